//! The controller-side page registry: a concurrent many-readers/one-writer map from
//! content digest to the sandboxes that carry a page with that digest.

use std::collections::HashMap;

use meshbox_proto::Digest;
use parking_lot::RwLock;

/// A single registered page, identified by which sandbox/machine/region it lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryEntry {
    /// Sandbox that owns this page.
    pub sandbox_id: u64,
    /// Machine the sandbox resides on.
    pub machine_id: u32,
    /// Region id the page was registered under.
    pub region_id: u32,
    /// Offset of the page within that region.
    pub offset: u64,
}

/// Maps content digests to the set of sandboxes carrying a matching page.
///
/// Inserts append; the same digest may be claimed by many base sandboxes and no entry is
/// ever deduplicated on insert. Entries for a removed base sandbox are not scanned out
/// eagerly — consumers that look up a digest and find an entry whose sandbox has since
/// been removed from the controller's sandbox map are expected to treat it as absent and
/// move on, per the intentional simplification of never eagerly garbage-collecting the
/// registry.
#[derive(Debug, Default)]
pub struct PageRegistry {
    entries: RwLock<HashMap<Digest, Vec<RegistryEntry>>>,
}

impl PageRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one entry under `digest`. Never overwrites or deduplicates existing
    /// entries for the same digest.
    pub fn insert(&self, digest: Digest, entry: RegistryEntry) {
        self.entries.write().entry(digest).or_default().push(entry);
    }

    /// Returns the entries registered for `digest`, or an empty vector if none.
    pub fn lookup(&self, digest: Digest) -> Vec<RegistryEntry> {
        self.entries
            .read()
            .get(&digest)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of distinct digests currently tracked.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the registry currently tracks no digests at all.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::{PageRegistry, RegistryEntry};
    use meshbox_proto::Digest;

    fn digest(byte: u8) -> Digest {
        Digest([byte; 20])
    }

    fn entry(sandbox_id: u64) -> RegistryEntry {
        RegistryEntry {
            sandbox_id,
            machine_id: 0,
            region_id: 0,
            offset: 0,
        }
    }

    // ── 1. a fresh registry is empty ──
    #[test]
    fn fresh_registry_is_empty() {
        let registry = PageRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
    }

    // ── 2. lookup on an unknown digest returns an empty list, not an error ──
    #[test]
    fn lookup_unknown_digest() {
        let registry = PageRegistry::new();
        assert!(registry.lookup(digest(1)).is_empty());
    }

    // ── 3. multiple inserts under the same digest accumulate, no dedup ──
    #[test]
    fn inserts_accumulate_without_dedup() {
        let registry = PageRegistry::new();
        registry.insert(digest(1), entry(5));
        registry.insert(digest(1), entry(7));
        registry.insert(digest(1), entry(7));
        assert_eq!(registry.lookup(digest(1)).len(), 3);
    }

    // ── 4. distinct digests are tracked independently ──
    #[test]
    fn distinct_digests_independent() {
        let registry = PageRegistry::new();
        registry.insert(digest(1), entry(5));
        registry.insert(digest(2), entry(6));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.lookup(digest(1))[0].sandbox_id, 5);
        assert_eq!(registry.lookup(digest(2))[0].sandbox_id, 6);
    }
}
