//! SHA-1 page fingerprinting: three interchangeable strategies over a fixed page layout.

use meshbox_proto::{Digest, NULL_FINGERPRINT};
use sha1::{Digest as _, Sha1};

/// Bytes in a page. Every strategy in this module assumes pages are exactly this size.
pub const PAGE_SIZE: usize = 4096;
/// Bytes hashed per fingerprint window.
pub const CHUNK_SIZE: usize = 64;
/// Stride, in bytes, between candidate windows for the sampling strategies.
pub const SKIP_SIZE: usize = 16;

/// Which of the three fingerprinting algorithms to apply to a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerprintStrategy {
    /// Sample `num_chunks` windows at fixed, equidistant offsets across the page.
    FixedOffset,
    /// Within each of `num_chunks` equal segments, use the first non-null window found.
    NonNull,
    /// Scan all windows at [`SKIP_SIZE`] stride, keep ones whose digest's last nibble is
    /// even, stop at `num_chunks` matches. The production strategy.
    ValueSampled,
}

impl FingerprintStrategy {
    /// Computes the fingerprint set of `page` under this strategy.
    ///
    /// `page` must be exactly [`PAGE_SIZE`] bytes. `num_chunks` is `chunks_per_page` from
    /// configuration (typically 2).
    pub fn fingerprint(self, page: &[u8; PAGE_SIZE], num_chunks: usize) -> Vec<Digest> {
        match self {
            Self::FixedOffset => fixed_offset_fingerprint(page, num_chunks),
            Self::NonNull => non_null_fingerprint(page, num_chunks),
            Self::ValueSampled => value_sampled_fingerprint(page, num_chunks),
        }
    }
}

fn is_zero(window: &[u8]) -> bool {
    window.iter().all(|&b| b == 0)
}

fn compute_chunk_hash(chunk: &[u8]) -> Digest {
    let mut hasher = Sha1::new();
    hasher.update(chunk);
    let result = hasher.finalize();
    #[allow(clippy::unwrap_used)]
    Digest::from_slice(&result).unwrap()
}

/// Use `num_chunks` windows at fixed, equidistant offsets.
fn fixed_offset_fingerprint(page: &[u8; PAGE_SIZE], num_chunks: usize) -> Vec<Digest> {
    let mut fingerprints = Vec::with_capacity(num_chunks);
    for ichunk in 0..num_chunks {
        let offset = ichunk * PAGE_SIZE / num_chunks;
        fingerprints.push(compute_chunk_hash(&page[offset..offset + CHUNK_SIZE]));
    }
    fingerprints
}

/// Within each of `num_chunks` equal segments, take the first non-null window.
fn non_null_fingerprint(page: &[u8; PAGE_SIZE], num_chunks: usize) -> Vec<Digest> {
    let mut fingerprints = Vec::new();
    let mut found = false;
    let segment_size = PAGE_SIZE / num_chunks;

    for ichunk in 0..num_chunks {
        let segment_offset = ichunk * segment_size;
        let mut chunk_offset = 0;
        while chunk_offset < segment_size {
            let window = &page[segment_offset + chunk_offset..segment_offset + chunk_offset + CHUNK_SIZE];
            if !is_zero(window) {
                fingerprints.push(compute_chunk_hash(window));
                found = true;
                break;
            }
            chunk_offset += SKIP_SIZE;
        }
    }

    if !found {
        fingerprints.push(NULL_FINGERPRINT);
    }
    fingerprints
}

/// Scan at [`SKIP_SIZE`] stride, keep digests with an even last nibble, stop at
/// `num_chunks` matches; fall back to the null fingerprint if none qualify.
fn value_sampled_fingerprint(page: &[u8; PAGE_SIZE], num_chunks: usize) -> Vec<Digest> {
    let mut fingerprints = Vec::new();
    let mut chunk_offset = 0;

    while chunk_offset + CHUNK_SIZE <= PAGE_SIZE {
        let window = &page[chunk_offset..chunk_offset + CHUNK_SIZE];
        if !is_zero(window) {
            let fingerprint = compute_chunk_hash(window);
            let last_nibble = fingerprint.as_bytes()[19] & 0x0F;
            if last_nibble % 2 == 0 {
                fingerprints.push(fingerprint);
            }
        }
        if fingerprints.len() == num_chunks {
            break;
        }
        chunk_offset += SKIP_SIZE;
    }

    if fingerprints.is_empty() {
        fingerprints.push(NULL_FINGERPRINT);
    }
    fingerprints
}

#[cfg(test)]
mod tests {
    use super::{FingerprintStrategy, CHUNK_SIZE, PAGE_SIZE};
    use meshbox_proto::NULL_FINGERPRINT;

    fn zero_page() -> [u8; PAGE_SIZE] {
        [0u8; PAGE_SIZE]
    }

    // ── 1. an all-zero page yields the null fingerprint under value-sampled ──
    #[test]
    fn all_zero_page_value_sampled() {
        let page = zero_page();
        let fps = FingerprintStrategy::ValueSampled.fingerprint(&page, 2);
        assert_eq!(fps, vec![NULL_FINGERPRINT]);
    }

    // ── 2. an all-zero page yields the null fingerprint under non-null ──
    #[test]
    fn all_zero_page_non_null() {
        let page = zero_page();
        let fps = FingerprintStrategy::NonNull.fingerprint(&page, 3);
        assert_eq!(fps, vec![NULL_FINGERPRINT]);
    }

    // ── 3. fixed-offset always returns exactly num_chunks digests ──
    #[test]
    fn fixed_offset_always_num_chunks() {
        let mut page = zero_page();
        page[0] = 1;
        let fps = FingerprintStrategy::FixedOffset.fingerprint(&page, 4);
        assert_eq!(fps.len(), 4);
    }

    // ── 4. value-sampled stops at num_chunks matches ──
    #[test]
    fn value_sampled_caps_at_num_chunks() {
        let mut page = zero_page();
        // Make every window non-zero so every sampled window is a candidate.
        for byte in page.iter_mut() {
            *byte = 0xAB;
        }
        let fps = FingerprintStrategy::ValueSampled.fingerprint(&page, 2);
        assert!(fps.len() <= 2);
    }

    // ── 5. determinism: same bytes, same strategy, same chunk count -> same digests ──
    #[test]
    fn deterministic() {
        let mut page = zero_page();
        page[100] = 7;
        page[2000] = 9;
        let a = FingerprintStrategy::ValueSampled.fingerprint(&page, 2);
        let b = FingerprintStrategy::ValueSampled.fingerprint(&page, 2);
        assert_eq!(a, b);
    }

    // ── 6. chunk size sanity: hashing two distinct windows gives distinct digests ──
    #[test]
    fn distinct_windows_distinct_digests() {
        let mut page = zero_page();
        page[0] = 1;
        page[CHUNK_SIZE] = 2;
        let fps = FingerprintStrategy::FixedOffset.fingerprint(&page, 2);
        assert_ne!(fps[0], fps[1]);
    }
}
