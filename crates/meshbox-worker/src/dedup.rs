//! Page-level dedup encoding and restore decoding.
//!
//! A candidate sandbox is deduplicated by fingerprinting each of its pages, asking the
//! controller which base pages those fingerprints match, fetching the matched base
//! pages over the memory-transfer pipeline, and diffing each candidate page against its
//! match. Pages whose diff is small are stored as a patch; pages with no match, or whose
//! diff exceeds `patch_threshold`, are stored verbatim. A restore reverses the process:
//! fetch the same base pages, and either apply a patch or copy the verbatim bytes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use meshbox_cas::fingerprint::PAGE_SIZE;
use meshbox_cas::FingerprintStrategy;
use meshbox_memxfer::{MemxferPipeline, PollOutcome, PostReadRequest};
use meshbox_proto::controller::{BasePage, PageHashes};

use crate::delta::DeltaCodec;
use crate::error::WorkerError;
use crate::sandbox::DedupEntry;

/// How long [`fetch_pages`] waits for all posted reads to drain before giving up.
const FETCH_TIMEOUT: Duration = Duration::from_secs(5);
/// Backoff between completion polls while draining posted reads.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Fingerprints every page in `pages` for submission to `GetBaseContainers` or
/// `RegisterPages`. Page addresses are dense zero-based ids; `region_id` is left unset,
/// matching a dedup candidate's pages (never registered for remote reads).
pub fn fingerprint_pages(
    pages: &[[u8; PAGE_SIZE]],
    strategy: FingerprintStrategy,
    chunks_per_page: usize,
) -> Vec<PageHashes> {
    pages
        .iter()
        .enumerate()
        .map(|(addr, page)| PageHashes {
            addr: addr as u64,
            region_id: None,
            hashes: strategy.fingerprint(page, chunks_per_page),
        })
        .collect()
}

/// Fetches the base pages named by `matches` over `pipeline`, posting every read up
/// front (bounded by the pipeline's own per-peer backpressure) and draining completions
/// until every match has either landed or the fetch has timed out.
///
/// Returns a map from candidate page address to fetched base bytes; pages whose read
/// failed or never completed before the timeout are simply absent.
pub fn fetch_pages(
    pipeline: &MemxferPipeline,
    matches: &[BasePage],
) -> Result<HashMap<u64, Vec<u8>>, WorkerError> {
    let mut pending: HashMap<u64, u32> = HashMap::new();
    for base in matches {
        match pipeline.post_read(PostReadRequest {
            machine_id: base.machine_id,
            remote_region: base.region_id,
            remote_addr: base.base_addr,
            length: PAGE_SIZE as u64,
            local_region: 0,
            local_addr: 0,
            context: base.addr,
        }) {
            Ok(()) => {
                pending.insert(base.addr, base.machine_id);
            }
            Err(_) => continue,
        }
    }

    let mut fetched = HashMap::new();
    let deadline = std::time::Instant::now() + FETCH_TIMEOUT;
    let peers: Vec<u32> = pending.values().copied().collect::<std::collections::HashSet<_>>().into_iter().collect();
    while !pending.is_empty() && std::time::Instant::now() < deadline {
        let mut made_progress = false;
        for &peer in &peers {
            if let PollOutcome::Ready(completion) = pipeline.poll_completion(peer) {
                if pending.remove(&completion.context).is_some() {
                    if let Some(data) = completion.data {
                        fetched.insert(completion.context, data);
                    }
                    made_progress = true;
                }
            }
        }
        if !made_progress {
            std::thread::sleep(POLL_INTERVAL);
        }
    }
    Ok(fetched)
}

/// Encodes `pages` against their matched base pages, producing each page's dedup map
/// entry and the bytes to append to the sandbox's patch file, in page-id order.
///
/// A page with no match, or whose encoded patch is no smaller than `patch_threshold`,
/// is stored verbatim (`patch_length == PAGE_SIZE`).
pub fn encode_patch_file(
    pages: &[[u8; PAGE_SIZE]],
    matches: &[BasePage],
    base_pages: &HashMap<u64, Vec<u8>>,
    codec: &dyn DeltaCodec,
    patch_threshold: usize,
) -> Result<(HashMap<u64, DedupEntry>, Vec<u8>), WorkerError> {
    let mut by_addr: HashMap<u64, &BasePage> = HashMap::new();
    for base in matches {
        by_addr.insert(base.addr, base);
    }

    let mut dedup_map = HashMap::with_capacity(pages.len());
    let mut patch_file = Vec::new();

    for (addr, page) in pages.iter().enumerate() {
        let addr = addr as u64;
        let verbatim = || -> (DedupEntry, Vec<u8>) {
            (
                DedupEntry { base_machine: 0, base_region: 0, base_offset: 0, patch_length: PAGE_SIZE },
                page.to_vec(),
            )
        };

        let (entry, fragment) = match (by_addr.get(&addr), base_pages.get(&addr)) {
            (Some(base), Some(base_bytes)) if base_bytes.len() == PAGE_SIZE => {
                let patch = codec.encode(page, base_bytes)?;
                if patch.len() < patch_threshold {
                    (
                        DedupEntry {
                            base_machine: base.machine_id,
                            base_region: base.region_id,
                            base_offset: base.base_addr,
                            patch_length: patch.len(),
                        },
                        patch,
                    )
                } else {
                    verbatim()
                }
            }
            _ => verbatim(),
        };

        dedup_map.insert(addr, entry);
        patch_file.extend_from_slice(&fragment);
    }

    Ok((dedup_map, patch_file))
}

/// Reconstructs every page from a sandbox's `dedup_map` and patch file, fetching the
/// required base pages over `pipeline` and either copying a verbatim fragment or
/// applying its patch against the matching base page.
pub fn decode_patch_file(
    dedup_map: &HashMap<u64, DedupEntry>,
    patch_file: &[u8],
    pipeline: &MemxferPipeline,
    codec: &dyn DeltaCodec,
) -> Result<Vec<[u8; PAGE_SIZE]>, WorkerError> {
    let page_count = dedup_map.len();
    let mut offsets = Vec::with_capacity(page_count);
    let mut offset = 0usize;
    for addr in 0..page_count as u64 {
        let entry = dedup_map
            .get(&addr)
            .ok_or_else(|| WorkerError::HelperFailure(format!("dedup map missing page {addr}")))?;
        offsets.push((addr, offset, entry));
        offset += entry.patch_length;
    }

    let needs_base: Vec<BasePage> = offsets
        .iter()
        .filter(|(_, _, entry)| entry.patch_length != PAGE_SIZE)
        .map(|(addr, _, entry)| BasePage {
            addr: *addr,
            machine_id: entry.base_machine,
            region_id: entry.base_region,
            base_addr: entry.base_offset,
        })
        .collect();
    let base_pages = fetch_pages(pipeline, &needs_base)?;

    let mut pages = Vec::with_capacity(page_count);
    for (addr, start, entry) in offsets {
        let fragment = patch_file
            .get(start..start + entry.patch_length)
            .ok_or_else(|| WorkerError::HelperFailure(format!("patch file truncated at page {addr}")))?;

        let page_bytes = if entry.patch_length == PAGE_SIZE {
            fragment.to_vec()
        } else {
            let base = base_pages
                .get(&addr)
                .ok_or_else(|| WorkerError::HelperFailure(format!("base page missing for page {addr}")))?;
            codec.decode(fragment, base)?
        };

        let page: [u8; PAGE_SIZE] = page_bytes
            .try_into()
            .map_err(|_| WorkerError::HelperFailure(format!("reconstructed page {addr} has wrong size")))?;
        pages.push(page);
    }
    Ok(pages)
}

/// Convenience wrapper bundling the codec and pipeline a worker uses for every
/// dedup/restore operation, so callers don't thread both through every call.
pub struct DedupCodec {
    /// Delta codec used to encode/decode patches.
    pub delta: Arc<dyn DeltaCodec>,
    /// Memory-transfer pipeline used to fetch base pages.
    pub pipeline: Arc<MemxferPipeline>,
}
