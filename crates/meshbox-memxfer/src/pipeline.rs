//! The register/broadcast/read/poll pipeline.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use meshbox_proto::region::{is_remote_facing, MEMORY_REGION_ID_REMOTE_MASK};
use meshbox_proto::RegionDescriptor;
use parking_lot::{Condvar, Mutex};

use crate::transport::Transport;
use crate::MemxferError;

/// Tuning for a [`MemxferPipeline`]: bounds on outstanding broadcasts and per-peer
/// in-flight reads.
#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    /// Maximum number of source regions that may be awaiting broadcast acks at once.
    pub max_outstanding_broadcasts: usize,
    /// Maximum in-flight reads per peer before `post_read` returns `Backpressure`.
    pub max_in_flight_per_peer: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_outstanding_broadcasts: 64,
            max_in_flight_per_peer: 32,
        }
    }
}

struct SourceRegion {
    descriptor: RegionDescriptor,
    expected: HashSet<u32>,
    acked: Mutex<HashSet<u32>>,
    ready: Mutex<bool>,
    cvar: Condvar,
}

impl SourceRegion {
    fn is_ready(&self) -> bool {
        *self.ready.lock()
    }
}

/// A posted remote read, once it has completed.
#[derive(Debug, Clone)]
pub struct Completion {
    /// The opaque context the caller attached to the original `post_read`.
    pub context: u64,
    /// The bytes read, or `None` if the read failed (treated as the remote page being
    /// unavailable).
    pub data: Option<Vec<u8>>,
}

/// A request to read a remote region, as passed to [`MemxferPipeline::post_read`].
#[derive(Debug, Clone, Copy)]
pub struct PostReadRequest {
    /// Peer machine to read from.
    pub machine_id: u32,
    /// Region id on that machine.
    pub remote_region: u32,
    /// Offset within that region.
    pub remote_addr: u64,
    /// Number of bytes to read.
    pub length: u64,
    /// Local destination region to deliver the bytes into (informational; actual
    /// placement is left to the caller, which owns the destination buffer).
    pub local_region: u32,
    /// Offset within the local destination region.
    pub local_addr: u64,
    /// Opaque value echoed back on the matching [`Completion`].
    pub context: u64,
}

/// Outcome of a non-blocking [`MemxferPipeline::poll_completion`] call.
#[derive(Debug)]
pub enum PollOutcome {
    /// A completion was available and has been written to the caller's output slot.
    Ready(Completion),
    /// No completion was available for this peer right now.
    Empty,
}

struct PeerQueue {
    in_flight: AtomicUsize,
    next_seq: AtomicU64,
    next_to_deliver: Mutex<u64>,
    pending: Mutex<BTreeMap<u64, Completion>>,
    ready: Mutex<VecDeque<Completion>>,
}

impl Default for PeerQueue {
    fn default() -> Self {
        Self {
            in_flight: AtomicUsize::new(0),
            next_seq: AtomicU64::new(0),
            next_to_deliver: Mutex::new(0),
            pending: Mutex::new(BTreeMap::new()),
            ready: Mutex::new(VecDeque::new()),
        }
    }
}

/// Implements register/broadcast/read/poll over a pluggable [`Transport`].
///
/// Per-peer reads are delivered in FIFO order of successful `post_read` calls even though
/// the underlying transport calls may complete out of order: each peer buffers
/// out-of-order completions by sequence number and only releases them to the poll-visible
/// queue once every earlier-sequenced read has landed.
pub struct MemxferPipeline {
    transport: Arc<dyn Transport>,
    config: PipelineConfig,
    next_local_region: AtomicU32,
    next_remote_region: AtomicU32,
    sources: Mutex<HashMap<u32, Arc<SourceRegion>>>,
    destinations: Mutex<HashMap<u32, RegionDescriptor>>,
    outstanding_broadcasts: AtomicUsize,
    peers: Mutex<HashMap<u32, Arc<PeerQueue>>>,
}

impl MemxferPipeline {
    /// Builds a pipeline over `transport` with the given bounds.
    pub fn new(transport: Arc<dyn Transport>, config: PipelineConfig) -> Self {
        Self {
            transport,
            config,
            next_local_region: AtomicU32::new(0),
            next_remote_region: AtomicU32::new(0),
            sources: Mutex::new(HashMap::new()),
            destinations: Mutex::new(HashMap::new()),
            outstanding_broadcasts: AtomicUsize::new(0),
            peers: Mutex::new(HashMap::new()),
        }
    }

    fn peer_queue(&self, machine_id: u32) -> Arc<PeerQueue> {
        Arc::clone(
            self.peers
                .lock()
                .entry(machine_id)
                .or_insert_with(|| Arc::new(PeerQueue::default())),
        )
    }

    /// Registers `length` bytes as a remotely-readable source, broadcasting its
    /// descriptor to `peers`. Returns the tentative region id immediately.
    ///
    /// Fails with [`MemxferError::Backpressure`] if `max_outstanding_broadcasts` sources
    /// are already awaiting acks.
    pub fn register_source(
        &self,
        machine_id: u32,
        peers: &[u32],
        length: u64,
    ) -> Result<u32, MemxferError> {
        if self.outstanding_broadcasts.load(Ordering::SeqCst) >= self.config.max_outstanding_broadcasts
        {
            return Err(MemxferError::Backpressure);
        }

        let region_id =
            self.next_remote_region.fetch_add(1, Ordering::SeqCst) | MEMORY_REGION_ID_REMOTE_MASK;
        let descriptor = RegionDescriptor {
            machine_id,
            region_id,
            base_address: 0,
            length,
            access_key: u64::from(region_id),
        };

        let expected: HashSet<u32> = peers.iter().copied().collect();
        let region = Arc::new(SourceRegion {
            descriptor,
            expected: expected.clone(),
            acked: Mutex::new(HashSet::new()),
            ready: Mutex::new(expected.is_empty()),
            cvar: Condvar::new(),
        });

        if !expected.is_empty() {
            self.outstanding_broadcasts.fetch_add(1, Ordering::SeqCst);
        }
        self.sources.lock().insert(region_id, Arc::clone(&region));

        for &peer in &expected {
            // Broadcast is best-effort and asynchronous; a send failure here just means
            // that peer will never ack, which `wait_source_ready` surfaces as a timeout.
            let _ = self.transport.send_descriptor(peer, descriptor);
        }

        Ok(region_id)
    }

    /// Records that `peer_machine_id` has acknowledged receipt of `region_id`'s
    /// descriptor. A region becomes globally ready once every peer present at broadcast
    /// time has acked; peers that never connected at broadcast time are irrelevant.
    pub fn ack_broadcast(&self, region_id: u32, peer_machine_id: u32) {
        let Some(region) = self.sources.lock().get(&region_id).cloned() else {
            return;
        };
        if !region.expected.contains(&peer_machine_id) {
            return;
        }
        let mut acked = region.acked.lock();
        acked.insert(peer_machine_id);
        if acked.len() == region.expected.len() {
            let mut ready = region.ready.lock();
            if !*ready {
                *ready = true;
                self.outstanding_broadcasts.fetch_sub(1, Ordering::SeqCst);
            }
            region.cvar.notify_all();
        }
    }

    /// Returns whether `region_id` is currently broadcast-ready.
    pub fn is_source_ready(&self, region_id: u32) -> bool {
        self.sources
            .lock()
            .get(&region_id)
            .is_some_and(|region| region.is_ready())
    }

    /// Blocks until `region_id` becomes broadcast-ready or `timeout` elapses.
    /// `Duration::ZERO` means block forever. Returns `true` if ready, `false` on timeout.
    pub fn wait_source_ready(&self, region_id: u32, timeout: Duration) -> bool {
        let Some(region) = self.sources.lock().get(&region_id).cloned() else {
            return false;
        };

        let mut ready = region.ready.lock();
        if *ready {
            return true;
        }
        if timeout.is_zero() {
            region.cvar.wait(&mut ready);
            return true;
        }
        let deadline = Instant::now() + timeout;
        loop {
            if *ready {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let timed_out = region.cvar.wait_for(&mut ready, remaining).timed_out();
            if *ready {
                return true;
            }
            if timed_out {
                return false;
            }
        }
    }

    /// Registers a local buffer of `length` bytes as a read destination. Synchronous.
    pub fn register_destination(&self, machine_id: u32, length: u64) -> Result<u32, MemxferError> {
        let region_id = self.next_local_region.fetch_add(1, Ordering::SeqCst);
        if region_id > meshbox_proto::region::MEMORY_REGION_ID_MAX_VALUE {
            return Err(MemxferError::RegistrationFailed);
        }
        let descriptor = RegionDescriptor {
            machine_id,
            region_id,
            base_address: 0,
            length,
            access_key: 0,
        };
        self.destinations.lock().insert(region_id, descriptor);
        Ok(region_id)
    }

    /// Looks up a descriptor this pipeline registered locally (source or destination).
    pub fn lookup_local(&self, region_id: u32) -> Result<RegionDescriptor, MemxferError> {
        if is_remote_facing(region_id) {
            self.sources
                .lock()
                .get(&region_id)
                .map(|r| r.descriptor)
                .ok_or(MemxferError::NotFound)
        } else {
            self.destinations
                .lock()
                .get(&region_id)
                .copied()
                .ok_or(MemxferError::NotFound)
        }
    }

    /// Looks up a descriptor a peer has broadcast.
    pub fn lookup_remote(&self, machine_id: u32, region_id: u32) -> Result<RegionDescriptor, MemxferError> {
        self.transport
            .lookup_remote(machine_id, region_id)
            .ok_or(MemxferError::NotFound)
    }

    /// Enqueues a remote read. Returns `Backpressure` if the peer's in-flight queue
    /// (capacity `max_in_flight_per_peer`) is already full.
    pub fn post_read(&self, req: PostReadRequest) -> Result<(), MemxferError> {
        let queue = self.peer_queue(req.machine_id);

        loop {
            let current = queue.in_flight.load(Ordering::SeqCst);
            if current >= self.config.max_in_flight_per_peer {
                return Err(MemxferError::Backpressure);
            }
            if queue
                .in_flight
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
        }

        let seq = queue.next_seq.fetch_add(1, Ordering::SeqCst);
        let transport = Arc::clone(&self.transport);
        let queue_for_thread = Arc::clone(&queue);

        std::thread::spawn(move || {
            let result = transport.remote_read(req.machine_id, req.remote_addr, req.length);
            let completion = Completion {
                context: req.context,
                data: result.ok(),
            };
            queue_for_thread.pending.lock().insert(seq, completion);

            let mut next = queue_for_thread.next_to_deliver.lock();
            let mut pending = queue_for_thread.pending.lock();
            while let Some(done) = pending.remove(&*next) {
                queue_for_thread.ready.lock().push_back(done);
                *next += 1;
                queue_for_thread.in_flight.fetch_sub(1, Ordering::SeqCst);
            }
        });

        Ok(())
    }

    /// Non-blocking single-peer completion drain.
    pub fn poll_completion(&self, machine_id: u32) -> PollOutcome {
        let queue = self.peer_queue(machine_id);
        match queue.ready.lock().pop_front() {
            Some(completion) => PollOutcome::Ready(completion),
            None => PollOutcome::Empty,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{MemxferPipeline, PipelineConfig, PollOutcome, PostReadRequest};
    use crate::transport::InMemoryTransport;
    use std::sync::Arc;
    use std::time::Duration;

    fn pipeline() -> MemxferPipeline {
        MemxferPipeline::new(Arc::new(InMemoryTransport::new()), PipelineConfig::default())
    }

    // ── 1. S6: broadcast-ready flips only once every expected peer has acked ──
    #[test]
    fn scenario_s6_broadcast_gate() {
        let pipeline = pipeline();
        let region = pipeline.register_source(0, &[1, 2], 4096).expect("register");
        assert!(!pipeline.is_source_ready(region));

        pipeline.ack_broadcast(region, 1);
        assert!(!pipeline.is_source_ready(region));

        pipeline.ack_broadcast(region, 2);
        assert!(pipeline.is_source_ready(region));
    }

    // ── 2. S6: a peer that never acks times out wait_source_ready ──
    #[test]
    fn scenario_s6_disconnect_times_out() {
        let pipeline = pipeline();
        let region = pipeline.register_source(0, &[1, 2], 4096).expect("register");
        pipeline.ack_broadcast(region, 1);
        assert!(!pipeline.wait_source_ready(region, Duration::from_millis(50)));
    }

    // ── 3. a source with no expected peers is immediately ready ──
    #[test]
    fn source_with_no_peers_is_ready() {
        let pipeline = pipeline();
        let region = pipeline.register_source(0, &[], 4096).expect("register");
        assert!(pipeline.is_source_ready(region));
    }

    // ── 4. lookup_local fails for an unknown region id ──
    #[test]
    fn lookup_local_unknown_region() {
        let pipeline = pipeline();
        assert!(pipeline.lookup_local(999).is_err());
    }

    // ── 5. per-peer reads complete in FIFO order of successful posts ──
    #[test]
    fn per_peer_reads_are_fifo() {
        let pipeline = pipeline();
        for context in 0..8u64 {
            pipeline
                .post_read(PostReadRequest {
                    machine_id: 1,
                    remote_region: 0,
                    remote_addr: 0,
                    length: 64,
                    local_region: 0,
                    local_addr: 0,
                    context,
                })
                .expect("post_read");
        }

        let mut seen = Vec::new();
        while seen.len() < 8 {
            if let PollOutcome::Ready(completion) = pipeline.poll_completion(1) {
                seen.push(completion.context);
            }
        }
        assert_eq!(seen, (0..8).collect::<Vec<_>>());
    }

    // ── 6. exceeding the per-peer in-flight cap returns Backpressure ──
    #[test]
    fn per_peer_backpressure() {
        struct SlowTransport;
        impl crate::transport::Transport for SlowTransport {
            fn send_descriptor(
                &self,
                _peer_machine_id: u32,
                _descriptor: meshbox_proto::RegionDescriptor,
            ) -> Result<(), crate::MemxferError> {
                Ok(())
            }
            fn lookup_remote(&self, _machine_id: u32, _region_id: u32) -> Option<meshbox_proto::RegionDescriptor> {
                None
            }
            fn remote_read(&self, _machine_id: u32, _remote_addr: u64, length: u64) -> Result<Vec<u8>, crate::MemxferError> {
                std::thread::sleep(Duration::from_millis(200));
                #[allow(clippy::cast_possible_truncation)]
                Ok(vec![0u8; length as usize])
            }
        }

        let pipeline = MemxferPipeline::new(
            Arc::new(SlowTransport),
            PipelineConfig {
                max_outstanding_broadcasts: 64,
                max_in_flight_per_peer: 1,
            },
        );
        let req = PostReadRequest {
            machine_id: 2,
            remote_region: 0,
            remote_addr: 0,
            length: 64,
            local_region: 0,
            local_addr: 0,
            context: 0,
        };
        pipeline.post_read(req).expect("first post ok");
        assert!(pipeline.post_read(req).is_err());
    }
}
