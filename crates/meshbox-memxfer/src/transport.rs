//! The narrow transport seam this crate treats as an external collaborator.
//!
//! Everything below [`Transport`] — the actual RDMA-like wire primitive moving bytes
//! between machines — is out of scope here; this crate only implements the
//! register/broadcast/read/poll bookkeeping layered on top of it. Production code wires a
//! real implementation in; tests use [`InMemoryTransport`].

use std::collections::HashMap;

use meshbox_proto::RegionDescriptor;
use parking_lot::Mutex;

use crate::MemxferError;

/// The black-box remote-memory transport a [`crate::MemxferPipeline`] is built on.
pub trait Transport: Send + Sync {
    /// Sends a region descriptor to `peer_machine_id`. A transport-level failure here is
    /// non-fatal to the pipeline: the peer simply never acks, and broadcast readiness for
    /// that source never completes for it.
    fn send_descriptor(
        &self,
        peer_machine_id: u32,
        descriptor: RegionDescriptor,
    ) -> Result<(), MemxferError>;

    /// Looks up a region descriptor a peer has previously broadcast.
    fn lookup_remote(&self, machine_id: u32, region_id: u32) -> Option<RegionDescriptor>;

    /// Performs the actual remote read. Failure here surfaces as a failed completion, not
    /// a panic or pipeline-wide error — callers see it as if the remote page were
    /// unavailable.
    fn remote_read(&self, machine_id: u32, remote_addr: u64, length: u64) -> Result<Vec<u8>, MemxferError>;
}

/// A local, single-process stand-in transport for tests: descriptors sent to it are
/// simply recorded, and reads return zero-filled buffers of the requested length.
#[derive(Default)]
pub struct InMemoryTransport {
    descriptors: Mutex<HashMap<(u32, u32), RegionDescriptor>>,
}

impl InMemoryTransport {
    /// Builds an empty in-memory transport.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Transport for InMemoryTransport {
    fn send_descriptor(
        &self,
        peer_machine_id: u32,
        descriptor: RegionDescriptor,
    ) -> Result<(), MemxferError> {
        self.descriptors
            .lock()
            .insert((peer_machine_id, descriptor.region_id), descriptor);
        Ok(())
    }

    fn lookup_remote(&self, machine_id: u32, region_id: u32) -> Option<RegionDescriptor> {
        self.descriptors.lock().get(&(machine_id, region_id)).copied()
    }

    fn remote_read(&self, _machine_id: u32, _remote_addr: u64, length: u64) -> Result<Vec<u8>, MemxferError> {
        #[allow(clippy::cast_possible_truncation)]
        Ok(vec![0u8; length as usize])
    }
}
