//! Controller RPC surface: the calls a worker makes into the controller.

use serde::{Deserialize, Serialize};

use crate::{Decision, Digest, RpcError};

/// `GetDecision(sandbox_id) -> decision`.
///
/// *Cancelled* if the sandbox is unknown or currently Dummy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetDecisionRequest {
    /// Sandbox to evaluate.
    pub sandbox_id: u64,
}

/// Response to [`GetDecisionRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetDecisionResponse {
    /// The controller's decision for this sandbox.
    pub decision: Decision,
}

/// One page's fingerprint set, as reported by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageHashes {
    /// Page offset within its region (base role) or dense zero-based page id (dedup role).
    pub addr: u64,
    /// Region id the page belongs to. Unset (`None`) for a dedup candidate's pages, since
    /// those pages are never registered for remote reads.
    pub region_id: Option<u32>,
    /// Fingerprint digests collected for this page.
    pub hashes: Vec<Digest>,
}

/// `RegisterPages({sandbox_id, machine_id, payload[]}) -> Ack`.
///
/// Marks `base_ready = true` on the controller once any base has registered pages for the
/// sandbox's environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterPagesRequest {
    /// Sandbox whose pages are being registered.
    pub sandbox_id: u64,
    /// Machine the sandbox resides on.
    pub machine_id: u32,
    /// Per-page fingerprint payload.
    pub payload: Vec<PageHashes>,
}

/// Acknowledgement with no payload, used by several controller RPCs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack;

/// One matched base page, as returned by [`GetBaseContainersResponse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasePage {
    /// The candidate page's own address (echoed back for correlation).
    pub addr: u64,
    /// Machine hosting the chosen base page.
    pub machine_id: u32,
    /// Region id on that machine.
    pub region_id: u32,
    /// Offset of the matched page within that region.
    pub base_addr: u64,
}

/// `GetBaseContainers(same shape as RegisterPagesRequest) -> base_pages[]`.
///
/// The response covers only pages for which a base match was found; unmatched pages are
/// simply absent from the list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetBaseContainersRequest {
    /// Candidate sandbox whose pages are being matched.
    pub sandbox_id: u64,
    /// Machine the candidate resides on.
    pub machine_id: u32,
    /// Per-page fingerprint payload to match against the registry.
    pub payload: Vec<PageHashes>,
}

/// Response to [`GetBaseContainersRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetBaseContainersResponse {
    /// Matched base pages, one per candidate page that found a match.
    pub base_pages: Vec<BasePage>,
}

/// `UpdateStatus({sandbox_id, status}) -> Ack`. *Cancelled* if the sandbox is unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateStatusRequest {
    /// Sandbox whose status changed.
    pub sandbox_id: u64,
    /// New status, one of BASE / DEDUP / WARM.
    pub status: crate::SandboxState,
}

/// `UpdateAvailableMemory({machine_id, used_memory_mb}) -> Ack`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateAvailableMemoryRequest {
    /// Machine reporting its memory usage.
    pub machine_id: u32,
    /// Used memory, in megabytes.
    pub used_memory_mb: u64,
}

/// `Blacklist({sandbox_id}) -> Ack`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlacklistRequest {
    /// Sandbox to blacklist.
    pub sandbox_id: u64,
}

/// The tagged union of every call a worker can make into the controller, as carried over
/// the wire by [`crate::wire::Packet`]. Dispatch on the controller side matches on this
/// enum rather than routing by a separate method-name field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControllerRequest {
    /// See [`GetDecisionRequest`].
    GetDecision(GetDecisionRequest),
    /// See [`RegisterPagesRequest`].
    RegisterPages(RegisterPagesRequest),
    /// See [`GetBaseContainersRequest`].
    GetBaseContainers(GetBaseContainersRequest),
    /// See [`UpdateStatusRequest`].
    UpdateStatus(UpdateStatusRequest),
    /// See [`UpdateAvailableMemoryRequest`].
    UpdateAvailableMemory(UpdateAvailableMemoryRequest),
    /// See [`BlacklistRequest`].
    Blacklist(BlacklistRequest),
}

/// The response half of [`ControllerRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControllerResponse {
    /// Reply to `GetDecision`.
    Decision(GetDecisionResponse),
    /// Reply to `GetBaseContainers`.
    BaseContainers(GetBaseContainersResponse),
    /// Reply to any call whose success carries no payload.
    Ack(Ack),
    /// The call failed.
    Err(RpcError),
}
