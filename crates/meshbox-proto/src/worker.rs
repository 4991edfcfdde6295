//! Worker RPC surface: the calls the controller (scheduler) makes into a worker.

use serde::{Deserialize, Serialize};

use crate::RpcError;

/// `Spawn({sandbox_id, application, environment}) -> {used_memory}`.
///
/// The worker retries its spawn helper up to 5 times; a successful spawn requires the
/// helper to have run for at least 100 ms (shorter runs are treated as cold-start
/// anomalies and retried).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnRequest {
    /// Sandbox id assigned by the controller.
    pub sandbox_id: u64,
    /// Application tag.
    pub application: String,
    /// Environment tag.
    pub environment: String,
}

/// `Restart({sandbox_id}) -> {used_memory}`. Valid only when the sandbox is Warm or Base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartRequest {
    /// Sandbox to restart.
    pub sandbox_id: u64,
}

/// `Restore({sandbox_id}) -> {used_memory}`. Valid only when the sandbox is Dedup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreRequest {
    /// Sandbox to restore.
    pub sandbox_id: u64,
}

/// `Purge({sandbox_id}) -> {used_memory}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeRequest {
    /// Sandbox to purge.
    pub sandbox_id: u64,
}

/// Common response shape for `Spawn` / `Restart` / `Restore` / `Purge`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsedMemoryResponse {
    /// Memory in use by this sandbox after the operation, in megabytes.
    pub used_memory_mb: u64,
}

/// `Terminate() -> Ack`. Initiates a graceful exit after a 2 s grace period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminateRequest;

/// The tagged union of every call the controller's scheduler can make into a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerRequest {
    /// See [`SpawnRequest`].
    Spawn(SpawnRequest),
    /// See [`RestartRequest`].
    Restart(RestartRequest),
    /// See [`RestoreRequest`].
    Restore(RestoreRequest),
    /// See [`PurgeRequest`].
    Purge(PurgeRequest),
    /// See [`TerminateRequest`].
    Terminate(TerminateRequest),
}

/// The response half of [`WorkerRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerResponse {
    /// Reply to `Spawn` / `Restart` / `Restore` / `Purge`.
    UsedMemory(UsedMemoryResponse),
    /// Reply to `Terminate`.
    Ack,
    /// The call failed.
    Err(RpcError),
}
