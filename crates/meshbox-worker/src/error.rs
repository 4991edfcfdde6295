//! Errors surfaced by the worker's lifecycle, dedup/restore, and RPC-server logic.

use thiserror::Error;

/// Errors the worker crate's operations can surface.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The referenced sandbox is not known to this worker.
    #[error("sandbox not found")]
    SandboxNotFound,
    /// The call is invalid for the sandbox's current state (e.g. `Restart` on a sandbox
    /// that is not Warm or Base).
    #[error("state precondition failed")]
    StatePrecondition,
    /// The checkpoint/restore helper produced a bad or missing result.
    #[error("checkpoint/restore helper failure: {0}")]
    HelperFailure(String),
    /// A call against the sandbox runtime's local daemon returned an unexpected status
    /// code or failed to connect.
    #[error("sandbox runtime call failed: {0}")]
    RuntimeCall(String),
    /// A memory-transfer pipeline operation failed.
    #[error("memory transfer failed: {0}")]
    Memxfer(#[from] meshbox_memxfer::MemxferError),
    /// A call into the controller's RPC surface failed.
    #[error("controller rpc failed: {0}")]
    ControllerRpc(String),
    /// Local filesystem I/O (dump files, patch files) failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
