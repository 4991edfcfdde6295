//! Wire contracts shared by the meshbox controller and worker binaries.
//!
//! This crate owns nothing but types and (de)serialization: the controller RPC surface
//! (`controller` module), the worker RPC surface (`worker` module), the sandbox-runtime
//! local daemon's HTTP contract (`runtime` module), the trace-file record format
//! (`trace` module), and the length-prefixed CBOR framing used to carry any of the above
//! over a byte stream (`wire` module).
//!
//! # Hash Domain Policy
//!
//! [`Digest`] always denotes a 20-byte SHA-1 digest of a 64-byte page window, matching the
//! content-hash black box this system treats as an external collaborator. It is never used
//! for anything content-addressed beyond page fingerprints — do not repurpose it as a
//! general-purpose hash newtype.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::dbg_macro,
    clippy::print_stdout,
    clippy::print_stderr
)]
#![allow(
    clippy::must_use_candidate,
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::too_many_lines,
    clippy::multiple_crate_versions
)]

pub mod controller;
mod digest;
pub mod region;
pub mod runtime;
pub mod trace;
pub mod wire;
pub mod worker;

pub use digest::{Digest, NULL_FINGERPRINT};
pub use region::RegionDescriptor;

/// Errors shared across every RPC surface defined in this crate.
///
/// Each variant is a first-class, wire-representable value rather than an opaque message
/// string, so that controller and worker can react to specific failure modes instead of
/// pattern-matching on text.
#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub enum RpcError {
    /// The referenced sandbox or machine does not exist.
    #[error("not found")]
    NotFound,
    /// The call was cancelled because of a state precondition (e.g. restart on a
    /// non-warm sandbox, or a decision requested for a sandbox currently Dummy).
    #[error("cancelled")]
    Cancelled,
    /// The call exceeded its deadline.
    #[error("deadline exceeded")]
    DeadlineExceeded,
    /// A bounded resource (outstanding broadcasts, per-peer in-flight reads) is full.
    #[error("backpressure")]
    Backpressure,
    /// The checkpoint/restore helper produced a bad or missing result.
    #[error("helper failure")]
    HelperFailure,
    /// Any other internal failure not covered by a more specific variant.
    #[error("internal error")]
    Internal,
}

/// Residency state of a sandbox, as seen by both controller and worker.
///
/// `Dummy` is intentionally included even though it never holds for long: the wire type
/// has to be able to represent "mid-transition" even if well-behaved peers never observe
/// it as a resting state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum SandboxState {
    /// Executing a request.
    Running,
    /// Paused in memory, ready for an immediate restart.
    Warm,
    /// Checkpointed donor whose pages are registered for remote reads.
    Base,
    /// Stored as per-page deltas against remote base pages.
    Dedup,
    /// Ephemeral: a worker thread has claimed this sandbox mid-transition.
    Dummy,
    /// Awaiting removal by the underlying runtime.
    Purge,
}

/// A controller decision for an idle or newly-evaluated sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Decision {
    /// Promote to (or keep as) a base sandbox.
    Base,
    /// Deduplicate against remote base pages.
    Dedup,
    /// Keep as a paused, immediately-restartable sandbox.
    Warm,
    /// Tear down the sandbox.
    Purge,
}
