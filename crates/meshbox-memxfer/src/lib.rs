//! The register/broadcast/read/poll memory-transfer pipeline.
//!
//! This crate implements the bookkeeping around the RDMA-like primitive the system
//! treats as an external collaborator: bounded outstanding broadcasts, per-peer bounded
//! in-flight reads with FIFO completion delivery, and broadcast-ready tracking. The
//! actual byte transport is a pluggable [`transport::Transport`]; production code
//! supplies a real one, tests use [`transport::InMemoryTransport`].
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
    clippy::multiple_crate_versions
)]

mod pipeline;
pub mod transport;

pub use pipeline::{Completion, MemxferPipeline, PipelineConfig, PollOutcome, PostReadRequest};

/// Errors the memory-transfer pipeline can surface.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum MemxferError {
    /// A bounded resource (outstanding broadcasts, per-peer in-flight reads) is full.
    #[error("backpressure")]
    Backpressure,
    /// The requested region id is not known locally or remotely.
    #[error("region not found")]
    NotFound,
    /// `register_destination` was rejected by the transport.
    #[error("destination registration failed")]
    RegistrationFailed,
}
