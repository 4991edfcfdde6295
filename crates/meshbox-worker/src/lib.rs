//! The worker: per-sandbox lifecycle state machine, checkpoint/restore sequencing, and
//! page-level dedup/restore logic.
//!
//! This crate is the worker side of the cluster: a local sandbox map (`sandbox`), the
//! single-pipe checkpoint/restore exclusion discipline (`pipe`), the delta codec and
//! dedup/restore pipeline glue (`delta`, `dedup`), the client used to call into the
//! controller (`controller_client`), the daemon that drives each sandbox's state machine
//! (`lifecycle`), and the worker's own RPC server (`rpc`).
//!
//! # Durability
//!
//! A worker's sandbox map is held only in memory; on crash, the controller eventually
//! notices via failed RPCs and the scheduler's failure-escalation path.
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

pub mod controller_client;
pub mod dedup;
pub mod delta;
pub mod error;
pub mod lifecycle;
pub mod pipe;
pub mod rpc;
pub mod runtime;
pub mod sandbox;

pub use controller_client::ControllerClient;
pub use error::WorkerError;
pub use lifecycle::{Worker, WorkerConfig};
pub use sandbox::{DedupEntry, WorkerSandbox};
