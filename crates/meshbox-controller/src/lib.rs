//! The controller: data model, decision policy, request scheduler, and RPC server.
//!
//! This crate is the cluster's single-process authority: the sandbox / machine /
//! application / environment data model (`model`), the per-sandbox idle-time decision
//! policy (`policy`), the request scheduler that drives a trace against the cluster
//! (`scheduler`), the client used to call into workers (`worker_client`), and the
//! controller's own RPC server (`rpc`).
//!
//! # Durability
//!
//! Controller state is held only in memory (`parking_lot`-guarded maps in
//! [`state::Controller`]) and is lost on crash. No persistence layer is provided or implied
//! by anything in this crate.
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

pub mod model;
pub mod policy;
pub mod rpc;
pub mod scheduler;
pub mod state;
pub mod stats;
pub mod worker_client;

pub use policy::{evaluate_decision, DecisionContext, DecisionOutcome, PolicyKind};
pub use state::{Controller, ControllerError};
pub use stats::ControllerStats;
pub use worker_client::WorkerClient;
