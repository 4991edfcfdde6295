//! Page-level content deduplication: fingerprinting, the cross-machine page registry, and
//! the dedup planner that matches a candidate sandbox's pages against known base pages.
//!
//! # Page Size Invariant
//!
//! Every fingerprinting strategy in [`fingerprint`] assumes a page is exactly
//! [`fingerprint::PAGE_SIZE`] bytes. Callers that hand in a shorter or longer slice get a
//! panic in debug builds of the strategy functions' internal slicing — validate page size
//! at the boundary where pages are read from a memory-dump file, not here.
//!
//! # Determinism Invariant
//!
//! For a fixed strategy and `chunks_per_page`, the fingerprint set of a page is a pure
//! function of its bytes. No strategy reads wall-clock time, randomness, or any state
//! outside the page buffer itself.
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

pub mod fingerprint;
pub mod planner;
pub mod registry;

pub use fingerprint::FingerprintStrategy;
pub use planner::{DedupPlanner, PlannerWeights};
pub use registry::{PageRegistry, RegistryEntry};
