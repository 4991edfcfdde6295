//! Configuration: the cluster topology file, the key=value parameter file, and a small
//! filesystem-backed preference store for CLI-local convenience state.
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

pub mod cluster;
pub mod params;
mod store;

pub use cluster::ClusterConfig;
pub use params::ParamConfig;
pub use store::{ConfigError, ConfigService, ConfigStore, FsConfigStore, LAST_CLUSTER_FILE_KEY};
