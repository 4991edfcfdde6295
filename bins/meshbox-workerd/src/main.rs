//! Worker daemon (`meshbox-workerd`).
//!
//! Reads the cluster topology and an agent parameter file, connects back to the
//! controller, brings up the worker's own RPC server, and drives the per-sandbox tick
//! loop roughly every 50 ms until a `Terminate` call flips the shutdown flag. Mirrors
//! the reference worker's CLI: `<machine_id> <num_threads>`, with the cluster/parameter
//! file paths defaulting to `config/cluster.json` and `config/agent.ini` and overridable
//! by flag.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, unused_must_use)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::dbg_macro,
    clippy::print_stdout,
    clippy::print_stderr
)]
#![allow(clippy::too_many_lines, clippy::multiple_crate_versions)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use meshbox_config::cluster::ClusterConfig;
use meshbox_config::params::ParamConfig;
use meshbox_memxfer::transport::InMemoryTransport;
use meshbox_memxfer::{MemxferPipeline, PipelineConfig};
use meshbox_worker::controller_client::ControllerClient;
use meshbox_worker::dedup::DedupCodec;
use meshbox_worker::delta::SparseDeltaCodec;
use meshbox_worker::lifecycle::{Worker, WorkerConfig};
use meshbox_worker::rpc;
use meshbox_worker::runtime::UnixSocketRuntime;

/// How often the daemon loop walks every sandbox and reconsiders its state.
const TICK_INTERVAL: Duration = Duration::from_millis(50);

/// Cluster-level function-sandbox orchestrator: worker daemon.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// This worker's dense machine id, looked up against `grpc_nodes` in the cluster file.
    machine_id: u32,
    /// Number of worker threads the worker's async runtime uses.
    num_threads: usize,
    /// Cluster topology file (controller + worker endpoints).
    #[arg(long, default_value = "config/cluster.json")]
    cluster_file: PathBuf,
    /// Worker parameter file (policy, params, configuration, parameters sections).
    #[arg(long, default_value = "config/agent.ini")]
    param_file: PathBuf,
    /// Unix domain socket the local sandbox-runtime daemon listens on.
    #[arg(long, default_value = "/tmp/meshbox-runtime.sock")]
    runtime_socket: PathBuf,
    /// Directory holding each sandbox's memory-dump and patch files.
    #[arg(long, default_value = "/tmp/meshbox-dumps")]
    dump_dir: PathBuf,
    /// Named pipe the checkpoint/restore helper is driven through.
    #[arg(long, default_value = "/tmp/meshbox-dump-pipe")]
    dump_pipe: PathBuf,
}

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt::init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(args.num_threads.max(1))
        .enable_all()
        .build()
        .context("building the worker's tokio runtime")?;
    runtime.block_on(run(args))
}

async fn run(args: Args) -> Result<()> {
    let cluster_text = std::fs::read_to_string(&args.cluster_file)
        .with_context(|| format!("reading cluster file {}", args.cluster_file.display()))?;
    let cluster = ClusterConfig::parse(&cluster_text).context("parsing cluster file")?;

    let param_text = std::fs::read_to_string(&args.param_file)
        .with_context(|| format!("reading worker parameter file {}", args.param_file.display()))?;
    let params = ParamConfig::parse(&param_text).context("parsing worker parameter file")?;

    let self_node = cluster
        .grpc_nodes
        .iter()
        .find(|node| node.machine_id == args.machine_id)
        .with_context(|| format!("machine id {} not present in cluster file's grpc_nodes", args.machine_id))?;
    let bind_addr = format!("{}:{}", self_node.addr, self_node.port);

    let applications = params
        .configuration
        .applications
        .iter()
        .enumerate()
        .map(|(i, app)| (format!("app{i}"), app.clone()))
        .collect();

    std::fs::create_dir_all(&args.dump_dir)
        .with_context(|| format!("creating dump dir {}", args.dump_dir.display()))?;

    let controller_addr = format!("{}:{}", cluster.controller.addr, cluster.controller.port);
    info!(%controller_addr, "connecting to controller");
    let controller = Arc::new(ControllerClient::connect(controller_addr).await.context("connecting to controller")?);

    // The RDMA-capable memory-transfer fabric is an external collaborator accessed only
    // through `Transport`'s register/lookup/read interface; no network wire format for it
    // is specified here, so the in-process transport stands in for it.
    let transport = Arc::new(InMemoryTransport::default());
    let pipeline = Arc::new(MemxferPipeline::new(transport, PipelineConfig::default()));
    let dedup = DedupCodec { delta: Arc::new(SparseDeltaCodec), pipeline };

    let config = WorkerConfig {
        machine_id: args.machine_id,
        applications,
        fingerprint: params.parameters,
        dump_dir: args.dump_dir,
    };
    let sandbox_runtime = Arc::new(UnixSocketRuntime::new(args.runtime_socket));
    let worker = Arc::new(Worker::new(config, sandbox_runtime, controller, dedup, args.dump_pipe));

    let rpc_worker = Arc::clone(&worker);
    let server = tokio::spawn(async move {
        if let Err(err) = rpc::serve(rpc_worker, bind_addr).await {
            warn!(%err, "worker rpc server exited");
        }
    });

    info!(machine_id = args.machine_id, "worker daemon tick loop starting");
    while !worker.is_shutting_down() {
        worker.tick();
        tokio::time::sleep(TICK_INTERVAL).await;
    }

    info!("shutdown observed, draining rpc server");
    server.abort();
    Ok(())
}
