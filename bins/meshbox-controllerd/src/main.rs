//! Controller daemon (`meshbox-controllerd`).
//!
//! Reads the cluster topology and controller parameter files, brings up the controller's
//! RPC server, dials every worker named in the cluster file, then replays a trace file
//! against the scheduler. Mirrors the reference controller's CLI: `<num_threads>
//! <trace_file>`, with the cluster/parameter file paths defaulting to `config/cluster.json`
//! and `config/controller.ini` and overridable by flag.
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

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use meshbox_cas::PlannerWeights;
use meshbox_config::cluster::ClusterConfig;
use meshbox_config::params::ParamConfig;
use meshbox_controller::model::Machine;
use meshbox_controller::rpc;
use meshbox_controller::scheduler::{ScheduleOutcome, Scheduler, SchedulerConfig};
use meshbox_controller::state::Controller;
use meshbox_controller::worker_client::WorkerClient;
use meshbox_proto::trace::TraceRecord;

/// How long the driver sleeps between dial attempts against a worker that isn't up yet.
const DIAL_RETRY: Duration = Duration::from_millis(500);
/// Upper bound on dial attempts per worker before the daemon gives up and exits.
const DIAL_ATTEMPTS: u32 = 60;
/// Sleep between polls of the trace-drain stopping condition.
const DRAIN_POLL: Duration = Duration::from_secs(10);
/// Grace period after the drain condition holds, before `Terminate` is sent to workers.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
/// Grace period after `Terminate` acks, before the process exits.
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// Cluster-level function-sandbox orchestrator: controller daemon.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Number of worker threads the controller's async runtime uses.
    num_threads: usize,
    /// Trace file to replay against the cluster.
    trace_file: PathBuf,
    /// Cluster topology file (controller + worker endpoints).
    #[arg(long, default_value = "config/cluster.json")]
    cluster_file: PathBuf,
    /// Controller parameter file (policy, params, configuration, parameters sections).
    #[arg(long, default_value = "config/controller.ini")]
    param_file: PathBuf,
    /// Requests allowed to remain in flight before the trace driver considers the run
    /// drained and starts tearing the cluster down.
    #[arg(long, default_value_t = 20)]
    drain_window: u64,
}

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt::init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(args.num_threads.max(1))
        .enable_all()
        .build()
        .context("building the controller's tokio runtime")?;
    runtime.block_on(run(args))
}

async fn run(args: Args) -> Result<()> {
    let cluster_text = std::fs::read_to_string(&args.cluster_file)
        .with_context(|| format!("reading cluster file {}", args.cluster_file.display()))?;
    let cluster = ClusterConfig::parse(&cluster_text).context("parsing cluster file")?;

    let param_text = std::fs::read_to_string(&args.param_file)
        .with_context(|| format!("reading controller parameter file {}", args.param_file.display()))?;
    let params = ParamConfig::parse(&param_text).context("parsing controller parameter file")?;

    let memory_cap_mb = params.params.memory_cap_mb;
    let policy_id = params.policy.policy_id;
    let applications = params.configuration.applications.clone();

    let controller = Arc::new(Controller::new(params, PlannerWeights::default()));
    for (i, app_params) in applications.into_iter().enumerate() {
        controller.add_application(format!("app{i}"), app_params, policy_id);
    }
    for node in &cluster.grpc_nodes {
        controller.add_machine(Machine {
            id: node.machine_id,
            addr: node.addr.clone(),
            port: node.port,
            total_memory_mb: memory_cap_mb,
            used_memory_mb: 0,
            num_dedup_starts: 0,
        });
    }

    let controller_addr = format!("{}:{}", cluster.controller.addr, cluster.controller.port);
    let rpc_controller = Arc::clone(&controller);
    tokio::spawn(async move {
        if let Err(err) = rpc::serve(rpc_controller, controller_addr).await {
            warn!(%err, "controller rpc server exited");
        }
    });

    info!("opening connections to every worker named in the cluster file");
    let mut workers: HashMap<u32, Arc<WorkerClient>> = HashMap::new();
    for node in &cluster.grpc_nodes {
        let addr = format!("{}:{}", node.addr, node.port);
        let client = dial_with_retry(&addr).await?;
        info!(machine_id = node.machine_id, %addr, "connected to worker");
        workers.insert(node.machine_id, Arc::new(client));
    }

    let scheduler = Arc::new(Scheduler::new(Arc::clone(&controller), workers.clone(), SchedulerConfig::default()));

    info!(trace_file = %args.trace_file.display(), "starting workload trace");
    replay_trace(&args.trace_file, Arc::clone(&scheduler)).await?;

    info!("closing up execution now");
    while controller.stats().in_flight() > args.drain_window {
        tokio::time::sleep(DRAIN_POLL).await;
    }
    // Sleep once more so any operation a worker just started (restart, restore) has a
    // chance to actually land before `Terminate` tears the connection down under it.
    tokio::time::sleep(SHUTDOWN_GRACE).await;

    for (machine_id, worker) in &workers {
        if let Err(err) = worker.terminate(Duration::from_secs(5)).await {
            warn!(machine_id, %err, "terminate rpc failed");
        }
    }

    info!(dropped_requests = controller.stats().dropped_requests(), "trace replay complete");
    tokio::time::sleep(EXIT_GRACE).await;
    Ok(())
}

async fn dial_with_retry(addr: &str) -> Result<WorkerClient> {
    let mut last_err = None;
    for _attempt in 0..DIAL_ATTEMPTS {
        match WorkerClient::connect(addr).await {
            Ok(client) => return Ok(client),
            Err(err) => {
                last_err = Some(err);
                tokio::time::sleep(DIAL_RETRY).await;
            }
        }
    }
    Err(anyhow::anyhow!(
        "failed to connect to worker at {addr} after {DIAL_ATTEMPTS} attempts: {}",
        last_err.map_or_else(|| "no attempts made".to_owned(), |e| e.to_string())
    ))
}

/// Replays `trace_file` against `scheduler`: each arrival is dispatched as a detached
/// task (so a slow schedule never delays reading the next record) and the driver sleeps
/// for the gap between consecutive timestamps before reading on, matching how the
/// reference trace driver paces replay. Returns once the `-1` sentinel is read.
async fn replay_trace(trace_file: &Path, scheduler: Arc<Scheduler>) -> Result<()> {
    let file = tokio::fs::File::open(trace_file)
        .await
        .with_context(|| format!("opening trace file {}", trace_file.display()))?;
    let mut lines = BufReader::new(file).lines();

    let Some(first_line) = lines.next_line().await? else {
        info!("trace file is empty, nothing to replay");
        return Ok(());
    };
    let mut current = TraceRecord::parse(&first_line).context("parsing first trace record")?;

    loop {
        let (timestamp_ms, application, environment) = match current {
            TraceRecord::Arrival { timestamp_ms, application, environment } => (timestamp_ms, application, environment),
            TraceRecord::End => return Ok(()),
        };

        dispatch_arrival(Arc::clone(&scheduler), application, environment);

        let Some(next_line) = lines.next_line().await? else {
            return Ok(());
        };
        let next = TraceRecord::parse(&next_line).context("parsing trace record")?;

        if let TraceRecord::Arrival { timestamp_ms: next_ts, .. } = &next {
            let sleep_ms = next_ts.saturating_sub(timestamp_ms).max(0);
            #[allow(clippy::cast_sign_loss)]
            tokio::time::sleep(Duration::from_millis(sleep_ms as u64)).await;
        }

        current = next;
    }
}

fn dispatch_arrival(scheduler: Arc<Scheduler>, application: String, environment: String) {
    let issued_at = Instant::now();
    tokio::spawn(async move {
        let outcome = scheduler.schedule(&application, &environment).await;
        let latency_ms = issued_at.elapsed().as_millis();
        match outcome {
            ScheduleOutcome::Placed { sandbox_id, machine_id } => {
                info!(sandbox_id, machine_id, latency_ms, application, environment, "request placed");
            }
            ScheduleOutcome::Dropped => {
                warn!(latency_ms, application, environment, "request dropped");
            }
        }
    });
}
