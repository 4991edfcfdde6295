//! The request scheduler: drives the controller from a trace of arrivals per the cluster's
//! request-scheduling design.
//!
//! Each arrival records itself in the target environment's arrival window, then looks for
//! a sandbox it can reuse (warm, dedup, or a running piggyback) before paying for a cold
//! spawn. When no machine has room for a fresh sandbox, it falls back to evicting an idle
//! warm/dedup sandbox elsewhere in the cluster and retries. Both the retry loop and the
//! eviction fallback are bounded, so a pathological trace degrades into dropped requests
//! instead of spinning forever.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use meshbox_proto::SandboxState;

use crate::state::Controller;
use crate::worker_client::WorkerClient;

/// Deadline applied to a cold `Spawn` RPC.
pub const COLD_SPAWN_DEADLINE: Duration = Duration::from_millis(3500);
/// Deadline applied to a warm `Restart` RPC.
pub const WARM_RESTART_DEADLINE: Duration = Duration::from_millis(2000);
/// Deadline applied to a dedup `Restore` RPC.
pub const DEDUP_RESTORE_DEADLINE: Duration = Duration::from_millis(5000);
/// Sleep between polls of a machine's dedup-restore concurrency gate.
const DEDUP_GATE_POLL: Duration = Duration::from_millis(50);
/// Backoff applied after a failed cold spawn before the scheduler retries.
const COLD_SPAWN_BACKOFF: Duration = Duration::from_millis(100);

/// Tunables for [`Scheduler::schedule`]'s retry/eviction loop.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Upper bound on find-or-create attempts before a request is dropped.
    pub max_tries: u32,
    /// Upper bound on evictions attempted per request.
    pub max_evictions: u32,
    /// The "just decided, don't re-touch it yet" window excluded from both reuse and
    /// eviction candidate searches.
    pub decision_window: (Duration, Duration),
    /// Minimum time a sandbox must have rested before it is eligible for reuse.
    pub reuse_period: Duration,
    /// Cap on concurrent dedup-restores per machine.
    pub dedup_starts_per_machine: u32,
    /// Consecutive RPC failures against one sandbox before the scheduler escalates to a
    /// controller-initiated purge.
    pub failure_threshold: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_tries: 1000,
            max_evictions: 64,
            decision_window: (Duration::from_millis(0), Duration::from_millis(0)),
            reuse_period: Duration::from_millis(0),
            dedup_starts_per_machine: 2,
            failure_threshold: 5,
        }
    }
}

/// Outcome of one [`Scheduler::schedule`] call, for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// A sandbox was placed (reused or cold-spawned) and put into `Running`.
    Placed {
        /// The sandbox serving the request.
        sandbox_id: u64,
        /// The machine it is running on.
        machine_id: u32,
    },
    /// Every retry and eviction attempt was exhausted; the request was dropped.
    Dropped,
}

/// Drives the controller and the cluster's workers for one trace of arrivals.
///
/// One `Scheduler` per controller process; `workers` is built once at startup by dialing
/// every machine in the cluster config and is otherwise read-only for the scheduler's
/// lifetime.
pub struct Scheduler {
    controller: Arc<Controller>,
    workers: HashMap<u32, Arc<WorkerClient>>,
    config: SchedulerConfig,
}

impl Scheduler {
    /// Builds a scheduler over an already-populated controller and worker-client map.
    pub const fn new(
        controller: Arc<Controller>,
        workers: HashMap<u32, Arc<WorkerClient>>,
        config: SchedulerConfig,
    ) -> Self {
        Self { controller, workers, config }
    }

    /// Handles one request arrival for `application` running in `environment`.
    pub async fn schedule(&self, application: &str, environment: &str) -> ScheduleOutcome {
        self.controller.record_arrival(environment);

        let mut evictions = 0u32;
        for _try in 0..self.config.max_tries {
            if let Some((sandbox_id, machine_id, prior_state)) = self.controller.find_reusable_sandbox(
                environment,
                self.config.reuse_period,
                self.config.decision_window,
            ) {
                if self.reuse(sandbox_id, machine_id, prior_state).await.is_ok() {
                    return ScheduleOutcome::Placed { sandbox_id, machine_id };
                }
                continue;
            }

            if let Some(machine_id) = self.controller.pick_machine_round_robin() {
                let sandbox_id =
                    self.controller.create_sandbox(machine_id, application.to_owned(), environment.to_owned());
                if self.cold_spawn(sandbox_id, machine_id, application, environment).await.is_ok() {
                    return ScheduleOutcome::Placed { sandbox_id, machine_id };
                }
                tokio::time::sleep(COLD_SPAWN_BACKOFF).await;
                continue;
            }

            if evictions >= self.config.max_evictions {
                break;
            }
            if self.evict_one().await.is_none() {
                break;
            }
            evictions += 1;
        }

        self.controller.stats().record_dropped();
        ScheduleOutcome::Dropped
    }

    /// Restarts or restores a matched sandbox and brings it to `Running`.
    async fn reuse(&self, sandbox_id: u64, machine_id: u32, prior_state: SandboxState) -> Result<(), ()> {
        let Some(worker) = self.workers.get(&machine_id).cloned() else {
            self.escalate_on_failure(sandbox_id, machine_id).await;
            return Err(());
        };

        let is_running_piggyback = prior_state == SandboxState::Running;

        let result = match prior_state {
            SandboxState::Warm => {
                self.controller.stats().record_issued();
                let result = worker.restart(sandbox_id, WARM_RESTART_DEADLINE).await;
                self.controller.stats().record_completed();
                result.map_err(|err| warn!(sandbox_id, machine_id, %err, "restart failed"))
            }
            SandboxState::Dedup => {
                let mut polls = 0u32;
                while !self.controller.try_begin_dedup_start(machine_id, self.config.dedup_starts_per_machine) {
                    polls += 1;
                    if polls > self.config.max_tries {
                        return Err(());
                    }
                    tokio::time::sleep(DEDUP_GATE_POLL).await;
                }
                self.controller.stats().record_issued();
                let result = worker.restore(sandbox_id, DEDUP_RESTORE_DEADLINE).await;
                self.controller.stats().record_completed();
                self.controller.end_dedup_start(machine_id);
                result.map_err(|err| warn!(sandbox_id, machine_id, %err, "restore failed"))
            }
            // A running sandbox was piggybacked: it always settles into Warm or Base on
            // its own. Poll for that, wait out the reuse-quiescence period, then restart
            // it for the new request same as a plain warm match.
            SandboxState::Running => {
                let mut polls = 0u32;
                loop {
                    match self.controller.sandbox_state(sandbox_id) {
                        Some(SandboxState::Warm | SandboxState::Base) => break,
                        None => {
                            self.controller.clear_next_assigned(sandbox_id);
                            return Err(());
                        }
                        _ => {}
                    }
                    polls += 1;
                    if polls > self.config.max_tries {
                        self.controller.clear_next_assigned(sandbox_id);
                        return Err(());
                    }
                    tokio::time::sleep(DEDUP_GATE_POLL).await;
                }
                tokio::time::sleep(self.config.reuse_period).await;

                self.controller.stats().record_issued();
                let result = worker.restart(sandbox_id, WARM_RESTART_DEADLINE).await;
                self.controller.stats().record_completed();
                result.map_err(|err| warn!(sandbox_id, machine_id, %err, "restart failed"))
            }
            SandboxState::Base | SandboxState::Dummy | SandboxState::Purge => {
                return Ok(());
            }
        };

        if is_running_piggyback {
            self.controller.clear_next_assigned(sandbox_id);
        }

        match result {
            Ok(used) => {
                let _ = self.controller.update_available_memory(machine_id, used.used_memory_mb);
                let _ = self.controller.update_status(sandbox_id, SandboxState::Running);
                Ok(())
            }
            Err(()) => {
                self.escalate_on_failure(sandbox_id, machine_id).await;
                Err(())
            }
        }
    }

    /// Spawns a brand-new sandbox on `machine_id`.
    async fn cold_spawn(
        &self,
        sandbox_id: u64,
        machine_id: u32,
        application: &str,
        environment: &str,
    ) -> Result<(), ()> {
        let Some(worker) = self.workers.get(&machine_id).cloned() else {
            self.escalate_on_failure(sandbox_id, machine_id).await;
            return Err(());
        };

        self.controller.stats().record_issued();
        let result = worker
            .spawn(sandbox_id, application.to_owned(), environment.to_owned(), COLD_SPAWN_DEADLINE)
            .await;
        self.controller.stats().record_completed();

        match result {
            Ok(used) => {
                let _ = self.controller.update_available_memory(machine_id, used.used_memory_mb);
                let _ = self.controller.update_status(sandbox_id, SandboxState::Running);
                Ok(())
            }
            Err(err) => {
                warn!(sandbox_id, machine_id, %err, "cold spawn failed");
                self.escalate_on_failure(sandbox_id, machine_id).await;
                Err(())
            }
        }
    }

    /// Records a failed RPC; once a sandbox has failed `failure_threshold` times in a row
    /// the scheduler gives up on it and asks the worker to purge it outright.
    async fn escalate_on_failure(&self, sandbox_id: u64, machine_id: u32) {
        let Ok(count) = self.controller.record_failure(sandbox_id) else {
            return;
        };
        if count < self.config.failure_threshold {
            return;
        }
        warn!(sandbox_id, machine_id, count, "escalating to purge after repeated rpc failures");
        if let Some(worker) = self.workers.get(&machine_id) {
            let _ = worker.purge(sandbox_id, COLD_SPAWN_DEADLINE).await;
        }
        self.controller.remove_sandbox(sandbox_id);
    }

    /// Picks and purges one idle warm/dedup sandbox cluster-wide to free a reuse slot.
    async fn evict_one(&self) -> Option<()> {
        let (victim_id, machine_id) = self.controller.pick_eviction_victim(self.config.decision_window)?;
        self.controller.claim_for_eviction(victim_id).ok()?;
        if let Some(worker) = self.workers.get(&machine_id) {
            let _ = worker.purge(victim_id, COLD_SPAWN_DEADLINE).await;
        }
        self.controller.remove_sandbox(victim_id);
        Some(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Scheduler, SchedulerConfig, ScheduleOutcome};
    use crate::state::Controller;
    use crate::worker_client::WorkerClient;
    use meshbox_cas::PlannerWeights;
    use meshbox_config::params::{
        ConfigurationParams, ConstraintKind, FingerprintParams, ParamConfig, PolicyConfig, RuntimeParams,
    };
    use meshbox_proto::wire::Packet;
    use meshbox_proto::worker::{UsedMemoryResponse, WorkerRequest, WorkerResponse};
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn params() -> ParamConfig {
        ParamConfig {
            policy: PolicyConfig {
                policy_id: 0,
                constraint: ConstraintKind::Latency,
                dedup_per_base: 10,
                alpha: 0.1,
                beta: 0.2,
                gamma: 1.5,
                provisioned: true,
            },
            params: RuntimeParams { reuse_period_ms: 0, arrival_window_minutes: 5, memory_cap_mb: 4096 },
            configuration: ConfigurationParams { num_env: 1, applications: Vec::new() },
            parameters: FingerprintParams {
                chunks_per_page: 2,
                idle_time_s: 30,
                nopause: false,
                adaptive: false,
                patch_threshold: 4096,
            },
        }
    }

    /// Spawns a fake worker that always answers `Spawn`/`Restart`/`Restore`/`Purge` with a
    /// fixed used-memory response.
    async fn fake_worker() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else { return };
                tokio::spawn(async move {
                    let mut acc = Vec::new();
                    let mut buf = [0_u8; 4096];
                    loop {
                        while let Ok((request, consumed)) = Packet::decode::<WorkerRequest>(&acc) {
                            let response = match request {
                                WorkerRequest::Terminate(_) => WorkerResponse::Ack,
                                _ => WorkerResponse::UsedMemory(UsedMemoryResponse { used_memory_mb: 64 }),
                            };
                            let framed = Packet::encode(&response).unwrap();
                            if socket.write_all(&framed).await.is_err() {
                                return;
                            }
                            acc.drain(..consumed);
                        }
                        let Ok(n) = socket.read(&mut buf).await else { return };
                        if n == 0 {
                            return;
                        }
                        acc.extend_from_slice(&buf[..n]);
                    }
                });
            }
        });
        addr
    }

    async fn scheduler_with_one_machine() -> (Scheduler, Arc<Controller>) {
        let controller = Arc::new(Controller::new(params(), PlannerWeights::default()));
        controller.add_machine(crate::model::Machine {
            id: 0,
            addr: "127.0.0.1".into(),
            port: 0,
            total_memory_mb: 4096,
            used_memory_mb: 0,
            num_dedup_starts: 0,
        });

        let addr = fake_worker().await;
        let client = Arc::new(WorkerClient::connect(addr).await.unwrap());
        let mut workers = HashMap::new();
        workers.insert(0, client);

        let scheduler = Scheduler::new(Arc::clone(&controller), workers, SchedulerConfig::default());
        (scheduler, controller)
    }

    // ── 1. a cold arrival with an empty cluster places a brand-new sandbox ──
    #[tokio::test]
    async fn cold_arrival_places_new_sandbox() {
        let (scheduler, controller) = scheduler_with_one_machine().await;
        let outcome = scheduler.schedule("app0", "env0").await;
        match outcome {
            ScheduleOutcome::Placed { sandbox_id, machine_id } => {
                assert_eq!(machine_id, 0);
                assert_eq!(controller.sandbox_state(sandbox_id), Some(meshbox_proto::SandboxState::Running));
            }
            ScheduleOutcome::Dropped => panic!("expected a placement"),
        }
        assert_eq!(controller.stats().issued_requests(), 1);
        assert_eq!(controller.stats().completed_requests(), 1);
    }

    // ── 2. a warm sandbox in the same environment is reused instead of cold-spawning ──
    #[tokio::test]
    async fn warm_sandbox_is_reused() {
        let (scheduler, controller) = scheduler_with_one_machine().await;
        let warm_id = controller.create_sandbox(0, "app0".into(), "env0".into());
        controller.update_status(warm_id, meshbox_proto::SandboxState::Warm).unwrap();

        let outcome = scheduler.schedule("app0", "env0").await;
        assert_eq!(outcome, ScheduleOutcome::Placed { sandbox_id: warm_id, machine_id: 0 });
        assert_eq!(controller.sandbox_state(warm_id), Some(meshbox_proto::SandboxState::Running));
    }

    // ── 3. piggybacking a running sandbox waits for it to settle then restarts it,
    //       clearing the claim flag so it is reusable again afterwards ──
    #[tokio::test]
    async fn running_sandbox_is_piggybacked_and_unclaimed_after() {
        let (scheduler, controller) = scheduler_with_one_machine().await;
        let running_id = controller.create_sandbox(0, "app0".into(), "env0".into());
        controller.update_status(running_id, meshbox_proto::SandboxState::Running).unwrap();

        let settle_controller = Arc::clone(&controller);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = settle_controller.update_status(running_id, meshbox_proto::SandboxState::Warm);
        });

        let outcome = scheduler.schedule("app0", "env0").await;
        assert_eq!(outcome, ScheduleOutcome::Placed { sandbox_id: running_id, machine_id: 0 });
        assert_eq!(controller.sandbox_state(running_id), Some(meshbox_proto::SandboxState::Running));

        // The piggyback claim must be released so the sandbox can be matched again.
        let reused_again = controller.find_reusable_sandbox(
            "env0",
            Duration::from_secs(0),
            (Duration::from_secs(9999), Duration::from_secs(9999)),
        );
        assert_eq!(reused_again.map(|(id, ..)| id), Some(running_id));
    }

    // ── 4. a request with no machines and nothing to reuse or evict is dropped ──
    #[tokio::test]
    async fn unplaceable_request_is_dropped() {
        let controller = Arc::new(Controller::new(params(), PlannerWeights::default()));
        let scheduler = Scheduler::new(Arc::clone(&controller), HashMap::new(), SchedulerConfig::default());
        let outcome = scheduler.schedule("app0", "env0").await;
        assert_eq!(outcome, ScheduleOutcome::Dropped);
        assert_eq!(controller.stats().dropped_requests(), 1);
    }
}
