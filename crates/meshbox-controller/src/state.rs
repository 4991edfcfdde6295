//! `Controller`: the single shared, in-memory authority over every sandbox, machine,
//! application, and environment the cluster knows about.
//!
//! One `Controller` value is built once in the binary's `main` and handed by `Arc` to the
//! RPC server and the scheduler, rather than reached for as a process-wide singleton.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use meshbox_cas::registry::{PageRegistry, RegistryEntry};
use meshbox_cas::{DedupPlanner, PlannerWeights};
use meshbox_config::params::{ApplicationParams, ParamConfig};
use meshbox_proto::controller::{BasePage, PageHashes};
use meshbox_proto::{Decision, SandboxState};
use parking_lot::RwLock;
use thiserror::Error;

use crate::model::{Application, EnvironmentStats, Machine, Sandbox};
use crate::policy::{evaluate_decision, DecisionContext};
use crate::stats::ControllerStats;

/// Errors the controller's state operations can surface.
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum ControllerError {
    /// The referenced sandbox is not known to the controller.
    #[error("sandbox not found")]
    SandboxNotFound,
    /// The referenced machine is not known to the controller.
    #[error("machine not found")]
    MachineNotFound,
    /// The sandbox was currently `Dummy` when a call required a resting state.
    #[error("sandbox is mid-transition")]
    SandboxDummy,
    /// No machine in the cluster currently has enough memory for this request.
    #[error("no machine with enough memory")]
    NoMachineAvailable,
}

/// The controller's full shared state.
pub struct Controller {
    sandboxes: RwLock<HashMap<u64, Sandbox>>,
    next_sandbox_id: AtomicU64,
    machines: RwLock<HashMap<u32, Machine>>,
    round_robin: AtomicU32,
    applications: RwLock<HashMap<String, Application>>,
    env_stats: RwLock<HashMap<String, EnvironmentStats>>,
    page_registry: PageRegistry,
    planner_weights: PlannerWeights,
    params: ParamConfig,
    stats: ControllerStats,
}

impl Controller {
    /// Builds a fresh controller over `params`, with no sandboxes and no machines yet.
    pub fn new(params: ParamConfig, planner_weights: PlannerWeights) -> Self {
        Self {
            sandboxes: RwLock::new(HashMap::new()),
            next_sandbox_id: AtomicU64::new(0),
            machines: RwLock::new(HashMap::new()),
            round_robin: AtomicU32::new(0),
            applications: RwLock::new(HashMap::new()),
            env_stats: RwLock::new(HashMap::new()),
            page_registry: PageRegistry::new(),
            planner_weights,
            params,
            stats: ControllerStats::new(),
        }
    }

    /// The process-wide request/dropped counters.
    pub const fn stats(&self) -> &ControllerStats {
        &self.stats
    }

    /// The configured parameters this controller was built with.
    pub const fn params(&self) -> &ParamConfig {
        &self.params
    }

    /// Registers (or replaces) a machine's bookkeeping entry.
    pub fn add_machine(&self, machine: Machine) {
        self.machines.write().insert(machine.id, machine);
    }

    /// Registers (or replaces) an application's configured parameters.
    pub fn add_application(&self, tag: String, params: ApplicationParams, policy_id: u32) {
        self.applications.write().insert(
            tag,
            Application {
                keep_alive_s: params.keep_alive_s,
                exec_time_ms: params.exec_time_ms,
                policy_id,
                memory_mb: params.memory_mb,
                dedup_benefit: params.dedup_benefit,
            },
        );
    }

    fn env_stats_mut<'a>(
        envs: &'a mut HashMap<String, EnvironmentStats>,
        environment: &str,
        window_minutes: usize,
    ) -> &'a mut EnvironmentStats {
        envs.entry(environment.to_owned())
            .or_insert_with(|| EnvironmentStats::new(window_minutes))
    }

    /// Records one arrival in `environment`'s arrival-rate window, rolling the minute
    /// bucket if due.
    pub fn record_arrival(&self, environment: &str) {
        #[allow(clippy::cast_possible_truncation)]
        let window_minutes = self.params.params.arrival_window_minutes as usize;
        let mut envs = self.env_stats.write();
        Self::env_stats_mut(&mut envs, environment, window_minutes).record_arrival();
    }

    /// Picks a machine round-robin, skipping any without enough memory, starting from the
    /// shared cursor. Returns `None` if a full cycle finds no eligible machine.
    pub fn pick_machine_round_robin(&self) -> Option<u32> {
        let machines = self.machines.read();
        if machines.is_empty() {
            return None;
        }
        let mut ids: Vec<u32> = machines.keys().copied().collect();
        ids.sort_unstable();
        let len = ids.len();
        #[allow(clippy::cast_possible_truncation)]
        let start = self.round_robin.fetch_add(1, Ordering::SeqCst) as usize % len;
        for offset in 0..len {
            let idx = (start + offset) % len;
            let id = ids[idx];
            if machines
                .get(&id)
                .is_some_and(Machine::has_enough_memory)
            {
                return Some(id);
            }
        }
        None
    }

    /// Creates a new sandbox entry in `Dummy`, awaiting a spawn RPC. Returns its new id.
    pub fn create_sandbox(&self, machine_id: u32, application: String, environment: String) -> u64 {
        let id = self.next_sandbox_id.fetch_add(1, Ordering::SeqCst);
        self.sandboxes
            .write()
            .insert(id, Sandbox::new(id, machine_id, application, environment));
        id
    }

    /// Removes a sandbox from the controller's map outright (used after a successful
    /// purge acknowledgement or an explicit `RemoveContainer`).
    pub fn remove_sandbox(&self, sandbox_id: u64) -> Option<Sandbox> {
        self.sandboxes.write().remove(&sandbox_id)
    }

    /// Applies a status update to a sandbox (`UpdateStatus` / `UpdateContainerStatus`).
    pub fn update_status(
        &self,
        sandbox_id: u64,
        status: SandboxState,
    ) -> Result<(), ControllerError> {
        let mut sandboxes = self.sandboxes.write();
        let sandbox = sandboxes
            .get_mut(&sandbox_id)
            .ok_or(ControllerError::SandboxNotFound)?;
        sandbox.update_status(status);
        Ok(())
    }

    /// Marks a sandbox as blacklisted (sticky).
    pub fn blacklist(&self, sandbox_id: u64) -> Result<(), ControllerError> {
        let mut sandboxes = self.sandboxes.write();
        let sandbox = sandboxes
            .get_mut(&sandbox_id)
            .ok_or(ControllerError::SandboxNotFound)?;
        sandbox.blacklisted = true;
        Ok(())
    }

    /// Attempts to claim one of `machine_id`'s bounded dedup-restore concurrency slots.
    /// Returns `false` if the machine is unknown or already at its cap; the scheduler
    /// spins on this (50 ms sleeps) before issuing a dedup `Restore` RPC.
    pub fn try_begin_dedup_start(&self, machine_id: u32, cap: u32) -> bool {
        let mut machines = self.machines.write();
        let Some(machine) = machines.get_mut(&machine_id) else {
            return false;
        };
        if machine.num_dedup_starts >= cap {
            return false;
        }
        machine.num_dedup_starts += 1;
        true
    }

    /// Releases a dedup-restore concurrency slot claimed by [`Self::try_begin_dedup_start`].
    /// Called once the `Restore` RPC returns, success or failure.
    pub fn end_dedup_start(&self, machine_id: u32) {
        if let Some(machine) = self.machines.write().get_mut(&machine_id) {
            machine.num_dedup_starts = machine.num_dedup_starts.saturating_sub(1);
        }
    }

    /// Updates a machine's last-reported used memory.
    pub fn update_available_memory(
        &self,
        machine_id: u32,
        used_memory_mb: u64,
    ) -> Result<(), ControllerError> {
        let mut machines = self.machines.write();
        let machine = machines
            .get_mut(&machine_id)
            .ok_or(ControllerError::MachineNotFound)?;
        machine.used_memory_mb = used_memory_mb;
        Ok(())
    }

    /// `GetDecision`: evaluates the decision policy for `sandbox_id` and applies its side
    /// effects (sticky flags, base-quota promotion, Dummy transition for non-PURGE, map
    /// removal for PURGE).
    pub fn get_decision(&self, sandbox_id: u64) -> Result<Decision, ControllerError> {
        let mut sandboxes = self.sandboxes.write();
        let sandbox = sandboxes
            .get(&sandbox_id)
            .ok_or(ControllerError::SandboxNotFound)?;
        if sandbox.state == SandboxState::Dummy {
            return Err(ControllerError::SandboxDummy);
        }

        let application = self
            .applications
            .read()
            .get(&sandbox.application)
            .cloned()
            .unwrap_or(Application {
                keep_alive_s: 0,
                exec_time_ms: 0,
                policy_id: 1,
                memory_mb: 0,
                dedup_benefit: 1.0,
            });
        let machine_total_mb = self
            .machines
            .read()
            .get(&sandbox.machine_id)
            .map_or(0, |m| m.total_memory_mb);

        let mut envs = self.env_stats.write();
        #[allow(clippy::cast_possible_truncation)]
        let window_minutes = self.params.params.arrival_window_minutes as usize;
        let env = Self::env_stats_mut(&mut envs, &sandbox.environment, window_minutes);

        let mut policy_params = self.params.policy.clone();
        policy_params.policy_id = application.policy_id;

        let ctx = DecisionContext {
            is_base: sandbox.is_base,
            is_dedup: sandbox.is_dedup,
            is_blacklisted: sandbox.blacklisted,
            state: sandbox.state,
            idle: sandbox.time_idle(),
            num_warm: env.num_warm,
            num_dedup: env.num_dedup,
            num_base: env.num_base,
            base_ready: env.base_ready,
            warm_start_ema_ms: env.warm_start_ema.get(),
            dedup_start_ema_ms: env.dedup_start_ema.get(),
            max_arrival_rate: env.max_arrival_rate(),
            moving_window_rate: env.moving_window_arrival_rate(),
            exec_time_ms: application.exec_time_ms,
            reuse_period_ms: self.params.params.reuse_period_ms,
            dedup_benefit: application.dedup_benefit,
            app_memory_mb: application.memory_mb,
            machine_total_memory_mb: machine_total_mb,
            policy: policy_params,
        };

        let outcome = evaluate_decision(&ctx);
        if outcome.promote_to_base {
            env.num_base += 1;
        }
        drop(envs);

        let sandbox = sandboxes
            .get_mut(&sandbox_id)
            .ok_or(ControllerError::SandboxNotFound)?;
        match outcome.decision {
            Decision::Purge => {
                drop(sandboxes);
                self.sandboxes.write().remove(&sandbox_id);
            }
            Decision::Base | Decision::Dedup | Decision::Warm => {
                sandbox.update_status(SandboxState::Dummy);
            }
        }

        Ok(outcome.decision)
    }

    /// `RegisterPages`: records a base sandbox's page fingerprints in the registry and
    /// marks the owning environment `base_ready`.
    pub fn register_pages(
        &self,
        sandbox_id: u64,
        machine_id: u32,
        payload: &[PageHashes],
    ) -> Result<(), ControllerError> {
        let environment = {
            let sandboxes = self.sandboxes.read();
            sandboxes
                .get(&sandbox_id)
                .map(|s| s.environment.clone())
                .ok_or(ControllerError::SandboxNotFound)?
        };

        for page in payload {
            let Some(region_id) = page.region_id else {
                continue;
            };
            for digest in &page.hashes {
                self.page_registry.insert(
                    *digest,
                    RegistryEntry {
                        sandbox_id,
                        machine_id,
                        region_id,
                        offset: page.addr,
                    },
                );
            }
        }

        #[allow(clippy::cast_possible_truncation)]
        let window_minutes = self.params.params.arrival_window_minutes as usize;
        let mut envs = self.env_stats.write();
        Self::env_stats_mut(&mut envs, &environment, window_minutes).base_ready = true;
        Ok(())
    }

    /// `GetBaseContainers`: plans dedup matches for a candidate sandbox's page list and
    /// bumps refcounts on every distinct base chosen.
    pub fn get_base_containers(
        &self,
        _sandbox_id: u64,
        machine_id: u32,
        payload: &[PageHashes],
    ) -> Vec<BasePage> {
        let candidate_pages: Vec<meshbox_cas::planner::CandidatePage> = payload
            .iter()
            .map(|p| meshbox_cas::planner::CandidatePage {
                addr: p.addr,
                digests: p.hashes.clone(),
            })
            .collect();

        let planner = DedupPlanner::new(&self.page_registry, self.planner_weights);
        let refcount_of = |base_id: u64| -> u64 {
            self.sandboxes
                .read()
                .get(&base_id)
                .map_or(0, |s| u64::from(s.refcount))
        };
        let plan = planner.plan(machine_id, &candidate_pages, refcount_of);

        {
            let mut sandboxes = self.sandboxes.write();
            for base_id in &plan.chosen_bases {
                if let Some(base) = sandboxes.get_mut(base_id) {
                    base.refcount += 1;
                }
            }
        }

        plan.matched
            .into_iter()
            .map(|m| BasePage {
                addr: m.addr,
                machine_id: m.base.machine_id,
                region_id: m.base.region_id,
                base_addr: m.base.offset,
            })
            .collect()
    }

    /// Selects the eviction candidate environment (greatest `num_warm` per arrival rate)
    /// and, within it, the victim sandbox. Returns `(sandbox_id, machine_id)` of the
    /// victim, if any environment currently has an eligible non-next-assigned warm/dedup
    /// sandbox.
    pub fn pick_eviction_victim(&self, decision_window: (Duration, Duration)) -> Option<(u64, u32)> {
        let envs = self.env_stats.read();
        let eviction_env = envs
            .iter()
            .max_by(|(_, a), (_, b)| {
                let ra = a.num_warm as f64 / a.moving_window_arrival_rate().max(f64::EPSILON);
                let rb = b.num_warm as f64 / b.moving_window_arrival_rate().max(f64::EPSILON);
                ra.total_cmp(&rb)
            })
            .map(|(name, _)| name.clone())?;
        drop(envs);

        let sandboxes = self.sandboxes.read();
        sandboxes
            .values()
            .filter(|s| {
                s.environment == eviction_env
                    && !s.next_assigned
                    && matches!(s.state, SandboxState::Warm | SandboxState::Dedup)
                    && !(s.time_since_last_modified() >= decision_window.0
                        && s.time_since_last_modified() <= decision_window.1)
                    && s.time_since_last_modified() >= Duration::from_secs(2)
            })
            .max_by_key(|s| s.time_since_last_modified())
            .map(|s| (s.id, s.machine_id))
    }

    /// Claims a sandbox for eviction by moving it to `Dummy`.
    pub fn claim_for_eviction(&self, sandbox_id: u64) -> Result<(), ControllerError> {
        let mut sandboxes = self.sandboxes.write();
        let sandbox = sandboxes
            .get_mut(&sandbox_id)
            .ok_or(ControllerError::SandboxNotFound)?;
        sandbox.update_status(SandboxState::Dummy);
        Ok(())
    }

    /// Finds the first eligible sandbox to reuse for `environment`. Prefers warm over
    /// dedup over running; claims the match (Dummy for warm/dedup, `next_assigned` for
    /// running).
    pub fn find_reusable_sandbox(
        &self,
        environment: &str,
        reuse_period: Duration,
        decision_window: (Duration, Duration),
    ) -> Option<(u64, u32, SandboxState)> {
        let is_eligible = |s: &Sandbox| {
            s.environment == environment
                && !s.next_assigned
                && s.time_since_last_modified() >= reuse_period
                && !(s.time_since_last_modified() >= decision_window.0
                    && s.time_since_last_modified() <= decision_window.1)
        };

        let mut sandboxes = self.sandboxes.write();
        let warm_id = sandboxes
            .values()
            .find(|s| is_eligible(s) && s.state == SandboxState::Warm)
            .map(|s| s.id);
        if let Some(id) = warm_id {
            if let Some(s) = sandboxes.get_mut(&id) {
                s.update_status(SandboxState::Dummy);
                return Some((id, s.machine_id, SandboxState::Warm));
            }
        }

        let dedup_id = sandboxes
            .values()
            .find(|s| is_eligible(s) && s.state == SandboxState::Dedup)
            .map(|s| s.id);
        if let Some(id) = dedup_id {
            if let Some(s) = sandboxes.get_mut(&id) {
                s.update_status(SandboxState::Dummy);
                return Some((id, s.machine_id, SandboxState::Dedup));
            }
        }

        let running_id = sandboxes
            .values()
            .find(|s| is_eligible(s) && s.state == SandboxState::Running)
            .map(|s| s.id);
        if let Some(id) = running_id {
            if let Some(s) = sandboxes.get_mut(&id) {
                s.next_assigned = true;
                return Some((id, s.machine_id, SandboxState::Running));
            }
        }

        None
    }

    /// Releases a piggyback claim taken by [`Controller::find_reusable_sandbox`] on a
    /// `Running` sandbox, making it eligible for reuse and eviction again. Must be called
    /// once the scheduler has finished driving that sandbox back to `Running` for the new
    /// request, whether the restart RPC it issues succeeds or fails.
    pub fn clear_next_assigned(&self, sandbox_id: u64) {
        if let Some(s) = self.sandboxes.write().get_mut(&sandbox_id) {
            s.next_assigned = false;
        }
    }

    /// Records a failed RPC against `sandbox_id`; returns the new failure count.
    pub fn record_failure(&self, sandbox_id: u64) -> Result<u32, ControllerError> {
        let mut sandboxes = self.sandboxes.write();
        let sandbox = sandboxes
            .get_mut(&sandbox_id)
            .ok_or(ControllerError::SandboxNotFound)?;
        sandbox.num_failed += 1;
        Ok(sandbox.num_failed)
    }

    /// Reads back a sandbox's current state, for tests and logging.
    pub fn sandbox_state(&self, sandbox_id: u64) -> Option<SandboxState> {
        self.sandboxes.read().get(&sandbox_id).map(|s| s.state)
    }

    /// Digest of a digest-value for tests: number of sandboxes currently tracked.
    pub fn sandbox_count(&self) -> usize {
        self.sandboxes.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::Controller;
    use crate::model::Machine;
    use meshbox_cas::PlannerWeights;
    use meshbox_config::params::{
        ConfigurationParams, ConstraintKind, FingerprintParams, ParamConfig, PolicyConfig, RuntimeParams,
    };
    use meshbox_proto::{Decision, SandboxState};
    use std::time::Duration;

    fn params() -> ParamConfig {
        ParamConfig {
            policy: PolicyConfig {
                policy_id: 0, // None-Openwhisk: always PURGE, simplest to assert on
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

    fn controller() -> Controller {
        Controller::new(params(), PlannerWeights::default())
    }

    fn machine(id: u32, total_mb: u64, used_mb: u64) -> Machine {
        Machine {
            id,
            addr: "127.0.0.1".into(),
            port: 9000 + u16::try_from(id).unwrap_or(0),
            total_memory_mb: total_mb,
            used_memory_mb: used_mb,
            num_dedup_starts: 0,
        }
    }

    // ── 1. a fresh sandbox starts in Dummy and create_sandbox assigns dense ids ──
    #[test]
    fn create_sandbox_assigns_dense_ids() {
        let controller = controller();
        let a = controller.create_sandbox(0, "app".into(), "env".into());
        let b = controller.create_sandbox(0, "app".into(), "env".into());
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(controller.sandbox_state(a), Some(SandboxState::Dummy));
    }

    // ── 2. S1 cold start: GetDecision on an unknown sandbox is SandboxNotFound ──
    #[test]
    fn get_decision_unknown_is_not_found() {
        let controller = controller();
        assert!(controller.get_decision(999).is_err());
    }

    // ── 3. GetDecision on a Dummy sandbox is SandboxDummy, not a silent decision ──
    #[test]
    fn get_decision_dummy_sandbox_rejected() {
        let controller = controller();
        let id = controller.create_sandbox(0, "app".into(), "env".into());
        assert_eq!(controller.get_decision(id), Err(super::ControllerError::SandboxDummy));
    }

    // ── 4. None-Openwhisk always PURGE removes the sandbox from the map ──
    #[test]
    fn none_openwhisk_purge_removes_sandbox() {
        let controller = controller();
        let id = controller.create_sandbox(0, "app".into(), "env".into());
        controller.update_status(id, SandboxState::Warm).unwrap();
        let decision = controller.get_decision(id).unwrap();
        assert_eq!(decision, Decision::Purge);
        assert_eq!(controller.sandbox_state(id), None);
    }

    // ── 5. round-robin skips machines without enough memory ──
    #[test]
    fn round_robin_skips_full_machines() {
        let controller = controller();
        controller.add_machine(machine(0, 1000, 999)); // < 5% free, not enough
        controller.add_machine(machine(1, 1000, 100));
        let picked = controller.pick_machine_round_robin();
        assert_eq!(picked, Some(1));
    }

    // ── 6. round-robin with no eligible machine returns None ──
    #[test]
    fn round_robin_none_when_all_full() {
        let controller = controller();
        controller.add_machine(machine(0, 1000, 999));
        assert_eq!(controller.pick_machine_round_robin(), None);
    }

    // ── 7. dedup-start gating is bounded per machine and reversible ──
    #[test]
    fn dedup_start_gating_is_bounded() {
        let controller = controller();
        controller.add_machine(machine(0, 1000, 0));
        assert!(controller.try_begin_dedup_start(0, 1));
        assert!(!controller.try_begin_dedup_start(0, 1));
        controller.end_dedup_start(0);
        assert!(controller.try_begin_dedup_start(0, 1));
    }

    // ── 8. find_reusable_sandbox prefers Warm over Dedup over Running ──
    #[test]
    fn find_reusable_prefers_warm_over_dedup() {
        let controller = controller();
        let dedup_id = controller.create_sandbox(0, "app".into(), "env".into());
        controller.update_status(dedup_id, SandboxState::Dedup).unwrap();
        let warm_id = controller.create_sandbox(0, "app".into(), "env".into());
        controller.update_status(warm_id, SandboxState::Warm).unwrap();

        let found = controller
            .find_reusable_sandbox("env", Duration::from_secs(0), (Duration::from_secs(9999), Duration::from_secs(9999)))
            .expect("a reusable sandbox");
        assert_eq!(found.0, warm_id);
        assert_eq!(controller.sandbox_state(warm_id), Some(SandboxState::Dummy));
    }

    // ── 9. a sandbox already claimed (next_assigned) is never matched again ──
    #[test]
    fn find_reusable_skips_next_assigned() {
        let controller = controller();
        let running_id = controller.create_sandbox(0, "app".into(), "env".into());
        controller.update_status(running_id, SandboxState::Running).unwrap();

        let first = controller
            .find_reusable_sandbox("env", Duration::from_secs(0), (Duration::from_secs(9999), Duration::from_secs(9999)))
            .expect("first claim");
        assert_eq!(first.0, running_id);

        let second = controller.find_reusable_sandbox(
            "env",
            Duration::from_secs(0),
            (Duration::from_secs(9999), Duration::from_secs(9999)),
        );
        assert!(second.is_none());

        controller.clear_next_assigned(running_id);
        let third = controller.find_reusable_sandbox(
            "env",
            Duration::from_secs(0),
            (Duration::from_secs(9999), Duration::from_secs(9999)),
        );
        assert_eq!(third.expect("claim available again after clear").0, running_id);
    }

    // ── 10. record_failure accumulates per sandbox ──
    #[test]
    fn record_failure_accumulates() {
        let controller = controller();
        let id = controller.create_sandbox(0, "app".into(), "env".into());
        controller.update_status(id, SandboxState::Warm).unwrap();
        assert_eq!(controller.record_failure(id).unwrap(), 1);
        assert_eq!(controller.record_failure(id).unwrap(), 2);
    }
}
