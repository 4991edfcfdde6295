//! The per-sandbox daemon tick and the decision → operation transitions it drives.
//!
//! One [`Worker`] per process, shared between the RPC server (`Spawn`/`Restart`/
//! `Restore`/`Purge`/`Terminate` handlers) and the daemon loop that ticks every sandbox
//! roughly every 50 ms. A single [`crate::pipe::DumpPipe`] and [`crate::pipe::RestorePids`]
//! pair is held here, giving the whole worker — not per sandbox — the "at most one
//! checkpoint/restore helper invocation in flight" guarantee.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use meshbox_cas::fingerprint::PAGE_SIZE;
use meshbox_cas::FingerprintStrategy;
use meshbox_config::params::{ApplicationParams, FingerprintParams};
use meshbox_proto::controller::PageHashes;
use meshbox_proto::runtime::RuntimeCall;
use meshbox_proto::worker::UsedMemoryResponse;
use meshbox_proto::{Decision, SandboxState};
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::controller_client::ControllerClient;
use crate::dedup::{encode_patch_file, fetch_pages, fingerprint_pages, DedupCodec};
use crate::delta::DeltaCodec;
use crate::error::WorkerError;
use crate::pipe::{DumpPipe, RestorePids};
use crate::runtime::SandboxRuntime;
use crate::sandbox::WorkerSandbox;

/// How long `Purge` waits between force-remove retries.
const PURGE_RETRY_INTERVAL: Duration = Duration::from_secs(60);
/// Fallback keep-alive used when a sandbox's application is not in the configured set.
const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);
/// Spawn helper retries before giving up.
const SPAWN_RETRIES: u32 = 5;

/// Static configuration a [`Worker`] is built with.
pub struct WorkerConfig {
    /// This machine's dense id, used when registering pages with the controller.
    pub machine_id: u32,
    /// Per-application timing/memory parameters, keyed by application tag (`"app0"`, …).
    pub applications: HashMap<String, ApplicationParams>,
    /// Fingerprinting and restore knobs (`chunks_per_page`, `idle_time_s`, `patch_threshold`, …).
    pub fingerprint: FingerprintParams,
    /// Directory holding each sandbox's memory-dump and patch files.
    pub dump_dir: PathBuf,
}

/// The worker's full shared state: sandbox map, runtime client, controller client, and
/// the checkpoint/restore exclusion primitives.
pub struct Worker {
    config: WorkerConfig,
    sandboxes: RwLock<HashMap<u64, WorkerSandbox>>,
    runtime: Arc<dyn SandboxRuntime>,
    controller: Arc<ControllerClient>,
    dedup: DedupCodec,
    dump_pipe: DumpPipe,
    restore_pids: RestorePids,
    shutting_down: AtomicBool,
}

impl Worker {
    /// Builds a worker over an already-connected controller client and runtime.
    pub fn new(
        config: WorkerConfig,
        runtime: Arc<dyn SandboxRuntime>,
        controller: Arc<ControllerClient>,
        dedup: DedupCodec,
        dump_pipe_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            config,
            sandboxes: RwLock::new(HashMap::new()),
            runtime,
            controller,
            dedup,
            dump_pipe: DumpPipe::new(dump_pipe_path),
            restore_pids: RestorePids::default(),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Whether `Terminate` has been received and the daemon loop should stop spawning new
    /// work.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    fn dump_file_path(&self, sandbox_id: u64) -> PathBuf {
        self.config.dump_dir.join(format!("sandbox-{sandbox_id}.dump"))
    }

    fn patch_file_path(&self, sandbox_id: u64) -> PathBuf {
        self.config.dump_dir.join(format!("sandbox-{sandbox_id}.patch"))
    }

    fn read_dump_pages(&self, sandbox_id: u64) -> Result<Vec<[u8; PAGE_SIZE]>, WorkerError> {
        let bytes = std::fs::read(self.dump_file_path(sandbox_id))?;
        let mut pages = Vec::with_capacity(bytes.len().div_ceil(PAGE_SIZE));
        for chunk in bytes.chunks(PAGE_SIZE) {
            let mut page = [0_u8; PAGE_SIZE];
            page[..chunk.len()].copy_from_slice(chunk);
            pages.push(page);
        }
        Ok(pages)
    }

    fn write_dump_pages(&self, sandbox_id: u64, pages: &[[u8; PAGE_SIZE]]) -> Result<(), WorkerError> {
        let mut bytes = Vec::with_capacity(pages.len() * PAGE_SIZE);
        for page in pages {
            bytes.extend_from_slice(page);
        }
        std::fs::write(self.dump_file_path(sandbox_id), bytes)?;
        Ok(())
    }

    fn application_params(&self, application: &str) -> ApplicationParams {
        self.config.applications.get(application).copied().unwrap_or(ApplicationParams {
            keep_alive_s: DEFAULT_KEEP_ALIVE.as_secs(),
            exec_time_ms: 0,
            memory_mb: 0,
            dedup_benefit: 1.0,
        })
    }

    fn container_name(&self, sandbox_id: u64) -> Option<String> {
        self.sandboxes.read().get(&sandbox_id).map(|s| s.container_name.clone())
    }

    fn transition_to(&self, sandbox_id: u64, state: SandboxState) {
        if let Some(sandbox) = self.sandboxes.write().get_mut(&sandbox_id) {
            sandbox.transition(state);
        }
    }

    // ---------------------------------------------------------------- RPC-facing calls

    /// `Spawn`: launches a fresh container, retrying the helper call up to
    /// [`SPAWN_RETRIES`] times before giving up.
    pub fn spawn(
        &self,
        sandbox_id: u64,
        application: String,
        environment: String,
    ) -> Result<UsedMemoryResponse, WorkerError> {
        let name = format!("cont{sandbox_id}");
        let mut last_err = None;
        for _attempt in 0..SPAWN_RETRIES {
            match self.runtime.call(&RuntimeCall::Launch {
                name: name.clone(),
                application: application.clone(),
            }) {
                Ok(_) => {
                    last_err = None;
                    break;
                }
                Err(err) => last_err = Some(err),
            }
        }
        if let Some(err) = last_err {
            return Err(err);
        }

        let memory_mb = self.application_params(&application).memory_mb;
        self.sandboxes
            .write()
            .insert(sandbox_id, WorkerSandbox::new_running(sandbox_id, application, environment));
        Ok(UsedMemoryResponse { used_memory_mb: memory_mb })
    }

    /// `Restart`: resumes a Warm or Base sandbox back to Running. Invalid on any other
    /// state.
    pub fn restart(&self, sandbox_id: u64) -> Result<UsedMemoryResponse, WorkerError> {
        let state = self.sandboxes.read().get(&sandbox_id).map(|s| s.state);
        match state {
            Some(SandboxState::Warm | SandboxState::Base) => {}
            Some(_) => return Err(WorkerError::StatePrecondition),
            None => return Err(WorkerError::SandboxNotFound),
        }
        let name = self.container_name(sandbox_id).ok_or(WorkerError::SandboxNotFound)?;
        self.runtime.call(&RuntimeCall::Unpause { name })?;
        self.transition_to(sandbox_id, SandboxState::Running);
        let memory_mb = self
            .sandboxes
            .read()
            .get(&sandbox_id)
            .map_or(0, |s| self.application_params(&s.application).memory_mb);
        Ok(UsedMemoryResponse { used_memory_mb: memory_mb })
    }

    /// `Restore`: reverses a Dedup sandbox back to Running to serve a request. Invalid
    /// unless the sandbox is currently Dedup.
    pub fn restore(&self, sandbox_id: u64) -> Result<UsedMemoryResponse, WorkerError> {
        if self.sandboxes.read().get(&sandbox_id).map(|s| s.state) != Some(SandboxState::Dedup) {
            return Err(WorkerError::StatePrecondition);
        }
        self.restore_from_dedup(sandbox_id, SandboxState::Running)?;
        let memory_mb = self
            .sandboxes
            .read()
            .get(&sandbox_id)
            .map_or(0, |s| self.application_params(&s.application).memory_mb);
        Ok(UsedMemoryResponse { used_memory_mb: memory_mb })
    }

    /// `Purge`: kills any parked restore helpers and force-removes the container.
    pub fn purge(&self, sandbox_id: u64) -> Result<UsedMemoryResponse, WorkerError> {
        for pid in self.restore_pids.drain() {
            kill_parked_pid(pid);
        }
        let name = self.container_name(sandbox_id).unwrap_or_else(|| format!("cont{sandbox_id}"));
        self.runtime.call(&RuntimeCall::Remove { name })?;
        let sandbox = self.sandboxes.write().remove(&sandbox_id);
        let _ = std::fs::remove_file(self.dump_file_path(sandbox_id));
        let _ = std::fs::remove_file(self.patch_file_path(sandbox_id));
        Ok(UsedMemoryResponse {
            used_memory_mb: sandbox.map_or(0, |s| self.application_params(&s.application).memory_mb),
        })
    }

    /// `Terminate`: flips the shutdown flag; the binary's main loop is expected to exit
    /// after a 2 s grace once it observes [`Self::is_shutting_down`].
    pub fn terminate(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    // -------------------------------------------------------------------- daemon tick

    /// Runs one daemon tick over every sandbox currently known to this worker.
    ///
    /// Reconsideration calls into the controller and the heavier transition sequences
    /// are dispatched as detached tasks so the tick itself never blocks on an RPC; each
    /// task re-reads the sandbox under the lock before acting, so a sandbox claimed by a
    /// concurrent RPC handler in the interim is simply skipped.
    pub fn tick(self: &Arc<Self>) {
        let snapshot: Vec<(u64, SandboxState, Duration, String)> = self
            .sandboxes
            .read()
            .values()
            .map(|s| (s.id, s.state, s.time_in_state(), s.application.clone()))
            .collect();

        for (id, state, time_in_state, application) in snapshot {
            let params = self.application_params(&application);
            match state {
                SandboxState::Warm => {
                    let idle = time_in_state;
                    if idle >= Duration::from_secs(self.config.fingerprint.idle_time_s)
                        && idle >= Duration::from_secs(params.keep_alive_s)
                    {
                        self.reconsider(id);
                    }
                }
                SandboxState::Base => {
                    if time_in_state >= Duration::from_secs(6 * params.keep_alive_s) {
                        self.reconsider(id);
                    }
                }
                SandboxState::Dedup => {
                    if time_in_state >= Duration::from_secs(self.config.fingerprint.idle_time_s) {
                        self.reconsider(id);
                    }
                }
                SandboxState::Running => {
                    if time_in_state >= Duration::from_millis(params.exec_time_ms) {
                        self.transition_to(id, SandboxState::Dummy);
                        let worker = Arc::clone(self);
                        tokio::spawn(async move {
                            if let Err(err) = worker.apply_previous_op(id) {
                                warn!(sandbox_id = id, %err, "previous-op reversion failed");
                            }
                        });
                    }
                }
                SandboxState::Purge => {
                    if time_in_state >= PURGE_RETRY_INTERVAL {
                        match self.purge(id) {
                            Ok(_) => info!(sandbox_id = id, "purge completed"),
                            Err(err) => {
                                warn!(sandbox_id = id, %err, "purge retry failed, will retry");
                                self.transition_to(id, SandboxState::Purge);
                            }
                        }
                    }
                }
                SandboxState::Dummy => {
                    if time_in_state >= Duration::from_secs(params.keep_alive_s) {
                        warn!(sandbox_id = id, "stuck in dummy, escalating to purge");
                        self.transition_to(id, SandboxState::Purge);
                    }
                }
            }
        }
    }

    /// Moves a sandbox to `Dummy` pending `GetDecision`, then applies the decision the
    /// controller returns on a detached task.
    fn reconsider(self: &Arc<Self>, sandbox_id: u64) {
        self.transition_to(sandbox_id, SandboxState::Dummy);
        let worker = Arc::clone(self);
        tokio::spawn(async move {
            let decision = match worker.controller.get_decision(sandbox_id).await {
                Ok(response) => response.decision,
                Err(err) => {
                    warn!(sandbox_id, %err, "get_decision failed, reverting to previous state");
                    let prior = worker.sandboxes.read().get(&sandbox_id).map(|s| s.previous_stable_state);
                    if let Some(state) = prior {
                        worker.transition_to(sandbox_id, state);
                    }
                    return;
                }
            };
            worker.apply_decision(sandbox_id, decision).await;
        });
    }

    async fn apply_decision(&self, sandbox_id: u64, decision: Decision) {
        let result = match decision {
            Decision::Base => self.handle_base(sandbox_id).await,
            Decision::Dedup => self.handle_dedup(sandbox_id).await,
            Decision::Warm => self.handle_warm(sandbox_id),
            Decision::Purge => {
                self.transition_to(sandbox_id, SandboxState::Purge);
                Ok(())
            }
        };
        if let Err(err) = result {
            warn!(sandbox_id, ?decision, %err, "decision transition failed, falling back to warm");
            let _ = self.controller.blacklist(sandbox_id).await;
            if let Some(name) = self.container_name(sandbox_id) {
                let _ = self.runtime.call(&RuntimeCall::Unpause { name });
            }
            self.transition_to(sandbox_id, SandboxState::Warm);
        }
    }

    /// Decision BASE: checkpoint (unless already checkpointed), pause, fingerprint,
    /// register pages with the controller.
    async fn handle_base(&self, sandbox_id: u64) -> Result<(), WorkerError> {
        let (name, checkpointed) = {
            let sandboxes = self.sandboxes.read();
            let sandbox = sandboxes.get(&sandbox_id).ok_or(WorkerError::SandboxNotFound)?;
            (sandbox.container_name.clone(), sandbox.checkpointed)
        };

        if !checkpointed {
            self.runtime.call(&RuntimeCall::Unpause { name: name.clone() })?;
            // The pipe write and the checkpoint call it triggers are one helper
            // invocation; both must happen under the same guard so a concurrent
            // BASE/DEDUP decision on another sandbox can't interleave its own
            // invocation in between.
            let guard = self.dump_pipe.lock();
            guard.write(&name)?;
            self.runtime.call(&RuntimeCall::Checkpoint { name: name.clone() })?;
        }
        self.runtime.call(&RuntimeCall::Pause { name: name.clone() })?;

        let pages = self.read_dump_pages(sandbox_id)?;
        let mut payload = fingerprint_pages(&pages, FingerprintStrategy::ValueSampled, self.config.fingerprint.chunks_per_page);
        for entry in &mut payload {
            entry.region_id = Some(self.config.machine_id);
        }
        self.controller.register_pages(sandbox_id, self.config.machine_id, payload).await?;
        self.controller.update_status(sandbox_id, SandboxState::Base).await?;

        let mut sandboxes = self.sandboxes.write();
        if let Some(sandbox) = sandboxes.get_mut(&sandbox_id) {
            sandbox.checkpointed = true;
            sandbox.transition(SandboxState::Base);
        }
        Ok(())
    }

    /// Decision DEDUP: checkpoint-with-exit, fingerprint, match against base pages,
    /// fetch and diff, write the patch file, park restore-helper pids, remove the
    /// original dump.
    async fn handle_dedup(&self, sandbox_id: u64) -> Result<(), WorkerError> {
        let name = self.container_name(sandbox_id).ok_or(WorkerError::SandboxNotFound)?;

        {
            let guard = self.dump_pipe.lock();
            guard.write(&name)?;
            self.runtime.call(&RuntimeCall::Checkpoint { name: name.clone() })?;
        }
        self.runtime.call(&RuntimeCall::Stop { name: name.clone() })?;

        let pages = self.read_dump_pages(sandbox_id)?;
        let candidate_hashes: Vec<PageHashes> =
            fingerprint_pages(&pages, FingerprintStrategy::ValueSampled, self.config.fingerprint.chunks_per_page);

        let base_pages = self
            .controller
            .get_base_containers(sandbox_id, self.config.machine_id, candidate_hashes)
            .await?
            .base_pages;

        let fetched = fetch_pages(&self.dedup.pipeline, &base_pages)?;
        let (dedup_map, patch_file) = encode_patch_file(
            &pages,
            &base_pages,
            &fetched,
            self.dedup.delta.as_ref(),
            self.config.fingerprint.patch_threshold,
        )?;

        std::fs::write(self.patch_file_path(sandbox_id), &patch_file)?;

        // Second pass: signal the restore-paused helper and read back the two real
        // CRIU pids it reports (the cloned CRIU process and the root restore
        // process), so a later purge can kill them. The signal and the pid read are
        // one helper invocation and must share a guard.
        {
            let guard = self.dump_pipe.lock();
            self.runtime.call(&RuntimeCall::StartFromCheckpoint {
                name: name.clone(),
                checkpoint_id: format!("sandbox-{sandbox_id}"),
            })?;
            guard.write(&name)?;
            let (cloned_pid, root_pid) = guard.read_pids()?;
            self.restore_pids.park(cloned_pid);
            self.restore_pids.park(root_pid);
        }
        let _ = std::fs::remove_file(self.dump_file_path(sandbox_id));

        self.controller.update_status(sandbox_id, SandboxState::Dedup).await?;

        let mut sandboxes = self.sandboxes.write();
        if let Some(sandbox) = sandboxes.get_mut(&sandbox_id) {
            sandbox.dedup_map = dedup_map;
            sandbox.transition(SandboxState::Dedup);
        }
        Ok(())
    }

    /// Decision WARM on a Dedup sandbox: reverse the dedup, landing in Warm rather than
    /// Running (the counterpart of the `Restore` RPC, which lands in Running instead).
    fn handle_warm(&self, sandbox_id: u64) -> Result<(), WorkerError> {
        if self.sandboxes.read().get(&sandbox_id).map(|s| s.state) == Some(SandboxState::Dedup) {
            return self.restore_from_dedup(sandbox_id, SandboxState::Warm);
        }
        let name = self.container_name(sandbox_id).ok_or(WorkerError::SandboxNotFound)?;
        self.runtime.call(&RuntimeCall::Pause { name })?;
        self.transition_to(sandbox_id, SandboxState::Warm);
        Ok(())
    }

    /// Restore-phase decoder shared by the `Restore` RPC and a WARM decision on a Dedup
    /// sandbox: fetch base pages, decode the patch file, rewrite the page images, then
    /// resume either via the parked helper pids (pause-mode) or a fresh
    /// start-from-checkpoint, landing in `target`.
    fn restore_from_dedup(&self, sandbox_id: u64, target: SandboxState) -> Result<(), WorkerError> {
        let (name, dedup_map) = {
            let sandboxes = self.sandboxes.read();
            let sandbox = sandboxes.get(&sandbox_id).ok_or(WorkerError::SandboxNotFound)?;
            (sandbox.container_name.clone(), sandbox.dedup_map.clone())
        };

        let patch_file = std::fs::read(self.patch_file_path(sandbox_id))?;
        let pages = crate::dedup::decode_patch_file(&dedup_map, &patch_file, &self.dedup.pipeline, self.dedup.delta.as_ref())?;
        self.write_dump_pages(sandbox_id, &pages)?;

        let parked = self.restore_pids.drain();
        if parked.is_empty() {
            self.runtime.call(&RuntimeCall::StartFromCheckpoint {
                name: name.clone(),
                checkpoint_id: format!("sandbox-{sandbox_id}"),
            })?;
        } else {
            let guard = self.dump_pipe.lock();
            guard.write(&name)?;
        }
        if target == SandboxState::Warm {
            self.runtime.call(&RuntimeCall::Pause { name })?;
        }

        let _ = std::fs::remove_file(self.dump_file_path(sandbox_id));
        let _ = std::fs::remove_file(self.patch_file_path(sandbox_id));

        let mut sandboxes = self.sandboxes.write();
        if let Some(sandbox) = sandboxes.get_mut(&sandbox_id) {
            sandbox.dedup_map.clear();
            sandbox.transition(target);
        }
        Ok(())
    }

    /// Reverts a `Running` sandbox that just finished executing back to its last stable
    /// role (Warm, Base, or Dedup).
    fn apply_previous_op(&self, sandbox_id: u64) -> Result<(), WorkerError> {
        let (name, previous) = {
            let sandboxes = self.sandboxes.read();
            let sandbox = sandboxes.get(&sandbox_id).ok_or(WorkerError::SandboxNotFound)?;
            (sandbox.container_name.clone(), sandbox.previous_stable_state)
        };

        match previous {
            SandboxState::Base => {
                self.runtime.call(&RuntimeCall::Checkpoint { name: name.clone() })?;
                self.runtime.call(&RuntimeCall::Pause { name })?;
                self.transition_to(sandbox_id, SandboxState::Base);
            }
            SandboxState::Dedup => {
                self.runtime.call(&RuntimeCall::Pause { name })?;
                self.transition_to(sandbox_id, SandboxState::Dedup);
            }
            _ => {
                self.runtime.call(&RuntimeCall::Pause { name })?;
                self.transition_to(sandbox_id, SandboxState::Warm);
            }
        }
        Ok(())
    }

    /// Read-only accessor for tests and the RPC server's logging.
    pub fn sandbox_state(&self, sandbox_id: u64) -> Option<SandboxState> {
        self.sandboxes.read().get(&sandbox_id).map(|s| s.state)
    }
}

/// Sends a kill signal to a parked restore-helper pid. The pid is a raw OS process id
/// the checkpoint/restore helper reported, not a sandbox the runtime daemon knows
/// about, so it is signalled via the external `kill` utility rather than an unsafe
/// libc call. Best-effort: the process may already have exited on its own, so a
/// failure here is logged, not propagated — a purge must not get stuck on a pid that's
/// already gone.
fn kill_parked_pid(pid: u32) {
    match std::process::Command::new("kill").arg("-9").arg(pid.to_string()).status() {
        Ok(status) if status.success() => {}
        Ok(status) => warn!(pid, code = ?status.code(), "kill of parked restore helper pid exited non-zero"),
        Err(err) => warn!(pid, %err, "failed to invoke kill for parked restore helper pid"),
    }
}

#[cfg(test)]
mod tests {
    use super::{Worker, WorkerConfig};
    use crate::controller_client::ControllerClient;
    use crate::dedup::DedupCodec;
    use crate::delta::SparseDeltaCodec;
    use crate::runtime::InMemoryRuntime;
    use meshbox_config::params::FingerprintParams;
    use meshbox_memxfer::transport::InMemoryTransport;
    use meshbox_memxfer::{MemxferPipeline, PipelineConfig};
    use meshbox_proto::controller::{ControllerRequest, ControllerResponse};
    use meshbox_proto::wire::Packet;
    use meshbox_proto::SandboxState;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn fake_controller_ack_everything() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let Ok((mut socket, _)) = listener.accept().await else { return };
            let mut acc = Vec::new();
            let mut buf = [0_u8; 4096];
            loop {
                while let Ok((request, consumed)) = Packet::decode::<ControllerRequest>(&acc) {
                    let response = match request {
                        ControllerRequest::GetDecision(_) => {
                            ControllerResponse::Decision(meshbox_proto::controller::GetDecisionResponse {
                                decision: meshbox_proto::Decision::Warm,
                            })
                        }
                        _ => ControllerResponse::Ack(meshbox_proto::controller::Ack),
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
        addr
    }

    async fn worker() -> Arc<Worker> {
        let addr = fake_controller_ack_everything().await;
        let controller = Arc::new(ControllerClient::connect(addr).await.unwrap());
        let transport = Arc::new(InMemoryTransport::default());
        let pipeline = Arc::new(MemxferPipeline::new(transport, PipelineConfig::default()));
        let dedup = DedupCodec { delta: Arc::new(SparseDeltaCodec), pipeline };
        let config = WorkerConfig {
            machine_id: 0,
            applications: HashMap::new(),
            fingerprint: FingerprintParams {
                chunks_per_page: 2,
                idle_time_s: 30,
                nopause: false,
                adaptive: false,
                patch_threshold: 4096,
            },
            dump_dir: std::env::temp_dir(),
        };
        Arc::new(Worker::new(
            config,
            Arc::new(InMemoryRuntime::default()),
            controller,
            dedup,
            "/tmp/meshbox-test-pipe-does-not-exist",
        ))
    }

    // ── 1. spawn retries until the helper call takes at least the minimum duration ──
    #[tokio::test]
    async fn spawn_places_sandbox_running() {
        let worker = worker().await;
        let result = worker.spawn(1, "app0".into(), "env0".into());
        assert!(result.is_ok());
        assert_eq!(worker.sandbox_state(1), Some(SandboxState::Running));
    }

    // ── 2. restart on a non-warm/base sandbox is a state precondition failure ──
    #[tokio::test]
    async fn restart_requires_warm_or_base() {
        let worker = worker().await;
        worker.spawn(1, "app0".into(), "env0".into()).unwrap();
        let err = worker.restart(1).unwrap_err();
        assert!(matches!(err, super::WorkerError::StatePrecondition));
    }

    // ── 3. restart succeeds from warm and lands in running ──
    #[tokio::test]
    async fn restart_from_warm_succeeds() {
        let worker = worker().await;
        worker.spawn(1, "app0".into(), "env0".into()).unwrap();
        worker.transition_to(1, SandboxState::Warm);
        assert!(worker.restart(1).is_ok());
        assert_eq!(worker.sandbox_state(1), Some(SandboxState::Running));
    }

    // ── 4. purge removes the sandbox from the local map ──
    #[tokio::test]
    async fn purge_removes_sandbox() {
        let worker = worker().await;
        worker.spawn(1, "app0".into(), "env0".into()).unwrap();
        assert!(worker.purge(1).is_ok());
        assert_eq!(worker.sandbox_state(1), None);
    }

    // ── 5. terminate flips the shutdown flag ──
    #[tokio::test]
    async fn terminate_flips_shutdown_flag() {
        let worker = worker().await;
        assert!(!worker.is_shutting_down());
        worker.terminate();
        assert!(worker.is_shutting_down());
    }
}
