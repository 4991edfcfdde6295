//! A worker's view of one sandbox: residency state, sticky flags, and the bookkeeping
//! needed to drive checkpoint/restore and dedup/restore sequencing.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use meshbox_proto::SandboxState;

/// One page's dedup pointer: where its base page lives, and how large its encoded patch
/// is. `patch_length == PAGE_SIZE` means "no patch, page stored verbatim in the patch
/// file" (see [`crate::dedup::PAGE_SIZE`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupEntry {
    /// Machine hosting the base page this entry points at.
    pub base_machine: u32,
    /// Region id on that machine.
    pub base_region: u32,
    /// Offset of the base page within that region.
    pub base_offset: u64,
    /// Length of this page's encoded patch, in bytes.
    pub patch_length: usize,
}

/// A worker-local sandbox entry.
#[derive(Debug, Clone)]
pub struct WorkerSandbox {
    /// Sandbox id, assigned by the controller.
    pub id: u64,
    /// Application tag, used to look up keep-alive / exec-time configuration.
    pub application: String,
    /// Environment tag.
    pub environment: String,
    /// Current residency state.
    pub state: SandboxState,
    /// The last of Warm/Base/Dedup this sandbox was in, used by the "previous op" that
    /// returns a sandbox to its stable role once its execution finishes.
    pub previous_stable_state: SandboxState,
    /// Sticky: set once this sandbox has completed a Base transition.
    pub is_base: bool,
    /// Sticky: set once this sandbox has completed a Dedup transition.
    pub is_dedup: bool,
    /// Sticky: set once the controller has told this worker to blacklist the sandbox.
    pub blacklisted: bool,
    /// Whether a checkpoint currently exists on disk for this sandbox (lets the Base
    /// transition skip re-checkpointing when one is already present).
    pub checkpointed: bool,
    /// When this sandbox entered its current `state`. Drives every idle/time-in-state
    /// comparison in the daemon tick.
    pub entered_state_at: Instant,
    /// Pids of any restore-helper processes parked for this sandbox (recorded when a
    /// Dedup transition signals the helper in restore-paused mode), so a later Purge can
    /// kill them before the runtime removes the sandbox.
    pub restore_helper_pids: Vec<u32>,
    /// This sandbox's dedup map, populated once it has completed a Dedup transition.
    /// Keyed by dense zero-based page id.
    pub dedup_map: HashMap<u64, DedupEntry>,
    /// Container name as known to the sandbox runtime (`cont<id>`).
    pub container_name: String,
}

impl WorkerSandbox {
    /// Creates a freshly-spawned sandbox, already in `Running`.
    pub fn new_running(id: u64, application: String, environment: String) -> Self {
        Self {
            id,
            application,
            environment,
            state: SandboxState::Running,
            previous_stable_state: SandboxState::Warm,
            is_base: false,
            is_dedup: false,
            blacklisted: false,
            checkpointed: false,
            entered_state_at: Instant::now(),
            restore_helper_pids: Vec::new(),
            dedup_map: HashMap::new(),
            container_name: format!("cont{id}"),
        }
    }

    /// Moves this sandbox into `state`, resetting its time-in-state clock and applying
    /// the sticky-flag rules.
    pub fn transition(&mut self, state: SandboxState) {
        match state {
            SandboxState::Base => self.is_base = true,
            SandboxState::Dedup => self.is_dedup = true,
            _ => {}
        }
        if matches!(state, SandboxState::Warm | SandboxState::Base | SandboxState::Dedup) {
            self.previous_stable_state = state;
        }
        self.state = state;
        self.entered_state_at = Instant::now();
    }

    /// How long this sandbox has been in its current state.
    pub fn time_in_state(&self) -> Duration {
        self.entered_state_at.elapsed()
    }
}
