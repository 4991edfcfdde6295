//! Per-sandbox, per-machine, per-application, and per-environment state.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use meshbox_proto::SandboxState;

/// A sandbox (container) as tracked by the controller.
///
/// `is_base`, `is_dedup`, and `blacklisted` are sticky: once set, nothing in this crate
/// clears them again short of removing the sandbox entirely.
#[derive(Debug, Clone)]
pub struct Sandbox {
    /// Globally unique id, assigned by the controller on creation.
    pub id: u64,
    /// Owning machine.
    pub machine_id: u32,
    /// Application tag.
    pub application: String,
    /// Environment tag.
    pub environment: String,
    /// Current residency state.
    pub state: SandboxState,
    /// The last of Warm/Base/Dedup this sandbox was in — used to resume a running
    /// sandbox back into the right role after it finishes executing.
    pub previous_stable_state: SandboxState,
    /// Sticky: once true, this sandbox is accounted in its environment's base quota
    /// forever, even if transiently Warm.
    pub is_base: bool,
    /// Sticky: once true, a tentative Warm decision is always upgraded to Dedup.
    pub is_dedup: bool,
    /// Sticky: once true, tentative Base/Dedup decisions are downgraded to Warm.
    pub blacklisted: bool,
    /// Another request has exclusively claimed this sandbox for its next run.
    pub next_assigned: bool,
    /// Whether this sandbox has completed at least one spawn.
    pub first_spawned: bool,
    /// Number of dedup sandboxes that point at this one as a base.
    pub refcount: u32,
    /// Consecutive RPC failure count; reaching 5 escalates to a controller-initiated purge.
    pub num_failed: u32,
    /// Updated on every transition into a non-Dummy state.
    pub last_modified: Instant,
    /// When this sandbox most recently entered an idle (non-Running, non-Dummy) state.
    pub idle_since: Instant,
}

impl Sandbox {
    /// Creates a newly-scheduled sandbox in the Dummy state, awaiting a spawn.
    pub fn new(id: u64, machine_id: u32, application: String, environment: String) -> Self {
        let now = Instant::now();
        Self {
            id,
            machine_id,
            application,
            environment,
            state: SandboxState::Dummy,
            previous_stable_state: SandboxState::Warm,
            is_base: false,
            is_dedup: false,
            blacklisted: false,
            next_assigned: false,
            first_spawned: false,
            refcount: 0,
            num_failed: 0,
            last_modified: now,
            idle_since: now,
        }
    }

    /// Updates this sandbox's status, applying the sticky-flag and last-modified rules.
    /// Callers never need the prior state back, so this returns unit.
    pub fn update_status(&mut self, status: SandboxState) {
        match status {
            SandboxState::Base => self.is_base = true,
            SandboxState::Dedup => self.is_dedup = true,
            _ => {}
        }
        if status != SandboxState::Dummy {
            self.last_modified = Instant::now();
            self.idle_since = Instant::now();
            self.previous_stable_state = match status {
                SandboxState::Warm | SandboxState::Base | SandboxState::Dedup => status,
                _ => self.previous_stable_state,
            };
        }
        self.state = status;
    }

    /// Time since this sandbox last transitioned into a non-Dummy state.
    pub fn time_since_last_modified(&self) -> Duration {
        self.last_modified.elapsed()
    }

    /// Time since this sandbox entered its current idle state.
    pub fn time_idle(&self) -> Duration {
        self.idle_since.elapsed()
    }
}

/// A worker machine.
#[derive(Debug, Clone)]
pub struct Machine {
    /// Dense machine id.
    pub id: u32,
    /// RPC endpoint address.
    pub addr: String,
    /// RPC endpoint port.
    pub port: u16,
    /// Total memory, in megabytes.
    pub total_memory_mb: u64,
    /// Last-reported used memory, in megabytes.
    pub used_memory_mb: u64,
    /// Dedup-restore operations currently in flight on this machine.
    pub num_dedup_starts: u32,
}

impl Machine {
    /// "Enough memory" means used memory is below 95% of total.
    #[allow(clippy::cast_precision_loss)]
    pub fn has_enough_memory(&self) -> bool {
        (self.used_memory_mb as f64) < 0.95 * (self.total_memory_mb as f64)
    }

    /// Memory currently available, in megabytes (saturating at zero).
    pub fn available_memory_mb(&self) -> u64 {
        self.total_memory_mb.saturating_sub(self.used_memory_mb)
    }
}

/// Per-application configuration.
#[derive(Debug, Clone)]
pub struct Application {
    /// Keep-alive duration, in seconds, before a warm sandbox is reconsidered.
    pub keep_alive_s: u64,
    /// Expected execution time, in milliseconds.
    pub exec_time_ms: u64,
    /// Decision-policy tag/id applied to this application's sandboxes.
    pub policy_id: u32,
    /// Configured memory footprint, in megabytes.
    pub memory_mb: u64,
    /// Estimated dedup benefit.
    pub dedup_benefit: f64,
}

/// Exponential moving average with a fixed smoothing factor.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ema {
    value: Option<f64>,
    alpha: f64,
}

impl Ema {
    /// Builds an EMA with smoothing factor `alpha` (the controller's default is 0.1).
    pub const fn new(alpha: f64) -> Self {
        Self { value: None, alpha }
    }

    /// Folds in a new sample.
    pub fn update(&mut self, sample: f64) {
        self.value = Some(match self.value {
            Some(prev) => self.alpha * sample + (1.0 - self.alpha) * prev,
            None => sample,
        });
    }

    /// Current average, or 0.0 if no sample has ever been folded in.
    pub fn get(&self) -> f64 {
        self.value.unwrap_or(0.0)
    }
}

/// Per-environment statistics: counts, startup-latency EMAs, and the arrival-rate window.
#[derive(Debug, Clone)]
pub struct EnvironmentStats {
    /// Number of sandboxes in a warm-ish state (Warm + Base + Running, lumped together).
    pub num_warm: u32,
    /// Number of sandboxes in the Dedup state.
    pub num_dedup: u32,
    /// Number of sandboxes that are (sticky) base sandboxes.
    pub num_base: u32,
    /// Whether any base sandbox has registered pages for this environment yet.
    pub base_ready: bool,
    /// EMA of warm-start latencies, alpha = 0.1.
    pub warm_start_ema: Ema,
    /// EMA of dedup-start latencies, alpha = 0.1.
    pub dedup_start_ema: Ema,
    window_minutes: usize,
    minute_buckets: VecDeque<u64>,
    bucket_opened_at: Instant,
}

impl EnvironmentStats {
    /// Creates fresh stats with an arrival window of `window_minutes` minutes.
    pub fn new(window_minutes: usize) -> Self {
        Self {
            num_warm: 0,
            num_dedup: 0,
            num_base: 0,
            base_ready: false,
            warm_start_ema: Ema::new(0.1),
            dedup_start_ema: Ema::new(0.1),
            window_minutes: window_minutes.max(1),
            minute_buckets: VecDeque::from(vec![0]),
            bucket_opened_at: Instant::now(),
        }
    }

    /// Rolls the minute bucket if more than 60 s have elapsed since it opened, then
    /// records one arrival in the current bucket.
    pub fn record_arrival(&mut self) {
        self.roll_if_due();
        if let Some(back) = self.minute_buckets.back_mut() {
            *back += 1;
        }
    }

    fn roll_if_due(&mut self) {
        if self.bucket_opened_at.elapsed() >= Duration::from_secs(60) {
            self.minute_buckets.push_back(0);
            while self.minute_buckets.len() > self.window_minutes {
                self.minute_buckets.pop_front();
            }
            self.bucket_opened_at = Instant::now();
        }
    }

    /// Max arrival count over the window, divided by 60 (arrivals per second).
    #[allow(clippy::cast_precision_loss)]
    pub fn max_arrival_rate(&self) -> f64 {
        self.minute_buckets.iter().copied().max().unwrap_or(0) as f64 / 60.0
    }

    /// Sum of arrivals in the window divided by elapsed time in the window, in seconds.
    #[allow(clippy::cast_precision_loss)]
    pub fn moving_window_arrival_rate(&self) -> f64 {
        let sum: u64 = self.minute_buckets.iter().sum();
        let elapsed_minutes = self.minute_buckets.len().saturating_sub(1) as f64
            + self.bucket_opened_at.elapsed().as_secs_f64() / 60.0;
        let elapsed_secs = (elapsed_minutes * 60.0).max(1.0);
        sum as f64 / elapsed_secs
    }

    /// Fraction of `machine_total_mb` that one instance of an application occupies.
    #[allow(clippy::cast_precision_loss)]
    pub fn memory_fraction(app_memory_mb: u64, machine_total_mb: u64) -> f64 {
        if machine_total_mb == 0 {
            return 0.0;
        }
        app_memory_mb as f64 / machine_total_mb as f64
    }
}
