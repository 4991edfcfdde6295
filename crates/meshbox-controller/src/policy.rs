//! The per-sandbox idle-time decision policy: four variants plus shared post-processing.
//!
//! Only four policy variants are modeled here; see `DESIGN.md` for why a fifth,
//! inconsistently-specified variant was left out rather than ported with its defect
//! reproduced.
//!
//! Numeric `policy_id` values map to variants as `0 = NoneOpenwhisk`, `1 = NoneHeuristic`,
//! `2 = Heuristic`, and any other value (including `3`) `= Boundary`, so that
//! misconfiguration degrades toward the richest, most self-correcting policy rather than
//! the crudest one. See `DESIGN.md` for this choice.

use std::time::Duration;

use meshbox_config::params::{ConstraintKind, PolicyConfig};
use meshbox_proto::Decision;

/// Which decision-policy variant a `policy_id` selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    /// Always PURGE. Used as a fixed-timeout baseline.
    NoneOpenwhisk,
    /// Provisioned-vs-arrival-rate purge/warm, ignoring dedup capacity.
    NoneHeuristic,
    /// Provisioned-vs-arrival-rate purge/dedup/warm, optionally counting dedup capacity.
    Heuristic,
    /// Idle-timeout plus a constrained optimum over warm/dedup counts.
    Boundary,
}

impl PolicyKind {
    /// Resolves a configured `policy_id` to the variant it selects.
    pub const fn from_id(policy_id: u32) -> Self {
        match policy_id {
            0 => Self::NoneOpenwhisk,
            1 => Self::NoneHeuristic,
            2 => Self::Heuristic,
            _ => Self::Boundary,
        }
    }
}

/// A read-only snapshot of the inputs the decision policy needs; distinct from
/// [`crate::model::EnvironmentStats`] and [`crate::model::Sandbox`] so this module stays
/// decoupled from how the controller stores that state.
#[derive(Debug, Clone)]
pub struct DecisionContext {
    /// Whether the sandbox is currently (sticky) a base sandbox.
    pub is_base: bool,
    /// Whether the sandbox is currently (sticky) a dedup sandbox.
    pub is_dedup: bool,
    /// Whether the sandbox is currently blacklisted.
    pub is_blacklisted: bool,
    /// The sandbox's current residency state (`Warm` or `Dedup` matter for the Boundary
    /// policy's absolute idle timeout; other states never reach this function).
    pub state: meshbox_proto::SandboxState,
    /// Time since the sandbox entered its current idle state.
    pub idle: Duration,
    /// Count of sandboxes in a warm-ish state (Warm + Base + Running) in this environment.
    pub num_warm: u32,
    /// Count of sandboxes in the Dedup state in this environment.
    pub num_dedup: u32,
    /// Count of (sticky) base sandboxes in this environment.
    pub num_base: u32,
    /// Whether any base sandbox has registered pages for this environment yet.
    pub base_ready: bool,
    /// EMA of warm-start latencies, in milliseconds.
    pub warm_start_ema_ms: f64,
    /// EMA of dedup-start latencies, in milliseconds.
    pub dedup_start_ema_ms: f64,
    /// Max arrival rate over the window, arrivals/second.
    pub max_arrival_rate: f64,
    /// Moving-window arrival rate, arrivals/second.
    pub moving_window_rate: f64,
    /// This application's expected execution time, in milliseconds.
    pub exec_time_ms: u64,
    /// The configured reuse period, in milliseconds.
    pub reuse_period_ms: u64,
    /// This application's configured dedup benefit (fraction of memory retained).
    pub dedup_benefit: f64,
    /// This application's configured memory footprint, in megabytes.
    pub app_memory_mb: u64,
    /// The owning machine's total memory, in megabytes.
    pub machine_total_memory_mb: u64,
    /// The configured policy parameters.
    pub policy: PolicyConfig,
}

/// The result of evaluating the decision policy for one sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecisionOutcome {
    /// The final decision, after post-processing.
    pub decision: Decision,
    /// Set when the base-quota post-processing rule fired: the caller must increment its
    /// environment's `num_base` counter exactly once.
    pub promote_to_base: bool,
}

impl DecisionContext {
    fn wrp_seconds(&self) -> f64 {
        #[allow(clippy::cast_precision_loss)]
        let reuse_s = self.reuse_period_ms as f64;
        #[allow(clippy::cast_precision_loss)]
        let exec_s = self.exec_time_ms as f64;
        (self.warm_start_ema_ms + exec_s + reuse_s) / 1000.0
    }

    fn drp_seconds(&self) -> f64 {
        #[allow(clippy::cast_precision_loss)]
        let reuse_s = self.reuse_period_ms as f64;
        #[allow(clippy::cast_precision_loss)]
        let exec_s = self.exec_time_ms as f64;
        (self.dedup_start_ema_ms + exec_s + reuse_s) / 1000.0
    }

    fn sandboxes_per_machine(&self) -> f64 {
        if self.app_memory_mb == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let total = self.machine_total_memory_mb as f64;
        #[allow(clippy::cast_precision_loss)]
        let per_sandbox = self.app_memory_mb as f64;
        total / per_sandbox
    }
}

fn none_openwhisk() -> Decision {
    Decision::Purge
}

fn none_heuristic(ctx: &DecisionContext) -> Decision {
    let wrp = ctx.wrp_seconds();
    #[allow(clippy::cast_precision_loss)]
    let provisioned = f64::from(ctx.num_warm + ctx.num_base) / wrp;
    if provisioned > ctx.max_arrival_rate {
        Decision::Purge
    } else {
        Decision::Warm
    }
}

fn heuristic(ctx: &DecisionContext) -> Decision {
    let wrp = ctx.wrp_seconds();
    #[allow(clippy::cast_precision_loss)]
    let mut provisioned = f64::from(ctx.num_warm + ctx.num_base) / wrp;
    if ctx.policy.provisioned {
        let drp = ctx.drp_seconds();
        #[allow(clippy::cast_precision_loss)]
        let dedup_term = f64::from(ctx.num_dedup) / drp;
        provisioned += dedup_term;
    }

    if provisioned > ctx.policy.gamma * ctx.max_arrival_rate {
        Decision::Purge
    } else if provisioned > ctx.moving_window_rate && ctx.base_ready {
        Decision::Dedup
    } else {
        Decision::Warm
    }
}

fn boundary(ctx: &DecisionContext) -> Decision {
    if ctx.state == meshbox_proto::SandboxState::Warm && ctx.idle >= Duration::from_secs(600) {
        return Decision::Purge;
    }
    if ctx.state == meshbox_proto::SandboxState::Dedup && ctx.idle >= Duration::from_secs(900) {
        return Decision::Purge;
    }

    let wrp = ctx.wrp_seconds();
    let drp = ctx.drp_seconds();
    #[allow(clippy::cast_precision_loss)]
    let total = f64::from(ctx.num_warm + ctx.num_base + ctx.num_dedup);
    let dedup_cost = wrp / drp;
    let d_lambda = (total - ctx.max_arrival_rate * wrp) / (1.0 - dedup_cost);

    match ctx.policy.constraint {
        ConstraintKind::Latency => {
            if d_lambda < 0.0 {
                return Decision::Warm;
            }
            let frac = (ctx.dedup_start_ema_ms * dedup_cost / ctx.warm_start_ema_ms) - 1.0;
            let d_lat = (ctx.policy.beta * wrp * ctx.max_arrival_rate - total) / frac;
            let d_opt = d_lat.min(d_lambda);
            if d_lat < 0.0 {
                Decision::Purge
            } else if f64::from(ctx.num_dedup) < d_opt {
                Decision::Dedup
            } else {
                Decision::Warm
            }
        }
        ConstraintKind::Memory => {
            let capacity = ctx.sandboxes_per_machine();
            let d_mem = (total - capacity) / ctx.dedup_benefit;
            if d_mem < 0.0 {
                Decision::Warm
            } else if d_mem > total {
                Decision::Dedup
            } else if d_mem < d_lambda {
                if f64::from(ctx.num_dedup) < d_mem {
                    Decision::Dedup
                } else {
                    Decision::Warm
                }
            } else {
                Decision::Dedup
            }
        }
    }
}

/// Evaluates the decision policy selected by `ctx.policy.policy_id`, then applies the
/// shared post-processing rules common to every variant: already-base short-circuit,
/// base-quota promotion, dedup-to-warm prohibition, and blacklist override.
pub fn evaluate_decision(ctx: &DecisionContext) -> DecisionOutcome {
    if ctx.is_base {
        return DecisionOutcome {
            decision: Decision::Base,
            promote_to_base: false,
        };
    }

    let tentative = match PolicyKind::from_id(ctx.policy.policy_id) {
        PolicyKind::NoneOpenwhisk => none_openwhisk(),
        PolicyKind::NoneHeuristic => none_heuristic(ctx),
        PolicyKind::Heuristic => heuristic(ctx),
        PolicyKind::Boundary => boundary(ctx),
    };

    if tentative == Decision::Purge {
        return DecisionOutcome {
            decision: Decision::Purge,
            promote_to_base: false,
        };
    }

    // At num_base == 0 this is trivially satisfied (0 >= 0): the first non-dedup
    // sandbox any environment evaluates with a non-PURGE tentative becomes that
    // environment's first base. Nothing else in this policy creates a base.
    let quota_exceeded =
        u64::from(ctx.num_dedup) >= u64::from(ctx.policy.dedup_per_base) * u64::from(ctx.num_base);
    if quota_exceeded && !ctx.is_dedup {
        return DecisionOutcome {
            decision: Decision::Base,
            promote_to_base: true,
        };
    }

    let mut decision = tentative;
    if ctx.is_dedup && decision == Decision::Warm {
        decision = Decision::Dedup;
    }
    if ctx.is_blacklisted && matches!(decision, Decision::Base | Decision::Dedup) {
        decision = Decision::Warm;
    }

    DecisionOutcome {
        decision,
        promote_to_base: false,
    }
}

#[cfg(test)]
mod tests {
    use super::{evaluate_decision, DecisionContext, PolicyKind};
    use meshbox_config::params::{ConstraintKind, PolicyConfig};
    use meshbox_proto::{Decision, SandboxState};
    use std::time::Duration;

    fn base_policy() -> PolicyConfig {
        PolicyConfig {
            policy_id: 1,
            constraint: ConstraintKind::Latency,
            dedup_per_base: 10,
            alpha: 0.1,
            beta: 0.2,
            gamma: 1.5,
            provisioned: true,
        }
    }

    fn base_ctx() -> DecisionContext {
        DecisionContext {
            is_base: false,
            is_dedup: false,
            is_blacklisted: false,
            state: SandboxState::Warm,
            idle: Duration::from_secs(0),
            num_warm: 1,
            num_dedup: 0,
            num_base: 0,
            base_ready: false,
            warm_start_ema_ms: 100.0,
            dedup_start_ema_ms: 100.0,
            max_arrival_rate: 0.0,
            moving_window_rate: 0.0,
            exec_time_ms: 0,
            reuse_period_ms: 0,
            dedup_benefit: 0.5,
            app_memory_mb: 128,
            machine_total_memory_mb: 1024,
            policy: base_policy(),
        }
    }

    // ── S2: policy purge under low load (None-Heuristic) ──
    #[test]
    fn scenario_s2_none_heuristic_purge() {
        let ctx = base_ctx();
        let outcome = evaluate_decision(&ctx);
        assert_eq!(outcome.decision, Decision::Purge);
    }

    // ── S3: base promotion by quota ──
    #[test]
    fn scenario_s3_base_promotion_by_quota() {
        let mut ctx = base_ctx();
        ctx.num_base = 1;
        ctx.num_dedup = 10;
        ctx.policy.dedup_per_base = 10;
        ctx.max_arrival_rate = 1000.0; // keep tentative away from PURGE
        let outcome = evaluate_decision(&ctx);
        assert_eq!(outcome.decision, Decision::Base);
        assert!(outcome.promote_to_base);
    }

    // ── S4: dedup -> warm prohibition ──
    #[test]
    fn scenario_s4_dedup_to_warm_prohibition() {
        let mut ctx = base_ctx();
        ctx.is_dedup = true;
        ctx.max_arrival_rate = 1000.0; // force tentative WARM, not PURGE
        let outcome = evaluate_decision(&ctx);
        assert_eq!(outcome.decision, Decision::Dedup);
    }

    // ── already-base sandboxes short-circuit to BASE regardless of policy ──
    #[test]
    fn already_base_short_circuits() {
        let mut ctx = base_ctx();
        ctx.is_base = true;
        let outcome = evaluate_decision(&ctx);
        assert_eq!(outcome.decision, Decision::Base);
        assert!(!outcome.promote_to_base);
    }

    // ── blacklist override downgrades BASE/DEDUP tentatives to WARM ──
    #[test]
    fn blacklist_overrides_base_to_warm() {
        let mut ctx = base_ctx();
        ctx.is_blacklisted = true;
        ctx.is_dedup = true;
        ctx.max_arrival_rate = 1000.0;
        let outcome = evaluate_decision(&ctx);
        assert_eq!(outcome.decision, Decision::Warm);
    }

    // ── S11: Boundary purges a Warm sandbox iff idle >= 600s ──
    #[test]
    fn scenario_s11_boundary_idle_timeout() {
        let mut ctx = base_ctx();
        ctx.policy.policy_id = 3;
        ctx.warm_start_ema_ms = 100.0;
        ctx.dedup_start_ema_ms = 50.0;
        ctx.exec_time_ms = 10;
        ctx.reuse_period_ms = 10;

        ctx.idle = Duration::from_secs(599);
        assert_ne!(evaluate_decision(&ctx).decision, Decision::Purge);

        ctx.idle = Duration::from_secs(600);
        assert_eq!(evaluate_decision(&ctx).decision, Decision::Purge);
    }

    // ── Boundary purges a Dedup sandbox iff idle >= 900s ──
    #[test]
    fn boundary_dedup_idle_timeout() {
        let mut ctx = base_ctx();
        ctx.policy.policy_id = 3;
        ctx.state = SandboxState::Dedup;
        ctx.is_dedup = true;
        ctx.warm_start_ema_ms = 100.0;
        ctx.dedup_start_ema_ms = 50.0;

        ctx.idle = Duration::from_secs(899);
        assert_ne!(evaluate_decision(&ctx).decision, Decision::Purge);

        ctx.idle = Duration::from_secs(900);
        assert_eq!(evaluate_decision(&ctx).decision, Decision::Purge);
    }

    // ── policy id mapping resolves unknown ids toward Boundary, not a panic ──
    #[test]
    fn unknown_policy_id_resolves_to_boundary() {
        assert_eq!(PolicyKind::from_id(99), PolicyKind::Boundary);
        assert_eq!(PolicyKind::from_id(0), PolicyKind::NoneOpenwhisk);
    }
}
