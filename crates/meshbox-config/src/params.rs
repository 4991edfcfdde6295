//! The controller/worker parameter file: one `section: key=value key=value ...` line per
//! section, plus one `appN: ...` line per configured application.

use std::collections::HashMap;

use thiserror::Error;

/// Errors parsing a parameter file.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParamParseError {
    /// A required section was absent from the file.
    #[error("missing section: {0}")]
    MissingSection(String),
    /// A required key was absent from a section.
    #[error("missing key `{key}` in section `{section}`")]
    MissingKey {
        /// Section the key was expected in.
        section: String,
        /// Key that was missing.
        key: String,
    },
    /// A value could not be parsed as the type the key requires.
    #[error("invalid value for `{key}` in section `{section}`: {value}")]
    InvalidValue {
        /// Section the key lives in.
        section: String,
        /// Key whose value failed to parse.
        key: String,
        /// The offending raw value.
        value: String,
    },
}

/// Which resource the decision policy's constrained search (`Boundary`) optimizes under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintKind {
    /// Latency-constrained mode.
    Latency,
    /// Memory-constrained mode.
    Memory,
}

/// The `policy` section: which decision-policy variant applies and its thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyConfig {
    /// Numeric policy id (maps to a decision-policy variant).
    pub policy_id: u32,
    /// Constraint kind for the `Boundary` policy.
    pub constraint: ConstraintKind,
    /// Number of dedup sandboxes tolerated per base sandbox before quota-promotion fires.
    pub dedup_per_base: u32,
    /// EMA smoothing factor for the `Heuristic` policy's provisioning threshold.
    pub alpha: f64,
    /// Latency threshold used by `Boundary`'s latency-constrained mode.
    pub beta: f64,
    /// Load-shedding multiplier (`gamma`) applied to `max_arrival_rate` in `Heuristic`.
    pub gamma: f64,
    /// Whether the policy should account for dedup capacity when computing provisioning.
    pub provisioned: bool,
}

/// The `params` section: global runtime knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeParams {
    /// Minimum quiescence, in milliseconds, before a sandbox can accept another request.
    pub reuse_period_ms: u64,
    /// Length, in minutes, of the arrival-rate ring window.
    pub arrival_window_minutes: u64,
    /// Per-machine memory cap, in megabytes.
    pub memory_cap_mb: u64,
}

/// One `appN` line: per-application timing and memory parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ApplicationParams {
    /// Per-application configured keep-alive, in seconds.
    pub keep_alive_s: u64,
    /// Expected execution time, in milliseconds.
    pub exec_time_ms: u64,
    /// Memory footprint, in megabytes.
    pub memory_mb: u64,
    /// Estimated dedup benefit (a fraction of the full memory footprint retained).
    pub dedup_benefit: f64,
}

/// The `configuration` section plus its `appN` lines.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigurationParams {
    /// Number of environments configured for this run.
    pub num_env: u32,
    /// Per-application parameters, indexed by application number.
    pub applications: Vec<ApplicationParams>,
}

/// The `parameters` section: fingerprinting and restore knobs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FingerprintParams {
    /// Number of fingerprint digests to collect per page.
    pub chunks_per_page: usize,
    /// Idle duration, in seconds, before a sandbox is re-evaluated by the decision policy.
    pub idle_time_s: u64,
    /// If set, skip pausing sandboxes around checkpoint operations (debug/test aid).
    pub nopause: bool,
    /// If set, enable adaptive tuning of `chunks_per_page` at runtime.
    pub adaptive: bool,
    /// Maximum accepted delta size, in bytes, before a page is stored verbatim.
    pub patch_threshold: usize,
}

/// The full parsed parameter file.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamConfig {
    /// The `policy` section.
    pub policy: PolicyConfig,
    /// The `params` section.
    pub params: RuntimeParams,
    /// The `configuration` section.
    pub configuration: ConfigurationParams,
    /// The `parameters` section.
    pub parameters: FingerprintParams,
}

type KvMap = HashMap<String, String>;

fn parse_line(line: &str) -> Option<(String, KvMap)> {
    let (name, rest) = line.split_once(':')?;
    let mut kv = KvMap::new();
    for token in rest.split_whitespace() {
        if let Some((key, value)) = token.split_once('=') {
            kv.insert(key.to_owned(), value.to_owned());
        }
    }
    Some((name.trim().to_owned(), kv))
}

fn require<'a>(
    section: &str,
    kv: &'a KvMap,
    key: &str,
) -> Result<&'a str, ParamParseError> {
    kv.get(key).map(String::as_str).ok_or_else(|| ParamParseError::MissingKey {
        section: section.to_owned(),
        key: key.to_owned(),
    })
}

fn parse_value<T: std::str::FromStr>(
    section: &str,
    key: &str,
    raw: &str,
) -> Result<T, ParamParseError> {
    raw.parse().map_err(|_| ParamParseError::InvalidValue {
        section: section.to_owned(),
        key: key.to_owned(),
        value: raw.to_owned(),
    })
}

impl ParamConfig {
    /// Parses a parameter file from its full text contents.
    pub fn parse(text: &str) -> Result<Self, ParamParseError> {
        let mut sections: HashMap<String, KvMap> = HashMap::new();
        for line in text.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            if let Some((name, kv)) = parse_line(trimmed) {
                sections.insert(name, kv);
            }
        }

        let policy_kv = sections
            .get("policy")
            .ok_or_else(|| ParamParseError::MissingSection("policy".into()))?;
        let policy = PolicyConfig {
            policy_id: parse_value("policy", "id", require("policy", policy_kv, "id")?)?,
            constraint: match require("policy", policy_kv, "constraint")? {
                "memory" => ConstraintKind::Memory,
                _ => ConstraintKind::Latency,
            },
            dedup_per_base: parse_value(
                "policy",
                "dedup_per_base",
                require("policy", policy_kv, "dedup_per_base")?,
            )?,
            alpha: parse_value("policy", "alpha", require("policy", policy_kv, "alpha")?)?,
            beta: parse_value("policy", "beta", require("policy", policy_kv, "beta")?)?,
            gamma: parse_value("policy", "gamma", require("policy", policy_kv, "gamma")?)?,
            provisioned: require("policy", policy_kv, "provisioned")?.eq_ignore_ascii_case("true"),
        };

        let params_kv = sections
            .get("params")
            .ok_or_else(|| ParamParseError::MissingSection("params".into()))?;
        let params = RuntimeParams {
            reuse_period_ms: parse_value(
                "params",
                "reuse_period_ms",
                require("params", params_kv, "reuse_period_ms")?,
            )?,
            arrival_window_minutes: parse_value(
                "params",
                "arrival_window_minutes",
                require("params", params_kv, "arrival_window_minutes")?,
            )?,
            memory_cap_mb: parse_value(
                "params",
                "memory_cap_mb",
                require("params", params_kv, "memory_cap_mb")?,
            )?,
        };

        let configuration_kv = sections
            .get("configuration")
            .ok_or_else(|| ParamParseError::MissingSection("configuration".into()))?;
        let num_env = parse_value(
            "configuration",
            "num_env",
            require("configuration", configuration_kv, "num_env")?,
        )?;
        let num_appl: usize = parse_value(
            "configuration",
            "num_appl",
            require("configuration", configuration_kv, "num_appl")?,
        )?;

        let mut applications = Vec::with_capacity(num_appl);
        for i in 0..num_appl {
            let section_name = format!("app{i}");
            let app_kv = sections
                .get(&section_name)
                .ok_or_else(|| ParamParseError::MissingSection(section_name.clone()))?;
            applications.push(ApplicationParams {
                keep_alive_s: parse_value(
                    &section_name,
                    "keep_alive",
                    require(&section_name, app_kv, "keep_alive")?,
                )?,
                exec_time_ms: parse_value(
                    &section_name,
                    "exec_time",
                    require(&section_name, app_kv, "exec_time")?,
                )?,
                memory_mb: parse_value(
                    &section_name,
                    "memory",
                    require(&section_name, app_kv, "memory")?,
                )?,
                dedup_benefit: parse_value(
                    &section_name,
                    "dedup_benefit",
                    require(&section_name, app_kv, "dedup_benefit")?,
                )?,
            });
        }

        let parameters_kv = sections
            .get("parameters")
            .ok_or_else(|| ParamParseError::MissingSection("parameters".into()))?;
        let parameters = FingerprintParams {
            chunks_per_page: parse_value(
                "parameters",
                "chunks_per_page",
                require("parameters", parameters_kv, "chunks_per_page")?,
            )?,
            idle_time_s: parse_value(
                "parameters",
                "idle_time_s",
                require("parameters", parameters_kv, "idle_time_s")?,
            )?,
            nopause: require("parameters", parameters_kv, "nopause")?.eq_ignore_ascii_case("true"),
            adaptive: require("parameters", parameters_kv, "adaptive")?.eq_ignore_ascii_case("true"),
            patch_threshold: parse_value(
                "parameters",
                "patch_threshold",
                require("parameters", parameters_kv, "patch_threshold")?,
            )?,
        };

        Ok(Self {
            policy,
            params,
            configuration: ConfigurationParams {
                num_env,
                applications,
            },
            parameters,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{ConstraintKind, ParamConfig};

    const SAMPLE: &str = "\
policy: id=5 constraint=latency dedup_per_base=10 alpha=0.1 beta=0.2 gamma=1.5 provisioned=true
params: reuse_period_ms=500 arrival_window_minutes=5 memory_cap_mb=4096
configuration: num_env=1 num_appl=1
app0: keep_alive=60 exec_time=1000 memory=128 dedup_benefit=0.5
parameters: chunks_per_page=2 idle_time_s=30 nopause=false adaptive=true patch_threshold=4096
";

    // ── 1. parses a well-formed file end to end ──
    #[test]
    fn parses_sample() {
        let config = ParamConfig::parse(SAMPLE).expect("parse");
        assert_eq!(config.policy.policy_id, 5);
        assert_eq!(config.policy.constraint, ConstraintKind::Latency);
        assert_eq!(config.params.reuse_period_ms, 500);
        assert_eq!(config.configuration.applications.len(), 1);
        assert_eq!(config.configuration.applications[0].exec_time_ms, 1000);
        assert_eq!(config.parameters.chunks_per_page, 2);
        assert!(!config.parameters.nopause);
        assert!(config.parameters.adaptive);
    }

    // ── 2. a missing section is reported by name ──
    #[test]
    fn missing_section_reported() {
        let text = "params: reuse_period_ms=1 arrival_window_minutes=1 memory_cap_mb=1\n";
        let err = ParamConfig::parse(text).unwrap_err();
        assert_eq!(err.to_string(), "missing section: policy");
    }

    // ── 3. blank lines and comments are ignored ──
    #[test]
    fn ignores_blank_lines_and_comments() {
        let mut text = String::from("# a comment\n\n");
        text.push_str(SAMPLE);
        let config = ParamConfig::parse(&text).expect("parse");
        assert_eq!(config.policy.policy_id, 5);
    }
}
