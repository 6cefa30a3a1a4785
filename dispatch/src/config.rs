//! Executor configuration.
//!
//! Defaults come from the environment (`FOREMAN_*` keys), optionally
//! overlaid by a TOML file. `validate()` enforces the cross-field rules
//! before the executor starts.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// What to do when the preflight baseline check fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Enter self-healing: create baseline issues, claim repair work.
    Block,
    /// Log the failure and keep claiming normally.
    Warn,
    /// Pretend the baseline is fine.
    Ignore,
}

impl FailureMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "block" => Some(Self::Block),
            "warn" => Some(Self::Warn),
            "ignore" => Some(Self::Ignore),
            _ => None,
        }
    }
}

impl std::fmt::Display for FailureMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Block => write!(f, "block"),
            Self::Warn => write!(f, "warn"),
            Self::Ignore => write!(f, "ignore"),
        }
    }
}

/// Top-level executor configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Issue-ID prefix used when generating baseline and escalation issues.
    pub issue_prefix: String,

    // Feature toggles.
    pub enable_ai_supervision: bool,
    pub enable_quality_gates: bool,
    pub enable_auto_commit: bool,
    /// Open a review request after a successful auto-commit.
    /// Requires `enable_auto_commit`.
    pub enable_auto_pr: bool,
    pub enable_sandboxes: bool,
    /// Requires `enable_ai_supervision`.
    pub enable_health_monitoring: bool,
    /// Dispatch mission gate runs from the event loop.
    /// Requires `enable_quality_gates`.
    pub enable_quality_gate_worker: bool,
    /// Prefer ready `discovered:blocker` issues over the regular queue.
    pub enable_blocker_priority: bool,

    // Timing (seconds in TOML/env, durations in code).
    pub poll_interval_secs: u64,
    pub heartbeat_period_secs: u64,
    pub gates_timeout_secs: u64,
    pub agent_timeout_secs: u64,

    // Escalation bounds. Zero disables the corresponding bound.
    pub max_escalation_attempts: u32,
    pub max_escalation_duration_secs: u64,
    pub self_healing_deadlock_timeout_secs: u64,

    // Result processing.
    pub max_incomplete_retries: u32,
    pub dedup_batch_size: usize,

    // Instance reaping.
    pub instance_cleanup_age_secs: u64,
    pub instance_cleanup_keep: usize,

    pub failure_mode: FailureMode,

    // Agent supervision bounds.
    pub max_output_lines: usize,
    pub max_file_reads: u32,
    pub max_same_file_reads: u32,

    /// Base URL of the AI advisor service, when supervision is enabled.
    #[serde(default)]
    pub advisor_url: Option<String>,

    // Debug switches.
    /// Dump each assembled prompt to the log.
    pub dump_prompts: bool,
    /// Verbose tracing of agent event parsing.
    pub trace_events: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            issue_prefix: env_str("FOREMAN_ISSUE_PREFIX", "fm"),
            enable_ai_supervision: env_flag("FOREMAN_AI_SUPERVISION", false),
            enable_quality_gates: env_flag("FOREMAN_QUALITY_GATES", true),
            enable_auto_commit: env_flag("FOREMAN_AUTO_COMMIT", false),
            enable_auto_pr: env_flag("FOREMAN_AUTO_PR", false),
            enable_sandboxes: env_flag("FOREMAN_SANDBOXES", false),
            enable_health_monitoring: env_flag("FOREMAN_HEALTH_MONITORING", false),
            enable_quality_gate_worker: env_flag("FOREMAN_QA_WORKER", false),
            enable_blocker_priority: env_flag("FOREMAN_BLOCKER_PRIORITY", true),
            poll_interval_secs: env_u64("FOREMAN_POLL_INTERVAL", 15),
            heartbeat_period_secs: env_u64("FOREMAN_HEARTBEAT_PERIOD", 30),
            gates_timeout_secs: env_u64("FOREMAN_GATES_TIMEOUT", 5 * 60),
            agent_timeout_secs: env_u64("FOREMAN_AGENT_TIMEOUT", 45 * 60),
            max_escalation_attempts: env_u64("FOREMAN_MAX_ESCALATION_ATTEMPTS", 3) as u32,
            max_escalation_duration_secs: env_u64(
                "FOREMAN_MAX_ESCALATION_DURATION",
                2 * 60 * 60,
            ),
            self_healing_deadlock_timeout_secs: env_u64(
                "FOREMAN_SELF_HEALING_DEADLOCK_TIMEOUT",
                30 * 60,
            ),
            max_incomplete_retries: env_u64("FOREMAN_MAX_INCOMPLETE_RETRIES", 1) as u32,
            dedup_batch_size: env_u64("FOREMAN_DEDUP_BATCH_SIZE", 100) as usize,
            instance_cleanup_age_secs: env_u64("FOREMAN_INSTANCE_CLEANUP_AGE", 24 * 60 * 60),
            instance_cleanup_keep: env_u64("FOREMAN_INSTANCE_CLEANUP_KEEP", 5) as usize,
            failure_mode: std::env::var("FOREMAN_FAILURE_MODE")
                .ok()
                .and_then(|s| FailureMode::parse(&s))
                .unwrap_or(FailureMode::Block),
            max_output_lines: env_u64("FOREMAN_MAX_OUTPUT_LINES", 10_000) as usize,
            max_file_reads: env_u64("FOREMAN_MAX_FILE_READS", 500) as u32,
            max_same_file_reads: env_u64("FOREMAN_MAX_SAME_FILE_READS", 20) as u32,
            advisor_url: std::env::var("FOREMAN_ADVISOR_URL").ok().filter(|s| !s.is_empty()),
            dump_prompts: env_flag("FOREMAN_DUMP_PROMPTS", false),
            trace_events: env_flag("FOREMAN_TRACE_EVENTS", false),
        }
    }
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl ExecutorConfig {
    /// Environment-derived defaults overlaid with a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: ExecutorConfig = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Enforce cross-field rules. Called once at startup.
    pub fn validate(&self) -> Result<()> {
        if self.issue_prefix.is_empty() || !self.issue_prefix.chars().all(|c| c.is_ascii_lowercase())
        {
            anyhow::bail!(
                "issue_prefix must be non-empty lowercase ascii, got {:?}",
                self.issue_prefix
            );
        }
        if self.enable_auto_pr && !self.enable_auto_commit {
            anyhow::bail!("enable_auto_pr requires enable_auto_commit");
        }
        if self.enable_health_monitoring && !self.enable_ai_supervision {
            anyhow::bail!("enable_health_monitoring requires enable_ai_supervision");
        }
        if self.enable_quality_gate_worker && !self.enable_quality_gates {
            anyhow::bail!("enable_quality_gate_worker requires enable_quality_gates");
        }
        if self.enable_ai_supervision && self.advisor_url.is_none() {
            anyhow::bail!("enable_ai_supervision requires advisor_url");
        }
        if self.max_output_lines == 0 {
            anyhow::bail!("max_output_lines must be positive");
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_secs(self.heartbeat_period_secs)
    }

    pub fn gates_timeout(&self) -> Duration {
        Duration::from_secs(self.gates_timeout_secs)
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs)
    }

    pub fn max_escalation_duration(&self) -> Duration {
        Duration::from_secs(self.max_escalation_duration_secs)
    }

    pub fn self_healing_deadlock_timeout(&self) -> Duration {
        Duration::from_secs(self.self_healing_deadlock_timeout_secs)
    }

    pub fn instance_cleanup_age(&self) -> Duration {
        Duration::from_secs(self.instance_cleanup_age_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ExecutorConfig {
        ExecutorConfig {
            issue_prefix: "fm".into(),
            enable_ai_supervision: false,
            enable_quality_gates: true,
            enable_auto_commit: false,
            enable_auto_pr: false,
            enable_sandboxes: false,
            enable_health_monitoring: false,
            enable_quality_gate_worker: false,
            enable_blocker_priority: true,
            poll_interval_secs: 15,
            heartbeat_period_secs: 30,
            gates_timeout_secs: 300,
            agent_timeout_secs: 2700,
            max_escalation_attempts: 3,
            max_escalation_duration_secs: 7200,
            self_healing_deadlock_timeout_secs: 1800,
            max_incomplete_retries: 1,
            dedup_batch_size: 100,
            instance_cleanup_age_secs: 86400,
            instance_cleanup_keep: 5,
            failure_mode: FailureMode::Block,
            max_output_lines: 10_000,
            max_file_reads: 500,
            max_same_file_reads: 20,
            advisor_url: None,
            dump_prompts: false,
            trace_events: false,
        }
    }

    #[test]
    fn test_valid_base_config() {
        base().validate().unwrap();
    }

    #[test]
    fn test_auto_pr_requires_auto_commit() {
        let mut config = base();
        config.enable_auto_pr = true;
        assert!(config.validate().is_err());
        config.enable_auto_commit = true;
        config.validate().unwrap();
    }

    #[test]
    fn test_health_monitoring_requires_ai() {
        let mut config = base();
        config.enable_health_monitoring = true;
        assert!(config.validate().is_err());
        config.enable_ai_supervision = true;
        config.advisor_url = Some("http://localhost:8600".into());
        config.validate().unwrap();
    }

    #[test]
    fn test_qa_worker_requires_gates() {
        let mut config = base();
        config.enable_quality_gates = false;
        config.enable_quality_gate_worker = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_prefix_must_be_lowercase() {
        let mut config = base();
        config.issue_prefix = "FM".into();
        assert!(config.validate().is_err());
        config.issue_prefix = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_overlay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("foreman.toml");
        std::fs::write(
            &path,
            r#"
issue_prefix = "vx"
enable_auto_commit = true
poll_interval_secs = 5
failure_mode = "warn"
"#,
        )
        .unwrap();

        let config = ExecutorConfig::load(&path).unwrap();
        assert_eq!(config.issue_prefix, "vx");
        assert!(config.enable_auto_commit);
        assert_eq!(config.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.failure_mode, FailureMode::Warn);
    }

    #[test]
    fn test_failure_mode_parse() {
        assert_eq!(FailureMode::parse("block"), Some(FailureMode::Block));
        assert_eq!(FailureMode::parse(" WARN "), Some(FailureMode::Warn));
        assert_eq!(FailureMode::parse("ignore"), Some(FailureMode::Ignore));
        assert_eq!(FailureMode::parse("panic"), None);
    }
}
