//! Self-healing end-to-end: a broken baseline drives the executor into
//! SELF_HEALING, repeated failed repair attempts cross the per-baseline
//! threshold, and the baseline escalates to a human with the executor
//! settling in ESCALATED.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use dispatch::baseline::{gate_type, GateKind, BASELINE_LABEL};
use dispatch::budget::{BudgetState, StaticCostTracker};
use dispatch::config::ExecutorConfig;
use dispatch::healing::HealingMode;
use dispatch::tracker::types::DependencyKind;
use dispatch::tracker::TrackerStore;
use dispatch::MemoryTracker;
use foreman::agent::AgentKind;
use foreman::gates::{GateResult, GateRunner};
use foreman::Executor;

struct BrokenGates {
    healthy: AtomicBool,
}

#[async_trait]
impl GateRunner for BrokenGates {
    async fn run_all(&self, _workdir: &Path, _timeout: Duration) -> Result<(Vec<GateResult>, bool)> {
        let healthy = self.healthy.load(Ordering::SeqCst);
        Ok((
            GateKind::ALL
                .iter()
                .map(|&gate| GateResult {
                    gate,
                    passed: healthy,
                    output: String::new(),
                    duration_ms: 1,
                })
                .collect(),
            healthy,
        ))
    }

    async fn run_preflight(
        &self,
        _workdir: &Path,
        _timeout: Duration,
    ) -> Result<(Vec<GateResult>, bool)> {
        let healthy = self.healthy.load(Ordering::SeqCst);
        Ok((
            vec![GateResult {
                gate: GateKind::Build,
                passed: healthy,
                output: if healthy { String::new() } else { "does not compile".into() },
                duration_ms: 1,
            }],
            healthy,
        ))
    }
}

fn config() -> ExecutorConfig {
    let mut config = ExecutorConfig::default();
    config.issue_prefix = "fm".into();
    config.enable_ai_supervision = false;
    config.enable_quality_gates = true;
    config.enable_auto_commit = false;
    config.enable_quality_gate_worker = false;
    config.enable_health_monitoring = false;
    config.advisor_url = None;
    config.max_escalation_attempts = 2;
    config.max_escalation_duration_secs = 0;
    config.self_healing_deadlock_timeout_secs = 3600;
    config.agent_timeout_secs = 5;
    config
}

#[tokio::test]
async fn baseline_escalates_after_repeated_failed_repairs() {
    // Agent spawns must fail deterministically: every repair attempt is a
    // failed attempt.
    std::env::set_var("FOREMAN_CLAUDE_BIN", "/nonexistent/foreman-test-agent");

    let tracker = Arc::new(MemoryTracker::new());
    let gates = Arc::new(BrokenGates {
        healthy: AtomicBool::new(false),
    });
    let workdir = tempfile::tempdir().unwrap();
    let executor = Executor::new(
        config(),
        tracker.clone(),
        None,
        Some(gates),
        Arc::new(StaticCostTracker(BudgetState::Ok)),
        workdir.path().to_path_buf(),
        AgentKind::Claude,
        CancellationToken::new(),
    )
    .unwrap();

    // Tick 1: preflight fails → SELF_HEALING, baseline issue filed, first
    // repair attempt claimed and failed.
    executor.tick().await.unwrap();
    assert_eq!(executor.healing().mode(), HealingMode::SelfHealing);
    let baselines = tracker.get_issues_by_label(BASELINE_LABEL).unwrap();
    assert_eq!(baselines.len(), 1);
    let baseline_id = baselines[0].id.clone();
    assert_eq!(gate_type(&baseline_id), Some(GateKind::Build));

    // Tick 2: second repair attempt, also failed.
    executor.tick().await.unwrap();

    // Tick 3: the attempt threshold (2) is crossed — the baseline
    // escalates instead of being retried.
    executor.tick().await.unwrap();
    assert_eq!(executor.healing().mode(), HealingMode::Escalated);

    let baseline = tracker.get_issue(&baseline_id).unwrap();
    assert!(baseline.has_label("no-auto-claim"));

    let escalations = tracker.get_issues_by_label("escalation").unwrap();
    assert_eq!(escalations.len(), 1);
    let escalation = &escalations[0];
    assert_eq!(escalation.priority, 0);
    assert!(escalation.has_label("no-auto-claim"));
    let edges = tracker.get_dependency_records(&escalation.id).unwrap();
    assert!(edges
        .iter()
        .any(|e| e.depends_on == baseline_id && e.kind == DependencyKind::DiscoveredFrom));
}
