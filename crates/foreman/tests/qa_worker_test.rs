//! QA worker: completed missions labeled `needs-quality-gates` get one
//! background gate run, locked by the `gates-running` label.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use dispatch::baseline::GateKind;
use dispatch::budget::{BudgetState, StaticCostTracker};
use dispatch::config::ExecutorConfig;
use dispatch::tracker::types::{Issue, IssueType};
use dispatch::tracker::TrackerStore;
use dispatch::MemoryTracker;
use foreman::agent::AgentKind;
use foreman::executor::{GATES_RUNNING_LABEL, NEEDS_QA_LABEL};
use foreman::gates::{GateResult, GateRunner};
use foreman::Executor;

struct SlowFailingGates;

#[async_trait]
impl GateRunner for SlowFailingGates {
    async fn run_all(&self, _workdir: &Path, _timeout: Duration) -> Result<(Vec<GateResult>, bool)> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok((
            vec![GateResult {
                gate: GateKind::Test,
                passed: false,
                output: "2 tests failed".into(),
                duration_ms: 50,
            }],
            false,
        ))
    }

    async fn run_preflight(
        &self,
        _workdir: &Path,
        _timeout: Duration,
    ) -> Result<(Vec<GateResult>, bool)> {
        Ok((Vec::new(), true))
    }
}

#[tokio::test]
async fn qa_worker_runs_mission_gates_and_unlocks() {
    std::env::set_var("FOREMAN_CLAUDE_BIN", "/nonexistent/foreman-test-agent");

    let tracker = Arc::new(MemoryTracker::new());
    let mut config = ExecutorConfig::default();
    config.issue_prefix = "fm".into();
    config.enable_ai_supervision = false;
    config.enable_quality_gates = true;
    config.enable_quality_gate_worker = true;
    config.enable_auto_commit = false;
    config.enable_health_monitoring = false;
    config.advisor_url = None;

    let workdir = tempfile::tempdir().unwrap();
    let executor = Executor::new(
        config,
        tracker.clone(),
        None,
        Some(Arc::new(SlowFailingGates)),
        Arc::new(StaticCostTracker(BudgetState::Ok)),
        workdir.path().to_path_buf(),
        AgentKind::Claude,
        CancellationToken::new(),
    )
    .unwrap();

    // An epic waiting in the QA queue. Its children keep it out of the
    // ready queue, so only the QA worker touches it.
    let mut epic = Issue::new("fm-epic", "finished mission", IssueType::Epic);
    epic.labels.insert(NEEDS_QA_LABEL.to_string());
    tracker.create_issue(epic).unwrap();
    tracker
        .create_issue(Issue::new("fm-open-child", "still open", IssueType::Task))
        .unwrap();
    tracker
        .add_dependency(dispatch::tracker::types::DependencyEdge::new(
            "fm-epic",
            "fm-open-child",
            dispatch::tracker::types::DependencyKind::Blocks,
        ))
        .unwrap();
    tracker.claim_issue("fm-open-child", "someone-else").unwrap();

    executor.tick().await.unwrap();

    // The lock label is taken synchronously during the tick.
    let labels = tracker.get_labels("fm-epic").unwrap();
    assert!(labels.contains(&GATES_RUNNING_LABEL.to_string()));

    // The gate run finishes in the background, records its outcome, and
    // releases the lock.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let epic = tracker.get_issue("fm-epic").unwrap();
    assert!(!epic.has_label(GATES_RUNNING_LABEL));
    assert!(epic
        .comments
        .iter()
        .any(|c| c.body.contains("FAILED") && c.body.contains("test")));

    // The mission stays in the QA queue until something clears the
    // needs-quality-gates label; a later tick can take the lock again and
    // the cycle stays idempotent.
    executor.tick().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!tracker
        .get_issue("fm-epic")
        .unwrap()
        .has_label(GATES_RUNNING_LABEL));
}
