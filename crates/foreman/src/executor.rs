//! The executor event loop.
//!
//! One ticker drives everything: heartbeat, preflight baseline check,
//! budget gate, self-healing recovery, work selection and claiming, the
//! per-issue execution pipeline, the QA worker, and health monitors.
//! Claim races between executors are expected and swallowed; the loop
//! simply moves on.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use dispatch::baseline::{baseline_issue_id, gate_type, GateKind, BASELINE_LABEL};
use dispatch::budget::{BudgetGate, BudgetState, CostTracker};
use dispatch::config::{ExecutorConfig, FailureMode};
use dispatch::escalation::{EscalationThresholds, EscalationTracker};
use dispatch::events::{emit_best_effort, EventKind, EventSink, ExecutorEvent, Severity};
use dispatch::exec::ExecPhase;
use dispatch::healing::{HealingMode, HealingState};
use dispatch::tracker::types::{ExecutorInstance, InstanceStatus, Issue, IssueStatus, IssueType};
use dispatch::tracker::{TrackerError, TrackerStore};

use crate::advisor::Advisor;
use crate::agent::{AgentKind, AgentRequest, AgentSupervisor, CaptureLimits, SuperviseError};
use crate::context::ContextGatherer;
use crate::gates::{GateRunner, PreflightCache};
use crate::git;
use crate::prompt::build_prompt;
use crate::results::{AgentOutcome, ProcessingResult, ResultProcessor};
use crate::selector::{SelectedWork, WorkSelector};
use crate::watchdog::Watchdog;

/// Cross-process lock label for mission QA runs.
pub const GATES_RUNNING_LABEL: &str = "gates-running";
/// Label queueing a completed mission for the QA worker.
pub const NEEDS_QA_LABEL: &str = crate::results::NEEDS_QA_LABEL;

/// Registered health monitor, run each tick; errors are logged, never fatal.
pub type HealthMonitor = Box<dyn Fn() -> Result<()> + Send + Sync>;

/// Adapts the tracker's event log to the [`EventSink`] interface.
struct TrackerSink(Arc<dyn TrackerStore>);

impl EventSink for TrackerSink {
    fn store(&self, event: &ExecutorEvent) -> Result<()> {
        self.0.store_agent_event(event).map_err(Into::into)
    }
}

pub struct Executor {
    config: Arc<ExecutorConfig>,
    tracker: Arc<dyn TrackerStore>,
    advisor: Option<Arc<dyn Advisor>>,
    gates: Option<Arc<dyn GateRunner>>,
    sink: Arc<dyn EventSink>,
    budget: BudgetGate<Arc<dyn CostTracker>>,
    healing: Arc<HealingState>,
    escalation: Arc<EscalationTracker>,
    selector: WorkSelector,
    processor: ResultProcessor,
    gatherer: ContextGatherer,
    supervisor: AgentSupervisor,
    watchdog: Watchdog,
    preflight_cache: PreflightCache,
    health_monitors: Vec<HealthMonitor>,
    shutdown: CancellationToken,
    instance_id: String,
    workdir: PathBuf,
    agent_kind: AgentKind,
}

impl Executor {
    /// Wire up an executor instance. `shutdown` is the root cancellation
    /// token: cancelling it preempts the in-flight agent and stops the loop.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ExecutorConfig,
        tracker: Arc<dyn TrackerStore>,
        advisor: Option<Arc<dyn Advisor>>,
        gates: Option<Arc<dyn GateRunner>>,
        cost: Arc<dyn CostTracker>,
        workdir: PathBuf,
        agent_kind: AgentKind,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        config.validate().context("invalid executor configuration")?;
        let config = Arc::new(config);

        let instance_id = {
            let suffix = uuid::Uuid::new_v4().simple().to_string();
            format!("exec-{}", &suffix[..8])
        };
        let sink: Arc<dyn EventSink> = Arc::new(TrackerSink(tracker.clone()));
        let healing = Arc::new(HealingState::new());
        let escalation = Arc::new(EscalationTracker::new(EscalationThresholds {
            max_attempts: config.max_escalation_attempts,
            max_duration: config.max_escalation_duration(),
        }));

        let selector = WorkSelector::new(
            tracker.clone(),
            healing.clone(),
            escalation.clone(),
            sink.clone(),
            config.clone(),
            instance_id.clone(),
        );
        let processor = ResultProcessor::new(
            tracker.clone(),
            advisor.clone(),
            gates.clone(),
            sink.clone(),
            escalation.clone(),
            config.clone(),
            instance_id.clone(),
        );
        let gatherer = ContextGatherer::new(tracker.clone());
        let supervisor = AgentSupervisor::new(
            instance_id.clone(),
            CaptureLimits {
                max_output_lines: config.max_output_lines,
                max_file_reads: config.max_file_reads,
                max_same_file_reads: config.max_same_file_reads,
            },
        )
        .with_sink(sink.clone())
        .with_trace_events(config.trace_events);

        Ok(Self {
            watchdog: Watchdog::new(shutdown.clone()),
            budget: BudgetGate::new(cost),
            tracker,
            advisor,
            gates,
            sink,
            healing,
            escalation,
            selector,
            processor,
            gatherer,
            supervisor,
            preflight_cache: PreflightCache::new(),
            health_monitors: Vec::new(),
            shutdown,
            instance_id,
            workdir,
            agent_kind,
            config,
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn healing(&self) -> &HealingState {
        &self.healing
    }

    pub fn register_health_monitor(&mut self, monitor: HealthMonitor) {
        self.health_monitors.push(monitor);
    }

    /// Preempt the in-flight agent for one issue (external intervention).
    /// Returns false when nothing is running for that issue.
    pub fn preempt(&self, issue_id: &str) -> bool {
        self.watchdog.preempt(issue_id)
    }

    /// Run the ticker until the shutdown token fires.
    pub async fn run(&self) -> Result<()> {
        self.register_instance()?;
        info!(instance = %self.instance_id, workdir = %self.workdir.display(), "executor started");

        while !self.shutdown.is_cancelled() {
            if let Err(e) = self.tick().await {
                error!(error = %e, "tick failed — continuing");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
                _ = self.shutdown.cancelled() => break,
            }
        }

        self.cleanup();
        info!(instance = %self.instance_id, "executor stopped");
        Ok(())
    }

    /// One loop iteration. Public so single-shot runs and tests can drive
    /// the loop directly.
    pub async fn tick(&self) -> Result<()> {
        self.heartbeat();
        self.reap_instances();
        self.preflight().await;
        self.check_recovery();

        let decision = self.budget.check();
        if decision.newly_changed && decision.state != BudgetState::Ok {
            let severity = match decision.state {
                BudgetState::Exceeded => Severity::Critical,
                _ => Severity::Warning,
            };
            self.emit(
                severity,
                EventKind::BudgetAlert {
                    state: decision.state.to_string(),
                    resets_in_secs: self.budget.window_resets_in().map(|d| d.as_secs()),
                },
                None,
            );
        }

        if decision.proceed {
            match self.selector.get_ready_work()? {
                Some(selected) => self.claim_and_execute(selected).await,
                None => debug!("no ready work this tick"),
            }
            if self.config.enable_quality_gate_worker {
                self.qa_tick();
            }
        }

        self.run_health_monitors();
        Ok(())
    }

    // ── Instance lifecycle ──────────────────────────────────────────────

    fn register_instance(&self) -> Result<()> {
        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        self.tracker
            .register_instance(ExecutorInstance {
                instance_id: self.instance_id.clone(),
                hostname,
                pid: std::process::id(),
                status: InstanceStatus::Running,
                started_at: Utc::now(),
                last_heartbeat: Utc::now(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            })
            .context("failed to register executor instance")
    }

    fn heartbeat(&self) {
        if let Err(e) = self.tracker.update_heartbeat(&self.instance_id) {
            warn!(error = %e, "heartbeat failed");
        }
    }

    fn reap_instances(&self) {
        match self.tracker.cleanup_instances(
            self.config.instance_cleanup_age(),
            self.config.instance_cleanup_keep,
        ) {
            Ok(0) => {}
            Ok(reaped) => info!(reaped, "reaped stale executor instances"),
            Err(e) => warn!(error = %e, "instance cleanup failed"),
        }
    }

    fn cleanup(&self) {
        // Cleanup runs after the shutdown token has fired; tracker calls
        // here must not depend on it.
        if let Err(e) = self.tracker.mark_instance_stopped(&self.instance_id) {
            warn!(error = %e, "failed to mark instance stopped");
        }
    }

    // ── Preflight & self-healing recovery ───────────────────────────────

    /// Check baseline health (build + lint), cached by commit hash. On
    /// failure the configured failure mode decides between entering
    /// self-healing, warning, or ignoring.
    async fn preflight(&self) {
        if !self.config.enable_quality_gates {
            return;
        }
        let Some(gates) = &self.gates else { return };

        let commit = git::head_hash(&self.workdir).await.ok();
        if let Some(commit) = &commit {
            if let Some(healthy) = self.preflight_cache.get(commit) {
                if !healthy {
                    self.on_preflight_failure(&[]).await;
                }
                return;
            }
        }

        let (results, healthy) =
            match gates.run_preflight(&self.workdir, self.config.gates_timeout()).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(error = %e, "preflight could not run — treating as unhealthy");
                    (Vec::new(), false)
                }
            };
        if let Some(commit) = &commit {
            self.preflight_cache.put(commit, healthy);
        }
        if !healthy {
            let failed: Vec<GateKind> = results
                .iter()
                .filter(|r| !r.passed)
                .map(|r| r.gate)
                .collect();
            self.on_preflight_failure(&failed).await;
        }
    }

    async fn on_preflight_failure(&self, failed_gates: &[GateKind]) {
        match self.config.failure_mode {
            FailureMode::Block => {
                if self
                    .healing
                    .transition(HealingMode::SelfHealing, "preflight failed")
                    .is_some()
                {
                    self.emit(
                        Severity::Warning,
                        EventKind::SelfHealingMode {
                            from: HealingMode::Healthy.to_string(),
                            to: HealingMode::SelfHealing.to_string(),
                            reason: "preflight failed".into(),
                        },
                        None,
                    );
                }
                for gate in failed_gates {
                    self.ensure_baseline_issue(*gate);
                }
            }
            FailureMode::Warn => {
                warn!("preflight failed — continuing (failure_mode=warn)");
            }
            FailureMode::Ignore => {
                debug!("preflight failed — ignored (failure_mode=ignore)");
            }
        }
    }

    /// Create the baseline issue for a failed gate, once.
    fn ensure_baseline_issue(&self, gate: GateKind) {
        let id = baseline_issue_id(&self.config.issue_prefix, gate);
        match self.tracker.get_issue(&id) {
            Ok(existing) if existing.status != IssueStatus::Closed => return,
            Ok(_) => {
                // Closed baseline re-broke: reopen it.
                if let Err(e) = self.tracker.update_status(&id, IssueStatus::Open, &self.instance_id)
                {
                    warn!(issue = %id, error = %e, "failed to reopen baseline issue");
                }
                return;
            }
            Err(TrackerError::NotFound(_)) => {}
            Err(e) => {
                warn!(issue = %id, error = %e, "failed to look up baseline issue");
                return;
            }
        }

        let issue = Issue::new(
            id.clone(),
            format!("Baseline {gate} gate is failing"),
            IssueType::Bug,
        )
        .with_priority(0)
        .with_description(format!(
            "The repository-wide `{gate}` gate fails on the current baseline. \
             Repair it following the self-healing protocol."
        ))
        .with_label(BASELINE_LABEL);
        match self.tracker.create_issue(issue) {
            Ok(_) => info!(issue = %id, %gate, "created baseline issue"),
            Err(e) => warn!(issue = %id, error = %e, "failed to create baseline issue"),
        }
    }

    /// Leave SELF_HEALING / ESCALATED once no baseline-failure issue
    /// remains open. Returning to HEALTHY clears every escalation counter.
    fn check_recovery(&self) {
        if self.healing.mode() == HealingMode::Healthy {
            return;
        }
        let open_baselines = match self.tracker.get_issues_by_label(BASELINE_LABEL) {
            Ok(issues) => issues
                .into_iter()
                .filter(|i| i.status != IssueStatus::Closed)
                .count(),
            Err(e) => {
                warn!(error = %e, "failed to check baseline issues");
                return;
            }
        };
        if open_baselines == 0 {
            if let Some(from) = self
                .healing
                .transition(HealingMode::Healthy, "baselines clean")
            {
                self.escalation.clear_all();
                self.emit(
                    Severity::Info,
                    EventKind::SelfHealingMode {
                        from: from.to_string(),
                        to: HealingMode::Healthy.to_string(),
                        reason: "baselines clean".into(),
                    },
                    None,
                );
            }
        }
    }

    // ── Claim & execute ─────────────────────────────────────────────────

    async fn claim_and_execute(&self, selected: SelectedWork) {
        let issue_id = selected.issue.id.clone();
        match self.tracker.claim_issue(&issue_id, &self.instance_id) {
            Ok(()) => {}
            Err(e) if e.is_claim_race() => {
                // Another executor got there first; normal outcome.
                debug!(issue = %issue_id, "lost claim race");
                return;
            }
            Err(e) => {
                warn!(issue = %issue_id, error = %e, "claim failed");
                return;
            }
        }

        self.selector.on_claimed(&selected);
        self.emit(Severity::Info, EventKind::IssueClaimed, Some(&issue_id));

        let token = self.watchdog.register(&issue_id);
        let outcome = self.execute_issue(&selected.issue, &token).await;
        self.watchdog.complete(&issue_id);

        if let Err(e) = outcome {
            error!(issue = %issue_id, error = %e, "execution pipeline failed — releasing");
            let released = self.tracker.release_issue_and_reopen(
                &issue_id,
                &self.instance_id,
                &format!("Executor error: {e}. Reopened for retry."),
            );
            if let Err(e) = released {
                warn!(issue = %issue_id, error = %e, "release after pipeline failure failed");
            }
        }
    }

    /// Assessment → context → prompt → agent → result processing.
    async fn execute_issue(
        &self,
        issue: &Issue,
        cancel: &CancellationToken,
    ) -> Result<Option<ProcessingResult>> {
        self.advance_phase(&issue.id, ExecPhase::Assessing);

        if let Some(advisor) = &self.advisor {
            if let Err(e) = advisor.health_check().await {
                // Do not execute against a blind advisor: release and move on.
                warn!(issue = %issue.id, error = %e, "advisor health check failed");
                self.tracker.release_issue_and_reopen(
                    &issue.id,
                    &self.instance_id,
                    &format!("Released without execution: advisor unavailable ({e})."),
                )?;
                return Ok(None);
            }

            self.emit(Severity::Info, EventKind::AssessmentStarted, Some(&issue.id));
            match advisor.assess(issue).await {
                Ok(assessment) => {
                    self.emit(
                        Severity::Info,
                        EventKind::AssessmentCompleted {
                            strategy: assessment.strategy.clone(),
                            confidence: assessment.confidence,
                        },
                        Some(&issue.id),
                    );
                }
                Err(e) => {
                    // Degradation after a successful claim: skip assessment.
                    warn!(issue = %issue.id, error = %e, "assessment failed — skipping");
                }
            }
        }

        let mut ctx = self.gatherer.gather(issue)?;
        ctx.sandbox_path = Some(self.workdir.clone());
        ctx.git_state = git::observe_state(&self.workdir).await;
        let prompt = build_prompt(&ctx);
        if self.config.dump_prompts {
            debug!(issue = %issue.id, prompt = %prompt, "assembled prompt");
        }

        self.advance_phase(&issue.id, ExecPhase::Executing);
        self.emit(
            Severity::Info,
            EventKind::AgentSpawned {
                agent: self.agent_kind.to_string(),
            },
            Some(&issue.id),
        );
        if let Some(gate) = gate_type(&issue.id) {
            self.emit(
                Severity::Info,
                EventKind::BaselineFixStarted {
                    gate: gate.to_string(),
                },
                Some(&issue.id),
            );
        }

        let request = AgentRequest {
            kind: self.agent_kind,
            workdir: self.workdir.clone(),
            prompt,
            timeout: self.config.agent_timeout(),
            stream_json: true,
            issue_id: Some(issue.id.clone()),
        };
        let started_at = Utc::now();
        let outcome = match self.supervisor.run(&request, cancel).await {
            Ok(result) => {
                self.emit(
                    Severity::Info,
                    EventKind::AgentCompleted {
                        success: result.success,
                        exit_code: result.exit_code,
                        duration_ms: result.duration.as_millis() as u64,
                    },
                    Some(&issue.id),
                );
                AgentOutcome::Finished(result)
            }
            Err(SuperviseError::Timeout(after)) => AgentOutcome::TimedOut(after),
            Err(SuperviseError::Cancelled) => {
                if self.shutdown.is_cancelled() {
                    // Shutting down: release so another instance can pick
                    // the issue up, skip result processing entirely.
                    self.tracker.release_issue(&issue.id)?;
                    return Ok(None);
                }
                AgentOutcome::Cancelled
            }
            Err(SuperviseError::Spawn(e)) => AgentOutcome::SpawnFailed(e),
        };

        let attempt_number = self.tracker.get_attempts(&issue.id)?.len() as u32 + 1;
        let result = self
            .processor
            .process(issue, &self.workdir, attempt_number, started_at, outcome)
            .await?;
        Ok(Some(result))
    }

    // ── QA worker ───────────────────────────────────────────────────────

    /// Claim at most one `needs-quality-gates` mission per tick, using the
    /// `gates-running` label as a cross-process lock, and run its gates in
    /// a background task.
    fn qa_tick(&self) {
        let Some(gates) = self.gates.clone() else { return };

        let missions = match self.tracker.get_issues_by_label(NEEDS_QA_LABEL) {
            Ok(missions) => missions,
            Err(e) => {
                warn!(error = %e, "QA worker could not list missions");
                return;
            }
        };
        let Some(mission) = missions
            .into_iter()
            .find(|m| m.status != IssueStatus::Closed && !m.has_label(GATES_RUNNING_LABEL))
        else {
            return;
        };

        // Label add is the lock acquisition; losing it means another
        // instance owns this mission's gate run.
        if let Err(e) = self.tracker.add_label(&mission.id, GATES_RUNNING_LABEL) {
            debug!(mission = %mission.id, error = %e, "QA lock not acquired");
            return;
        }
        info!(mission = %mission.id, "QA worker claimed mission gate run");

        let tracker = self.tracker.clone();
        let sink = self.sink.clone();
        let workdir = self.workdir.clone();
        let timeout = self.config.gates_timeout();
        let instance_id = self.instance_id.clone();
        let mission_id = mission.id.clone();

        tokio::spawn(async move {
            let outcome = gates.run_all(&workdir, timeout).await;
            let body = match &outcome {
                Ok((results, true)) => format!(
                    "Quality gates passed for the completed mission ({} gates).",
                    results.len()
                ),
                Ok((results, false)) => {
                    let failed: Vec<String> = results
                        .iter()
                        .filter(|r| !r.passed)
                        .map(|r| r.gate.to_string())
                        .collect();
                    format!("Quality gates FAILED for the mission: {}.", failed.join(", "))
                }
                Err(e) => format!("Quality gate run errored: {e}."),
            };
            if let Err(e) = tracker.add_comment(&mission_id, &instance_id, &body) {
                warn!(mission = %mission_id, error = %e, "failed to record QA outcome");
            }

            // Unlock. A stuck label would wedge the mission, so failure
            // here is alerted loudly.
            if let Err(e) = tracker.remove_label(&mission_id, GATES_RUNNING_LABEL) {
                error!(mission = %mission_id, error = %e, "failed to remove gates-running label");
                emit_best_effort(
                    sink.as_ref(),
                    ExecutorEvent::new(
                        &instance_id,
                        Severity::Critical,
                        EventKind::Error {
                            message: format!(
                                "mission {mission_id} stuck: gates-running label could not be removed"
                            ),
                        },
                    )
                    .for_issue(mission_id.clone()),
                );
            }
        });
    }

    // ── Health monitors ─────────────────────────────────────────────────

    fn run_health_monitors(&self) {
        if !self.config.enable_health_monitoring {
            return;
        }
        for (index, monitor) in self.health_monitors.iter().enumerate() {
            if let Err(e) = monitor() {
                warn!(monitor = index, error = %e, "health monitor failed");
            }
        }
    }

    // ── Helpers ─────────────────────────────────────────────────────────

    fn advance_phase(&self, issue_id: &str, phase: ExecPhase) {
        if let Err(e) = self
            .tracker
            .update_execution_state(issue_id, &self.instance_id, phase)
        {
            warn!(issue = issue_id, %phase, error = %e, "phase transition failed");
        }
    }

    fn emit(&self, severity: Severity, kind: EventKind, issue_id: Option<&str>) {
        let mut event = ExecutorEvent::new(&self.instance_id, severity, kind);
        if let Some(id) = issue_id {
            event = event.for_issue(id);
        }
        emit_best_effort(self.sink.as_ref(), event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gates::GateResult;
    use async_trait::async_trait;
    use dispatch::budget::StaticCostTracker;
    use dispatch::MemoryTracker;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Gate runner with a switchable verdict.
    struct FakeGates {
        healthy: AtomicBool,
    }

    impl FakeGates {
        fn new(healthy: bool) -> Self {
            Self {
                healthy: AtomicBool::new(healthy),
            }
        }

        fn results(&self, gates: &[GateKind]) -> (Vec<GateResult>, bool) {
            let healthy = self.healthy.load(Ordering::SeqCst);
            let results = gates
                .iter()
                .map(|&gate| GateResult {
                    gate,
                    passed: healthy,
                    output: if healthy { String::new() } else { "broken".into() },
                    duration_ms: 1,
                })
                .collect();
            (results, healthy)
        }
    }

    #[async_trait]
    impl GateRunner for FakeGates {
        async fn run_all(
            &self,
            _workdir: &Path,
            _timeout: Duration,
        ) -> Result<(Vec<GateResult>, bool)> {
            Ok(self.results(&GateKind::ALL))
        }

        async fn run_preflight(
            &self,
            _workdir: &Path,
            _timeout: Duration,
        ) -> Result<(Vec<GateResult>, bool)> {
            Ok(self.results(&[GateKind::Build, GateKind::Lint]))
        }
    }

    fn test_config() -> ExecutorConfig {
        let mut config = ExecutorConfig::default();
        config.issue_prefix = "fm".into();
        config.enable_ai_supervision = false;
        config.enable_quality_gates = true;
        config.enable_auto_commit = false;
        config.enable_quality_gate_worker = false;
        config.enable_health_monitoring = false;
        config.advisor_url = None;
        config.poll_interval_secs = 0;
        config.agent_timeout_secs = 5;
        config
    }

    /// Point the agent binary at a path that cannot exist, so claimed
    /// issues deterministically take the spawn-failure path.
    fn disable_real_agent() {
        std::env::set_var("FOREMAN_CLAUDE_BIN", "/nonexistent/foreman-test-agent");
    }

    fn executor(
        tracker: Arc<MemoryTracker>,
        gates: Arc<FakeGates>,
        workdir: PathBuf,
    ) -> Executor {
        disable_real_agent();
        Executor::new(
            test_config(),
            tracker,
            None,
            Some(gates),
            Arc::new(StaticCostTracker(BudgetState::Ok)),
            workdir,
            AgentKind::Claude,
            CancellationToken::new(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_preflight_failure_enters_self_healing_and_files_baselines() {
        let tracker = Arc::new(MemoryTracker::new());
        let gates = Arc::new(FakeGates::new(false));
        let workdir = tempfile::tempdir().unwrap();
        let exec = executor(tracker.clone(), gates, workdir.path().to_path_buf());
        exec.register_instance().unwrap();

        exec.tick().await.unwrap();

        assert_eq!(exec.healing().mode(), HealingMode::SelfHealing);
        let baselines = tracker.get_issues_by_label(BASELINE_LABEL).unwrap();
        let gates_filed: Vec<_> = baselines
            .iter()
            .filter_map(|i| gate_type(&i.id))
            .collect();
        assert!(gates_filed.contains(&GateKind::Build));
        assert!(gates_filed.contains(&GateKind::Lint));
    }

    #[tokio::test]
    async fn test_recovery_when_baselines_close() {
        let tracker = Arc::new(MemoryTracker::new());
        let gates = Arc::new(FakeGates::new(false));
        let workdir = tempfile::tempdir().unwrap();
        let exec = executor(tracker.clone(), gates.clone(), workdir.path().to_path_buf());
        exec.register_instance().unwrap();

        exec.tick().await.unwrap();
        assert_eq!(exec.healing().mode(), HealingMode::SelfHealing);

        // Gates fixed and every baseline closed: the next tick recovers.
        gates.healthy.store(true, Ordering::SeqCst);
        for baseline in tracker.get_issues_by_label(BASELINE_LABEL).unwrap() {
            tracker.release_issue(&baseline.id).unwrap();
            tracker.close_issue(&baseline.id, "test").unwrap();
        }
        exec.tick().await.unwrap();
        assert_eq!(exec.healing().mode(), HealingMode::Healthy);
    }

    #[tokio::test]
    async fn test_spawn_failure_reopens_issue() {
        // No real agent binary exists in the test environment, so a
        // claimed issue fails to spawn and must be reopened with a comment.
        let tracker = Arc::new(MemoryTracker::new());
        let gates = Arc::new(FakeGates::new(true));
        let workdir = tempfile::tempdir().unwrap();
        let exec = executor(tracker.clone(), gates, workdir.path().to_path_buf());
        exec.register_instance().unwrap();

        tracker
            .create_issue(Issue::new("fm-task", "do work", IssueType::Task))
            .unwrap();
        exec.tick().await.unwrap();

        let issue = tracker.get_issue("fm-task").unwrap();
        assert_eq!(issue.status, IssueStatus::Open);
        assert!(tracker.get_execution_state("fm-task").unwrap().is_none());
        assert!(issue
            .comments
            .iter()
            .any(|c| c.body.contains("failed to start")));
        // The attempt was recorded as a failure.
        let attempts = tracker.get_attempts("fm-task").unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].success, Some(false));
    }

    #[tokio::test]
    async fn test_budget_exceeded_skips_claiming() {
        let tracker = Arc::new(MemoryTracker::new());
        let gates = Arc::new(FakeGates::new(true));
        let workdir = tempfile::tempdir().unwrap();
        disable_real_agent();
        let exec = Executor::new(
            test_config(),
            tracker.clone(),
            None,
            Some(gates),
            Arc::new(StaticCostTracker(BudgetState::Exceeded)),
            workdir.path().to_path_buf(),
            AgentKind::Claude,
            CancellationToken::new(),
        )
        .unwrap();
        exec.register_instance().unwrap();

        tracker
            .create_issue(Issue::new("fm-task", "do work", IssueType::Task))
            .unwrap();
        exec.tick().await.unwrap();

        // Nothing was claimed while the budget is exhausted.
        assert_eq!(
            tracker.get_issue("fm-task").unwrap().status,
            IssueStatus::Open
        );
        assert!(tracker.get_execution_state("fm-task").unwrap().is_none());
        // The alert event fired once.
        let events = tracker.get_agent_events(None, 100).unwrap();
        assert!(events
            .iter()
            .any(|e| e.kind.name() == "budget_alert" && e.severity == Severity::Critical));
    }
}
