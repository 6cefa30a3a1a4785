//! Result processing.
//!
//! Everything between "agent finished" and "issue released or closed":
//! attempt persistence, advisor analysis, discovered-issue deduplication,
//! quality gates, outcome classification, auto-commit, bounded
//! incomplete-work retries, and consecutive-failure blocking.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use dispatch::baseline::{gate_type, is_baseline_issue};
use dispatch::config::ExecutorConfig;
use dispatch::escalation::EscalationTracker;
use dispatch::events::{emit_best_effort, EventKind, EventSink, ExecutorEvent, Severity};
use dispatch::exec::ExecPhase;
use dispatch::tracker::types::{
    DependencyEdge, DependencyKind, DiscoveredIssue, ExecutionAttempt, Issue, IssueId, IssueStatus,
    IssueType,
};
use dispatch::tracker::{TrackerResult, TrackerStore};

use crate::advisor::{Advisor, Analysis, DedupStats};
use crate::agent::AgentResult;
use crate::gates::{GateResult, GateRunner};
use crate::git;

/// Comment prefix marking a bounded incomplete-work retry. The attempt
/// count is recovered by counting comments with exactly this prefix.
pub const INCOMPLETE_MARKER: &str = "**Incomplete Work Detected (Attempt #";
/// Comment prefix marking incomplete-work escalation to a human.
pub const ESCALATED_MARKER: &str = "**Incomplete Work Escalated**";
/// Label handing an issue to a human after repeated incomplete work.
pub const NEEDS_HUMAN_LABEL: &str = "needs-human-review";
/// Label handing a completed epic to the QA worker queue.
pub const NEEDS_QA_LABEL: &str = "needs-quality-gates";
pub use dispatch::tracker::types::BLOCKER_LABEL;

/// Consecutive failed attempts before an issue is blocked instead of
/// reopened.
const CONSECUTIVE_FAILURE_LIMIT: usize = 3;

/// How the supervised agent run ended.
#[derive(Debug)]
pub enum AgentOutcome {
    /// The child ran to an exit (which may still be a failure exit).
    Finished(AgentResult),
    SpawnFailed(String),
    TimedOut(Duration),
    /// Preempted by the watchdog or shutdown.
    Cancelled,
}

impl AgentOutcome {
    fn agent_succeeded(&self) -> bool {
        matches!(self, Self::Finished(result) if result.success)
    }

    fn failure_reason(&self) -> String {
        match self {
            Self::Finished(result) => match &result.breaker_reason {
                Some(reason) => format!("circuit breaker: {reason}"),
                None => format!(
                    "agent exited with code {}",
                    result
                        .exit_code
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "?".to_string())
                ),
            },
            Self::SpawnFailed(e) => format!("agent failed to start: {e}"),
            Self::TimedOut(after) => format!("agent timed out after {}s", after.as_secs()),
            Self::Cancelled => "agent run was cancelled".to_string(),
        }
    }
}

/// Summary handed back to the event loop.
#[derive(Debug, Default)]
pub struct ProcessingResult {
    pub completed: bool,
    pub gates_passed: Option<bool>,
    pub discovered: Vec<IssueId>,
    pub commit: Option<String>,
    /// Incomplete work crossed its retry bound and was handed to a human.
    pub escalated_incomplete: bool,
    /// The issue was blocked by the consecutive-failure rule.
    pub blocked: bool,
}

pub struct ResultProcessor {
    tracker: Arc<dyn TrackerStore>,
    advisor: Option<Arc<dyn Advisor>>,
    gates: Option<Arc<dyn GateRunner>>,
    sink: Arc<dyn EventSink>,
    escalation: Arc<EscalationTracker>,
    config: Arc<ExecutorConfig>,
    instance_id: String,
}

impl ResultProcessor {
    pub fn new(
        tracker: Arc<dyn TrackerStore>,
        advisor: Option<Arc<dyn Advisor>>,
        gates: Option<Arc<dyn GateRunner>>,
        sink: Arc<dyn EventSink>,
        escalation: Arc<EscalationTracker>,
        config: Arc<ExecutorConfig>,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            tracker,
            advisor,
            gates,
            sink,
            escalation,
            config,
            instance_id: instance_id.into(),
        }
    }

    /// Drive an agent outcome through analysis, gates, and classification.
    pub async fn process(
        &self,
        issue: &Issue,
        workdir: &Path,
        attempt_number: u32,
        started_at: DateTime<Utc>,
        outcome: AgentOutcome,
    ) -> Result<ProcessingResult> {
        self.emit(
            Severity::Info,
            EventKind::ResultsProcessingStarted,
            Some(&issue.id),
        );

        self.persist_attempt(issue, attempt_number, started_at, &outcome);

        // Advisor analysis, skipped silently when unavailable or failing.
        let analysis = self.run_analysis(issue, &outcome).await;

        let discovered = match &analysis {
            Some(analysis) if !analysis.discovered_issues.is_empty() => {
                self.dedup_and_create(issue, &analysis.discovered_issues).await
            }
            _ => Vec::new(),
        };

        let gate_results = self.run_gates(issue, workdir, &outcome).await;
        let gates_passed = gate_results
            .as_ref()
            .map(|results| results.iter().all(|r| r.passed));

        let agent_succeeded = outcome.agent_succeeded();
        let analysis_complete = analysis.as_ref().map(|a| a.completed);

        let mut result = ProcessingResult {
            completed: false,
            gates_passed,
            discovered,
            commit: None,
            escalated_incomplete: false,
            blocked: false,
        };

        if agent_succeeded && gates_passed != Some(false) && analysis_complete != Some(false) {
            result.completed = true;
            result.commit = self.handle_success(issue, workdir, analysis.as_ref()).await?;
        } else if agent_succeeded && analysis_complete == Some(false) {
            let summary = analysis.map(|a| a.summary).unwrap_or_default();
            result.escalated_incomplete = self.handle_incomplete_work(issue, &summary)?;
        } else {
            let mut reason = outcome.failure_reason();
            if gates_passed == Some(false) {
                let failed: Vec<String> = gate_results
                    .iter()
                    .flatten()
                    .filter(|r| !r.passed)
                    .map(|r| r.gate.to_string())
                    .collect();
                reason = format!("quality gates failed ({})", failed.join(", "));
            }
            result.blocked = self.handle_failure(issue, &reason)?;
        }

        self.emit(
            Severity::Info,
            EventKind::ResultsProcessingCompleted {
                completed: result.completed,
            },
            Some(&issue.id),
        );
        Ok(result)
    }

    // ── Attempt history ─────────────────────────────────────────────────

    fn persist_attempt(
        &self,
        issue: &Issue,
        attempt_number: u32,
        started_at: DateTime<Utc>,
        outcome: &AgentOutcome,
    ) {
        let (success, exit_code, summary, error_sample) = match outcome {
            AgentOutcome::Finished(result) => (
                Some(result.success),
                result.exit_code,
                format!(
                    "agent ran {}s, {} stdout lines",
                    result.duration.as_secs(),
                    result.stdout.len()
                ),
                tail_sample(&result.stderr),
            ),
            AgentOutcome::SpawnFailed(e) => (Some(false), None, "spawn failed".into(), e.clone()),
            AgentOutcome::TimedOut(after) => (
                Some(false),
                None,
                format!("timed out after {}s", after.as_secs()),
                String::new(),
            ),
            AgentOutcome::Cancelled => (None, None, "cancelled".into(), String::new()),
        };

        let attempt = ExecutionAttempt {
            issue_id: issue.id.clone(),
            instance_id: self.instance_id.clone(),
            attempt_number,
            started_at,
            completed_at: Some(Utc::now()),
            success,
            exit_code,
            summary,
            error_sample,
        };
        if let Err(e) = self.tracker.record_attempt(attempt) {
            warn!(issue = %issue.id, error = %e, "failed to persist attempt record");
        }
    }

    // ── Analysis ────────────────────────────────────────────────────────

    async fn run_analysis(&self, issue: &Issue, outcome: &AgentOutcome) -> Option<Analysis> {
        let advisor = self.advisor.as_ref()?;
        let AgentOutcome::Finished(agent) = outcome else {
            return None;
        };

        self.advance_phase(&issue.id, ExecPhase::Analyzing);
        let output = agent.stdout.join("\n");
        match advisor.analyze(issue, &output, agent.success).await {
            Ok(analysis) => {
                info!(
                    issue = %issue.id,
                    completed = analysis.completed,
                    discovered = analysis.discovered_issues.len(),
                    "analysis finished"
                );
                Some(analysis)
            }
            Err(e) => {
                // Advisor degradation after a successful start: skip it.
                warn!(issue = %issue.id, error = %e, "analysis failed — continuing without it");
                None
            }
        }
    }

    // ── Discovered-issue deduplication ──────────────────────────────────

    /// Cap, dedup, and create discovered issues. Never fails the caller:
    /// oracle errors fall through with the candidate list unchanged, and
    /// malformed entries are skipped one by one.
    async fn dedup_and_create(
        &self,
        parent: &Issue,
        candidates: &[DiscoveredIssue],
    ) -> Vec<IssueId> {
        let mut capped = candidates.to_vec();
        if capped.len() > self.config.dedup_batch_size {
            warn!(
                total = capped.len(),
                cap = self.config.dedup_batch_size,
                "discovered-issue batch over cap — truncating"
            );
            capped.truncate(self.config.dedup_batch_size);
        }

        let (unique, stats) = match &self.advisor {
            Some(advisor) => match advisor.dedup(parent, &capped).await {
                Ok((unique, stats)) => (unique, stats),
                Err(e) => {
                    warn!(error = %e, "dedup oracle failed — keeping raw candidates");
                    (capped.clone(), DedupStats::default())
                }
            },
            None => (capped.clone(), DedupStats::default()),
        };
        info!(
            candidates = stats.total_candidates,
            duplicates = stats.duplicates,
            unique = unique.len(),
            "dedup pass finished"
        );

        let mut created = Vec::new();
        for candidate in unique {
            let title = candidate.title.trim();
            if title.is_empty() {
                warn!("skipping discovered issue with empty title");
                continue;
            }
            let id = self.new_issue_id();
            let issue = Issue::new(&id, title, IssueType::parse_lenient(&candidate.issue_type))
                .with_priority(candidate.priority_or_default())
                .with_description(candidate.description.clone());
            if let Err(e) = self.tracker.create_issue(issue) {
                warn!(error = %e, "failed to create discovered issue");
                continue;
            }
            if let Err(e) = self.tracker.add_dependency(DependencyEdge::new(
                id.clone(),
                parent.id.clone(),
                DependencyKind::DiscoveredFrom,
            )) {
                warn!(error = %e, "failed to link discovered issue");
            }
            created.push(id);
        }
        created
    }

    // ── Quality gates ───────────────────────────────────────────────────

    async fn run_gates(
        &self,
        issue: &Issue,
        workdir: &Path,
        outcome: &AgentOutcome,
    ) -> Option<Vec<GateResult>> {
        if !self.config.enable_quality_gates || !matches!(outcome, AgentOutcome::Finished(_)) {
            return None;
        }
        let gates = self.gates.as_ref()?;

        self.advance_to(&issue.id, ExecPhase::Gates);
        match gates.run_all(workdir, self.config.gates_timeout()).await {
            Ok((results, _)) => {
                for result in &results {
                    let kind = if result.passed {
                        EventKind::QualityGatePass {
                            gate: result.gate.to_string(),
                        }
                    } else {
                        EventKind::QualityGateFail {
                            gate: result.gate.to_string(),
                            output_sample: result.output.chars().take(400).collect(),
                        }
                    };
                    let severity = if result.passed {
                        Severity::Info
                    } else {
                        Severity::Warning
                    };
                    self.emit(severity, kind, Some(&issue.id));
                }
                Some(results)
            }
            Err(e) => {
                warn!(issue = %issue.id, error = %e, "gate run failed — treating as gate failure");
                Some(vec![GateResult {
                    gate: dispatch::baseline::GateKind::Build,
                    passed: false,
                    output: format!("gate runner error: {e}"),
                    duration_ms: 0,
                }])
            }
        }
    }

    // ── Success ─────────────────────────────────────────────────────────

    async fn handle_success(
        &self,
        issue: &Issue,
        workdir: &Path,
        analysis: Option<&Analysis>,
    ) -> Result<Option<String>> {
        let mut commit = None;
        if self.config.enable_auto_commit {
            self.advance_to(&issue.id, ExecPhase::Committing);
            let summary = analysis.map(|a| a.summary.as_str()).unwrap_or("");
            let message = commit_message(issue, summary);
            match git::commit_all(workdir, &message).await {
                Ok(hash) => {
                    commit = hash;
                    if commit.is_some() && self.config.enable_auto_pr {
                        // The review request itself is owned by external
                        // tooling; record that one was asked for.
                        self.comment(&issue.id, "Review requested for the auto-committed change.");
                        self.emit(
                            Severity::Info,
                            EventKind::Progress {
                                subtype: "review_requested".into(),
                                detail: issue.id.clone(),
                            },
                            Some(&issue.id),
                        );
                    }
                }
                Err(e) => {
                    // A failed commit does not undo the work; surface it.
                    warn!(issue = %issue.id, error = %e, "auto-commit failed");
                    self.comment(&issue.id, &format!("Auto-commit failed: {e}"));
                }
            }
        }

        self.advance_to(&issue.id, ExecPhase::Completed);
        self.tracker.close_issue(&issue.id, &self.instance_id)?;
        info!(issue = %issue.id, "issue completed and closed");

        if is_baseline_issue(&issue.id) {
            self.escalation.clear(&issue.id);
            if let Some(gate) = gate_type(&issue.id) {
                self.emit(
                    Severity::Info,
                    EventKind::BaselineFixCompleted {
                        gate: gate.to_string(),
                        resolved: true,
                    },
                    Some(&issue.id),
                );
            }
        }

        self.check_mission_convergence(issue)?;
        self.propagate_epic_completion(&issue.id)?;
        Ok(commit)
    }

    /// When a discovered blocker closes, see whether its mission has
    /// converged (every discovered blocker closed).
    fn check_mission_convergence(&self, issue: &Issue) -> Result<()> {
        if !issue.has_label(BLOCKER_LABEL) {
            return Ok(());
        }
        for edge in self.tracker.get_dependency_records(&issue.id)? {
            if edge.issue_id != issue.id || edge.kind != DependencyKind::DiscoveredFrom {
                continue;
            }
            if has_mission_converged(self.tracker.as_ref(), &edge.depends_on)? {
                info!(mission = %edge.depends_on, "mission converged — all blockers closed");
                self.comment(
                    &edge.depends_on,
                    "All discovered blockers are closed; the mission has converged.",
                );
                self.emit(
                    Severity::Info,
                    EventKind::Progress {
                        subtype: "mission_converged".into(),
                        detail: edge.depends_on.clone(),
                    },
                    Some(&edge.depends_on),
                );
            }
        }
        Ok(())
    }

    /// Walk parent-child edges upward. Each epic that became complete is
    /// handed to the QA worker queue; nested epics keep propagating.
    /// Iterative with a visited set, so edge cycles cannot recurse.
    fn propagate_epic_completion(&self, issue_id: &str) -> Result<()> {
        let mut visited = HashSet::new();
        let mut current = issue_id.to_string();

        while let Some(parent_id) = self.parent_of(&current)? {
            if !visited.insert(parent_id.clone()) {
                break;
            }
            if !self.tracker.is_epic_complete(&parent_id)? {
                break;
            }
            let parent = self.tracker.get_issue(&parent_id)?;
            if parent.issue_type == IssueType::Epic && !parent.has_label(NEEDS_QA_LABEL) {
                info!(epic = %parent_id, "epic complete — queueing for quality gates");
                self.tracker.add_label(&parent_id, NEEDS_QA_LABEL)?;
                self.emit(
                    Severity::Info,
                    EventKind::Progress {
                        subtype: "epic_complete".into(),
                        detail: parent_id.clone(),
                    },
                    Some(&parent_id),
                );
            }
            current = parent_id;
        }
        Ok(())
    }

    fn parent_of(&self, issue_id: &str) -> TrackerResult<Option<IssueId>> {
        Ok(self
            .tracker
            .get_dependency_records(issue_id)?
            .into_iter()
            .find(|e| e.issue_id == issue_id && e.kind == DependencyKind::ParentChild)
            .map(|e| e.depends_on))
    }

    // ── Incomplete work ─────────────────────────────────────────────────

    /// Bounded retry for "agent says done, analysis says otherwise".
    /// Returns true when the bound was crossed and the issue escalated.
    fn handle_incomplete_work(&self, issue: &Issue, summary: &str) -> Result<bool> {
        let fresh = self.tracker.get_issue(&issue.id)?;
        let prior = fresh
            .comments
            .iter()
            .filter(|c| c.body.starts_with(INCOMPLETE_MARKER))
            .count() as u32;
        let attempt = prior + 1;

        if attempt <= self.config.max_incomplete_retries {
            let criteria = if fresh.acceptance_criteria.trim().is_empty() {
                "(none recorded)".to_string()
            } else {
                fresh.acceptance_criteria.trim().to_string()
            };
            self.comment(
                &issue.id,
                &format!(
                    "{INCOMPLETE_MARKER}{attempt})**\n\n\
                     The agent reported success but analysis found the work incomplete.\n\n\
                     Analysis summary: {summary}\n\n\
                     Acceptance criteria:\n{criteria}"
                ),
            );
            // Leave the issue in_progress; only the claim is released.
            self.tracker.release_issue(&issue.id)?;
            self.emit(
                Severity::Warning,
                EventKind::Progress {
                    subtype: "incomplete_retry".into(),
                    detail: format!("incomplete_attempts={attempt}"),
                },
                Some(&issue.id),
            );
            Ok(false)
        } else {
            self.comment(
                &issue.id,
                &format!(
                    "{ESCALATED_MARKER}\n\n\
                     The agent attempted {attempt} times without completing the work; \
                     handing to a human.\n\nLast analysis summary: {summary}"
                ),
            );
            self.tracker.add_label(&issue.id, NEEDS_HUMAN_LABEL)?;
            self.tracker
                .update_status(&issue.id, IssueStatus::Blocked, &self.instance_id)?;
            self.tracker.release_issue(&issue.id)?;
            self.emit(
                Severity::Error,
                EventKind::Progress {
                    subtype: "incomplete_escalated".into(),
                    detail: "escalated=true".into(),
                },
                Some(&issue.id),
            );
            Ok(true)
        }
    }

    // ── Failure ─────────────────────────────────────────────────────────

    /// Release a failed issue, blocking it instead when the tail of
    /// consecutive failed attempts reaches the limit. Returns true when
    /// the issue was blocked.
    fn handle_failure(&self, issue: &Issue, reason: &str) -> Result<bool> {
        let attempts = self.tracker.get_attempts(&issue.id)?;
        let consecutive = attempts
            .iter()
            .rev()
            .take_while(|a| a.success == Some(false))
            .count();

        if consecutive >= CONSECUTIVE_FAILURE_LIMIT {
            self.comment(
                &issue.id,
                &format!(
                    "Blocked after {consecutive} consecutive failed attempts \
                     (latest: {reason}). Needs investigation before another retry."
                ),
            );
            self.tracker
                .update_status(&issue.id, IssueStatus::Blocked, &self.instance_id)?;
            self.tracker.release_issue(&issue.id)?;
            self.emit(
                Severity::Error,
                EventKind::Error {
                    message: format!("{} blocked after {consecutive} consecutive failures", issue.id),
                },
                Some(&issue.id),
            );
            Ok(true)
        } else {
            self.tracker.release_issue_and_reopen(
                &issue.id,
                &self.instance_id,
                &format!("Execution failed: {reason}. Reopened for retry."),
            )?;
            Ok(false)
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

    /// Step through every phase up to `target`, one transition at a time,
    /// so the observed sequence stays a contiguous prefix of the
    /// traversal even when a stage (gates, commit) was skipped.
    fn advance_to(&self, issue_id: &str, target: ExecPhase) {
        let current = match self.tracker.get_execution_state(issue_id) {
            Ok(Some(state)) => state.phase,
            Ok(None) => return,
            Err(e) => {
                warn!(issue = issue_id, error = %e, "could not read execution state");
                return;
            }
        };
        for phase in ExecPhase::ALL {
            if phase.rank() > current.rank() && phase.rank() <= target.rank() {
                self.advance_phase(issue_id, phase);
            }
        }
    }

    fn comment(&self, issue_id: &str, body: &str) {
        if let Err(e) = self.tracker.add_comment(issue_id, &self.instance_id, body) {
            warn!(issue = issue_id, error = %e, "failed to add comment");
        }
    }

    fn emit(&self, severity: Severity, kind: EventKind, issue_id: Option<&str>) {
        let mut event = ExecutorEvent::new(&self.instance_id, severity, kind);
        if let Some(id) = issue_id {
            event = event.for_issue(id);
        }
        emit_best_effort(self.sink.as_ref(), event);
    }

    fn new_issue_id(&self) -> IssueId {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("{}-{}", self.config.issue_prefix, &suffix[..8])
    }
}

/// A mission has converged when every discovered blocker hanging off it
/// is closed.
pub fn has_mission_converged(tracker: &dyn TrackerStore, mission_id: &str) -> TrackerResult<bool> {
    Ok(tracker
        .get_dependents(mission_id)?
        .into_iter()
        .filter(|d| d.has_label(BLOCKER_LABEL))
        .all(|d| d.status == IssueStatus::Closed))
}

fn commit_message(issue: &Issue, summary: &str) -> String {
    let mut message = format!("{}: {}", issue.id, issue.title);
    if !summary.trim().is_empty() {
        message.push_str("\n\n");
        message.push_str(summary.trim());
    }
    message
}

fn tail_sample(lines: &[String]) -> String {
    let tail: Vec<&str> = lines
        .iter()
        .rev()
        .take(5)
        .map(String::as_str)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    let mut sample = tail.join("\n");
    if sample.len() > 400 {
        let mut cut = 400;
        while !sample.is_char_boundary(cut) {
            cut -= 1;
        }
        sample.truncate(cut);
        sample.push('…');
    }
    sample
}
