//! Work selection.
//!
//! Dispatches on the current self-healing mode. HEALTHY and ESCALATED
//! claim regular work; SELF_HEALING walks a fallback chain over baseline
//! repair work, escalating to a human when a baseline exceeds its
//! per-issue thresholds or when the chain makes no progress for the
//! deadlock timeout.

use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use dispatch::config::ExecutorConfig;
use dispatch::escalation::{EscalationReason, EscalationTracker};
use dispatch::events::{emit_best_effort, EventKind, EventSink, ExecutorEvent, Severity};
use dispatch::healing::{HealingMode, HealingState};
use dispatch::tracker::types::{DependencyEdge, DependencyKind, Issue, IssueId, IssueType, ReadyFilter};
use dispatch::tracker::TrackerStore;

/// Issues carrying this label are never auto-claimed.
pub const NO_AUTO_CLAIM_LABEL: &str = "no-auto-claim";
/// Label on human-only escalation issues.
pub const ESCALATION_LABEL: &str = "escalation";
/// Label on the deadlock-escalation diagnostic issue.
pub const BASELINE_STUCK_LABEL: &str = "baseline-stuck";

/// An issue chosen for execution, plus which baseline (if any) the
/// attempt is credited to for escalation accounting.
#[derive(Debug, Clone)]
pub struct SelectedWork {
    pub issue: Issue,
    pub credited_baseline: Option<IssueId>,
}

pub struct WorkSelector {
    tracker: Arc<dyn TrackerStore>,
    healing: Arc<HealingState>,
    escalation: Arc<EscalationTracker>,
    sink: Arc<dyn EventSink>,
    config: Arc<ExecutorConfig>,
    instance_id: String,
}

impl WorkSelector {
    pub fn new(
        tracker: Arc<dyn TrackerStore>,
        healing: Arc<HealingState>,
        escalation: Arc<EscalationTracker>,
        sink: Arc<dyn EventSink>,
        config: Arc<ExecutorConfig>,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            tracker,
            healing,
            escalation,
            sink,
            config,
            instance_id: instance_id.into(),
        }
    }

    /// Pick the next issue to claim, or `None` when nothing is ready.
    pub fn get_ready_work(&self) -> Result<Option<SelectedWork>> {
        match self.healing.mode() {
            HealingMode::Healthy | HealingMode::Escalated => self.normal_work(),
            HealingMode::SelfHealing => self.healing_work(),
        }
    }

    /// Bump the escalation counter for a freshly claimed selection.
    pub fn on_claimed(&self, selected: &SelectedWork) {
        if let Some(baseline) = &selected.credited_baseline {
            let attempts = self.escalation.increment(baseline);
            info!(baseline, attempts, "credited self-healing attempt");
        }
    }

    fn claimable(issue: &Issue) -> bool {
        !issue.has_label(NO_AUTO_CLAIM_LABEL)
    }

    /// Regular selection: highest-priority ready blocker first (when
    /// enabled), then the ready queue. The over-fetch of 10 exists so the
    /// `no-auto-claim` filter still leaves candidates.
    fn normal_work(&self) -> Result<Option<SelectedWork>> {
        if self.config.enable_blocker_priority {
            if let Some(blocker) = self
                .tracker
                .get_ready_blockers(10)?
                .into_iter()
                .find(Self::claimable)
            {
                return Ok(Some(SelectedWork {
                    issue: blocker,
                    credited_baseline: None,
                }));
            }
        }

        let ready = self.tracker.get_ready_work(&ReadyFilter::default())?;
        Ok(ready.into_iter().find(Self::claimable).map(|issue| SelectedWork {
            issue,
            credited_baseline: None,
        }))
    }

    /// Self-healing selection: threshold checks, then the fallback chain,
    /// then deadlock detection, finally regular work.
    fn healing_work(&self) -> Result<Option<SelectedWork>> {
        // A baseline past its per-issue threshold escalates before any
        // further repair attempt is scheduled.
        if let Some((baseline_id, reason)) = self.escalation.check_thresholds() {
            self.escalate_baseline(&baseline_id, &reason)?;
            return self.normal_work();
        }

        // 1. Ready baseline-failure issues.
        if let Some(baseline) = self
            .tracker
            .get_ready_baseline_issues(10)?
            .into_iter()
            .find(Self::claimable)
        {
            self.healing.record_progress();
            let credited = baseline.id.clone();
            return Ok(Some(SelectedWork {
                issue: baseline,
                credited_baseline: Some(credited),
            }));
        }

        // 2. Ready dependents of blocked baselines; the attempt is
        // credited to the parent baseline.
        let (dependents, parent_of) = self.tracker.get_ready_dependents_of_blocked_baselines(10)?;
        if let Some(dependent) = dependents.into_iter().find(Self::claimable) {
            self.healing.record_progress();
            let credited = parent_of.get(&dependent.id).cloned();
            return Ok(Some(SelectedWork {
                issue: dependent,
                credited_baseline: credited,
            }));
        }

        // 3. Ready discovered blockers.
        if let Some(blocker) = self
            .tracker
            .get_ready_blockers(10)?
            .into_iter()
            .find(Self::claimable)
        {
            self.healing.record_progress();
            let credited = blocker.id.clone();
            return Ok(Some(SelectedWork {
                issue: blocker,
                credited_baseline: Some(credited),
            }));
        }

        // Nothing in the chain.
        let cycles = self.healing.record_no_work();
        if self
            .healing
            .is_deadlocked(self.config.self_healing_deadlock_timeout())
        {
            self.escalate_deadlock(cycles)?;
        }

        self.normal_work()
    }

    /// A baseline exceeded its attempt or age threshold: create a P0
    /// escalation issue for a human, stop auto-claiming the baseline, and
    /// flip to ESCALATED.
    fn escalate_baseline(&self, baseline_id: &str, reason: &EscalationReason) -> Result<()> {
        warn!(baseline = baseline_id, %reason, "escalating baseline to human");

        let escalation_id = self.new_issue_id();
        let issue = Issue::new(
            escalation_id.clone(),
            format!("Escalation: baseline {baseline_id} is stuck"),
            IssueType::Bug,
        )
        .with_priority(0)
        .with_description(format!(
            "The executor could not repair `{baseline_id}`: {reason}.\n\n\
             Automatic repair has been suspended for this baseline; it \
             needs a human. Close this issue after the gate is green again."
        ))
        .with_label(NO_AUTO_CLAIM_LABEL)
        .with_label(ESCALATION_LABEL);
        self.tracker.create_issue(issue)?;
        self.tracker.add_dependency(DependencyEdge::new(
            escalation_id.clone(),
            baseline_id,
            DependencyKind::DiscoveredFrom,
        ))?;
        self.tracker.add_label(baseline_id, NO_AUTO_CLAIM_LABEL)?;

        self.escalation.clear(baseline_id);
        emit_best_effort(
            self.sink.as_ref(),
            ExecutorEvent::new(
                &self.instance_id,
                Severity::Critical,
                EventKind::Progress {
                    subtype: "self_healing_escalated".into(),
                    detail: format!("baseline {baseline_id}: {reason} → {escalation_id}"),
                },
            )
            .for_issue(baseline_id),
        );
        self.transition(HealingMode::Escalated, &format!("baseline {baseline_id}: {reason}"));
        Ok(())
    }

    /// Zero progress for the deadlock timeout: file a P0 diagnostic issue
    /// once and flip to ESCALATED so regular work resumes.
    fn escalate_deadlock(&self, no_work_cycles: u32) -> Result<()> {
        let since = self.healing.time_since_progress();
        warn!(
            no_work_cycles,
            stalled_secs = since.as_secs(),
            "self-healing deadlocked — escalating"
        );

        let escalation_id = self.new_issue_id();
        let issue = Issue::new(
            escalation_id.clone(),
            "Self-healing deadlock: no repairable baseline work",
            IssueType::Bug,
        )
        .with_priority(0)
        .with_description(format!(
            "Self-healing found no claimable work for {}s across \
             {no_work_cycles} cycles while the baseline is still broken. \
             Likely causes: all baselines are blocked by unresolvable \
             dependencies, or repair issues carry `{NO_AUTO_CLAIM_LABEL}`.",
            since.as_secs()
        ))
        .with_label(NO_AUTO_CLAIM_LABEL)
        .with_label(ESCALATION_LABEL)
        .with_label(BASELINE_STUCK_LABEL);
        self.tracker.create_issue(issue)?;

        self.healing.set_deadlock_issue(escalation_id.clone());
        emit_best_effort(
            self.sink.as_ref(),
            ExecutorEvent::new(
                &self.instance_id,
                Severity::Critical,
                EventKind::Progress {
                    subtype: "self_healing_deadlock".into(),
                    detail: format!("filed {escalation_id} after {}s without progress", since.as_secs()),
                },
            ),
        );
        self.transition(HealingMode::Escalated, "self-healing deadlock");
        Ok(())
    }

    fn transition(&self, to: HealingMode, reason: &str) {
        if let Some(from) = self.healing.transition(to, reason) {
            emit_best_effort(
                self.sink.as_ref(),
                ExecutorEvent::new(
                    &self.instance_id,
                    Severity::Warning,
                    EventKind::SelfHealingMode {
                        from: from.to_string(),
                        to: to.to_string(),
                        reason: reason.to_string(),
                    },
                ),
            );
        }
    }

    fn new_issue_id(&self) -> IssueId {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("{}-{}", self.config.issue_prefix, &suffix[..8])
    }
}
