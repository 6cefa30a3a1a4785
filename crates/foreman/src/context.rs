//! Context gathering for agent prompts.
//!
//! Aggregates everything the prompt builder needs: the issue itself, its
//! parent mission, related issues split by relationship, chronological
//! attempt history with a synthesized resume hint, and the last observed
//! git state.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;

use dispatch::tracker::types::{DependencyKind, ExecutionAttempt, Issue, IssueStatus};
use dispatch::tracker::TrackerStore;

use crate::gates::GateResult;
use crate::git::GitState;

/// Everything a prompt can be assembled from. All sections optional
/// except the issue.
#[derive(Debug, Clone)]
pub struct PromptContext {
    pub issue: Issue,
    /// Parent mission via the parent-child edge, when one exists.
    pub mission: Option<Issue>,
    /// Open issues this one is waiting on.
    pub blockers: Vec<Issue>,
    /// Issues waiting on this one.
    pub dependents: Vec<Issue>,
    /// Other children of the same mission.
    pub siblings: Vec<Issue>,
    /// Discovered-from relatives and other non-blocking links.
    pub related: Vec<Issue>,
    pub attempts: Vec<ExecutionAttempt>,
    pub resume_hint: Option<String>,
    pub sandbox_path: Option<PathBuf>,
    pub git_state: Option<GitState>,
    pub failed_gates: Vec<GateResult>,
    pub notes: Option<String>,
}

impl PromptContext {
    pub fn for_issue(issue: Issue) -> Self {
        Self {
            issue,
            mission: None,
            blockers: Vec::new(),
            dependents: Vec::new(),
            siblings: Vec::new(),
            related: Vec::new(),
            attempts: Vec::new(),
            resume_hint: None,
            sandbox_path: None,
            git_state: None,
            failed_gates: Vec::new(),
            notes: None,
        }
    }
}

/// Builds a [`PromptContext`] from tracker state.
pub struct ContextGatherer {
    tracker: Arc<dyn TrackerStore>,
}

impl ContextGatherer {
    pub fn new(tracker: Arc<dyn TrackerStore>) -> Self {
        Self { tracker }
    }

    pub fn gather(&self, issue: &Issue) -> Result<PromptContext> {
        let mut ctx = PromptContext::for_issue(issue.clone());

        for edge in self.tracker.get_dependency_records(&issue.id)? {
            // Only edges where this issue is the dependent matter here.
            if edge.issue_id != issue.id {
                continue;
            }
            let Ok(other) = self.tracker.get_issue(&edge.depends_on) else {
                continue;
            };
            match edge.kind {
                DependencyKind::ParentChild => ctx.mission = Some(other),
                DependencyKind::Blocks => {
                    if other.status != IssueStatus::Closed {
                        ctx.blockers.push(other);
                    }
                }
                DependencyKind::DiscoveredFrom => ctx.related.push(other),
            }
        }

        ctx.dependents = self
            .tracker
            .get_dependents(&issue.id)?
            .into_iter()
            .filter(|d| d.status != IssueStatus::Closed)
            .collect();

        if let Some(mission) = &ctx.mission {
            ctx.siblings = self
                .tracker
                .get_dependents(&mission.id)?
                .into_iter()
                .filter(|s| s.id != issue.id)
                .collect();
        }

        ctx.attempts = self.tracker.get_attempts(&issue.id)?;
        ctx.resume_hint = resume_hint(&ctx.attempts);
        Ok(ctx)
    }
}

/// Human-readable hint synthesized from the most recent attempt.
fn resume_hint(attempts: &[ExecutionAttempt]) -> Option<String> {
    let last = attempts.last()?;
    let hint = match last.success {
        Some(false) => {
            let exit = last
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "?".to_string());
            let mut sample = last.error_sample.clone();
            if sample.len() > 200 {
                let mut cut = 200;
                while !sample.is_char_boundary(cut) {
                    cut -= 1;
                }
                sample.truncate(cut);
                sample.push('…');
            }
            if sample.is_empty() {
                format!("Attempt #{} failed (exit code {exit}).", last.attempt_number)
            } else {
                format!(
                    "Attempt #{} failed (exit code {exit}): {sample}",
                    last.attempt_number
                )
            }
        }
        None => format!(
            "Attempt #{} did not complete; pick up where it left off.",
            last.attempt_number
        ),
        Some(true) => format!(
            "Attempt #{} succeeded; this run continues from that state.",
            last.attempt_number
        ),
    };
    Some(hint)
}
