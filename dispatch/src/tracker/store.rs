//! Storage interface the executor runs against.
//!
//! The executor is agnostic to the backing store. Implementations must
//! provide atomic claim semantics and idempotent release; everything else
//! is plain CRUD. Calls are expected to be bounded I/O and are made
//! synchronously from the event loop.

use std::collections::HashMap;
use std::time::Duration;

use crate::events::ExecutorEvent;
use crate::exec::ExecPhase;
use crate::tracker::types::{
    DependencyEdge, ExecutionAttempt, ExecutionState, ExecutorInstance, Issue, IssueId,
    IssueStatus, ReadyFilter,
};

/// Errors surfaced by tracker operations.
///
/// `AlreadyClaimed` is the distinguished claim-race outcome: expected under
/// concurrency, swallowed by the event loop.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("issue {0} not found")]
    NotFound(IssueId),

    #[error("issue {issue_id} already claimed by {owner}")]
    AlreadyClaimed { issue_id: IssueId, owner: String },

    #[error("instance {actor} does not own execution state for {issue_id}")]
    NotOwner { issue_id: IssueId, actor: String },

    #[error("illegal execution phase change for {issue_id}: {from} → {to}")]
    IllegalPhase {
        issue_id: IssueId,
        from: ExecPhase,
        to: ExecPhase,
    },

    #[error("storage error: {0}")]
    Storage(String),
}

impl TrackerError {
    /// Whether this is the expected lost-the-race outcome.
    pub fn is_claim_race(&self) -> bool {
        matches!(self, Self::AlreadyClaimed { .. })
    }
}

pub type TrackerResult<T> = Result<T, TrackerError>;

/// The full storage surface the executor needs.
///
/// "Ready" everywhere means: status open, no execution state, and every
/// dependency whose kind affects readiness is closed (`discovered-from`
/// edges are always skipped).
pub trait TrackerStore: Send + Sync {
    // ── Work queries ────────────────────────────────────────────────────

    /// Ready issues matching `filter`, priority-first then oldest.
    fn get_ready_work(&self, filter: &ReadyFilter) -> TrackerResult<Vec<Issue>>;

    /// Ready issues labeled `discovered:blocker`, priority-first.
    fn get_ready_blockers(&self, limit: usize) -> TrackerResult<Vec<Issue>>;

    /// Ready issues labeled `baseline-failure`, priority-first.
    fn get_ready_baseline_issues(&self, limit: usize) -> TrackerResult<Vec<Issue>>;

    /// Ready children of baseline issues that are themselves blocked by
    /// open dependencies. The map sends each returned child to the
    /// baseline it unblocks, so attempts can be credited to the parent.
    fn get_ready_dependents_of_blocked_baselines(
        &self,
        limit: usize,
    ) -> TrackerResult<(Vec<Issue>, HashMap<IssueId, IssueId>)>;

    // ── Issue CRUD ──────────────────────────────────────────────────────

    fn get_issue(&self, id: &str) -> TrackerResult<Issue>;
    fn get_issues_by_label(&self, label: &str) -> TrackerResult<Vec<Issue>>;
    fn create_issue(&self, issue: Issue) -> TrackerResult<IssueId>;
    /// Update status, logging the transition as a comment-free audit entry.
    fn update_status(&self, id: &str, status: IssueStatus, actor: &str) -> TrackerResult<()>;
    /// Close an issue: sets `closed_at` and deletes any execution state.
    fn close_issue(&self, id: &str, actor: &str) -> TrackerResult<()>;
    fn add_comment(&self, id: &str, author: &str, body: &str) -> TrackerResult<()>;

    // ── Labels ──────────────────────────────────────────────────────────

    fn add_label(&self, id: &str, label: &str) -> TrackerResult<()>;
    fn remove_label(&self, id: &str, label: &str) -> TrackerResult<()>;
    fn get_labels(&self, id: &str) -> TrackerResult<Vec<String>>;

    // ── Dependencies ────────────────────────────────────────────────────

    fn add_dependency(&self, edge: DependencyEdge) -> TrackerResult<()>;
    /// Issues that `id` depends on.
    fn get_dependencies(&self, id: &str) -> TrackerResult<Vec<Issue>>;
    /// Issues that depend on `id`.
    fn get_dependents(&self, id: &str) -> TrackerResult<Vec<Issue>>;
    /// Raw edges where `id` is either endpoint.
    fn get_dependency_records(&self, id: &str) -> TrackerResult<Vec<DependencyEdge>>;

    // ── Claim / execution state ─────────────────────────────────────────

    /// Atomically claim an open issue for `instance_id`.
    ///
    /// Creates the execution state record in phase `claimed` and moves the
    /// issue to in_progress. Fails with [`TrackerError::AlreadyClaimed`]
    /// when a state record exists for another instance.
    fn claim_issue(&self, issue_id: &str, instance_id: &str) -> TrackerResult<()>;

    /// Transition the execution phase. Only the owner may transition, and
    /// only forward.
    fn update_execution_state(
        &self,
        issue_id: &str,
        instance_id: &str,
        phase: ExecPhase,
    ) -> TrackerResult<()>;

    fn get_execution_state(&self, issue_id: &str) -> TrackerResult<Option<ExecutionState>>;

    /// Delete the execution state record. Idempotent: releasing a
    /// never-claimed or already-released issue is a no-op success.
    fn release_issue(&self, issue_id: &str) -> TrackerResult<()>;

    /// Atomic release + status→open + explanatory comment.
    fn release_issue_and_reopen(
        &self,
        issue_id: &str,
        actor: &str,
        comment: &str,
    ) -> TrackerResult<()>;

    // ── Attempt history ─────────────────────────────────────────────────

    fn record_attempt(&self, attempt: ExecutionAttempt) -> TrackerResult<()>;
    /// Chronological attempt history for an issue.
    fn get_attempts(&self, issue_id: &str) -> TrackerResult<Vec<ExecutionAttempt>>;

    // ── Instances ───────────────────────────────────────────────────────

    fn register_instance(&self, instance: ExecutorInstance) -> TrackerResult<()>;
    fn update_heartbeat(&self, instance_id: &str) -> TrackerResult<()>;
    fn mark_instance_stopped(&self, instance_id: &str) -> TrackerResult<()>;
    fn get_active_instances(&self) -> TrackerResult<Vec<ExecutorInstance>>;
    /// Reap stopped instances older than `age`, keeping at least `keep`
    /// most-recent rows. Returns the number removed.
    fn cleanup_instances(&self, age: Duration, keep: usize) -> TrackerResult<usize>;

    // ── Event log ───────────────────────────────────────────────────────

    fn store_agent_event(&self, event: &ExecutorEvent) -> TrackerResult<()>;
    fn get_agent_events(
        &self,
        issue_id: Option<&str>,
        limit: usize,
    ) -> TrackerResult<Vec<ExecutorEvent>>;

    // ── Epics ───────────────────────────────────────────────────────────

    /// Whether every parent-child dependent of the epic is closed.
    fn is_epic_complete(&self, epic_id: &str) -> TrackerResult<bool>;
}
