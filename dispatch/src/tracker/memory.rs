//! In-memory tracker backend.
//!
//! Reference implementation of [`TrackerStore`] used by the test suite and
//! by single-process local runs. Everything lives in one `RwLock`-guarded
//! record, so claim atomicity holds trivially; the semantics (idempotent
//! release, forward-only phases, readiness rules) are the contract any real
//! backend must match.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::Utc;

use crate::events::ExecutorEvent;
use crate::exec::ExecPhase;
use crate::tracker::store::{TrackerError, TrackerResult, TrackerStore};
use crate::tracker::types::{
    Comment, DependencyEdge, ExecutionAttempt, ExecutionState, ExecutorInstance, InstanceStatus,
    Issue, IssueId, IssueStatus, ReadyFilter, BLOCKER_LABEL,
};

#[derive(Default)]
struct Inner {
    issues: BTreeMap<IssueId, Issue>,
    edges: Vec<DependencyEdge>,
    exec_states: HashMap<IssueId, ExecutionState>,
    attempts: Vec<ExecutionAttempt>,
    instances: BTreeMap<String, ExecutorInstance>,
    events: Vec<ExecutorEvent>,
}

impl Inner {
    fn issue(&self, id: &str) -> TrackerResult<&Issue> {
        self.issues
            .get(id)
            .ok_or_else(|| TrackerError::NotFound(id.to_string()))
    }

    fn issue_mut(&mut self, id: &str) -> TrackerResult<&mut Issue> {
        self.issues
            .get_mut(id)
            .ok_or_else(|| TrackerError::NotFound(id.to_string()))
    }

    /// Open, unclaimed, and every readiness-affecting dependency closed.
    fn is_ready(&self, issue: &Issue) -> bool {
        if issue.status != IssueStatus::Open || self.exec_states.contains_key(&issue.id) {
            return false;
        }
        self.edges
            .iter()
            .filter(|e| e.issue_id == issue.id && e.kind.affects_readiness())
            .all(|e| {
                self.issues
                    .get(&e.depends_on)
                    .map(|dep| dep.status == IssueStatus::Closed)
                    .unwrap_or(true)
            })
    }

    /// Priority-first (ascending), then oldest-created, then id.
    fn sort_by_priority(issues: &mut [Issue]) {
        issues.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
    }

    fn ready_with_label(&self, label: &str, limit: usize) -> Vec<Issue> {
        let mut out: Vec<Issue> = self
            .issues
            .values()
            .filter(|i| i.has_label(label) && self.is_ready(i))
            .cloned()
            .collect();
        Self::sort_by_priority(&mut out);
        out.truncate(limit);
        out
    }
}

/// In-memory [`TrackerStore`].
pub struct MemoryTracker {
    inner: RwLock<Inner>,
}

impl Default for MemoryTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTracker {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl TrackerStore for MemoryTracker {
    fn get_ready_work(&self, filter: &ReadyFilter) -> TrackerResult<Vec<Issue>> {
        let inner = self.read();
        let mut out: Vec<Issue> = inner
            .issues
            .values()
            .filter(|i| i.status == filter.status && inner.is_ready(i))
            .cloned()
            .collect();
        Inner::sort_by_priority(&mut out);
        out.truncate(filter.limit);
        Ok(out)
    }

    fn get_ready_blockers(&self, limit: usize) -> TrackerResult<Vec<Issue>> {
        Ok(self.read().ready_with_label(BLOCKER_LABEL, limit))
    }

    fn get_ready_baseline_issues(&self, limit: usize) -> TrackerResult<Vec<Issue>> {
        Ok(self.read().ready_with_label(crate::baseline::BASELINE_LABEL, limit))
    }

    fn get_ready_dependents_of_blocked_baselines(
        &self,
        limit: usize,
    ) -> TrackerResult<(Vec<Issue>, HashMap<IssueId, IssueId>)> {
        let inner = self.read();
        let mut found = Vec::new();
        let mut parent_of = HashMap::new();

        // Baselines that are open but blocked by open dependencies.
        let blocked_baselines: Vec<&Issue> = inner
            .issues
            .values()
            .filter(|i| {
                i.has_label(crate::baseline::BASELINE_LABEL)
                    && i.status == IssueStatus::Open
                    && !inner.is_ready(i)
            })
            .collect();

        for baseline in blocked_baselines {
            for edge in inner
                .edges
                .iter()
                .filter(|e| e.issue_id == baseline.id && e.kind.affects_readiness())
            {
                if let Some(dep) = inner.issues.get(&edge.depends_on) {
                    if inner.is_ready(dep) && !parent_of.contains_key(&dep.id) {
                        parent_of.insert(dep.id.clone(), baseline.id.clone());
                        found.push(dep.clone());
                        if found.len() >= limit {
                            Inner::sort_by_priority(&mut found);
                            return Ok((found, parent_of));
                        }
                    }
                }
            }
        }

        Inner::sort_by_priority(&mut found);
        Ok((found, parent_of))
    }

    fn get_issue(&self, id: &str) -> TrackerResult<Issue> {
        self.read().issue(id).cloned()
    }

    fn get_issues_by_label(&self, label: &str) -> TrackerResult<Vec<Issue>> {
        let inner = self.read();
        Ok(inner
            .issues
            .values()
            .filter(|i| i.has_label(label))
            .cloned()
            .collect())
    }

    fn create_issue(&self, issue: Issue) -> TrackerResult<IssueId> {
        let mut inner = self.write();
        let id = issue.id.clone();
        if inner.issues.contains_key(&id) {
            return Err(TrackerError::Storage(format!("issue {id} already exists")));
        }
        inner.issues.insert(id.clone(), issue);
        Ok(id)
    }

    fn update_status(&self, id: &str, status: IssueStatus, actor: &str) -> TrackerResult<()> {
        let mut inner = self.write();
        let issue = inner.issue_mut(id)?;
        let from = issue.status;
        issue.status = status;
        issue.updated_at = Utc::now();
        tracing::info!(issue = id, %from, to = %status, actor, "issue status changed");
        Ok(())
    }

    fn close_issue(&self, id: &str, actor: &str) -> TrackerResult<()> {
        let mut inner = self.write();
        let issue = inner.issue_mut(id)?;
        let from = issue.status;
        issue.status = IssueStatus::Closed;
        issue.closed_at = Some(Utc::now());
        issue.updated_at = Utc::now();
        inner.exec_states.remove(id);
        tracing::info!(issue = id, %from, to = "closed", actor, "issue closed");
        Ok(())
    }

    fn add_comment(&self, id: &str, author: &str, body: &str) -> TrackerResult<()> {
        let mut inner = self.write();
        let issue = inner.issue_mut(id)?;
        issue.comments.push(Comment {
            author: author.to_string(),
            body: body.to_string(),
            created_at: Utc::now(),
        });
        issue.updated_at = Utc::now();
        Ok(())
    }

    fn add_label(&self, id: &str, label: &str) -> TrackerResult<()> {
        let mut inner = self.write();
        let issue = inner.issue_mut(id)?;
        issue.labels.insert(label.to_string());
        issue.updated_at = Utc::now();
        Ok(())
    }

    fn remove_label(&self, id: &str, label: &str) -> TrackerResult<()> {
        let mut inner = self.write();
        let issue = inner.issue_mut(id)?;
        issue.labels.remove(label);
        issue.updated_at = Utc::now();
        Ok(())
    }

    fn get_labels(&self, id: &str) -> TrackerResult<Vec<String>> {
        Ok(self.read().issue(id)?.labels.iter().cloned().collect())
    }

    fn add_dependency(&self, edge: DependencyEdge) -> TrackerResult<()> {
        let mut inner = self.write();
        inner.issue(&edge.issue_id)?;
        inner.issue(&edge.depends_on)?;
        if !inner.edges.contains(&edge) {
            inner.edges.push(edge);
        }
        Ok(())
    }

    fn get_dependencies(&self, id: &str) -> TrackerResult<Vec<Issue>> {
        let inner = self.read();
        Ok(inner
            .edges
            .iter()
            .filter(|e| e.issue_id == id)
            .filter_map(|e| inner.issues.get(&e.depends_on).cloned())
            .collect())
    }

    fn get_dependents(&self, id: &str) -> TrackerResult<Vec<Issue>> {
        let inner = self.read();
        Ok(inner
            .edges
            .iter()
            .filter(|e| e.depends_on == id)
            .filter_map(|e| inner.issues.get(&e.issue_id).cloned())
            .collect())
    }

    fn get_dependency_records(&self, id: &str) -> TrackerResult<Vec<DependencyEdge>> {
        let inner = self.read();
        Ok(inner
            .edges
            .iter()
            .filter(|e| e.issue_id == id || e.depends_on == id)
            .cloned()
            .collect())
    }

    fn claim_issue(&self, issue_id: &str, instance_id: &str) -> TrackerResult<()> {
        let mut inner = self.write();
        if let Some(state) = inner.exec_states.get(issue_id) {
            return Err(TrackerError::AlreadyClaimed {
                issue_id: issue_id.to_string(),
                owner: state.instance_id.clone(),
            });
        }
        let issue = inner.issue_mut(issue_id)?;
        let from = issue.status;
        issue.status = IssueStatus::InProgress;
        issue.updated_at = Utc::now();
        inner.exec_states.insert(
            issue_id.to_string(),
            ExecutionState {
                issue_id: issue_id.to_string(),
                instance_id: instance_id.to_string(),
                phase: ExecPhase::Claimed,
                last_transition: Utc::now(),
            },
        );
        tracing::info!(
            issue = issue_id,
            instance = instance_id,
            %from,
            to = "in_progress",
            "issue claimed"
        );
        Ok(())
    }

    fn update_execution_state(
        &self,
        issue_id: &str,
        instance_id: &str,
        phase: ExecPhase,
    ) -> TrackerResult<()> {
        let mut inner = self.write();
        let state = inner
            .exec_states
            .get_mut(issue_id)
            .ok_or_else(|| TrackerError::NotFound(issue_id.to_string()))?;
        if state.instance_id != instance_id {
            return Err(TrackerError::NotOwner {
                issue_id: issue_id.to_string(),
                actor: instance_id.to_string(),
            });
        }
        if !state.phase.can_advance_to(phase) {
            return Err(TrackerError::IllegalPhase {
                issue_id: issue_id.to_string(),
                from: state.phase,
                to: phase,
            });
        }
        state.phase = phase;
        state.last_transition = Utc::now();
        Ok(())
    }

    fn get_execution_state(&self, issue_id: &str) -> TrackerResult<Option<ExecutionState>> {
        Ok(self.read().exec_states.get(issue_id).cloned())
    }

    fn release_issue(&self, issue_id: &str) -> TrackerResult<()> {
        // Idempotent: absent record is success.
        self.write().exec_states.remove(issue_id);
        Ok(())
    }

    fn release_issue_and_reopen(
        &self,
        issue_id: &str,
        actor: &str,
        comment: &str,
    ) -> TrackerResult<()> {
        let mut inner = self.write();
        inner.exec_states.remove(issue_id);
        let issue = inner.issue_mut(issue_id)?;
        let from = issue.status;
        issue.status = IssueStatus::Open;
        issue.updated_at = Utc::now();
        issue.comments.push(Comment {
            author: actor.to_string(),
            body: comment.to_string(),
            created_at: Utc::now(),
        });
        tracing::info!(issue = issue_id, %from, to = "open", actor, "issue released and reopened");
        Ok(())
    }

    fn record_attempt(&self, attempt: ExecutionAttempt) -> TrackerResult<()> {
        self.write().attempts.push(attempt);
        Ok(())
    }

    fn get_attempts(&self, issue_id: &str) -> TrackerResult<Vec<ExecutionAttempt>> {
        let inner = self.read();
        let mut out: Vec<ExecutionAttempt> = inner
            .attempts
            .iter()
            .filter(|a| a.issue_id == issue_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.attempt_number.cmp(&b.attempt_number)));
        Ok(out)
    }

    fn register_instance(&self, instance: ExecutorInstance) -> TrackerResult<()> {
        self.write()
            .instances
            .insert(instance.instance_id.clone(), instance);
        Ok(())
    }

    fn update_heartbeat(&self, instance_id: &str) -> TrackerResult<()> {
        let mut inner = self.write();
        let instance = inner
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| TrackerError::NotFound(instance_id.to_string()))?;
        instance.last_heartbeat = Utc::now();
        Ok(())
    }

    fn mark_instance_stopped(&self, instance_id: &str) -> TrackerResult<()> {
        let mut inner = self.write();
        let instance = inner
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| TrackerError::NotFound(instance_id.to_string()))?;
        instance.status = InstanceStatus::Stopped;
        Ok(())
    }

    fn get_active_instances(&self) -> TrackerResult<Vec<ExecutorInstance>> {
        let inner = self.read();
        Ok(inner
            .instances
            .values()
            .filter(|i| i.status == InstanceStatus::Running)
            .cloned()
            .collect())
    }

    fn cleanup_instances(&self, age: Duration, keep: usize) -> TrackerResult<usize> {
        let mut inner = self.write();
        let cutoff = Utc::now() - chrono::Duration::from_std(age).unwrap_or(chrono::Duration::zero());

        let mut stopped: Vec<(String, chrono::DateTime<Utc>)> = inner
            .instances
            .values()
            .filter(|i| i.status == InstanceStatus::Stopped)
            .map(|i| (i.instance_id.clone(), i.last_heartbeat))
            .collect();
        // Most recent first; the retention floor keeps the head.
        stopped.sort_by(|a, b| b.1.cmp(&a.1));

        let mut removed = 0;
        for (id, heartbeat) in stopped.into_iter().skip(keep) {
            if heartbeat < cutoff {
                inner.instances.remove(&id);
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn store_agent_event(&self, event: &ExecutorEvent) -> TrackerResult<()> {
        self.write().events.push(event.clone());
        Ok(())
    }

    fn get_agent_events(
        &self,
        issue_id: Option<&str>,
        limit: usize,
    ) -> TrackerResult<Vec<ExecutorEvent>> {
        let inner = self.read();
        let filtered: Vec<ExecutorEvent> = inner
            .events
            .iter()
            .filter(|e| issue_id.is_none_or(|id| e.issue_id.as_deref() == Some(id)))
            .cloned()
            .collect();
        let skip = filtered.len().saturating_sub(limit);
        Ok(filtered.into_iter().skip(skip).collect())
    }

    fn is_epic_complete(&self, epic_id: &str) -> TrackerResult<bool> {
        let inner = self.read();
        inner.issue(epic_id)?;
        Ok(inner
            .edges
            .iter()
            .filter(|e| e.depends_on == epic_id && e.kind == crate::tracker::types::DependencyKind::ParentChild)
            .all(|e| {
                inner
                    .issues
                    .get(&e.issue_id)
                    .map(|child| child.status == IssueStatus::Closed)
                    .unwrap_or(true)
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventKind, Severity};
    use crate::tracker::types::{DependencyKind, IssueType};

    fn open_issue(id: &str) -> Issue {
        Issue::new(id, format!("issue {id}"), IssueType::Task)
    }

    #[test]
    fn test_claim_exclusivity() {
        let t = MemoryTracker::new();
        t.create_issue(open_issue("fm-x")).unwrap();

        t.claim_issue("fm-x", "exec-1").unwrap();
        let err = t.claim_issue("fm-x", "exec-2").unwrap_err();
        assert!(err.is_claim_race());

        let state = t.get_execution_state("fm-x").unwrap().unwrap();
        assert_eq!(state.instance_id, "exec-1");
        assert_eq!(state.phase, ExecPhase::Claimed);
        assert_eq!(t.get_issue("fm-x").unwrap().status, IssueStatus::InProgress);
    }

    #[test]
    fn test_release_is_idempotent() {
        let t = MemoryTracker::new();
        t.create_issue(open_issue("fm-x")).unwrap();

        // Never claimed: still success.
        t.release_issue("fm-x").unwrap();

        t.claim_issue("fm-x", "exec-1").unwrap();
        t.release_issue("fm-x").unwrap();
        t.release_issue("fm-x").unwrap();
        assert!(t.get_execution_state("fm-x").unwrap().is_none());
    }

    #[test]
    fn test_phase_traversal_forward_only() {
        let t = MemoryTracker::new();
        t.create_issue(open_issue("fm-x")).unwrap();
        t.claim_issue("fm-x", "exec-1").unwrap();

        for phase in [
            ExecPhase::Assessing,
            ExecPhase::Executing,
            ExecPhase::Analyzing,
            ExecPhase::Gates,
            ExecPhase::Committing,
            ExecPhase::Completed,
        ] {
            t.update_execution_state("fm-x", "exec-1", phase).unwrap();
            let state = t.get_execution_state("fm-x").unwrap().unwrap();
            assert_eq!(state.phase, phase);
        }

        // Backward transition rejected.
        let err = t
            .update_execution_state("fm-x", "exec-1", ExecPhase::Executing)
            .unwrap_err();
        assert!(matches!(err, TrackerError::IllegalPhase { .. }));

        t.close_issue("fm-x", "exec-1").unwrap();
        assert!(t.get_execution_state("fm-x").unwrap().is_none());
    }

    #[test]
    fn test_only_owner_may_transition() {
        let t = MemoryTracker::new();
        t.create_issue(open_issue("fm-x")).unwrap();
        t.claim_issue("fm-x", "exec-1").unwrap();

        let err = t
            .update_execution_state("fm-x", "exec-2", ExecPhase::Assessing)
            .unwrap_err();
        assert!(matches!(err, TrackerError::NotOwner { .. }));
    }

    #[test]
    fn test_ready_work_respects_dependencies() {
        let t = MemoryTracker::new();
        t.create_issue(open_issue("fm-a")).unwrap();
        t.create_issue(open_issue("fm-b")).unwrap();
        t.add_dependency(DependencyEdge::new("fm-a", "fm-b", DependencyKind::Blocks))
            .unwrap();

        let ready = t.get_ready_work(&ReadyFilter::default()).unwrap();
        let ids: Vec<&str> = ready.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["fm-b"]);

        t.close_issue("fm-b", "test").unwrap();
        let ready = t.get_ready_work(&ReadyFilter::default()).unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, "fm-a");
    }

    #[test]
    fn test_discovered_from_never_blocks_readiness() {
        let t = MemoryTracker::new();
        t.create_issue(open_issue("fm-a")).unwrap();
        t.create_issue(open_issue("fm-src")).unwrap();
        t.add_dependency(DependencyEdge::new(
            "fm-a",
            "fm-src",
            DependencyKind::DiscoveredFrom,
        ))
        .unwrap();

        let ready = t.get_ready_work(&ReadyFilter::default()).unwrap();
        assert!(ready.iter().any(|i| i.id == "fm-a"));
    }

    #[test]
    fn test_priority_first_ordering() {
        let t = MemoryTracker::new();
        t.create_issue(open_issue("fm-low").with_priority(3)).unwrap();
        t.create_issue(open_issue("fm-urgent").with_priority(0)).unwrap();
        t.create_issue(open_issue("fm-mid").with_priority(2)).unwrap();

        let ready = t.get_ready_work(&ReadyFilter::default()).unwrap();
        let ids: Vec<&str> = ready.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["fm-urgent", "fm-mid", "fm-low"]);
    }

    #[test]
    fn test_dependents_of_blocked_baselines() {
        let t = MemoryTracker::new();
        let baseline = open_issue("fm-09c7-baseline-test").with_label(crate::baseline::BASELINE_LABEL);
        t.create_issue(baseline).unwrap();
        t.create_issue(open_issue("fm-child")).unwrap();
        t.add_dependency(DependencyEdge::new(
            "fm-09c7-baseline-test",
            "fm-child",
            DependencyKind::Blocks,
        ))
        .unwrap();

        // The baseline is blocked by fm-child, which is itself ready.
        let (deps, parent_of) = t.get_ready_dependents_of_blocked_baselines(10).unwrap();
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].id, "fm-child");
        assert_eq!(
            parent_of.get("fm-child").map(String::as_str),
            Some("fm-09c7-baseline-test")
        );

        // Once the child closes, the baseline is ready itself and nothing
        // is returned here.
        t.close_issue("fm-child", "test").unwrap();
        let (deps, _) = t.get_ready_dependents_of_blocked_baselines(10).unwrap();
        assert!(deps.is_empty());
    }

    #[test]
    fn test_release_and_reopen_adds_comment() {
        let t = MemoryTracker::new();
        t.create_issue(open_issue("fm-x")).unwrap();
        t.claim_issue("fm-x", "exec-1").unwrap();

        t.release_issue_and_reopen("fm-x", "exec-1", "agent timed out")
            .unwrap();

        let issue = t.get_issue("fm-x").unwrap();
        assert_eq!(issue.status, IssueStatus::Open);
        assert_eq!(issue.comments.len(), 1);
        assert!(issue.comments[0].body.contains("timed out"));
        assert!(t.get_execution_state("fm-x").unwrap().is_none());
    }

    #[test]
    fn test_instance_cleanup_keeps_floor() {
        let t = MemoryTracker::new();
        let old = Utc::now() - chrono::Duration::hours(48);
        for n in 0..5 {
            t.register_instance(ExecutorInstance {
                instance_id: format!("exec-{n}"),
                hostname: "host".into(),
                pid: 100 + n,
                status: InstanceStatus::Stopped,
                started_at: old,
                last_heartbeat: old + chrono::Duration::minutes(n as i64),
                version: "0.1.0".into(),
            })
            .unwrap();
        }

        let removed = t
            .cleanup_instances(Duration::from_secs(3600), 2)
            .unwrap();
        assert_eq!(removed, 3);
    }

    #[test]
    fn test_epic_completion() {
        let t = MemoryTracker::new();
        t.create_issue(open_issue("fm-epic")).unwrap();
        t.create_issue(open_issue("fm-c1")).unwrap();
        t.create_issue(open_issue("fm-c2")).unwrap();
        t.add_dependency(DependencyEdge::new("fm-c1", "fm-epic", DependencyKind::ParentChild))
            .unwrap();
        t.add_dependency(DependencyEdge::new("fm-c2", "fm-epic", DependencyKind::ParentChild))
            .unwrap();

        assert!(!t.is_epic_complete("fm-epic").unwrap());
        t.close_issue("fm-c1", "test").unwrap();
        assert!(!t.is_epic_complete("fm-epic").unwrap());
        t.close_issue("fm-c2", "test").unwrap();
        assert!(t.is_epic_complete("fm-epic").unwrap());
    }

    #[test]
    fn test_event_log_filtering() {
        let t = MemoryTracker::new();
        for n in 0..4 {
            let event = ExecutorEvent::new("exec-1", Severity::Info, EventKind::IssueClaimed)
                .for_issue(format!("fm-{}", n % 2));
            t.store_agent_event(&event).unwrap();
        }

        assert_eq!(t.get_agent_events(None, 100).unwrap().len(), 4);
        assert_eq!(t.get_agent_events(Some("fm-0"), 100).unwrap().len(), 2);
        assert_eq!(t.get_agent_events(None, 1).unwrap().len(), 1);
    }
}
