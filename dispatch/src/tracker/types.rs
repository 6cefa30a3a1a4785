//! Core tracker entities: issues, dependency edges, execution records.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::exec::ExecPhase;

/// Stable issue identifier, e.g. `fm-a3f2` or `fm-09c7-baseline-test`.
pub type IssueId = String;

/// Label identifying advisor-discovered blocker issues.
pub const BLOCKER_LABEL: &str = "discovered:blocker";

/// Kind of work an issue represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    Task,
    Bug,
    Feature,
    Epic,
}

impl IssueType {
    /// Lenient parse used when creating issues from advisor proposals.
    /// Unknown strings fall back to `Task` rather than erroring.
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "bug" => Self::Bug,
            "feature" => Self::Feature,
            "epic" => Self::Epic,
            _ => Self::Task,
        }
    }
}

impl fmt::Display for IssueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Task => write!(f, "task"),
            Self::Bug => write!(f, "bug"),
            Self::Feature => write!(f, "feature"),
            Self::Epic => write!(f, "epic"),
        }
    }
}

/// Issue lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    Open,
    InProgress,
    Blocked,
    Closed,
}

impl fmt::Display for IssueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Blocked => write!(f, "blocked"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// A single tracker comment, ordered by insertion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub author: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// The unit of work the executor claims and drives to completion.
///
/// Priority is an integer where lower is more urgent (0 = P0).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub id: IssueId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Free-form design notes carried into the agent prompt.
    #[serde(default)]
    pub design: String,
    #[serde(default)]
    pub acceptance_criteria: String,
    #[serde(rename = "type")]
    pub issue_type: IssueType,
    pub priority: i32,
    pub status: IssueStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    #[serde(default)]
    pub comments: Vec<Comment>,
}

impl Issue {
    /// Create a new open issue with the current timestamp.
    pub fn new(id: impl Into<IssueId>, title: impl Into<String>, issue_type: IssueType) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            design: String::new(),
            acceptance_criteria: String::new(),
            issue_type,
            priority: 2,
            status: IssueStatus::Open,
            created_at: now,
            updated_at: now,
            closed_at: None,
            labels: BTreeSet::new(),
            comments: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_acceptance_criteria(mut self, criteria: impl Into<String>) -> Self {
        self.acceptance_criteria = criteria.into();
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.labels.insert(label.into());
        self
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.contains(label)
    }

    pub fn is_open(&self) -> bool {
        self.status == IssueStatus::Open
    }
}

/// Dependency edge kind.
///
/// `Blocks` and `ParentChild` participate in readiness checks;
/// `DiscoveredFrom` is provenance metadata and never blocks work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DependencyKind {
    Blocks,
    ParentChild,
    DiscoveredFrom,
}

impl DependencyKind {
    /// Whether this edge kind is considered when deciding if an issue is
    /// ready to work on.
    pub fn affects_readiness(self) -> bool {
        !matches!(self, Self::DiscoveredFrom)
    }
}

impl fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blocks => write!(f, "blocks"),
            Self::ParentChild => write!(f, "parent-child"),
            Self::DiscoveredFrom => write!(f, "discovered-from"),
        }
    }
}

/// Directed dependency: `issue_id` depends on `depends_on`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub issue_id: IssueId,
    pub depends_on: IssueId,
    pub kind: DependencyKind,
}

impl DependencyEdge {
    pub fn new(issue_id: impl Into<IssueId>, depends_on: impl Into<IssueId>, kind: DependencyKind) -> Self {
        Self {
            issue_id: issue_id.into(),
            depends_on: depends_on.into(),
            kind,
        }
    }
}

/// Transient in-flight record for a claimed issue.
///
/// Created by `ClaimIssue`, deleted by `ReleaseIssue` / `CloseIssue`.
/// Only the owning instance may transition its phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionState {
    pub issue_id: IssueId,
    pub instance_id: String,
    pub phase: ExecPhase,
    pub last_transition: DateTime<Utc>,
}

/// Executor process registration status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Running,
    Stopped,
}

/// A registered supervisor process. Heartbeat is refreshed every tick;
/// stale stopped rows are reaped by age with a retention floor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorInstance {
    pub instance_id: String,
    pub hostname: String,
    pub pid: u32,
    pub status: InstanceStatus,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub version: String,
}

/// Append-only record of one execution attempt.
///
/// `success` is `None` while the attempt is in flight or when the executor
/// died before completing it; consumers treat that as "did not complete".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionAttempt {
    pub issue_id: IssueId,
    pub instance_id: String,
    pub attempt_number: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub error_sample: String,
}

/// A new issue proposed by the advisor after analyzing agent output.
///
/// `issue_type` and `priority` are kept as raw strings: advisor output is
/// untrusted and may be malformed. Parsing is lenient at creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredIssue {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type", default)]
    pub issue_type: String,
    #[serde(default)]
    pub priority: String,
}

impl DiscoveredIssue {
    /// Lenient priority parse: non-numeric input falls back to P2.
    pub fn priority_or_default(&self) -> i32 {
        self.priority
            .trim()
            .trim_start_matches(['p', 'P'])
            .parse()
            .unwrap_or(2)
    }
}

/// Query filter for ready-work listings. Results are sorted
/// priority-first (ascending), then oldest-created.
#[derive(Debug, Clone)]
pub struct ReadyFilter {
    pub status: IssueStatus,
    pub limit: usize,
}

impl Default for ReadyFilter {
    fn default() -> Self {
        Self {
            status: IssueStatus::Open,
            limit: 10,
        }
    }
}
