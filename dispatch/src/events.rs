//! Structured executor events.
//!
//! Every significant lifecycle point emits one of these. Storage is
//! best-effort: a sink failure is logged to the process's error stream and
//! never fails the operation that emitted the event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tracker::types::IssueId;

/// Event severity, from routine progress to page-a-human.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// What happened. Variants mirror the executor lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    IssueClaimed,
    AssessmentStarted,
    AssessmentCompleted {
        strategy: String,
        confidence: f32,
    },
    AgentSpawned {
        agent: String,
    },
    AgentCompleted {
        success: bool,
        exit_code: Option<i32>,
        duration_ms: u64,
    },
    /// A structured tool invocation parsed from the agent's output stream.
    ToolUse {
        tool: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_file: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        command: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pattern: Option<String>,
        description: String,
    },
    QualityGatePass {
        gate: String,
    },
    QualityGateFail {
        gate: String,
        output_sample: String,
    },
    ResultsProcessingStarted,
    ResultsProcessingCompleted {
        completed: bool,
    },
    /// Generic progress marker with a machine-readable subtype
    /// (e.g. `self_healing_entered`, `incomplete_retry`).
    Progress {
        subtype: String,
        #[serde(default)]
        detail: String,
    },
    BudgetAlert {
        state: String,
        resets_in_secs: Option<u64>,
    },
    SelfHealingMode {
        from: String,
        to: String,
        reason: String,
    },
    BaselineFixStarted {
        gate: String,
    },
    BaselineFixCompleted {
        gate: String,
        resolved: bool,
    },
    TestFailureDiagnosis {
        failure_type: String,
        confidence: f32,
    },
    IssueDecomposed {
        children: Vec<IssueId>,
    },
    Error {
        message: String,
    },
}

impl EventKind {
    /// Snake-case tag, matching the serde representation.
    pub fn name(&self) -> &'static str {
        match self {
            Self::IssueClaimed => "issue_claimed",
            Self::AssessmentStarted => "assessment_started",
            Self::AssessmentCompleted { .. } => "assessment_completed",
            Self::AgentSpawned { .. } => "agent_spawned",
            Self::AgentCompleted { .. } => "agent_completed",
            Self::ToolUse { .. } => "tool_use",
            Self::QualityGatePass { .. } => "quality_gate_pass",
            Self::QualityGateFail { .. } => "quality_gate_fail",
            Self::ResultsProcessingStarted => "results_processing_started",
            Self::ResultsProcessingCompleted { .. } => "results_processing_completed",
            Self::Progress { .. } => "progress",
            Self::BudgetAlert { .. } => "budget_alert",
            Self::SelfHealingMode { .. } => "executor_self_healing_mode",
            Self::BaselineFixStarted { .. } => "baseline_fix_started",
            Self::BaselineFixCompleted { .. } => "baseline_fix_completed",
            Self::TestFailureDiagnosis { .. } => "test_failure_diagnosis",
            Self::IssueDecomposed { .. } => "issue_decomposed",
            Self::Error { .. } => "error",
        }
    }
}

/// One stored event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorEvent {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_id: Option<IssueId>,
    pub instance_id: String,
    pub severity: Severity,
    #[serde(flatten)]
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
}

impl ExecutorEvent {
    pub fn new(instance_id: impl Into<String>, severity: Severity, kind: EventKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            issue_id: None,
            instance_id: instance_id.into(),
            severity,
            kind,
            timestamp: Utc::now(),
        }
    }

    pub fn for_issue(mut self, issue_id: impl Into<IssueId>) -> Self {
        self.issue_id = Some(issue_id.into());
        self
    }
}

/// Destination for executor events, usually the tracker's event log.
pub trait EventSink: Send + Sync {
    fn store(&self, event: &ExecutorEvent) -> anyhow::Result<()>;
}

/// Store an event, degrading to a warning on sink failure.
///
/// Event storage must never fail the operation that produced the event.
pub fn emit_best_effort(sink: &dyn EventSink, event: ExecutorEvent) {
    let name = event.kind.name();
    if let Err(e) = sink.store(&event) {
        tracing::warn!(event = name, error = %e, "failed to store executor event");
    }
}

/// Sink that only logs, for runs without a tracker-backed event log.
#[derive(Debug, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn store(&self, event: &ExecutorEvent) -> anyhow::Result<()> {
        tracing::debug!(
            event = event.kind.name(),
            issue = event.issue_id.as_deref().unwrap_or("-"),
            severity = %event.severity,
            "executor event"
        );
        Ok(())
    }
}
