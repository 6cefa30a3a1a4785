//! Deterministic core for the foreman executor.
//!
//! This crate holds everything the supervisor process needs that is not
//! tied to a subprocess or network edge:
//!
//! - The tracker data model and the [`tracker::TrackerStore`] storage
//!   interface, with an in-memory reference backend for tests and
//!   single-process runs.
//! - The per-issue execution state machine ([`exec`]).
//! - Per-baseline escalation counters ([`escalation`]) and the process-wide
//!   self-healing mode machine ([`healing`]).
//! - Baseline-issue identifiers ([`baseline`]) and stable test-failure
//!   signatures ([`signature`]).
//! - Structured executor events ([`events`]) and the budget gate
//!   ([`budget`]).
//! - Executor configuration with environment overrides ([`config`]).

pub mod baseline;
pub mod budget;
pub mod config;
pub mod escalation;
pub mod events;
pub mod exec;
pub mod healing;
pub mod signature;
pub mod tracker;

pub use baseline::{baseline_issue_id, gate_type, is_baseline_issue, GateKind, BASELINE_LABEL};
pub use budget::{BudgetGate, BudgetState, CostTracker};
pub use config::{ExecutorConfig, FailureMode};
pub use escalation::{EscalationReason, EscalationTracker};
pub use events::{EventKind, EventSink, ExecutorEvent, Severity};
pub use exec::{ExecPhase, IllegalPhaseChange};
pub use healing::{HealingMode, HealingState};
pub use signature::{compute_signature, normalize_failure_output, TestFailure};
pub use tracker::{
    memory::MemoryTracker, store::TrackerError, store::TrackerResult, store::TrackerStore,
};
