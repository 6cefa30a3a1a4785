//! Tracker data model and storage interface.
//!
//! The tracker is the single source of durable truth. The executor is
//! agnostic to its implementation: everything goes through the
//! [`store::TrackerStore`] trait. [`memory::MemoryTracker`] is the
//! in-process reference backend used by the test suite and by local
//! single-process runs.

pub mod memory;
pub mod store;
pub mod types;

pub use store::{TrackerError, TrackerResult, TrackerStore};
pub use types::{
    Comment, DependencyEdge, DependencyKind, DiscoveredIssue, ExecutionAttempt, ExecutionState,
    ExecutorInstance, InstanceStatus, Issue, IssueId, IssueStatus, IssueType, ReadyFilter,
};
