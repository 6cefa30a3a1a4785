//! Agent subprocess supervision.
//!
//! Spawns a coding-agent CLI, captures both output streams line-by-line
//! with a bounded buffer, extracts structured tool events, enforces the
//! read-loop circuit breaker, and kills the child on timeout or
//! cancellation.

pub mod events;
pub mod supervisor;

pub use events::{parse_plain_line, parse_stream_line, AgentEvent};
pub use supervisor::{
    AgentKind, AgentRequest, AgentResult, AgentSupervisor, CaptureLimits, SuperviseError,
    TRUNCATION_SENTINEL,
};
