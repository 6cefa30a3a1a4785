//! Per-issue execution state machine.
//!
//! Every claimed issue moves through a fixed sequence of phases:
//!
//! ```text
//! claimed → assessing → executing → analyzing → gates → committing → completed
//! ```
//!
//! Transitions are forward-only: the observed phase sequence for any issue
//! is a contiguous prefix of the full list. The guard lives here so that
//! both the storage backend and the executor enforce the same rule.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Phases of a single issue execution, in traversal order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecPhase {
    /// Claimed by an instance; nothing has run yet.
    Claimed,
    /// Advisor assessment in progress (or skipped through).
    Assessing,
    /// Agent subprocess running.
    Executing,
    /// Post-run advisor analysis.
    Analyzing,
    /// Quality gates running.
    Gates,
    /// Committing the result.
    Committing,
    /// Terminal: the issue execution finished.
    Completed,
}

impl ExecPhase {
    /// All phases in traversal order.
    pub const ALL: [ExecPhase; 7] = [
        Self::Claimed,
        Self::Assessing,
        Self::Executing,
        Self::Analyzing,
        Self::Gates,
        Self::Committing,
        Self::Completed,
    ];

    /// Position in the traversal order.
    pub fn rank(self) -> u8 {
        match self {
            Self::Claimed => 0,
            Self::Assessing => 1,
            Self::Executing => 2,
            Self::Analyzing => 3,
            Self::Gates => 4,
            Self::Committing => 5,
            Self::Completed => 6,
        }
    }

    /// The next phase in order, or `None` from `Completed`.
    pub fn next(self) -> Option<ExecPhase> {
        Self::ALL.get(self.rank() as usize + 1).copied()
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed)
    }

    /// Whether moving from `self` to `to` keeps the traversal forward-only.
    pub fn can_advance_to(self, to: ExecPhase) -> bool {
        to.rank() > self.rank()
    }
}

impl fmt::Display for ExecPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Claimed => write!(f, "claimed"),
            Self::Assessing => write!(f, "assessing"),
            Self::Executing => write!(f, "executing"),
            Self::Analyzing => write!(f, "analyzing"),
            Self::Gates => write!(f, "gates"),
            Self::Committing => write!(f, "committing"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

/// Error returned when a transition would move backward or repeat a phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IllegalPhaseChange {
    pub from: ExecPhase,
    pub to: ExecPhase,
}

impl fmt::Display for IllegalPhaseChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "illegal phase change: {} → {}", self.from, self.to)
    }
}

impl std::error::Error for IllegalPhaseChange {}

/// Validate a phase transition, returning the target on success.
pub fn advance(from: ExecPhase, to: ExecPhase) -> Result<ExecPhase, IllegalPhaseChange> {
    if from.can_advance_to(to) {
        Ok(to)
    } else {
        Err(IllegalPhaseChange { from, to })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_traversal_is_legal() {
        let mut phase = ExecPhase::Claimed;
        while let Some(next) = phase.next() {
            phase = advance(phase, next).unwrap();
        }
        assert_eq!(phase, ExecPhase::Completed);
        assert!(phase.is_terminal());
    }

    #[test]
    fn test_forward_skip_is_legal() {
        // A run without an advisor moves straight past assessing.
        assert!(advance(ExecPhase::Claimed, ExecPhase::Executing).is_ok());
        assert!(advance(ExecPhase::Executing, ExecPhase::Completed).is_ok());
    }

    #[test]
    fn test_backward_and_repeat_are_illegal() {
        let err = advance(ExecPhase::Gates, ExecPhase::Executing).unwrap_err();
        assert_eq!(err.from, ExecPhase::Gates);
        assert_eq!(err.to, ExecPhase::Executing);

        assert!(advance(ExecPhase::Assessing, ExecPhase::Assessing).is_err());
        assert!(advance(ExecPhase::Completed, ExecPhase::Claimed).is_err());
    }

    #[test]
    fn test_rank_matches_order() {
        for pair in ExecPhase::ALL.windows(2) {
            assert!(pair[0].rank() < pair[1].rank());
            assert_eq!(pair[0].next(), Some(pair[1]));
        }
        assert_eq!(ExecPhase::Completed.next(), None);
    }

    #[test]
    fn test_serde_snake_case() {
        let json = serde_json::to_string(&ExecPhase::Analyzing).unwrap();
        assert_eq!(json, "\"analyzing\"");
        let back: ExecPhase = serde_json::from_str("\"committing\"").unwrap();
        assert_eq!(back, ExecPhase::Committing);
    }
}
