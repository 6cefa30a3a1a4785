//! Budget gate.
//!
//! Before each claim the event loop consults the cost tracker. Warning
//! state logs once per transition and proceeds; exceeded state pauses
//! claiming entirely until the rolling window resets.

use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

/// Reported budget condition for the current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetState {
    Ok,
    Warning,
    Exceeded,
}

impl fmt::Display for BudgetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Warning => write!(f, "warning"),
            Self::Exceeded => write!(f, "exceeded"),
        }
    }
}

/// Source of budget truth (token/cost accounting lives elsewhere).
pub trait CostTracker: Send + Sync {
    fn state(&self) -> BudgetState;
    /// Time until the rolling window resets, when known.
    fn window_resets_in(&self) -> Option<Duration>;
}

impl<T: CostTracker + ?Sized> CostTracker for std::sync::Arc<T> {
    fn state(&self) -> BudgetState {
        (**self).state()
    }

    fn window_resets_in(&self) -> Option<Duration> {
        (**self).window_resets_in()
    }
}

/// Cost tracker with a fixed answer. Used for tests and for deployments
/// without cost accounting wired up.
#[derive(Debug, Clone, Copy)]
pub struct StaticCostTracker(pub BudgetState);

impl CostTracker for StaticCostTracker {
    fn state(&self) -> BudgetState {
        self.0
    }

    fn window_resets_in(&self) -> Option<Duration> {
        None
    }
}

/// Decision handed to the event loop each tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetDecision {
    /// Whether claiming may proceed this tick.
    pub proceed: bool,
    /// Set on the tick where the state first changed, so callers can emit
    /// a single alert event per transition.
    pub newly_changed: bool,
    pub state: BudgetState,
}

/// Wraps a [`CostTracker`] with log-once-per-transition semantics.
pub struct BudgetGate<C> {
    tracker: C,
    last_state: Mutex<BudgetState>,
}

impl<C: CostTracker> BudgetGate<C> {
    pub fn new(tracker: C) -> Self {
        Self {
            tracker,
            last_state: Mutex::new(BudgetState::Ok),
        }
    }

    /// Evaluate the budget for this tick.
    pub fn check(&self) -> BudgetDecision {
        let state = self.tracker.state();
        let mut last = self.last_state.lock().unwrap_or_else(|e| e.into_inner());
        let newly_changed = *last != state;
        *last = state;
        drop(last);

        match state {
            BudgetState::Ok => {}
            BudgetState::Warning => {
                if newly_changed {
                    tracing::warn!("budget warning threshold crossed — continuing to claim");
                }
            }
            BudgetState::Exceeded => {
                if newly_changed {
                    match self.tracker.window_resets_in() {
                        Some(resets) => tracing::error!(
                            resets_in_secs = resets.as_secs(),
                            "budget exceeded — pausing claims until window resets"
                        ),
                        None => tracing::error!(
                            "budget exceeded — pausing claims until window resets"
                        ),
                    }
                }
            }
        }

        BudgetDecision {
            proceed: state != BudgetState::Exceeded,
            newly_changed,
            state,
        }
    }

    pub fn window_resets_in(&self) -> Option<Duration> {
        self.tracker.window_resets_in()
    }
}
