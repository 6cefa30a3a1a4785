//! Process-wide self-healing mode machine.
//!
//! Three macro-states layered over work selection:
//!
//! - `Healthy` — normal claiming.
//! - `SelfHealing` — the baseline is broken; the selector prefers baseline
//!   repair work through a fallback chain.
//! - `Escalated` — a human owns the baseline; the executor claims regular
//!   work only.
//!
//! Owned by the executor process and shared behind a mutex; never stored
//! in the tracker.

use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tracker::types::IssueId;

/// The macro-state controlling work selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealingMode {
    Healthy,
    SelfHealing,
    Escalated,
}

impl fmt::Display for HealingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::SelfHealing => write!(f, "self_healing"),
            Self::Escalated => write!(f, "escalated"),
        }
    }
}

#[derive(Debug)]
struct HealingInner {
    mode: HealingMode,
    since: DateTime<Utc>,
    no_work_cycles: u32,
    last_progress: Instant,
    deadlock_issue: Option<IssueId>,
}

/// Mutex-guarded mode, transition timestamp, no-work counter, progress
/// clock, and the deadlock-escalation issue (if one was created).
pub struct HealingState {
    inner: Mutex<HealingInner>,
}

impl Default for HealingState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealingState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HealingInner {
                mode: HealingMode::Healthy,
                since: Utc::now(),
                no_work_cycles: 0,
                last_progress: Instant::now(),
                deadlock_issue: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HealingInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn mode(&self) -> HealingMode {
        self.lock().mode
    }

    pub fn since(&self) -> DateTime<Utc> {
        self.lock().since
    }

    /// Transition to `to`, logging the change. Returns the previous mode,
    /// or `None` when already in `to` (no-op, nothing logged).
    pub fn transition(&self, to: HealingMode, reason: &str) -> Option<HealingMode> {
        let mut inner = self.lock();
        if inner.mode == to {
            return None;
        }
        let from = inner.mode;
        inner.mode = to;
        inner.since = Utc::now();
        if to == HealingMode::Healthy {
            // A clean baseline clears the deadlock marker and the clock.
            inner.deadlock_issue = None;
            inner.no_work_cycles = 0;
            inner.last_progress = Instant::now();
        }
        tracing::info!(%from, %to, reason, "self-healing mode transition");
        Some(from)
    }

    /// Record that the fallback chain found work: resets the no-work
    /// counter and the deadlock clock.
    pub fn record_progress(&self) {
        let mut inner = self.lock();
        inner.no_work_cycles = 0;
        inner.last_progress = Instant::now();
    }

    /// Record a cycle in which no healing work was found.
    pub fn record_no_work(&self) -> u32 {
        let mut inner = self.lock();
        inner.no_work_cycles = inner.no_work_cycles.saturating_add(1);
        inner.no_work_cycles
    }

    pub fn no_work_cycles(&self) -> u32 {
        self.lock().no_work_cycles
    }

    pub fn time_since_progress(&self) -> Duration {
        self.lock().last_progress.elapsed()
    }

    /// Whether the deadlock timeout has elapsed with no progress and no
    /// deadlock escalation has been filed yet.
    pub fn is_deadlocked(&self, timeout: Duration) -> bool {
        let inner = self.lock();
        inner.deadlock_issue.is_none() && inner.last_progress.elapsed() >= timeout
    }

    pub fn set_deadlock_issue(&self, id: impl Into<IssueId>) {
        self.lock().deadlock_issue = Some(id.into());
    }

    pub fn deadlock_issue(&self) -> Option<IssueId> {
        self.lock().deadlock_issue.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_healthy() {
        let state = HealingState::new();
        assert_eq!(state.mode(), HealingMode::Healthy);
        assert_eq!(state.no_work_cycles(), 0);
        assert!(state.deadlock_issue().is_none());
    }

    #[test]
    fn test_transition_returns_previous_mode() {
        let state = HealingState::new();
        assert_eq!(
            state.transition(HealingMode::SelfHealing, "preflight failed"),
            Some(HealingMode::Healthy)
        );
        assert_eq!(state.mode(), HealingMode::SelfHealing);

        // Same-mode transition is a no-op.
        assert_eq!(state.transition(HealingMode::SelfHealing, "again"), None);
    }

    #[test]
    fn test_healthy_transition_clears_deadlock_state() {
        let state = HealingState::new();
        state.transition(HealingMode::SelfHealing, "preflight failed");
        state.record_no_work();
        state.record_no_work();
        state.set_deadlock_issue("fm-dead");

        state.transition(HealingMode::Healthy, "baselines clean");
        assert_eq!(state.no_work_cycles(), 0);
        assert!(state.deadlock_issue().is_none());
    }

    #[test]
    fn test_no_work_counter() {
        let state = HealingState::new();
        assert_eq!(state.record_no_work(), 1);
        assert_eq!(state.record_no_work(), 2);
        state.record_progress();
        assert_eq!(state.no_work_cycles(), 0);
    }

    #[test]
    fn test_deadlock_detection() {
        let state = HealingState::new();
        // Zero timeout: deadlocked immediately while no escalation exists.
        assert!(state.is_deadlocked(Duration::ZERO));

        state.set_deadlock_issue("fm-dead");
        assert!(!state.is_deadlocked(Duration::ZERO));
    }

    #[test]
    fn test_progress_resets_deadlock_clock() {
        let state = HealingState::new();
        state.record_progress();
        assert!(!state.is_deadlocked(Duration::from_secs(3600)));
    }
}
