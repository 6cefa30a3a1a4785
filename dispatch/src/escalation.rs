//! Per-baseline escalation counters.
//!
//! The executor keeps one in-memory record per baseline issue it has
//! attempted: how many times, and since when. When a baseline exceeds its
//! attempt or age threshold the self-healing machinery escalates it to a
//! human. Records live for the process lifetime only; the tracker is not
//! involved.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::tracker::types::IssueId;

/// Counter record for one baseline issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscalationEntry {
    pub attempt_count: u32,
    pub first_seen: DateTime<Utc>,
    pub last_attempted: DateTime<Utc>,
}

/// Why a baseline crossed its escalation threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscalationReason {
    AttemptsExceeded { attempts: u32, limit: u32 },
    DurationExceeded { age: Duration, limit: Duration },
}

impl fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AttemptsExceeded { attempts, limit } => {
                write!(f, "{attempts} attempts (threshold: {limit})")
            }
            Self::DurationExceeded { age, limit } => {
                write!(
                    f,
                    "unresolved for {}s (threshold: {}s)",
                    age.as_secs(),
                    limit.as_secs()
                )
            }
        }
    }
}

/// Attempt/age thresholds. Zero disables the corresponding bound.
#[derive(Debug, Clone, Copy)]
pub struct EscalationThresholds {
    pub max_attempts: u32,
    pub max_duration: Duration,
}

impl Default for EscalationThresholds {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_duration: Duration::from_secs(2 * 60 * 60),
        }
    }
}

/// Reader/writer-locked map of baseline issue → escalation entry.
pub struct EscalationTracker {
    thresholds: EscalationThresholds,
    entries: RwLock<BTreeMap<IssueId, EscalationEntry>>,
}

impl EscalationTracker {
    pub fn new(thresholds: EscalationThresholds) -> Self {
        Self {
            thresholds,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<IssueId, EscalationEntry>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<IssueId, EscalationEntry>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Fetch the entry for `id`, creating a zeroed one on first sight.
    pub fn get_or_create(&self, id: &str) -> EscalationEntry {
        let mut entries = self.write();
        entries
            .entry(id.to_string())
            .or_insert_with(|| {
                let now = Utc::now();
                EscalationEntry {
                    attempt_count: 0,
                    first_seen: now,
                    last_attempted: now,
                }
            })
            .clone()
    }

    /// Record one attempt against `id`, creating the entry if needed.
    pub fn increment(&self, id: &str) -> u32 {
        let mut entries = self.write();
        let now = Utc::now();
        let entry = entries.entry(id.to_string()).or_insert_with(|| EscalationEntry {
            attempt_count: 0,
            first_seen: now,
            last_attempted: now,
        });
        entry.attempt_count = entry.attempt_count.saturating_add(1);
        entry.last_attempted = now;
        entry.attempt_count
    }

    pub fn get(&self, id: &str) -> Option<EscalationEntry> {
        self.read().get(id).cloned()
    }

    /// Drop the entry for a resolved or escalated baseline.
    pub fn clear(&self, id: &str) {
        self.write().remove(id);
    }

    /// Drop everything. Invoked on transitions back to HEALTHY.
    pub fn clear_all(&self) {
        self.write().clear();
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Walk all entries and return the first that exceeds a threshold.
    ///
    /// Iteration order is the issue-id order, so repeated calls are
    /// deterministic. A zero threshold disables that bound.
    pub fn check_thresholds(&self) -> Option<(IssueId, EscalationReason)> {
        let limit_attempts = self.thresholds.max_attempts;
        let limit_age = self.thresholds.max_duration;
        let now = Utc::now();

        for (id, entry) in self.read().iter() {
            if limit_attempts > 0 && entry.attempt_count >= limit_attempts {
                return Some((
                    id.clone(),
                    EscalationReason::AttemptsExceeded {
                        attempts: entry.attempt_count,
                        limit: limit_attempts,
                    },
                ));
            }
            if !limit_age.is_zero() {
                let age = (now - entry.first_seen).to_std().unwrap_or_default();
                if age >= limit_age {
                    return Some((
                        id.clone(),
                        EscalationReason::DurationExceeded {
                            age,
                            limit: limit_age,
                        },
                    ));
                }
            }
        }
        None
    }
}
