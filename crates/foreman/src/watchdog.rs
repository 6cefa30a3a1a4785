//! Per-issue cancellation registry.
//!
//! Every in-flight agent registers a child token here so that shutdown,
//! or external intervention targeting one issue, can preempt a specific
//! run without touching the others. Cleanup after cancellation runs on a
//! fresh token, so releases proceed even once the root is cancelled.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

use dispatch::tracker::types::IssueId;

pub struct Watchdog {
    root: CancellationToken,
    handles: Mutex<HashMap<IssueId, CancellationToken>>,
}

impl Watchdog {
    /// Registry rooted at the executor's shutdown token: cancelling the
    /// root preempts every registered run.
    pub fn new(root: CancellationToken) -> Self {
        Self {
            root,
            handles: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<IssueId, CancellationToken>> {
        self.handles.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register an issue and get its cancellation handle.
    pub fn register(&self, issue_id: &str) -> CancellationToken {
        let token = self.root.child_token();
        self.lock().insert(issue_id.to_string(), token.clone());
        token
    }

    /// Deregister after the run finishes (normally or not).
    pub fn complete(&self, issue_id: &str) {
        self.lock().remove(issue_id);
    }

    /// Preempt one specific run. Returns false when nothing is in flight
    /// for that issue.
    pub fn preempt(&self, issue_id: &str) -> bool {
        match self.lock().get(issue_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.lock().len()
    }
}
