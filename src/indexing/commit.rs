use super::types::CommitPolicy;

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

struct CommitWindow {
    batches: usize,
    since: Instant,
}

/// Decides when an explicit commit is due.
///
/// Counts batches and elapsed time since the last successful explicit commit.
/// Never due under `CommitPolicy::Delegated`.
pub struct CommitTracker {
    policy: CommitPolicy,
    window: Mutex<CommitWindow>,
}

impl CommitTracker {
    pub fn new(policy: CommitPolicy) -> Self {
        Self {
            policy,
            window: Mutex::new(CommitWindow {
                batches: 0,
                since: Instant::now(),
            }),
        }
    }

    pub fn policy(&self) -> &CommitPolicy {
        &self.policy
    }

    pub fn is_explicit(&self) -> bool {
        matches!(self.policy, CommitPolicy::Explicit { .. })
    }

    /// Counts one finished batch and reports whether a commit is now due.
    pub async fn record_batch(&self) -> bool {
        let CommitPolicy::Explicit { every_batches, .. } = &self.policy else {
            return false;
        };

        let mut window = self.window.lock().await;
        window.batches += 1;

        let by_count = every_batches.is_some_and(|n| n > 0 && window.batches >= n);
        let by_time = self
            .policy
            .interval()
            .is_some_and(|interval| interval > Duration::ZERO && window.since.elapsed() >= interval);

        by_count || by_time
    }

    /// Whether the time trigger has fired with batches still uncommitted.
    /// Polled by a timer so a quiet stream still gets its commit.
    pub async fn is_due_by_time(&self) -> bool {
        let Some(interval) = self.policy.interval().filter(|i| !i.is_zero()) else {
            return false;
        };
        if !self.is_explicit() {
            return false;
        }

        let window = self.window.lock().await;
        window.batches > 0 && window.since.elapsed() >= interval
    }

    /// Starts a new window. Called after a successful commit only, so a failed
    /// commit is attempted again with the next batch.
    pub async fn mark_committed(&self) {
        let mut window = self.window.lock().await;
        window.batches = 0;
        window.since = Instant::now();
    }

    /// Batches counted since the last commit.
    pub async fn pending_batches(&self) -> usize {
        self.window.lock().await.batches
    }
}
