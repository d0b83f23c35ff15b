//! Deferred teardown timers per resource key.
//!
//! When the last consumer of a key leaves, teardown waits out a grace
//! period so that a quick re-subscribe (a remount, a route change) can
//! reuse the open listener and cached snapshot. Each scheduled timer
//! carries a token; a firing timer only counts if its token is still the
//! one on record for the key, so a cancelled-then-rescheduled key never
//! acts on the stale timer.

use dashmap::DashMap;
use jobwatch_core::{ResourceKey, Scheduler, TimerHandle};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct PendingCleanup {
    token: u64,
    timer: TimerHandle,
}

/// Grace-period timers, at most one per key.
pub struct CleanupScheduler {
    grace: Duration,
    scheduler: Arc<dyn Scheduler>,
    pending: DashMap<ResourceKey, PendingCleanup>,
    next_token: AtomicU64,
}

impl CleanupScheduler {
    pub fn new(grace: Duration, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            grace,
            scheduler,
            pending: DashMap::new(),
            next_token: AtomicU64::new(1),
        }
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Start the grace timer for `key`, replacing any timer already pending.
    ///
    /// `on_expire` receives the token to hand back to
    /// [`CleanupScheduler::complete`].
    pub fn schedule<F>(&self, key: &ResourceKey, on_expire: F) -> u64
    where
        F: FnOnce(u64) + Send + 'static,
    {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let timer = self
            .scheduler
            .after(self.grace, Box::new(move || on_expire(token)));
        if let Some(previous) = self
            .pending
            .insert(key.clone(), PendingCleanup { token, timer })
        {
            previous.timer.cancel();
        }
        token
    }

    /// Cancel the pending timer for `key`. Returns true if one was pending.
    pub fn cancel(&self, key: &ResourceKey) -> bool {
        match self.pending.remove(key) {
            Some((_, cleanup)) => {
                cleanup.timer.cancel();
                true
            }
            None => false,
        }
    }

    /// Claim an expired timer. Returns true only if `token` is still the
    /// current one for `key`; the record is removed in that case.
    pub fn complete(&self, key: &ResourceKey, token: u64) -> bool {
        self.pending
            .remove_if(key, |_, cleanup| cleanup.token == token)
            .is_some()
    }

    pub fn is_pending(&self, key: &ResourceKey) -> bool {
        self.pending.contains_key(key)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Cancel every pending timer.
    pub fn cancel_all(&self) -> usize {
        let count = self.pending.len();
        for entry in self.pending.iter() {
            entry.value().timer.cancel();
        }
        self.pending.clear();
        count
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use jobwatch_test_utils::fixtures::job_key;
    use jobwatch_test_utils::ManualScheduler;
    use std::sync::Mutex;

    fn setup() -> (Arc<CleanupScheduler>, Arc<ManualScheduler>, Arc<Mutex<Vec<bool>>>) {
        let clock = ManualScheduler::shared();
        let cleanup = Arc::new(CleanupScheduler::new(Duration::from_secs(30), clock.clone()));
        (cleanup, clock, Arc::new(Mutex::new(Vec::new())))
    }

    fn expire_into(
        cleanup: &Arc<CleanupScheduler>,
        outcomes: &Arc<Mutex<Vec<bool>>>,
    ) -> impl FnOnce(u64) + Send + 'static {
        let cleanup = Arc::clone(cleanup);
        let outcomes = Arc::clone(outcomes);
        move |token| {
            let claimed = cleanup.complete(&job_key("J1"), token);
            outcomes.lock().unwrap().push(claimed);
        }
    }

    #[test]
    fn test_fires_after_grace() {
        let (cleanup, clock, outcomes) = setup();
        cleanup.schedule(&job_key("J1"), expire_into(&cleanup, &outcomes));
        assert!(cleanup.is_pending(&job_key("J1")));

        clock.advance(Duration::from_secs(29));
        assert!(outcomes.lock().unwrap().is_empty());

        clock.advance(Duration::from_secs(1));
        assert_eq!(*outcomes.lock().unwrap(), vec![true]);
        assert_eq!(cleanup.pending_count(), 0);
    }

    #[test]
    fn test_cancel_prevents_firing() {
        let (cleanup, clock, outcomes) = setup();
        cleanup.schedule(&job_key("J1"), expire_into(&cleanup, &outcomes));

        clock.advance(Duration::from_secs(10));
        assert!(cleanup.cancel(&job_key("J1")));
        assert!(!cleanup.cancel(&job_key("J1")));

        clock.advance(Duration::from_secs(60));
        assert!(outcomes.lock().unwrap().is_empty());
    }

    #[test]
    fn test_reschedule_supersedes_token() {
        let (cleanup, _clock, _outcomes) = setup();
        let first = cleanup.schedule(&job_key("J1"), |_| {});
        let second = cleanup.schedule(&job_key("J1"), |_| {});

        assert_ne!(first, second);
        assert!(!cleanup.complete(&job_key("J1"), first));
        assert!(cleanup.complete(&job_key("J1"), second));
    }

    #[test]
    fn test_cancel_all() {
        let (cleanup, clock, _outcomes) = setup();
        cleanup.schedule(&job_key("J1"), |_| {});
        cleanup.schedule(&job_key("J2"), |_| {});
        assert_eq!(clock.pending_timers(), 2);

        assert_eq!(cleanup.cancel_all(), 2);
        assert_eq!(clock.pending_timers(), 0);
        assert_eq!(cleanup.pending_count(), 0);
    }
}
