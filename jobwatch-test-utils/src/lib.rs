//! jobwatch Test Utilities
//!
//! Centralized test infrastructure for the jobwatch workspace:
//! - [`ManualScheduler`]: a virtual clock with deterministic timers
//! - [`EventRecorder`]: a consumer callback that records what it sees
//! - Proptest generators for keys and job status sequences
//! - Fixtures for common configurations

pub use jobwatch_core::{
    CachedSnapshot, ConfigError, EntryState, InMemoryJobStore, ManagerConfig, RateLimitConfig,
    ResourceKey, RetryConfig, Scheduler, SubscriptionError, SubscriptionEvent, TimerHandle,
    TransportError,
};

use futures_util::future::BoxFuture;
use jobwatch_core::scheduler::TimerTask;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::Context;
use std::time::{Duration, Instant};

// ============================================================================
// MANUAL SCHEDULER
// ============================================================================

struct ScheduledTask {
    cancelled: Arc<AtomicBool>,
    task: TimerTask,
}

struct ManualState {
    origin: Instant,
    elapsed: Duration,
    next_seq: u64,
    timers: BTreeMap<(Duration, u64), ScheduledTask>,
    spawned: Vec<BoxFuture<'static, ()>>,
}

/// Scheduler driven entirely by the test.
///
/// Time stands still until [`ManualScheduler::advance`] is called. Timers
/// fire in due order (ties in scheduling order) with no internal lock held,
/// so a firing task may schedule further timers; those fire within the same
/// `advance` call when they fall inside the window. Spawned futures are
/// polled with a no-op waker on every `advance`, so they must make progress
/// without external wakeups (in-memory fetchers do).
pub struct ManualScheduler {
    state: Mutex<ManualState>,
}

impl Default for ManualScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ManualState {
                origin: Instant::now(),
                elapsed: Duration::ZERO,
                next_seq: 0,
                timers: BTreeMap::new(),
                spawned: Vec::new(),
            }),
        }
    }

    /// Shared handle, ready to inject.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Virtual time elapsed since construction.
    pub fn elapsed(&self) -> Duration {
        self.lock().elapsed
    }

    /// Timers scheduled and not cancelled.
    pub fn pending_timers(&self) -> usize {
        self.lock()
            .timers
            .values()
            .filter(|t| !t.cancelled.load(Ordering::SeqCst))
            .count()
    }

    /// Spawned futures that have not completed.
    pub fn pending_futures(&self) -> usize {
        self.lock().spawned.len()
    }

    /// Move the clock forward by `by`, firing every timer that comes due.
    pub fn advance(&self, by: Duration) {
        let target = self.lock().elapsed + by;
        loop {
            self.run_spawned();
            let next = {
                let mut state = self.lock();
                let due = state
                    .timers
                    .keys()
                    .next()
                    .copied()
                    .filter(|(due, _)| *due <= target);
                due.and_then(|slot| {
                    state.elapsed = state.elapsed.max(slot.0);
                    state.timers.remove(&slot)
                })
            };
            match next {
                Some(scheduled) => {
                    if !scheduled.cancelled.load(Ordering::SeqCst) {
                        (scheduled.task)();
                    }
                }
                None => break,
            }
        }
        self.lock().elapsed = target;
        self.run_spawned();
    }

    /// Fire zero-delay timers and poll spawned futures without moving time.
    pub fn run_until_idle(&self) {
        self.advance(Duration::ZERO);
    }

    fn run_spawned(&self) {
        let waker = futures_util::task::noop_waker_ref();
        let mut cx = Context::from_waker(waker);
        loop {
            let batch = std::mem::take(&mut self.lock().spawned);
            if batch.is_empty() {
                return;
            }
            let mut waiting = Vec::new();
            for mut future in batch {
                if future.as_mut().poll(&mut cx).is_pending() {
                    waiting.push(future);
                }
            }
            let mut state = self.lock();
            let fresh = std::mem::take(&mut state.spawned);
            let has_fresh = !fresh.is_empty();
            state.spawned = waiting;
            state.spawned.extend(fresh);
            if !has_fresh {
                return;
            }
        }
    }
}

impl Scheduler for ManualScheduler {
    fn now(&self) -> Instant {
        let state = self.lock();
        state.origin + state.elapsed
    }

    fn after(&self, delay: Duration, task: TimerTask) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut state = self.lock();
        let slot = (state.elapsed + delay, state.next_seq);
        state.next_seq += 1;
        state.timers.insert(
            slot,
            ScheduledTask {
                cancelled: Arc::clone(&cancelled),
                task,
            },
        );
        TimerHandle::new(cancelled)
    }

    fn spawn(&self, future: BoxFuture<'static, ()>) {
        self.lock().spawned.push(future);
    }
}

// ============================================================================
// EVENT RECORDER
// ============================================================================

/// Consumer callback that records every delivered event.
pub struct EventRecorder<T> {
    events: Arc<Mutex<Vec<SubscriptionEvent<T>>>>,
}

impl<T> Clone for EventRecorder<T> {
    fn clone(&self) -> Self {
        Self {
            events: Arc::clone(&self.events),
        }
    }
}

impl<T> Default for EventRecorder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EventRecorder<T> {
    pub fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<SubscriptionEvent<T>>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Labels of every event in delivery order (`"value"`, `"stale"`, ...).
    pub fn kinds(&self) -> Vec<&'static str> {
        self.lock().iter().map(SubscriptionEvent::kind).collect()
    }

    pub fn errors(&self) -> Vec<SubscriptionError> {
        self.lock()
            .iter()
            .filter_map(|e| e.error().cloned())
            .collect()
    }
}

impl<T: Clone + Send + Sync + 'static> EventRecorder<T> {
    /// A callback feeding this recorder.
    pub fn callback(&self) -> impl Fn(SubscriptionEvent<T>) + Send + Sync + 'static {
        let events = Arc::clone(&self.events);
        move |event| {
            events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(event)
        }
    }

    pub fn events(&self) -> Vec<SubscriptionEvent<T>> {
        self.lock().clone()
    }

    /// Values carried by `Value` and `Stale` events, in delivery order.
    pub fn values(&self) -> Vec<T> {
        self.lock()
            .iter()
            .filter_map(|e| e.value().cloned())
            .collect()
    }

    pub fn last(&self) -> Option<SubscriptionEvent<T>> {
        self.lock().last().cloned()
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Common keys and configurations.

    use super::*;

    /// Key for a job document, e.g. `jobs/J1`.
    pub fn job_key(id: &str) -> ResourceKey {
        ResourceKey::new(format!("jobs/{}", id)).unwrap_or_else(|e| panic!("bad fixture key: {e}"))
    }

    /// No debounce, 30s grace, 10 attempts per 60s, 2 retries from 100ms.
    pub fn test_config() -> ManagerConfig {
        ManagerConfig {
            debounce_ms: 0,
            grace_period_ms: 30_000,
            poll_interval_ms: 1_000,
            dispatch_warn_depth: 1_024,
            rate_limit: RateLimitConfig {
                enabled: true,
                max_attempts: 10,
                window_ms: 60_000,
                reset_on_success: true,
            },
            retry: RetryConfig {
                max_retries: 2,
                initial_backoff_ms: 100,
                max_backoff_ms: 1_000,
                multiplier: 2.0,
                jitter_ms: 0,
            },
        }
    }

    /// [`test_config`] with rate limiting switched off.
    pub fn unlimited_config() -> ManagerConfig {
        let mut config = test_config();
        config.rate_limit.enabled = false;
        config
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for keys and job updates.

    use super::*;
    use proptest::prelude::*;

    /// Generate a valid resource key.
    pub fn arb_resource_key() -> impl Strategy<Value = ResourceKey> {
        "[a-z]{1,8}/[A-Za-z0-9_-]{1,16}".prop_map(|raw| {
            ResourceKey::new(raw).unwrap_or_else(|e| panic!("generator produced bad key: {e}"))
        })
    }

    /// Generate a job status label.
    pub fn arb_job_status() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("queued".to_string()),
            Just("uploading".to_string()),
            Just("processing".to_string()),
            Just("completed".to_string()),
            Just("failed".to_string()),
        ]
    }

    /// Generate a sequence of numbered status updates, each distinct.
    pub fn arb_update_sequence(max_len: usize) -> impl Strategy<Value = Vec<String>> {
        prop::collection::vec(arb_job_status(), 1..=max_len).prop_map(|statuses| {
            statuses
                .into_iter()
                .enumerate()
                .map(|(i, status)| format!("{}#{}", status, i))
                .collect()
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter_task(counter: &Arc<AtomicUsize>) -> TimerTask {
        let counter = Arc::clone(counter);
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_manual_timers_fire_in_order() {
        let scheduler = ManualScheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (label, delay) in [("b", 20u64), ("a", 10), ("c", 20)] {
            let order = Arc::clone(&order);
            let _ = scheduler.after(
                Duration::from_millis(delay),
                Box::new(move || order.lock().unwrap().push(label)),
            );
        }

        scheduler.advance(Duration::from_millis(15));
        assert_eq!(*order.lock().unwrap(), vec!["a"]);

        scheduler.advance(Duration::from_millis(5));
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(scheduler.elapsed(), Duration::from_millis(20));
    }

    #[test]
    fn test_manual_cancel() {
        let scheduler = ManualScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let handle = scheduler.after(Duration::from_secs(1), counter_task(&fired));
        assert_eq!(scheduler.pending_timers(), 1);

        handle.cancel();
        assert_eq!(scheduler.pending_timers(), 0);
        scheduler.advance(Duration::from_secs(5));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_manual_now_tracks_virtual_time() {
        let scheduler = ManualScheduler::new();
        let start = scheduler.now();
        scheduler.advance(Duration::from_secs(10));
        assert_eq!(scheduler.now() - start, Duration::from_secs(10));
    }

    #[test]
    fn test_nested_timers_fire_within_window() {
        let scheduler = ManualScheduler::shared();
        let fired = Arc::new(AtomicUsize::new(0));

        let inner_scheduler = Arc::clone(&scheduler);
        let inner_counter = Arc::clone(&fired);
        let _ = scheduler.after(
            Duration::from_millis(10),
            Box::new(move || {
                let _ = inner_scheduler.after(
                    Duration::from_millis(10),
                    Box::new(move || {
                        inner_counter.fetch_add(1, Ordering::SeqCst);
                    }),
                );
            }),
        );

        scheduler.advance(Duration::from_millis(15));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        scheduler.advance(Duration::from_millis(5));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_spawned_futures_run_on_advance() {
        let scheduler = ManualScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        scheduler.spawn(Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(scheduler.pending_futures(), 1);
        scheduler.run_until_idle();
        assert_eq!(scheduler.pending_futures(), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_recorder_collects_values() {
        let recorder: EventRecorder<String> = EventRecorder::new();
        let callback = recorder.callback();
        callback(SubscriptionEvent::Value(Arc::new(CachedSnapshot::new(
            "processing".to_string(),
        ))));
        callback(SubscriptionEvent::NotFound);

        assert_eq!(recorder.count(), 2);
        assert_eq!(recorder.values(), vec!["processing".to_string()]);
        assert_eq!(recorder.kinds(), vec!["value", "not_found"]);
    }
}
