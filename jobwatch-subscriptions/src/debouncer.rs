//! Per-consumer coalescing of bursty update events.
//!
//! The first event after a quiet period is delivered at once. Events that
//! arrive within the window of the previous delivery are buffered; only the
//! latest one survives, and it is flushed when the window elapses. Order is
//! never changed, superseded intermediate events may be dropped.
//!
//! Only `Value` and `Stale` events coalesce. `NotFound`, `Retrying` and
//! `Error` always reach the consumer: a buffered value is released ahead
//! of them and the armed flush is stopped.

use jobwatch_core::{SubscriptionEvent, TimerHandle};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// What the dispatcher should do with an offered event.
#[derive(Debug)]
pub enum Offer<T> {
    /// Deliver this event now.
    Deliver(SubscriptionEvent<T>),
    /// Deliver the buffered event, then the offered one.
    FlushThenDeliver(SubscriptionEvent<T>, SubscriptionEvent<T>),
    /// Buffered; schedule a flush after the given delay.
    ArmFlush(Duration),
    /// Buffered behind an already armed flush.
    Coalesced,
    /// The debouncer was cancelled; drop the event.
    Dropped,
}

struct DebounceState<T> {
    last_delivery: Option<Instant>,
    pending: Option<SubscriptionEvent<T>>,
    flush_armed: bool,
    timer: Option<TimerHandle>,
    cancelled: bool,
    coalesced: u64,
}

/// Coalescing gate owned by one consumer registration.
pub struct Debouncer<T> {
    window: Duration,
    state: Mutex<DebounceState<T>>,
}

impl<T> Debouncer<T> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            state: Mutex::new(DebounceState {
                last_delivery: None,
                pending: None,
                flush_armed: false,
                timer: None,
                cancelled: false,
                coalesced: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DebounceState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Offer an event observed at `now`.
    pub fn offer(&self, event: SubscriptionEvent<T>, now: Instant) -> Offer<T> {
        let mut state = self.lock();
        if state.cancelled {
            return Offer::Dropped;
        }
        if self.window.is_zero() {
            state.last_delivery = Some(now);
            return Offer::Deliver(event);
        }
        if !coalesces(&event) {
            state.last_delivery = Some(now);
            state.flush_armed = false;
            if let Some(timer) = state.timer.take() {
                timer.cancel();
            }
            return match state.pending.take() {
                Some(pending) => Offer::FlushThenDeliver(pending, event),
                None => Offer::Deliver(event),
            };
        }

        let since_last = state
            .last_delivery
            .map(|last| now.saturating_duration_since(last));
        match since_last {
            None => {
                state.last_delivery = Some(now);
                Offer::Deliver(event)
            }
            Some(elapsed) if elapsed >= self.window && state.pending.is_none() => {
                state.last_delivery = Some(now);
                Offer::Deliver(event)
            }
            Some(elapsed) => {
                if state.pending.replace(event).is_some() {
                    state.coalesced += 1;
                }
                if state.flush_armed {
                    Offer::Coalesced
                } else {
                    state.flush_armed = true;
                    Offer::ArmFlush(self.window.saturating_sub(elapsed))
                }
            }
        }
    }

    /// Keep the handle of the armed flush so [`Debouncer::cancel`] can stop it.
    pub fn attach_timer(&self, timer: TimerHandle) {
        let mut state = self.lock();
        if state.cancelled {
            timer.cancel();
            return;
        }
        state.timer = Some(timer);
    }

    /// Take the buffered event for delivery at `now`.
    pub fn take_pending(&self, now: Instant) -> Option<SubscriptionEvent<T>> {
        let mut state = self.lock();
        state.flush_armed = false;
        state.timer = None;
        if state.cancelled {
            return None;
        }
        let pending = state.pending.take();
        if pending.is_some() {
            state.last_delivery = Some(now);
        }
        pending
    }

    /// Drop anything buffered and stop the armed flush. Idempotent.
    pub fn cancel(&self) {
        let mut state = self.lock();
        state.cancelled = true;
        state.pending = None;
        state.flush_armed = false;
        if let Some(timer) = state.timer.take() {
            timer.cancel();
        }
    }

    pub fn has_pending(&self) -> bool {
        self.lock().pending.is_some()
    }

    /// Events superseded before they could be delivered.
    pub fn coalesced(&self) -> u64 {
        self.lock().coalesced
    }
}

fn coalesces<T>(event: &SubscriptionEvent<T>) -> bool {
    matches!(event, SubscriptionEvent::Value(_) | SubscriptionEvent::Stale(_))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn value(n: u32) -> SubscriptionEvent<u32> {
        SubscriptionEvent::Value(Arc::new(jobwatch_core::CachedSnapshot::new(n)))
    }

    fn delivered(offer: Offer<u32>) -> Option<u32> {
        match offer {
            Offer::Deliver(event) => event.value().copied(),
            _ => None,
        }
    }

    #[test]
    fn test_zero_window_passes_through() {
        let debouncer = Debouncer::new(Duration::ZERO);
        let now = Instant::now();
        assert_eq!(delivered(debouncer.offer(value(1), now)), Some(1));
        assert_eq!(delivered(debouncer.offer(value(2), now)), Some(2));
    }

    #[test]
    fn test_burst_keeps_latest() {
        let debouncer = Debouncer::new(Duration::from_millis(100));
        let start = Instant::now();

        assert_eq!(delivered(debouncer.offer(value(1), start)), Some(1));
        assert!(matches!(
            debouncer.offer(value(2), start + Duration::from_millis(10)),
            Offer::ArmFlush(d) if d == Duration::from_millis(90)
        ));
        assert!(matches!(
            debouncer.offer(value(3), start + Duration::from_millis(20)),
            Offer::Coalesced
        ));
        assert_eq!(debouncer.coalesced(), 1);

        let flushed = debouncer.take_pending(start + Duration::from_millis(100));
        assert_eq!(flushed.and_then(|e| e.value().copied()), Some(3));
        assert!(!debouncer.has_pending());
    }

    #[test]
    fn test_quiet_period_delivers_immediately() {
        let debouncer = Debouncer::new(Duration::from_millis(100));
        let start = Instant::now();
        debouncer.offer(value(1), start);
        assert_eq!(
            delivered(debouncer.offer(value(2), start + Duration::from_millis(150))),
            Some(2)
        );
    }

    #[test]
    fn test_pending_blocks_bypass() {
        let debouncer = Debouncer::new(Duration::from_millis(100));
        let start = Instant::now();
        debouncer.offer(value(1), start);
        debouncer.offer(value(2), start + Duration::from_millis(50));

        // Window elapsed but the flush has not run yet; the newer value must
        // not overtake the buffered one.
        let late = debouncer.offer(value(3), start + Duration::from_millis(120));
        assert!(matches!(late, Offer::Coalesced));
        let flushed = debouncer.take_pending(start + Duration::from_millis(120));
        assert_eq!(flushed.and_then(|e| e.value().copied()), Some(3));
    }

    #[test]
    fn test_not_found_is_never_coalesced() {
        let debouncer = Debouncer::new(Duration::from_millis(100));
        let start = Instant::now();
        debouncer.offer(value(1), start);
        debouncer.offer(value(2), start + Duration::from_millis(5));
        let flag = Arc::new(AtomicBool::new(false));
        debouncer.attach_timer(TimerHandle::new(Arc::clone(&flag)));

        match debouncer.offer(SubscriptionEvent::NotFound, start + Duration::from_millis(10)) {
            Offer::FlushThenDeliver(pending, sentinel) => {
                assert_eq!(pending.value().copied(), Some(2));
                assert!(sentinel.is_not_found());
            }
            other => panic!("expected flush then not_found, got {other:?}"),
        }
        assert!(flag.load(std::sync::atomic::Ordering::SeqCst));
        assert!(!debouncer.has_pending());

        // Nothing buffered: the sentinel goes straight through.
        let retrying = SubscriptionEvent::Retrying {
            attempt: 1,
            delay: Duration::from_millis(100),
        };
        assert!(matches!(
            debouncer.offer(retrying, start + Duration::from_millis(15)),
            Offer::Deliver(SubscriptionEvent::Retrying { attempt: 1, .. })
        ));

        // A value inside the window is buffered again behind a fresh flush.
        assert!(matches!(
            debouncer.offer(value(3), start + Duration::from_millis(20)),
            Offer::ArmFlush(d) if d == Duration::from_millis(95)
        ));
    }

    #[test]
    fn test_cancel_drops_pending_and_timer() {
        let debouncer = Debouncer::new(Duration::from_millis(100));
        let start = Instant::now();
        debouncer.offer(value(1), start);
        debouncer.offer(value(2), start + Duration::from_millis(10));

        let flag = Arc::new(AtomicBool::new(false));
        debouncer.attach_timer(TimerHandle::new(Arc::clone(&flag)));
        debouncer.cancel();
        debouncer.cancel();

        assert!(flag.load(std::sync::atomic::Ordering::SeqCst));
        assert!(debouncer.take_pending(start + Duration::from_millis(100)).is_none());
        assert!(matches!(
            debouncer.offer(value(3), start + Duration::from_secs(1)),
            Offer::Dropped
        ));
    }
}
