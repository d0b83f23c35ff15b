//! FIFO delivery of events to consumer callbacks.
//!
//! Events are queued while the registry lock is held, in the exact order
//! the manager accepted them, and drained after the lock is released. Only
//! one thread drains at a time; a drain requested while another is running
//! (including a reentrant one from inside a callback) returns at once and
//! leaves the jobs to the active drainer. This keeps per-consumer order
//! equal to acceptance order while letting callbacks call back into the
//! manager.

use crate::debouncer::Offer;
use crate::registry::ConsumerRegistration;
use jobwatch_core::{Scheduler, SubscriptionEvent};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{error, warn};

/// One unit of delivery work.
pub enum DispatchJob<T> {
    /// Offer an event to a consumer (through its debouncer).
    Deliver(Arc<ConsumerRegistration<T>>, SubscriptionEvent<T>),
    /// A debounce window elapsed; deliver whatever is buffered.
    Flush(Arc<ConsumerRegistration<T>>),
}

struct DispatchQueue<T> {
    jobs: VecDeque<DispatchJob<T>>,
    draining: bool,
}

/// Per-manager delivery queue.
pub struct Dispatcher<T> {
    scheduler: Arc<dyn Scheduler>,
    warn_depth: usize,
    queue: Mutex<DispatchQueue<T>>,
    weak_self: Weak<Dispatcher<T>>,
    delivered: AtomicU64,
    panicked: AtomicU64,
}

impl<T: Clone + Send + Sync + 'static> Dispatcher<T> {
    pub fn new(scheduler: Arc<dyn Scheduler>, warn_depth: usize) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            scheduler,
            warn_depth,
            queue: Mutex::new(DispatchQueue {
                jobs: VecDeque::new(),
                draining: false,
            }),
            weak_self: weak_self.clone(),
            delivered: AtomicU64::new(0),
            panicked: AtomicU64::new(0),
        })
    }

    fn lock(&self) -> MutexGuard<'_, DispatchQueue<T>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn enqueue(&self, job: DispatchJob<T>) {
        let mut queue = self.lock();
        queue.jobs.push_back(job);
        if queue.jobs.len() == self.warn_depth.saturating_add(1) {
            warn!(
                depth = queue.jobs.len(),
                threshold = self.warn_depth,
                "Dispatch queue is backing up"
            );
        }
    }

    /// Queue `event` for every active consumer, in registration order.
    pub fn broadcast(&self, consumers: &[Arc<ConsumerRegistration<T>>], event: SubscriptionEvent<T>) {
        let mut queue = self.lock();
        for consumer in consumers.iter().filter(|c| c.is_active()) {
            queue
                .jobs
                .push_back(DispatchJob::Deliver(Arc::clone(consumer), event.clone()));
        }
    }

    /// Run queued jobs until the queue is empty, unless another drain is
    /// already in progress.
    pub fn drain(&self) {
        {
            let mut queue = self.lock();
            if queue.draining {
                return;
            }
            queue.draining = true;
        }

        loop {
            let job = {
                let mut queue = self.lock();
                match queue.jobs.pop_front() {
                    Some(job) => job,
                    None => {
                        queue.draining = false;
                        return;
                    }
                }
            };
            self.run(job);
        }
    }

    /// Drop every queued job.
    pub fn clear(&self) -> usize {
        let mut queue = self.lock();
        let dropped = queue.jobs.len();
        queue.jobs.clear();
        dropped
    }

    pub fn depth(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn panicked(&self) -> u64 {
        self.panicked.load(Ordering::Relaxed)
    }

    /// Approximate heap usage of queued jobs, in bytes.
    pub fn approximate_bytes(&self) -> usize {
        self.lock().jobs.capacity() * std::mem::size_of::<DispatchJob<T>>()
    }

    fn run(&self, job: DispatchJob<T>) {
        match job {
            DispatchJob::Deliver(consumer, event) => {
                if !consumer.is_active() {
                    return;
                }
                match consumer.debouncer().offer(event, self.scheduler.now()) {
                    Offer::Deliver(event) => self.invoke(&consumer, event),
                    Offer::FlushThenDeliver(pending, event) => {
                        self.invoke(&consumer, pending);
                        self.invoke(&consumer, event);
                    }
                    Offer::ArmFlush(delay) => self.arm_flush(consumer, delay),
                    Offer::Coalesced | Offer::Dropped => {}
                }
            }
            DispatchJob::Flush(consumer) => {
                if !consumer.is_active() {
                    return;
                }
                if let Some(event) = consumer.debouncer().take_pending(self.scheduler.now()) {
                    self.invoke(&consumer, event);
                }
            }
        }
    }

    fn arm_flush(&self, consumer: Arc<ConsumerRegistration<T>>, delay: std::time::Duration) {
        let dispatcher = self.weak_self.clone();
        let target = Arc::clone(&consumer);
        let timer = self.scheduler.after(
            delay,
            Box::new(move || {
                if let Some(dispatcher) = dispatcher.upgrade() {
                    dispatcher.enqueue(DispatchJob::Flush(target));
                    dispatcher.drain();
                }
            }),
        );
        consumer.debouncer().attach_timer(timer);
    }

    fn invoke(&self, consumer: &ConsumerRegistration<T>, event: SubscriptionEvent<T>) {
        if !consumer.is_active() {
            return;
        }
        let kind = event.kind();
        match catch_unwind(AssertUnwindSafe(|| consumer.invoke(event))) {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.panicked.fetch_add(1, Ordering::Relaxed);
                error!(
                    key = %consumer.key(),
                    consumer = %consumer.id(),
                    event = kind,
                    "Consumer callback panicked"
                );
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use jobwatch_core::CachedSnapshot;
    use jobwatch_test_utils::fixtures::job_key;
    use jobwatch_test_utils::{EventRecorder, ManualScheduler};
    use std::time::Duration;

    fn consumer(
        recorder: &EventRecorder<u32>,
        debounce: Duration,
    ) -> Arc<ConsumerRegistration<u32>> {
        Arc::new(ConsumerRegistration::new(
            job_key("J1"),
            Arc::new(recorder.callback()),
            debounce,
            None,
        ))
    }

    fn value(n: u32) -> SubscriptionEvent<u32> {
        SubscriptionEvent::Value(Arc::new(CachedSnapshot::new(n)))
    }

    #[test]
    fn test_broadcast_preserves_order() {
        let clock = ManualScheduler::shared();
        let dispatcher = Dispatcher::new(clock, 16);
        let a = EventRecorder::new();
        let b = EventRecorder::new();
        let consumers = vec![consumer(&a, Duration::ZERO), consumer(&b, Duration::ZERO)];

        dispatcher.broadcast(&consumers, value(1));
        dispatcher.broadcast(&consumers, value(2));
        assert_eq!(dispatcher.depth(), 4);
        dispatcher.drain();

        assert_eq!(a.values(), vec![1, 2]);
        assert_eq!(b.values(), vec![1, 2]);
        assert_eq!(dispatcher.delivered(), 4);
    }

    #[test]
    fn test_inactive_consumer_skipped() {
        let clock = ManualScheduler::shared();
        let dispatcher = Dispatcher::new(clock, 16);
        let recorder = EventRecorder::new();
        let target = consumer(&recorder, Duration::ZERO);

        dispatcher.enqueue(DispatchJob::Deliver(target.clone(), value(1)));
        target.deactivate();
        dispatcher.drain();
        assert_eq!(recorder.count(), 0);
    }

    #[test]
    fn test_debounced_flush_through_scheduler() {
        let clock = ManualScheduler::shared();
        let dispatcher = Dispatcher::new(clock.clone(), 16);
        let recorder = EventRecorder::new();
        let target = consumer(&recorder, Duration::from_millis(100));
        let consumers = vec![target];

        for n in 1..=4 {
            dispatcher.broadcast(&consumers, value(n));
            dispatcher.drain();
            clock.advance(Duration::from_millis(10));
        }
        assert_eq!(recorder.values(), vec![1]);

        clock.advance(Duration::from_millis(100));
        assert_eq!(recorder.values(), vec![1, 4]);
    }

    #[test]
    fn test_not_found_inside_window_is_delivered() {
        let clock = ManualScheduler::shared();
        let dispatcher = Dispatcher::new(clock.clone(), 16);
        let recorder = EventRecorder::new();
        let consumers = vec![consumer(&recorder, Duration::from_millis(100))];

        dispatcher.broadcast(&consumers, value(1));
        dispatcher.drain();
        clock.advance(Duration::from_millis(10));
        dispatcher.broadcast(&consumers, value(2));
        dispatcher.broadcast(&consumers, SubscriptionEvent::NotFound);
        dispatcher.drain();
        clock.advance(Duration::from_millis(10));
        dispatcher.broadcast(&consumers, value(3));
        dispatcher.drain();
        assert_eq!(recorder.kinds(), vec!["value", "value", "not_found"]);

        clock.advance(Duration::from_millis(200));
        assert_eq!(recorder.kinds(), vec!["value", "value", "not_found", "value"]);
        assert_eq!(recorder.values(), vec![1, 2, 3]);
        assert_eq!(clock.pending_timers(), 0);
    }

    #[test]
    fn test_panicking_callback_does_not_stall() {
        let clock = ManualScheduler::shared();
        let dispatcher = Dispatcher::new(clock, 16);
        let panicky = Arc::new(ConsumerRegistration::new(
            job_key("J1"),
            Arc::new(|_: SubscriptionEvent<u32>| panic!("consumer bug")),
            Duration::ZERO,
            None,
        ));
        let recorder = EventRecorder::new();
        let healthy = consumer(&recorder, Duration::ZERO);

        dispatcher.broadcast(&[panicky, healthy], value(9));
        dispatcher.drain();

        assert_eq!(recorder.values(), vec![9]);
        assert_eq!(dispatcher.panicked(), 1);
    }

    #[test]
    fn test_reentrant_drain_keeps_fifo() {
        let clock = ManualScheduler::shared();
        let dispatcher = Dispatcher::new(clock, 16);
        let recorder = EventRecorder::new();
        let sink = consumer(&recorder, Duration::ZERO);

        let inner = Arc::downgrade(&dispatcher);
        let follow_up = Arc::clone(&sink);
        let trigger = Arc::new(ConsumerRegistration::new(
            job_key("J1"),
            Arc::new(move |_: SubscriptionEvent<u32>| {
                if let Some(dispatcher) = inner.upgrade() {
                    dispatcher.enqueue(DispatchJob::Deliver(follow_up.clone(), value(2)));
                    dispatcher.drain();
                }
            }),
            Duration::ZERO,
            None,
        ));

        dispatcher.enqueue(DispatchJob::Deliver(trigger, value(0)));
        dispatcher.enqueue(DispatchJob::Deliver(sink, value(1)));
        dispatcher.drain();

        assert_eq!(recorder.values(), vec![1, 2]);
        assert_eq!(dispatcher.depth(), 0);
    }
}
