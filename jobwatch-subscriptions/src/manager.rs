//! The subscription manager.
//!
//! One instance is constructed at application start and injected into
//! every consumer. It opens at most one underlying listener per key, fans
//! accepted updates out to all consumers of that key, and reclaims
//! listeners a grace period after the last consumer leaves.
//!
//! # Locking
//!
//! All registry mutations happen under a single mutex. The rules that keep
//! it deadlock-free under reentrant callbacks:
//!
//! - consumer callbacks run from the dispatcher with no lock held;
//! - `LiveTransport::open` is called with no lock held (it may emit
//!   synchronously); the entry is marked `CONNECTING` under a new
//!   generation beforehand so no second open can start for the key;
//! - listener handles are closed while the lock is held, which the
//!   transport contract allows because closing never calls back.
//!
//! Timer tasks hold only a weak reference to the manager, so dropping the
//! last [`SubscriptionManager`] clone tears everything down.

use crate::cleanup::CleanupScheduler;
use crate::dispatch::{DispatchJob, Dispatcher};
use crate::rate_limiter::RateLimiter;
use crate::registry::{Callback, ConsumerRegistration, SubscriptionRegistry};
use crate::stats::{EntryStatus, MemoryStats, StatsCollector, SubscriptionStats};
use crate::subscription::{SubscribeOptions, Subscription, UnsubscribeHandle};
use jobwatch_core::{
    CachedSnapshot, ConfigError, ConsumerId, EntryState, LiveTransport, ManagerConfig,
    ResourceKey, Scheduler, SnapshotFetcher, StreamSink, SubscriptionError, SubscriptionEvent,
    TimerHandle, TokioScheduler, TransportError, UpdateSink, WatchResult,
};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, error, info, warn};

// ============================================================================
// BUILDER
// ============================================================================

/// Assembles a [`SubscriptionManager`] from its injected collaborators.
pub struct ManagerBuilder<T> {
    config: ManagerConfig,
    transport: Option<Arc<dyn LiveTransport<T>>>,
    fetcher: Option<Arc<dyn SnapshotFetcher<T>>>,
    scheduler: Option<Arc<dyn Scheduler>>,
}

impl<T> ManagerBuilder<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            config,
            transport: None,
            fetcher: None,
            scheduler: None,
        }
    }

    /// Required live transport capability.
    pub fn transport(mut self, transport: Arc<dyn LiveTransport<T>>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Optional one-shot fetch capability for `force_refresh` and degraded
    /// polling.
    pub fn fetcher(mut self, fetcher: Arc<dyn SnapshotFetcher<T>>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Clock and timers. Defaults to [`TokioScheduler::current`].
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn build(self) -> Result<SubscriptionManager<T>, ConfigError> {
        self.config.validate()?;
        let transport = self.transport.ok_or_else(|| ConfigError::MissingRequired {
            field: "transport".to_string(),
        })?;
        let scheduler: Arc<dyn Scheduler> = match self.scheduler {
            Some(scheduler) => scheduler,
            None => Arc::new(TokioScheduler::current()?),
        };

        let config = self.config;
        let inner = Arc::new_cyclic(|weak_self| ManagerInner {
            rate_limiter: RateLimiter::new(config.rate_limit.clone(), Arc::clone(&scheduler)),
            cleanup: CleanupScheduler::new(config.grace_period(), Arc::clone(&scheduler)),
            dispatcher: Dispatcher::new(Arc::clone(&scheduler), config.dispatch_warn_depth),
            registry: Mutex::new(SubscriptionRegistry::new()),
            shut_down: AtomicBool::new(false),
            weak_self: weak_self.clone(),
            transport,
            fetcher: self.fetcher,
            scheduler,
            config,
        });

        info!(
            grace_period_ms = inner.config.grace_period_ms,
            debounce_ms = inner.config.debounce_ms,
            rate_limit_max = inner.config.rate_limit.max_attempts,
            fetch_fallback = inner.fetcher.is_some(),
            "Subscription manager initialized"
        );
        Ok(SubscriptionManager { inner })
    }
}

// ============================================================================
// MANAGER
// ============================================================================

/// Reference-counted, deduplicating subscription manager.
///
/// Cheap to clone; clones share one registry.
pub struct SubscriptionManager<T> {
    inner: Arc<ManagerInner<T>>,
}

impl<T> Clone for SubscriptionManager<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for SubscriptionManager<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("config", &self.inner.config)
            .field("shut_down", &self.inner.is_shut_down())
            .finish_non_exhaustive()
    }
}

impl<T> SubscriptionManager<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn builder(config: ManagerConfig) -> ManagerBuilder<T> {
        ManagerBuilder::new(config)
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.inner.rate_limiter
    }

    /// Register `callback` for updates on `key`.
    ///
    /// An admitted consumer immediately receives the cached snapshot, if one
    /// exists, ahead of any later live update. A denied call invokes the
    /// callback exactly once before returning (cached snapshot or
    /// [`SubscriptionError::RateLimited`]) and registers nothing.
    ///
    /// Invalid keys fail with [`SubscriptionError::InvalidConfig`].
    pub fn subscribe<F>(
        &self,
        key: impl AsRef<str>,
        callback: F,
        options: SubscribeOptions,
    ) -> WatchResult<Subscription>
    where
        F: Fn(SubscriptionEvent<T>) + Send + Sync + 'static,
    {
        let key = ResourceKey::new(key)?;
        self.inner.subscribe(key, Arc::new(callback), options)
    }

    /// Fetch the current value once, update the cache and broadcast it to
    /// every consumer of `key`, whatever state the listener is in.
    ///
    /// Not subject to rate limiting. Fails with
    /// [`SubscriptionError::FetchUnavailable`] when no fetch capability was
    /// configured and with [`SubscriptionError::NotFound`] when the
    /// resource is absent (consumers receive `NotFound` as well).
    pub async fn force_refresh(
        &self,
        key: impl AsRef<str>,
    ) -> WatchResult<Arc<CachedSnapshot<T>>> {
        let key = ResourceKey::new(key)?;
        self.inner.force_refresh(key).await
    }

    /// True iff at least one consumer is registered for `key`.
    pub fn has_active_subscribers(&self, key: impl AsRef<str>) -> bool {
        ResourceKey::new(key)
            .map(|key| self.inner.lock_registry().consumer_count(&key) > 0)
            .unwrap_or(false)
    }

    /// State of one entry, if it exists.
    pub fn entry_status(&self, key: impl AsRef<str>) -> Option<EntryStatus> {
        let key = ResourceKey::new(key).ok()?;
        let registry = self.inner.lock_registry();
        self.inner.collector(&registry).entry_status(&key)
    }

    pub fn stats(&self) -> SubscriptionStats {
        let registry = self.inner.lock_registry();
        self.inner.collector(&registry).subscription_stats()
    }

    pub fn memory_stats(&self) -> MemoryStats {
        let registry = self.inner.lock_registry();
        self.inner.collector(&registry).memory_stats()
    }

    /// Close every listener, cancel every timer and clear the registry.
    /// The manager stays usable afterwards.
    pub fn cleanup(&self) {
        self.inner.cleanup();
    }

    /// [`SubscriptionManager::cleanup`], then reject every later
    /// `subscribe` with [`SubscriptionError::ShutDown`].
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.cleanup();
        info!("Subscription manager shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.is_shut_down()
    }
}

// ============================================================================
// INTERNALS
// ============================================================================

struct ManagerInner<T> {
    config: ManagerConfig,
    transport: Arc<dyn LiveTransport<T>>,
    fetcher: Option<Arc<dyn SnapshotFetcher<T>>>,
    scheduler: Arc<dyn Scheduler>,
    registry: Mutex<SubscriptionRegistry<T>>,
    rate_limiter: RateLimiter,
    cleanup: CleanupScheduler,
    dispatcher: Arc<Dispatcher<T>>,
    shut_down: AtomicBool,
    weak_self: Weak<ManagerInner<T>>,
}

impl<T> ManagerInner<T> {
    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn lock_registry(&self) -> MutexGuard<'_, SubscriptionRegistry<T>> {
        self.registry.lock().unwrap_or_else(|poisoned| {
            warn!("Registry lock was poisoned, recovering");
            PoisonError::into_inner(poisoned)
        })
    }
}

impl<T> ManagerInner<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn collector<'a>(&'a self, registry: &'a SubscriptionRegistry<T>) -> StatsCollector<'a, T> {
        StatsCollector::new(
            registry,
            &self.cleanup,
            &self.rate_limiter,
            &self.dispatcher,
            self.is_shut_down(),
        )
    }

    // ------------------------------------------------------------------------
    // subscribe / unsubscribe
    // ------------------------------------------------------------------------

    fn subscribe(
        &self,
        key: ResourceKey,
        callback: Callback<T>,
        options: SubscribeOptions,
    ) -> WatchResult<Subscription> {
        if self.is_shut_down() {
            return Err(SubscriptionError::ShutDown);
        }

        let mut registry = self.lock_registry();

        if !self.rate_limiter.is_allowed(&key) {
            let retry_after = self.rate_limiter.time_until_reset(&key);
            let cached = registry.get(&key).and_then(|entry| entry.cached_event());
            drop(registry);

            warn!(
                key = %key,
                retry_after_ms = retry_after.as_millis() as u64,
                served_cache = cached.is_some(),
                "Subscription denied by rate limiter"
            );
            let event = cached.unwrap_or_else(|| {
                SubscriptionEvent::Error(SubscriptionError::RateLimited {
                    key: key.clone(),
                    retry_after,
                })
            });
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                error!(key = %key, "Consumer callback panicked");
            }
            return Ok(Subscription::rate_limited(key, retry_after));
        }
        self.rate_limiter.record_request(&key, true);

        let debounce = options.debounce.unwrap_or_else(|| self.config.debounce());
        let max_retries = options.max_retries.unwrap_or(self.config.retry.max_retries);
        let registration = Arc::new(ConsumerRegistration::new(
            key.clone(),
            callback,
            debounce,
            options.tag,
        ));
        let consumer_id = registration.id();

        let reused = self.cleanup.cancel(&key);
        let (entry, created) = registry.get_or_create(&key, max_retries);
        if created {
            debug!(key = %key, "Created subscription entry");
        } else if reused {
            debug!(key = %key, state = %entry.state, "Reusing entry within grace period");
        }
        entry.add_consumer(Arc::clone(&registration));
        let consumers = entry.consumer_count();
        if let Some(event) = entry.cached_event() {
            self.dispatcher
                .enqueue(DispatchJob::Deliver(Arc::clone(&registration), event));
        }
        let needs_listener = entry.state.needs_listener();
        if needs_listener {
            entry.retry_count = 0;
        }
        let generation = if needs_listener {
            registry.begin_connect(&key)
        } else {
            None
        };
        drop(registry);

        debug!(key = %key, consumer = %consumer_id, consumers, "Consumer subscribed");

        if let Some(generation) = generation {
            self.open_listener(&key, generation);
        }
        self.dispatcher.drain();

        let weak = self.weak_self.clone();
        let detach_key = key.clone();
        let handle = UnsubscribeHandle::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.unsubscribe(&detach_key, consumer_id);
            }
        });
        Ok(Subscription::admitted(key, consumer_id, handle))
    }

    fn unsubscribe(&self, key: &ResourceKey, consumer_id: ConsumerId) {
        let mut registry = self.lock_registry();
        let Some(entry) = registry.get_mut(key) else {
            return;
        };
        let Some(registration) = entry.remove_consumer(consumer_id) else {
            return;
        };
        registration.deactivate();
        let remaining = entry.consumer_count();
        debug!(key = %key, consumer = %consumer_id, remaining, "Consumer unsubscribed");

        if remaining == 0 {
            let weak = self.weak_self.clone();
            let expire_key = key.clone();
            self.cleanup.schedule(key, move |token| {
                if let Some(inner) = weak.upgrade() {
                    inner.expire_entry(&expire_key, token);
                }
            });
            debug!(
                key = %key,
                grace_ms = self.cleanup.grace().as_millis() as u64,
                "Last consumer left, grace period started"
            );
        }
    }

    fn expire_entry(&self, key: &ResourceKey, token: u64) {
        let mut registry = self.lock_registry();
        if !self.cleanup.complete(key, token) {
            return;
        }
        if registry.consumer_count(key) > 0 {
            return;
        }
        if let Some(mut entry) = registry.remove(key) {
            entry.state = EntryState::Closed;
            entry.cancel_timers();
            let closed = entry.close_listener();
            info!(key = %key, listener_closed = closed, "Subscription entry closed after grace period");
        }
    }

    // ------------------------------------------------------------------------
    // listener lifecycle
    // ------------------------------------------------------------------------

    fn open_listener(&self, key: &ResourceKey, generation: u64) {
        let sink: StreamSink<T> = Arc::new(ListenerSink {
            manager: self.weak_self.clone(),
            key: key.clone(),
            generation,
        });

        info!(key = %key, generation, "Opening listener");
        match self.transport.open(key, sink) {
            Ok(handle) => {
                let superseded = self.lock_registry().attach_listener(key, generation, handle);
                if let Err(handle) = superseded {
                    debug!(key = %key, generation, "Discarding superseded listener");
                    handle.close();
                }
            }
            Err(err) => self.on_transport_error(key, generation, err),
        }
        self.dispatcher.drain();
    }

    fn on_update(&self, key: &ResourceKey, generation: u64, value: Option<T>) {
        let mut registry = self.lock_registry();
        let Some(entry) = registry.get_mut(key) else {
            return;
        };
        if entry.generation != generation || !entry.state.accepts_updates() {
            debug!(key = %key, generation, state = %entry.state, "Ignoring update from stale listener");
            return;
        }

        if entry.retry_count > 0 {
            self.rate_limiter.record_request(key, true);
            info!(key = %key, attempts = entry.retry_count, "Listener recovered");
            entry.retry_count = 0;
            entry.last_error = None;
        }
        entry.state = EntryState::Live;
        let event = entry.accept(value);
        self.dispatcher.broadcast(&entry.consumers, event);
        drop(registry);

        self.dispatcher.drain();
    }

    fn on_transport_error(&self, key: &ResourceKey, generation: u64, err: TransportError) {
        let mut registry = self.lock_registry();
        let Some(entry) = registry.get_mut(key) else {
            return;
        };
        if entry.generation != generation || !entry.state.accepts_updates() {
            debug!(key = %key, generation, error = %err, "Ignoring error from stale listener");
            return;
        }

        self.rate_limiter.record_request(key, false);
        entry.close_listener();
        entry.retry_count += 1;
        entry.last_error = Some(err.to_string());
        let attempt = entry.retry_count;

        if attempt <= entry.max_retries {
            let delay = self.config.retry.delay_for(attempt);
            entry.state = EntryState::Retrying;
            warn!(
                key = %key,
                attempt,
                max_retries = entry.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Listener failed, scheduling retry"
            );
            self.dispatcher
                .broadcast(&entry.consumers, SubscriptionEvent::Retrying { attempt, delay });

            let weak = self.weak_self.clone();
            let retry_key = key.clone();
            entry.retry_timer = Some(self.scheduler.after(
                delay,
                Box::new(move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.retry(&retry_key, generation);
                    }
                }),
            ));
        } else {
            error!(
                key = %key,
                attempts = attempt,
                error = %err,
                fallback = self.fetcher.is_some(),
                "Listener retries exhausted"
            );
            let failure = SubscriptionError::Connection {
                key: key.clone(),
                attempts: attempt,
                reason: err.to_string(),
            };
            self.dispatcher
                .broadcast(&entry.consumers, SubscriptionEvent::Error(failure));

            if self.fetcher.is_some() {
                entry.state = EntryState::Degraded;
                warn!(
                    key = %key,
                    poll_interval_ms = self.config.poll_interval_ms,
                    "Entry degraded to polling"
                );
                entry.poll_timer = Some(self.schedule_poll(key, generation));
            } else {
                entry.state = EntryState::Failed;
            }
        }
        drop(registry);

        self.dispatcher.drain();
    }

    fn retry(&self, key: &ResourceKey, generation: u64) {
        let mut registry = self.lock_registry();
        let Some(entry) = registry.get_mut(key) else {
            return;
        };
        if entry.state != EntryState::Retrying || entry.generation != generation {
            return;
        }
        entry.retry_timer = None;
        let next = registry.begin_connect(key);
        drop(registry);

        if let Some(next) = next {
            debug!(key = %key, generation = next, "Retrying listener");
            self.open_listener(key, next);
        }
    }

    // ------------------------------------------------------------------------
    // degraded polling and forced refresh
    // ------------------------------------------------------------------------

    fn schedule_poll(&self, key: &ResourceKey, generation: u64) -> TimerHandle {
        let weak = self.weak_self.clone();
        let poll_key = key.clone();
        self.scheduler.after(
            self.config.poll_interval(),
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.poll(poll_key, generation);
                }
            }),
        )
    }

    fn poll(&self, key: ResourceKey, generation: u64) {
        let Some(fetcher) = self.fetcher.clone() else {
            return;
        };
        {
            let mut registry = self.lock_registry();
            let Some(entry) = registry.get_mut(&key) else {
                return;
            };
            if entry.state != EntryState::Degraded || entry.generation != generation {
                return;
            }
            entry.poll_timer = None;
        }

        let Some(inner) = self.weak_self.upgrade() else {
            return;
        };
        self.scheduler.spawn(Box::pin(async move {
            let result = fetcher.fetch_once(&key).await;
            inner.finish_poll(&key, generation, result);
        }));
    }

    fn finish_poll(
        &self,
        key: &ResourceKey,
        generation: u64,
        result: Result<Option<T>, TransportError>,
    ) {
        let mut registry = self.lock_registry();
        let Some(entry) = registry.get_mut(key) else {
            return;
        };
        if entry.state != EntryState::Degraded || entry.generation != generation {
            return;
        }

        match result {
            Ok(value) => {
                if let Some(event) = entry.accept_if_changed(value) {
                    debug!(key = %key, event = event.kind(), "Polled value changed");
                    self.dispatcher.broadcast(&entry.consumers, event);
                }
            }
            Err(err) => {
                warn!(key = %key, error = %err, "Degraded poll failed");
                entry.last_error = Some(err.to_string());
            }
        }
        entry.poll_timer = Some(self.schedule_poll(key, generation));
        drop(registry);

        self.dispatcher.drain();
    }

    async fn force_refresh(&self, key: ResourceKey) -> WatchResult<Arc<CachedSnapshot<T>>> {
        if self.is_shut_down() {
            return Err(SubscriptionError::ShutDown);
        }
        let fetcher = self
            .fetcher
            .clone()
            .ok_or_else(|| SubscriptionError::FetchUnavailable { key: key.clone() })?;

        let value = fetcher.fetch_once(&key).await.map_err(|err| {
            warn!(key = %key, error = %err, "Forced refresh failed");
            SubscriptionError::Connection {
                key: key.clone(),
                attempts: 1,
                reason: err.to_string(),
            }
        })?;

        let snapshot = {
            let mut registry = self.lock_registry();
            match registry.get_mut(&key) {
                Some(entry) => {
                    let event = entry.accept(value);
                    let snapshot = event.snapshot().cloned();
                    self.dispatcher.broadcast(&entry.consumers, event);
                    snapshot
                }
                None => value.map(|value| Arc::new(CachedSnapshot::new(value))),
            }
        };
        self.dispatcher.drain();

        debug!(key = %key, found = snapshot.is_some(), "Forced refresh completed");
        snapshot.ok_or(SubscriptionError::NotFound { key })
    }

    // ------------------------------------------------------------------------
    // teardown
    // ------------------------------------------------------------------------

    fn cleanup(&self) {
        let mut registry = self.lock_registry();
        let timers = self.cleanup.cancel_all();
        let mut entries = registry.drain_all();
        let mut listeners = 0usize;
        for entry in &mut entries {
            entry.release_consumers();
            entry.cancel_timers();
            entry.state = EntryState::Closed;
            if entry.close_listener() {
                listeners += 1;
            }
        }
        drop(registry);
        let dropped = self.dispatcher.clear();

        info!(
            entries = entries.len(),
            listeners,
            cleanup_timers = timers,
            dropped_events = dropped,
            "Subscription manager cleaned up"
        );
    }
}

// ============================================================================
// LISTENER SINK
// ============================================================================

/// Sink handed to the transport for one listener generation.
struct ListenerSink<T> {
    manager: Weak<ManagerInner<T>>,
    key: ResourceKey,
    generation: u64,
}

impl<T> UpdateSink<T> for ListenerSink<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn on_update(&self, value: Option<T>) {
        if let Some(manager) = self.manager.upgrade() {
            manager.on_update(&self.key, self.generation, value);
        }
    }

    fn on_error(&self, error: TransportError) {
        if let Some(manager) = self.manager.upgrade() {
            manager.on_transport_error(&self.key, self.generation, error);
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
