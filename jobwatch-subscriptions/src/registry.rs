//! In-memory map of resource key to subscription entry.
//!
//! An entry holds the single underlying listener for its key, the cached
//! snapshot, the registered consumers (in registration order) and the retry
//! state. The registry itself is not synchronised; the manager wraps it in
//! one coarse lock and performs every mutation as an atomic
//! read-modify-write under that lock.

use crate::debouncer::Debouncer;
use chrono::Utc;
use dashmap::DashMap;
use jobwatch_core::{
    CachedSnapshot, ConsumerId, EntryState, ListenerHandle, ResourceKey, SubscriptionEvent,
    TimerHandle, Timestamp,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Consumer callback. Invoked with no manager lock held.
pub type Callback<T> = Arc<dyn Fn(SubscriptionEvent<T>) + Send + Sync + 'static>;

// ============================================================================
// CONSUMER REGISTRATION
// ============================================================================

/// One logical subscriber and its callback.
pub struct ConsumerRegistration<T> {
    id: ConsumerId,
    key: ResourceKey,
    callback: Callback<T>,
    tag: Option<String>,
    registered_at: Timestamp,
    active: AtomicBool,
    debouncer: Debouncer<T>,
}

impl<T> ConsumerRegistration<T> {
    pub fn new(
        key: ResourceKey,
        callback: Callback<T>,
        debounce: Duration,
        tag: Option<String>,
    ) -> Self {
        Self {
            id: ConsumerId::new(),
            key,
            callback,
            tag,
            registered_at: Utc::now(),
            active: AtomicBool::new(true),
            debouncer: Debouncer::new(debounce),
        }
    }

    pub fn id(&self) -> ConsumerId {
        self.id
    }

    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn registered_at(&self) -> Timestamp {
        self.registered_at
    }

    pub fn debouncer(&self) -> &Debouncer<T> {
        &self.debouncer
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Stop all further deliveries. Returns true on the first call only.
    pub fn deactivate(&self) -> bool {
        let was_active = self.active.swap(false, Ordering::SeqCst);
        if was_active {
            self.debouncer.cancel();
        }
        was_active
    }

    pub fn invoke(&self, event: SubscriptionEvent<T>) {
        (self.callback)(event)
    }
}

impl<T> fmt::Debug for ConsumerRegistration<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerRegistration")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("tag", &self.tag)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// LISTENER LEDGER
// ============================================================================

/// Count of open listener handles per key, tracked apart from the entries.
///
/// Every handle the registry holds is wrapped in a [`TrackedListener`] that
/// registers here on creation and deregisters when closed, so a count above
/// one reveals a second live listener for the same key.
#[derive(Default)]
pub struct ListenerLedger {
    open: DashMap<ResourceKey, usize>,
}

impl ListenerLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_count(&self, key: &ResourceKey) -> usize {
        self.open.get(key).map(|count| *count).unwrap_or(0)
    }

    pub fn total_open(&self) -> usize {
        self.open.iter().map(|entry| *entry.value()).sum()
    }

    /// Keys with more than one open listener.
    pub fn anomalies(&self) -> Vec<(ResourceKey, usize)> {
        let mut found: Vec<_> = self
            .open
            .iter()
            .filter(|entry| *entry.value() > 1)
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        found.sort();
        found
    }

    fn opened(&self, key: &ResourceKey) {
        *self.open.entry(key.clone()).or_insert(0) += 1;
    }

    fn closed(&self, key: &ResourceKey) {
        self.open.remove_if_mut(key, |_, count| {
            *count = count.saturating_sub(1);
            *count == 0
        });
    }
}

/// A listener handle accounted for in the [`ListenerLedger`].
pub struct TrackedListener {
    key: ResourceKey,
    handle: Option<ListenerHandle>,
    ledger: Arc<ListenerLedger>,
}

impl TrackedListener {
    pub fn new(key: ResourceKey, handle: ListenerHandle, ledger: Arc<ListenerLedger>) -> Self {
        ledger.opened(&key);
        Self {
            key,
            handle: Some(handle),
            ledger,
        }
    }

    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.close();
            self.ledger.closed(&self.key);
        }
    }
}

impl Drop for TrackedListener {
    fn drop(&mut self) {
        self.release();
    }
}

// ============================================================================
// SUBSCRIPTION ENTRY
// ============================================================================

/// Shared state for one resource key.
pub struct SubscriptionEntry<T> {
    pub key: ResourceKey,
    pub listener: Option<TrackedListener>,
    /// Generation of the most recently requested listener. Callbacks from
    /// any other generation are ignored.
    pub generation: u64,
    pub snapshot: Option<Arc<CachedSnapshot<T>>>,
    /// The transport confirmed the resource absent and nothing replaced it.
    pub confirmed_absent: bool,
    pub consumers: Vec<Arc<ConsumerRegistration<T>>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub state: EntryState,
    pub created_at: Timestamp,
    pub retry_timer: Option<TimerHandle>,
    pub poll_timer: Option<TimerHandle>,
    pub last_error: Option<String>,
    pub updates_accepted: u64,
}

impl<T> SubscriptionEntry<T> {
    fn new(key: ResourceKey, max_retries: u32) -> Self {
        Self {
            key,
            listener: None,
            generation: 0,
            snapshot: None,
            confirmed_absent: false,
            consumers: Vec::new(),
            retry_count: 0,
            max_retries,
            state: EntryState::Init,
            created_at: Utc::now(),
            retry_timer: None,
            poll_timer: None,
            last_error: None,
            updates_accepted: 0,
        }
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    pub fn add_consumer(&mut self, registration: Arc<ConsumerRegistration<T>>) {
        self.consumers.push(registration);
    }

    pub fn remove_consumer(&mut self, id: ConsumerId) -> Option<Arc<ConsumerRegistration<T>>> {
        let index = self.consumers.iter().position(|c| c.id() == id)?;
        Some(self.consumers.remove(index))
    }

    /// Event replaying the cached snapshot to a newcomer, if any.
    pub fn cached_event(&self) -> Option<SubscriptionEvent<T>> {
        let snapshot = Arc::clone(self.snapshot.as_ref()?);
        if self.state.serves_stale() {
            Some(SubscriptionEvent::Stale(snapshot))
        } else {
            Some(SubscriptionEvent::Value(snapshot))
        }
    }

    /// Close the current listener, if one is attached.
    pub fn close_listener(&mut self) -> bool {
        match self.listener.take() {
            Some(listener) => {
                listener.close();
                true
            }
            None => false,
        }
    }

    pub fn cancel_timers(&mut self) {
        if let Some(timer) = self.retry_timer.take() {
            timer.cancel();
        }
        if let Some(timer) = self.poll_timer.take() {
            timer.cancel();
        }
    }

    /// Deactivate every consumer and forget them.
    pub fn release_consumers(&mut self) -> usize {
        let count = self.consumers.len();
        for consumer in self.consumers.drain(..) {
            consumer.deactivate();
        }
        count
    }

    pub fn timers_in_flight(&self) -> usize {
        usize::from(self.retry_timer.is_some()) + usize::from(self.poll_timer.is_some())
    }

    pub fn tags(&self) -> Vec<String> {
        self.consumers
            .iter()
            .filter_map(|c| c.tag().map(str::to_string))
            .collect()
    }
}

impl<T: PartialEq> SubscriptionEntry<T> {
    /// Install a live value or absence, always producing an event.
    pub fn accept(&mut self, value: Option<T>) -> SubscriptionEvent<T> {
        self.updates_accepted += 1;
        match value {
            Some(value) => {
                let snapshot = Arc::new(CachedSnapshot::new(value));
                self.snapshot = Some(Arc::clone(&snapshot));
                self.confirmed_absent = false;
                SubscriptionEvent::Value(snapshot)
            }
            None => {
                self.snapshot = None;
                self.confirmed_absent = true;
                SubscriptionEvent::NotFound
            }
        }
    }

    /// Install a polled value, producing an event only when it differs from
    /// what is cached.
    pub fn accept_if_changed(&mut self, value: Option<T>) -> Option<SubscriptionEvent<T>> {
        let unchanged = match (&value, &self.snapshot) {
            (Some(fresh), Some(cached)) => fresh == cached.value(),
            (None, None) => self.confirmed_absent,
            _ => false,
        };
        if unchanged {
            None
        } else {
            Some(self.accept(value))
        }
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

/// Map of key to entry, plus listener bookkeeping.
pub struct SubscriptionRegistry<T> {
    entries: HashMap<ResourceKey, SubscriptionEntry<T>>,
    ledger: Arc<ListenerLedger>,
    next_generation: u64,
}

impl<T> Default for SubscriptionRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SubscriptionRegistry<T> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            ledger: Arc::new(ListenerLedger::new()),
            next_generation: 1,
        }
    }

    pub fn ledger(&self) -> &Arc<ListenerLedger> {
        &self.ledger
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &ResourceKey) -> Option<&SubscriptionEntry<T>> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &ResourceKey) -> Option<&mut SubscriptionEntry<T>> {
        self.entries.get_mut(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SubscriptionEntry<T>> {
        self.entries.values()
    }

    /// Find the entry for `key` or create it in `INIT`. The boolean is true
    /// when the entry was created by this call.
    pub fn get_or_create(
        &mut self,
        key: &ResourceKey,
        max_retries: u32,
    ) -> (&mut SubscriptionEntry<T>, bool) {
        let mut created = false;
        let entry = self.entries.entry(key.clone()).or_insert_with(|| {
            created = true;
            SubscriptionEntry::new(key.clone(), max_retries)
        });
        entry.max_retries = entry.max_retries.max(max_retries);
        (entry, created)
    }

    /// Move the entry to `CONNECTING` under a fresh listener generation.
    pub fn begin_connect(&mut self, key: &ResourceKey) -> Option<u64> {
        let generation = self.next_generation;
        let entry = self.entries.get_mut(key)?;
        self.next_generation += 1;
        entry.generation = generation;
        entry.state = EntryState::Connecting;
        Some(generation)
    }

    /// Store a freshly opened listener if its generation is still current
    /// and the entry is still waiting on it. A listener that already
    /// reported an error (the entry moved on to `RETRYING`, `DEGRADED` or
    /// `FAILED`) or was superseded is handed back for the caller to close.
    pub fn attach_listener(
        &mut self,
        key: &ResourceKey,
        generation: u64,
        handle: ListenerHandle,
    ) -> Result<(), ListenerHandle> {
        let ledger = Arc::clone(&self.ledger);
        match self.entries.get_mut(key) {
            Some(entry)
                if entry.generation == generation
                    && entry.state.accepts_updates()
                    && entry.listener.is_none() =>
            {
                entry.listener = Some(TrackedListener::new(key.clone(), handle, ledger));
                Ok(())
            }
            _ => Err(handle),
        }
    }

    pub fn remove(&mut self, key: &ResourceKey) -> Option<SubscriptionEntry<T>> {
        self.entries.remove(key)
    }

    /// Remove every entry.
    pub fn drain_all(&mut self) -> Vec<SubscriptionEntry<T>> {
        self.entries.drain().map(|(_, entry)| entry).collect()
    }

    pub fn consumer_count(&self, key: &ResourceKey) -> usize {
        self.entries.get(key).map_or(0, SubscriptionEntry::consumer_count)
    }

    pub fn total_consumers(&self) -> usize {
        self.entries.values().map(SubscriptionEntry::consumer_count).sum()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use jobwatch_test_utils::fixtures::job_key;
    use std::sync::atomic::AtomicUsize;

    fn registration(key: &ResourceKey, tag: Option<&str>) -> Arc<ConsumerRegistration<u32>> {
        Arc::new(ConsumerRegistration::new(
            key.clone(),
            Arc::new(|_: SubscriptionEvent<u32>| {}),
            Duration::ZERO,
            tag.map(str::to_string),
        ))
    }

    fn counting_handle(closes: &Arc<AtomicUsize>) -> ListenerHandle {
        let closes = Arc::clone(closes);
        ListenerHandle::new(move || {
            closes.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_get_or_create_tracks_creation() {
        let mut registry: SubscriptionRegistry<u32> = SubscriptionRegistry::new();
        let key = job_key("J1");

        let (entry, created) = registry.get_or_create(&key, 2);
        assert!(created);
        assert_eq!(entry.state, EntryState::Init);

        let (entry, created) = registry.get_or_create(&key, 5);
        assert!(!created);
        assert_eq!(entry.max_retries, 5);

        let (entry, _) = registry.get_or_create(&key, 1);
        assert_eq!(entry.max_retries, 5);
    }

    #[test]
    fn test_consumers_keep_registration_order() {
        let mut registry: SubscriptionRegistry<u32> = SubscriptionRegistry::new();
        let key = job_key("J1");
        let (entry, _) = registry.get_or_create(&key, 0);

        let first = registration(&key, Some("header"));
        let second = registration(&key, None);
        let third = registration(&key, Some("panel"));
        entry.add_consumer(first.clone());
        entry.add_consumer(second.clone());
        entry.add_consumer(third.clone());

        let removed = entry.remove_consumer(second.id()).unwrap();
        assert_eq!(removed.id(), second.id());
        assert!(entry.remove_consumer(second.id()).is_none());

        let ids: Vec<_> = entry.consumers.iter().map(|c| c.id()).collect();
        assert_eq!(ids, vec![first.id(), third.id()]);
        assert_eq!(entry.tags(), vec!["header".to_string(), "panel".to_string()]);
        assert_eq!(registry.total_consumers(), 2);
    }

    #[test]
    fn test_stale_generation_listener_rejected() {
        let mut registry: SubscriptionRegistry<u32> = SubscriptionRegistry::new();
        let key = job_key("J1");
        registry.get_or_create(&key, 0);

        let old = registry.begin_connect(&key).unwrap();
        let current = registry.begin_connect(&key).unwrap();
        assert!(current > old);

        let closes = Arc::new(AtomicUsize::new(0));
        let rejected = registry
            .attach_listener(&key, old, counting_handle(&closes))
            .unwrap_err();
        rejected.close();
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        assert!(registry
            .attach_listener(&key, current, counting_handle(&closes))
            .is_ok());
        assert_eq!(registry.ledger().open_count(&key), 1);
        assert_eq!(registry.get(&key).unwrap().state, EntryState::Connecting);
    }

    #[test]
    fn test_listener_failed_before_attach_rejected() {
        let mut registry: SubscriptionRegistry<u32> = SubscriptionRegistry::new();
        let key = job_key("J1");
        registry.get_or_create(&key, 2);
        let generation = registry.begin_connect(&key).unwrap();

        // The error path ran before `open` returned.
        registry.get_mut(&key).unwrap().state = EntryState::Retrying;

        let closes = Arc::new(AtomicUsize::new(0));
        let rejected = registry
            .attach_listener(&key, generation, counting_handle(&closes))
            .unwrap_err();
        rejected.close();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(registry.get(&key).unwrap().listener.is_none());
        assert_eq!(registry.ledger().open_count(&key), 0);

        let retry = registry.begin_connect(&key).unwrap();
        assert!(registry
            .attach_listener(&key, retry, counting_handle(&closes))
            .is_ok());
        assert_eq!(registry.ledger().open_count(&key), 1);
    }

    #[test]
    fn test_ledger_follows_close() {
        let mut registry: SubscriptionRegistry<u32> = SubscriptionRegistry::new();
        let key = job_key("J1");
        registry.get_or_create(&key, 0);
        let generation = registry.begin_connect(&key).unwrap();

        let closes = Arc::new(AtomicUsize::new(0));
        registry
            .attach_listener(&key, generation, counting_handle(&closes))
            .unwrap();
        assert_eq!(registry.ledger().total_open(), 1);

        assert!(registry.get_mut(&key).unwrap().close_listener());
        assert!(!registry.get_mut(&key).unwrap().close_listener());
        assert_eq!(registry.ledger().total_open(), 0);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_ledger_reports_duplicates() {
        let ledger = Arc::new(ListenerLedger::new());
        let key = job_key("J1");
        let first = TrackedListener::new(key.clone(), ListenerHandle::noop(), ledger.clone());
        let second = TrackedListener::new(key.clone(), ListenerHandle::noop(), ledger.clone());

        assert_eq!(ledger.anomalies(), vec![(key.clone(), 2)]);
        drop(first);
        second.close();
        assert!(ledger.anomalies().is_empty());
        assert_eq!(ledger.open_count(&key), 0);
    }

    #[test]
    fn test_cached_event_marks_stale() {
        let mut registry: SubscriptionRegistry<u32> = SubscriptionRegistry::new();
        let key = job_key("J1");
        let (entry, _) = registry.get_or_create(&key, 0);
        assert!(entry.cached_event().is_none());

        entry.accept(Some(7));
        entry.state = EntryState::Live;
        assert!(matches!(entry.cached_event(), Some(SubscriptionEvent::Value(_))));

        entry.state = EntryState::Degraded;
        assert!(matches!(entry.cached_event(), Some(SubscriptionEvent::Stale(_))));
    }

    #[test]
    fn test_accept_if_changed() {
        let mut registry: SubscriptionRegistry<u32> = SubscriptionRegistry::new();
        let key = job_key("J1");
        let (entry, _) = registry.get_or_create(&key, 0);

        assert!(entry.accept_if_changed(Some(1)).is_some());
        assert!(entry.accept_if_changed(Some(1)).is_none());
        assert!(entry.accept_if_changed(None).unwrap().is_not_found());
        assert!(entry.accept_if_changed(None).is_none());
        assert!(entry.snapshot.is_none());
        assert_eq!(entry.updates_accepted, 2);
    }

    #[test]
    fn test_deactivate_once() {
        let key = job_key("J1");
        let consumer = registration(&key, None);
        assert!(consumer.deactivate());
        assert!(!consumer.deactivate());
        assert!(!consumer.is_active());
    }
}
