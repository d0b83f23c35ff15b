//! In-memory job store implementing both backend capabilities.
//!
//! Not intended for production use. It backs the simulator binary and the
//! test suites: values are published by hand, failures are injected on
//! demand, and listener bookkeeping is exposed so tests can assert that at
//! most one underlying listener per key is ever open.

use crate::error::TransportError;
use crate::transport::{ListenerHandle, LiveTransport, SnapshotFetcher, StreamSink};
use crate::ResourceKey;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

struct StoreState<T> {
    documents: HashMap<ResourceKey, T>,
    listeners: HashMap<ResourceKey, Vec<(u64, StreamSink<T>)>>,
    next_listener_id: u64,
    opens: HashMap<ResourceKey, usize>,
    peak_open: HashMap<ResourceKey, usize>,
    failing_opens: HashMap<ResourceKey, u32>,
    fetch_failure: Option<TransportError>,
    fetches: usize,
}

/// Shared in-memory document store with live listeners.
pub struct InMemoryJobStore<T> {
    state: Arc<Mutex<StoreState<T>>>,
}

impl<T> Clone for InMemoryJobStore<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> Default for InMemoryJobStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> InMemoryJobStore<T> {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState {
                documents: HashMap::new(),
                listeners: HashMap::new(),
                next_listener_id: 0,
                opens: HashMap::new(),
                peak_open: HashMap::new(),
                failing_opens: HashMap::new(),
                fetch_failure: None,
                fetches: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Listeners currently open for `key`.
    pub fn open_listeners(&self, key: &ResourceKey) -> usize {
        self.lock().listeners.get(key).map_or(0, Vec::len)
    }

    /// Listeners ever opened for `key`.
    pub fn total_opens(&self, key: &ResourceKey) -> usize {
        self.lock().opens.get(key).copied().unwrap_or(0)
    }

    /// Highest number of simultaneously open listeners seen for `key`.
    pub fn peak_open_listeners(&self, key: &ResourceKey) -> usize {
        self.lock().peak_open.get(key).copied().unwrap_or(0)
    }

    /// One-shot fetches served so far.
    pub fn fetch_count(&self) -> usize {
        self.lock().fetches
    }

    /// Make the next `count` calls to `open` for `key` fail.
    pub fn fail_next_opens(&self, key: &ResourceKey, count: u32) {
        self.lock().failing_opens.insert(key.clone(), count);
    }

    /// Make every `fetch_once` fail with `error` until cleared with `None`.
    pub fn set_fetch_failure(&self, error: Option<TransportError>) {
        self.lock().fetch_failure = error;
    }

    /// Report `error` to every listener on `key` and detach them, the way a
    /// dropped backend connection would.
    pub fn break_listeners(&self, key: &ResourceKey, error: TransportError) {
        let sinks = self.lock().listeners.remove(key).unwrap_or_default();
        for (_, sink) in sinks {
            sink.on_error(error.clone());
        }
    }
}

impl<T: Clone> InMemoryJobStore<T> {
    /// Store a value and push it to every open listener on `key`.
    pub fn publish(&self, key: &ResourceKey, value: T) {
        let sinks = {
            let mut state = self.lock();
            state.documents.insert(key.clone(), value.clone());
            Self::sinks_for(&state, key)
        };
        for sink in sinks {
            sink.on_update(Some(value.clone()));
        }
    }

    /// Store a value without notifying listeners (visible to fetches only).
    pub fn put_silently(&self, key: &ResourceKey, value: T) {
        self.lock().documents.insert(key.clone(), value);
    }

    /// Delete the value and tell listeners the resource is gone.
    pub fn remove(&self, key: &ResourceKey) {
        let sinks = {
            let mut state = self.lock();
            state.documents.remove(key);
            Self::sinks_for(&state, key)
        };
        for sink in sinks {
            sink.on_update(None);
        }
    }

    pub fn get(&self, key: &ResourceKey) -> Option<T> {
        self.lock().documents.get(key).cloned()
    }

    fn sinks_for(state: &StoreState<T>, key: &ResourceKey) -> Vec<StreamSink<T>> {
        state
            .listeners
            .get(key)
            .map(|sinks| sinks.iter().map(|(_, sink)| Arc::clone(sink)).collect())
            .unwrap_or_default()
    }
}

impl<T> LiveTransport<T> for InMemoryJobStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn open(
        &self,
        key: &ResourceKey,
        sink: StreamSink<T>,
    ) -> Result<ListenerHandle, TransportError> {
        let (listener_id, initial) = {
            let mut state = self.lock();
            if let Some(remaining) = state.failing_opens.get_mut(key) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(TransportError::unavailable(format!(
                        "injected open failure for {}",
                        key
                    )));
                }
            }

            let listener_id = state.next_listener_id;
            state.next_listener_id += 1;
            let open_now = {
                let sinks = state.listeners.entry(key.clone()).or_default();
                sinks.push((listener_id, Arc::clone(&sink)));
                sinks.len()
            };
            *state.opens.entry(key.clone()).or_insert(0) += 1;
            let peak = state.peak_open.entry(key.clone()).or_insert(0);
            *peak = (*peak).max(open_now);

            (listener_id, state.documents.get(key).cloned())
        };

        // Initial snapshot is pushed outside the lock, like a backend
        // delivering its first frame right after the listen call.
        if let Some(value) = initial {
            sink.on_update(Some(value));
        }

        let state = Arc::clone(&self.state);
        let key = key.clone();
        Ok(ListenerHandle::new(move || {
            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            let now_empty = match state.listeners.get_mut(&key) {
                Some(sinks) => {
                    sinks.retain(|(id, _)| *id != listener_id);
                    sinks.is_empty()
                }
                None => false,
            };
            if now_empty {
                state.listeners.remove(&key);
            }
        }))
    }
}

#[async_trait]
impl<T> SnapshotFetcher<T> for InMemoryJobStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn fetch_once(&self, key: &ResourceKey) -> Result<Option<T>, TransportError> {
        let mut state = self.lock();
        state.fetches += 1;
        if let Some(err) = &state.fetch_failure {
            return Err(err.clone());
        }
        Ok(state.documents.get(key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::UpdateSink;

    #[derive(Default)]
    struct Collect {
        seen: Mutex<Vec<Result<Option<String>, TransportError>>>,
    }

    impl UpdateSink<String> for Collect {
        fn on_update(&self, value: Option<String>) {
            self.seen.lock().unwrap().push(Ok(value));
        }

        fn on_error(&self, error: TransportError) {
            self.seen.lock().unwrap().push(Err(error));
        }
    }

    fn key() -> ResourceKey {
        ResourceKey::new("jobs/J1").unwrap()
    }

    #[test]
    fn test_open_emits_existing_value() {
        let store = InMemoryJobStore::new();
        store.publish(&key(), "processing".to_string());

        let sink = Arc::new(Collect::default());
        let _handle = store.open(&key(), sink.clone()).unwrap();

        let seen = sink.seen.lock().unwrap();
        assert_eq!(seen.as_slice(), &[Ok(Some("processing".to_string()))]);
    }

    #[test]
    fn test_publish_and_remove_reach_listeners() {
        let store = InMemoryJobStore::new();
        let sink = Arc::new(Collect::default());
        let handle = store.open(&key(), sink.clone()).unwrap();

        store.publish(&key(), "completed".to_string());
        store.remove(&key());
        assert_eq!(store.open_listeners(&key()), 1);

        handle.close();
        assert_eq!(store.open_listeners(&key()), 0);
        store.publish(&key(), "ignored".to_string());

        let seen = sink.seen.lock().unwrap();
        assert_eq!(
            seen.as_slice(),
            &[Ok(Some("completed".to_string())), Ok(None)]
        );
    }

    #[test]
    fn test_injected_open_failures() {
        let store: InMemoryJobStore<String> = InMemoryJobStore::new();
        store.fail_next_opens(&key(), 1);

        let sink = Arc::new(Collect::default());
        assert!(store.open(&key(), sink.clone()).is_err());
        assert!(store.open(&key(), sink).is_ok());
        assert_eq!(store.total_opens(&key()), 1);
    }

    #[test]
    fn test_break_listeners_detaches() {
        let store: InMemoryJobStore<String> = InMemoryJobStore::new();
        let sink = Arc::new(Collect::default());
        let _handle = store.open(&key(), sink.clone()).unwrap();

        store.break_listeners(&key(), TransportError::disconnected("reset"));
        assert_eq!(store.open_listeners(&key()), 0);
        assert_eq!(store.peak_open_listeners(&key()), 1);
        assert!(sink.seen.lock().unwrap()[0].is_err());
    }

    #[tokio::test]
    async fn test_fetch_once() {
        let store: InMemoryJobStore<u32> = InMemoryJobStore::new();
        assert_eq!(store.fetch_once(&key()).await.unwrap(), None);

        store.put_silently(&key(), 7u32);
        assert_eq!(store.fetch_once(&key()).await.unwrap(), Some(7));

        store.set_fetch_failure(Some(TransportError::Closed));
        assert_eq!(store.fetch_once(&key()).await, Err(TransportError::Closed));
        assert_eq!(store.fetch_count(), 3);
    }
}
