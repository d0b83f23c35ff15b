//! Consumer adapter over `tokio::sync::watch`.
//!
//! A [`JobWatcher`] is what a UI component holds between mount and
//! unmount: it subscribes on construction, folds every delivered event into
//! a [`WatchState`] (value, loading, error, not-found, stale, retry count),
//! and unsubscribes when dropped.

use crate::manager::SubscriptionManager;
use crate::subscription::{Admission, SubscribeOptions, Subscription};
use jobwatch_core::{CachedSnapshot, ResourceKey, SubscriptionError, SubscriptionEvent, WatchResult};
use std::sync::Arc;
use tokio::sync::watch;

/// Derived view state for one watched key.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchState<T> {
    pub snapshot: Option<Arc<CachedSnapshot<T>>>,
    /// Nothing delivered yet.
    pub loading: bool,
    pub error: Option<SubscriptionError>,
    pub not_found: bool,
    /// The snapshot is a cached value served while recovering.
    pub stale: bool,
    pub retry_count: u32,
}

impl<T> Default for WatchState<T> {
    fn default() -> Self {
        Self {
            snapshot: None,
            loading: true,
            error: None,
            not_found: false,
            stale: false,
            retry_count: 0,
        }
    }
}

impl<T> WatchState<T> {
    pub fn value(&self) -> Option<&T> {
        self.snapshot.as_ref().map(|s| s.value())
    }

    /// `StaleData` warning for `key` while the snapshot is a cached value
    /// served during recovery.
    pub fn stale_warning(&self, key: &ResourceKey) -> Option<SubscriptionError> {
        match &self.snapshot {
            Some(snapshot) if self.stale => Some(SubscriptionError::StaleData {
                key: key.clone(),
                age: snapshot.age(),
            }),
            _ => None,
        }
    }

    /// Fold one event into the state.
    pub fn apply(&mut self, event: SubscriptionEvent<T>) {
        self.loading = false;
        match event {
            SubscriptionEvent::Value(snapshot) => {
                self.snapshot = Some(snapshot);
                self.error = None;
                self.not_found = false;
                self.stale = false;
                self.retry_count = 0;
            }
            SubscriptionEvent::Stale(snapshot) => {
                self.snapshot = Some(snapshot);
                self.not_found = false;
                self.stale = true;
            }
            SubscriptionEvent::NotFound => {
                self.snapshot = None;
                self.error = None;
                self.not_found = true;
                self.stale = false;
            }
            SubscriptionEvent::Retrying { attempt, .. } => {
                self.retry_count = attempt;
                self.stale = self.snapshot.is_some();
            }
            SubscriptionEvent::Error(error) => {
                self.error = Some(error);
                self.stale = self.snapshot.is_some();
            }
        }
    }
}

/// Mount-to-unmount binding of one consumer to one key.
pub struct JobWatcher<T> {
    key: ResourceKey,
    receiver: watch::Receiver<WatchState<T>>,
    subscription: Subscription,
}

impl<T> JobWatcher<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Subscribe to `key` and start tracking its state.
    pub fn watch(
        manager: &SubscriptionManager<T>,
        key: impl AsRef<str>,
        options: SubscribeOptions,
    ) -> WatchResult<Self> {
        let (sender, receiver) = watch::channel(WatchState::default());
        let subscription = manager.subscribe(
            key,
            move |event| sender.send_modify(|state| state.apply(event)),
            options,
        )?;
        Ok(Self {
            key: subscription.key().clone(),
            receiver,
            subscription,
        })
    }

    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn admission(&self) -> Admission {
        self.subscription.admission()
    }

    /// Current state.
    pub fn state(&self) -> WatchState<T> {
        self.receiver.borrow().clone()
    }

    pub fn value(&self) -> Option<T> {
        self.receiver.borrow().value().cloned()
    }

    pub fn stale_warning(&self) -> Option<SubscriptionError> {
        self.receiver.borrow().stale_warning(&self.key)
    }

    /// Wait for the next state change.
    ///
    /// Fails with [`SubscriptionError::ShutDown`] once the registration is
    /// gone (unsubscribed, or the manager was cleaned up).
    pub async fn changed(&mut self) -> WatchResult<WatchState<T>> {
        self.receiver
            .changed()
            .await
            .map_err(|_| SubscriptionError::ShutDown)?;
        Ok(self.receiver.borrow_and_update().clone())
    }

    /// Stop receiving updates. Idempotent; also runs on drop.
    pub fn unsubscribe(&self) -> bool {
        self.subscription.unsubscribe()
    }
}

// ============================================================================
// TESTS
// ============================================================================
