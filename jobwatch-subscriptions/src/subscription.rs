//! Handles returned to consumers by `subscribe`.

use jobwatch_core::{ConsumerId, ResourceKey};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Per-call options for `subscribe`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscribeOptions {
    /// Coalescing window for this consumer. Defaults to the manager's.
    pub debounce: Option<Duration>,
    /// Reconnect budget requested by this consumer. The entry uses the
    /// largest budget of all consumers that joined it.
    pub max_retries: Option<u32>,
    /// Free-form label surfaced in stats (e.g. the component name).
    pub tag: Option<String>,
}

impl SubscribeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = Some(debounce);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }
}

/// Outcome of admission control for one `subscribe` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Admission {
    /// The consumer is registered and will receive updates.
    Admitted,
    /// Denied by the rate limiter. The callback was invoked once with the
    /// cached snapshot or a rate-limit error; nothing is registered.
    RateLimited { retry_after: Duration },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }
}

type DetachFn = Box<dyn FnOnce() + Send + 'static>;

struct UnsubscribeOnce {
    done: AtomicBool,
    detach: Mutex<Option<DetachFn>>,
}

/// Idempotent unsubscribe function bound to one consumer registration.
///
/// Cloneable so it can be moved into the consumer's own callback. The
/// first call detaches the consumer; every later call is a no-op.
#[derive(Clone)]
pub struct UnsubscribeHandle {
    inner: Arc<UnsubscribeOnce>,
}

impl UnsubscribeHandle {
    pub(crate) fn new<F>(detach: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            inner: Arc::new(UnsubscribeOnce {
                done: AtomicBool::new(false),
                detach: Mutex::new(Some(Box::new(detach))),
            }),
        }
    }

    /// Handle for a consumer that was never registered.
    pub(crate) fn noop() -> Self {
        Self {
            inner: Arc::new(UnsubscribeOnce {
                done: AtomicBool::new(false),
                detach: Mutex::new(None),
            }),
        }
    }

    /// Detach the consumer. Returns true on the first call only.
    pub fn unsubscribe(&self) -> bool {
        if self.inner.done.swap(true, Ordering::SeqCst) {
            return false;
        }
        let detach = self
            .inner
            .detach
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(detach) = detach {
            detach();
        }
        true
    }

    pub fn is_unsubscribed(&self) -> bool {
        self.inner.done.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for UnsubscribeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnsubscribeHandle")
            .field("unsubscribed", &self.is_unsubscribed())
            .finish()
    }
}

/// A consumer's registration with the manager.
///
/// Dropping it unsubscribes. Use [`Subscription::into_handle`] to keep the
/// registration alive without holding the `Subscription` itself.
#[must_use = "dropping a Subscription unsubscribes immediately"]
#[derive(Debug)]
pub struct Subscription {
    key: ResourceKey,
    consumer_id: Option<ConsumerId>,
    admission: Admission,
    handle: Option<UnsubscribeHandle>,
}

impl Subscription {
    pub(crate) fn admitted(key: ResourceKey, consumer_id: ConsumerId, handle: UnsubscribeHandle) -> Self {
        Self {
            key,
            consumer_id: Some(consumer_id),
            admission: Admission::Admitted,
            handle: Some(handle),
        }
    }

    pub(crate) fn rate_limited(key: ResourceKey, retry_after: Duration) -> Self {
        Self {
            key,
            consumer_id: None,
            admission: Admission::RateLimited { retry_after },
            handle: Some(UnsubscribeHandle::noop()),
        }
    }

    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    /// Registration id; `None` when admission was denied.
    pub fn consumer_id(&self) -> Option<ConsumerId> {
        self.consumer_id
    }

    pub fn admission(&self) -> Admission {
        self.admission
    }

    pub fn is_admitted(&self) -> bool {
        self.admission.is_admitted()
    }

    /// Idempotent: a second call is a no-op returning false.
    pub fn unsubscribe(&self) -> bool {
        self.handle.as_ref().is_some_and(UnsubscribeHandle::unsubscribe)
    }

    /// A cloneable unsubscribe function for this registration.
    pub fn handle(&self) -> UnsubscribeHandle {
        self.handle.clone().unwrap_or_else(UnsubscribeHandle::noop)
    }

    /// Give up RAII ownership; the registration lives until the returned
    /// handle is invoked or the manager is cleaned up.
    pub fn into_handle(mut self) -> UnsubscribeHandle {
        self.handle.take().unwrap_or_else(UnsubscribeHandle::noop)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.unsubscribe();
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
