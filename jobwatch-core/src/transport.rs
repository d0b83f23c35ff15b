//! Capability interfaces to the backend.
//!
//! The manager never speaks a wire protocol. It reaches the backend only
//! through two narrow capabilities:
//!
//! - [`LiveTransport`]: opens a real-time listener for a key and pushes
//!   updates into an [`UpdateSink`] until the returned [`ListenerHandle`]
//!   is closed.
//! - [`SnapshotFetcher`]: an optional one-shot read used by
//!   `force_refresh` and the degraded polling fallback.
//!
//! "Resource confirmed absent" and "transport failure" are told apart only
//! by the shape of what the sink receives: `on_update(None)` versus
//! `on_error(..)`.

use crate::error::TransportError;
use crate::ResourceKey;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Receiver side of a live listener.
///
/// Implementations must be cheap and non-blocking; the manager's sink takes
/// a short internal lock and returns.
pub trait UpdateSink<T>: Send + Sync {
    /// A new value, or `None` when the backend confirms the resource is absent.
    fn on_update(&self, value: Option<T>);

    /// The listener failed. No further updates are expected from it.
    fn on_error(&self, error: TransportError);
}

/// Shared sink handed to a transport.
pub type StreamSink<T> = Arc<dyn UpdateSink<T>>;

/// Live transport capability.
///
/// # Contract
///
/// - `open` may deliver updates through the sink before it returns.
/// - Closing the returned handle must not call back into the sink
///   synchronously; the manager closes handles while holding its registry
///   lock.
pub trait LiveTransport<T>: Send + Sync {
    fn open(&self, key: &ResourceKey, sink: StreamSink<T>)
        -> Result<ListenerHandle, TransportError>;
}

/// One-shot fetch capability.
#[async_trait]
pub trait SnapshotFetcher<T>: Send + Sync {
    /// Fetch the current value, `Ok(None)` when the resource is absent.
    async fn fetch_once(&self, key: &ResourceKey) -> Result<Option<T>, TransportError>;
}

type CloseFn = Box<dyn FnOnce() + Send + 'static>;

/// Owned handle to an open underlying listener.
///
/// Closing happens exactly once: either through [`ListenerHandle::close`]
/// or when the handle is dropped.
pub struct ListenerHandle {
    close: Option<CloseFn>,
}

impl ListenerHandle {
    pub fn new<F>(close: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            close: Some(Box::new(close)),
        }
    }

    /// Handle for transports with nothing to tear down.
    pub fn noop() -> Self {
        Self { close: None }
    }

    pub fn close(mut self) {
        self.run_close();
    }

    fn run_close(&mut self) {
        if let Some(close) = self.close.take() {
            close();
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.run_close();
    }
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("open", &self.close.is_some())
            .finish()
    }
}
