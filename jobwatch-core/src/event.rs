//! Snapshots, delivery events and entry lifecycle states.

use crate::error::SubscriptionError;
use crate::Timestamp;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Most recently accepted value for a key.
///
/// Replaced atomically on each accepted update and shared read-only with
/// every consumer of the key.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedSnapshot<T> {
    value: T,
    received_at: Timestamp,
}

impl<T> CachedSnapshot<T> {
    /// Snapshot stamped with the current wall-clock time.
    pub fn new(value: T) -> Self {
        Self {
            value,
            received_at: Utc::now(),
        }
    }

    pub fn with_timestamp(value: T, received_at: Timestamp) -> Self {
        Self { value, received_at }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn received_at(&self) -> Timestamp {
        self.received_at
    }

    /// How long ago this snapshot was accepted.
    pub fn age(&self) -> Duration {
        Utc::now()
            .signed_duration_since(self.received_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

/// What a consumer callback receives.
///
/// The variants keep "value", "stale value", "confirmed absent" and
/// "failure" distinct so a UI binding can derive loading/error state
/// without reaching into the registry.
#[derive(Debug, Clone)]
pub enum SubscriptionEvent<T> {
    /// A live value accepted from the transport (or a fresh cache hit).
    Value(Arc<CachedSnapshot<T>>),
    /// A cached value served while the entry is retrying or degraded.
    Stale(Arc<CachedSnapshot<T>>),
    /// The transport confirmed the resource does not exist.
    NotFound,
    /// A listener failure is being retried.
    Retrying { attempt: u32, delay: Duration },
    /// An error sentinel. Never thrown across the callback boundary.
    Error(SubscriptionError),
}

impl<T> SubscriptionEvent<T> {
    /// The snapshot carried by `Value` or `Stale`.
    pub fn snapshot(&self) -> Option<&Arc<CachedSnapshot<T>>> {
        match self {
            Self::Value(snapshot) | Self::Stale(snapshot) => Some(snapshot),
            _ => None,
        }
    }

    pub fn value(&self) -> Option<&T> {
        self.snapshot().map(|s| s.value())
    }

    pub fn error(&self) -> Option<&SubscriptionError> {
        match self {
            Self::Error(err) => Some(err),
            _ => None,
        }
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Stale(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }

    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Value(_) => "value",
            Self::Stale(_) => "stale",
            Self::NotFound => "not_found",
            Self::Retrying { .. } => "retrying",
            Self::Error(_) => "error",
        }
    }
}

/// Lifecycle of one subscription entry.
///
/// ```text
/// INIT → CONNECTING → LIVE
///          │    ↑       │  transport error
///          ↓    │       ↓
///        RETRYING ←─────┘
///          │  retries exhausted
///          ├──→ DEGRADED (fetch capability configured, polling)
///          └──→ FAILED   (entry retained, next subscribe reconnects)
///
/// any state ── grace timer fires with zero consumers ──→ CLOSED (removed)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryState {
    Init,
    Connecting,
    Live,
    Retrying,
    Degraded,
    Failed,
    Closed,
}

impl EntryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryState::Init => "INIT",
            EntryState::Connecting => "CONNECTING",
            EntryState::Live => "LIVE",
            EntryState::Retrying => "RETRYING",
            EntryState::Degraded => "DEGRADED",
            EntryState::Failed => "FAILED",
            EntryState::Closed => "CLOSED",
        }
    }

    /// Cached values served in this state are marked stale.
    pub fn serves_stale(&self) -> bool {
        matches!(
            self,
            EntryState::Retrying | EntryState::Degraded | EntryState::Failed
        )
    }

    /// A new subscriber arriving in this state must open a listener.
    pub fn needs_listener(&self) -> bool {
        matches!(self, EntryState::Init | EntryState::Failed)
    }

    /// Whether live updates from the current listener generation are accepted.
    pub fn accepts_updates(&self) -> bool {
        matches!(self, EntryState::Connecting | EntryState::Live)
    }
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ResourceKey;

    #[test]
    fn test_snapshot_age() {
        let past = Utc::now() - chrono::Duration::seconds(5);
        let snapshot = CachedSnapshot::with_timestamp("done", past);
        let age = snapshot.age();
        assert!(age >= Duration::from_secs(4));
        assert!(age <= Duration::from_secs(10));
    }

    #[test]
    fn test_future_snapshot_has_zero_age() {
        let future = Utc::now() + chrono::Duration::seconds(30);
        let snapshot = CachedSnapshot::with_timestamp(1, future);
        assert_eq!(snapshot.age(), Duration::ZERO);
    }

    #[test]
    fn test_event_accessors() {
        let snapshot = Arc::new(CachedSnapshot::new("processing".to_string()));
        let live = SubscriptionEvent::Value(snapshot.clone());
        let stale = SubscriptionEvent::Stale(snapshot);

        assert_eq!(live.value().map(String::as_str), Some("processing"));
        assert!(!live.is_stale());
        assert!(stale.is_stale());
        assert_eq!(stale.kind(), "stale");

        let missing: SubscriptionEvent<String> = SubscriptionEvent::NotFound;
        assert!(missing.is_not_found());
        assert!(missing.value().is_none());

        let failed: SubscriptionEvent<String> =
            SubscriptionEvent::Error(SubscriptionError::NotFound {
                key: ResourceKey::new("J1").unwrap(),
            });
        assert!(failed.error().is_some());
    }

    #[test]
    fn test_state_classification() {
        assert!(EntryState::Init.needs_listener());
        assert!(EntryState::Failed.needs_listener());
        assert!(!EntryState::Retrying.needs_listener());
        assert!(EntryState::Degraded.serves_stale());
        assert!(!EntryState::Live.serves_stale());
        assert!(EntryState::Connecting.accepts_updates());
        assert!(!EntryState::Degraded.accepts_updates());
    }

    #[test]
    fn test_state_serializes_screaming() {
        let json = serde_json::to_string(&EntryState::Degraded).unwrap();
        assert_eq!(json, "\"DEGRADED\"");
        assert_eq!(EntryState::Live.to_string(), "LIVE");
    }
}
