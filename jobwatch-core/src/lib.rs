//! jobwatch Core - Shared Types and Capabilities
//!
//! Everything the subscription manager and its consumers agree on lives
//! here: resource keys, snapshots and delivery events, the error taxonomy,
//! configuration, the scheduler abstraction and the narrow capability
//! traits through which the backend is reached.
//!
//! The manager itself lives in `jobwatch-subscriptions`; this crate holds
//! no orchestration logic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub mod config;
pub mod error;
pub mod event;
pub mod memory;
pub mod scheduler;
pub mod transport;

pub use config::{ManagerConfig, RateLimitConfig, RetryConfig};
pub use error::{ConfigError, SubscriptionError, TransportError, WatchResult};
pub use event::{CachedSnapshot, EntryState, SubscriptionEvent};
pub use memory::InMemoryJobStore;
pub use scheduler::{Scheduler, TimerHandle, TokioScheduler};
pub use transport::{ListenerHandle, LiveTransport, SnapshotFetcher, StreamSink, UpdateSink};

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Maximum accepted length of a resource key, in bytes.
pub const MAX_KEY_LEN: usize = 512;

/// Opaque identifier of a watched backend entity.
///
/// Keys are validated on construction: they must be non-empty after
/// trimming, contain no control characters, and fit in [`MAX_KEY_LEN`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceKey(String);

impl ResourceKey {
    /// Validate and wrap a raw key.
    pub fn new(raw: impl AsRef<str>) -> Result<Self, ConfigError> {
        let raw = raw.as_ref();
        if raw.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "key".to_string(),
            });
        }
        if raw.len() > MAX_KEY_LEN {
            return Err(ConfigError::InvalidValue {
                field: "key".to_string(),
                value: format!("<{} bytes>", raw.len()),
                reason: format!("key must be at most {} bytes", MAX_KEY_LEN),
            });
        }
        if raw.chars().any(char::is_control) {
            return Err(ConfigError::InvalidValue {
                field: "key".to_string(),
                value: raw.escape_debug().to_string(),
                reason: "key must not contain control characters".to_string(),
            });
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ResourceKey {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ResourceKey> for String {
    fn from(key: ResourceKey) -> Self {
        key.0
    }
}

impl AsRef<str> for ResourceKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Identifier of one consumer registration (UUIDv7, creation-ordered).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConsumerId(Uuid);

impl ConsumerId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConsumerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// TESTS
// ============================================================================
