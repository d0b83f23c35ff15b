//! Error types for jobwatch operations

use crate::ResourceKey;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
///
/// Raised synchronously at the call site: invalid keys handed to
/// `subscribe`, or a [`ManagerConfig`](crate::ManagerConfig) that fails
/// validation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to read config file {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Failed to parse config TOML: {reason}")]
    Parse { reason: String },

    #[error("No async runtime available: {reason}")]
    RuntimeUnavailable { reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(
        field: impl Into<String>,
        value: impl ToString,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            field: field.into(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Failures reported by a live transport or one-shot fetch capability.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Listener disconnected: {reason}")]
    Disconnected { reason: String },

    #[error("Permission denied: {reason}")]
    PermissionDenied { reason: String },

    #[error("Transport closed")]
    Closed,
}

impl TransportError {
    /// Convenience constructor for the common "backend unreachable" case.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    /// Convenience constructor for a dropped listener.
    pub fn disconnected(reason: impl Into<String>) -> Self {
        Self::Disconnected {
            reason: reason.into(),
        }
    }
}

/// Master error type for subscription operations.
///
/// Values of this type are both returned from API calls and delivered to
/// consumer callbacks as error sentinels, so it is `Clone` and carries only
/// owned data.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubscriptionError {
    /// The transport failed to establish or maintain a listener and retries
    /// are exhausted.
    #[error("Connection to {key} failed after {attempts} attempt(s): {reason}")]
    Connection {
        key: ResourceKey,
        attempts: u32,
        reason: String,
    },

    /// Admission denied by the rate limiter.
    #[error("Rate limit exceeded for {key}, retry after {retry_after:?}")]
    RateLimited {
        key: ResourceKey,
        retry_after: Duration,
    },

    /// A cached value is being served while a refresh or retry is pending.
    #[error("Serving stale data for {key}, age: {age:?}")]
    StaleData { key: ResourceKey, age: Duration },

    /// The transport confirmed the resource does not exist.
    #[error("Resource not found: {key}")]
    NotFound { key: ResourceKey },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("No fetch capability configured for {key}")]
    FetchUnavailable { key: ResourceKey },

    #[error("Subscription manager has been shut down")]
    ShutDown,
}

impl SubscriptionError {
    /// Returns true for failures that a later `subscribe` may recover from.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::RateLimited { .. } | Self::StaleData { .. }
        )
    }
}

/// Result type alias for subscription operations.
pub type WatchResult<T> = Result<T, SubscriptionError>;

// =============================================================================
// TESTS
// =============================================================================
