//! Configuration types
//!
//! Thresholds (grace period, rate-limit window, backoff) vary across
//! deployments, so every one of them is configuration rather than contract.
//! Values load from defaults, `JOBWATCH_*` environment variables, or a TOML
//! file, and are checked by [`ManagerConfig::validate`].

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Sliding-window admission policy per resource key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitConfig {
    /// When false every request is admitted (history is still recorded).
    pub enabled: bool,
    /// Attempts allowed per key inside one window.
    pub max_attempts: u32,
    /// Rolling window length in milliseconds.
    pub window_ms: u64,
    /// Discard prior failed attempts for a key once it succeeds.
    pub reset_on_success: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 10,
            window_ms: 60_000,
            reset_on_success: true,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Retry configuration for listener reconnects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    /// Upper bound of random jitter added to each delay. Zero disables it.
    pub jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            multiplier: 2.0,
            jitter_ms: 0,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based).
    ///
    /// `min(initial * multiplier^(attempt-1), max) + jitter`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let scaled = self.initial_backoff_ms as f64 * self.multiplier.powi(exponent);
        let capped = if scaled.is_finite() {
            (scaled as u64).min(self.max_backoff_ms)
        } else {
            self.max_backoff_ms
        };
        Duration::from_millis(jittered_backoff(capped, self.jitter_ms))
    }
}

fn jittered_backoff(base_ms: u64, jitter_ms: u64) -> u64 {
    if jitter_ms == 0 {
        return base_ms;
    }
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_nanos(0))
        .subsec_nanos() as u64;
    let jitter = nanos % jitter_ms;
    base_ms.saturating_add(jitter)
}

/// Master configuration for one subscription manager instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ManagerConfig {
    /// Default per-consumer coalescing window.
    pub debounce_ms: u64,
    /// Delay between the last unsubscribe and listener teardown.
    pub grace_period_ms: u64,
    /// Interval between one-shot fetches while an entry is degraded.
    pub poll_interval_ms: u64,
    /// Dispatch queue depth above which a warning is logged.
    pub dispatch_warn_depth: usize,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 100,
            grace_period_ms: 30_000,
            poll_interval_ms: 10_000,
            dispatch_warn_depth: 1_024,
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl ManagerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce_ms = debounce.as_millis() as u64;
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period_ms = grace.as_millis() as u64;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Create from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `JOBWATCH_DEBOUNCE_MS` (default: 100)
    /// - `JOBWATCH_GRACE_PERIOD_MS` (default: 30000)
    /// - `JOBWATCH_POLL_INTERVAL_MS` (default: 10000)
    /// - `JOBWATCH_RATE_LIMIT_ENABLED` (default: true)
    /// - `JOBWATCH_RATE_LIMIT_MAX_ATTEMPTS` (default: 10)
    /// - `JOBWATCH_RATE_LIMIT_WINDOW_MS` (default: 60000)
    /// - `JOBWATCH_MAX_RETRIES` (default: 3)
    /// - `JOBWATCH_INITIAL_BACKOFF_MS` (default: 1000)
    /// - `JOBWATCH_MAX_BACKOFF_MS` (default: 30000)
    pub fn from_env() -> Self {
        Self::default().overlay_env(|name| std::env::var(name).ok())
    }

    /// Apply `JOBWATCH_*` overrides read through `lookup`.
    pub fn overlay_env<F>(self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(
            lookup: &dyn Fn(&str) -> Option<String>,
            name: &str,
            fallback: T,
        ) -> T {
            lookup(name)
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(fallback)
        }

        let lookup: &dyn Fn(&str) -> Option<String> = &lookup;
        Self {
            debounce_ms: parsed(lookup, "JOBWATCH_DEBOUNCE_MS", self.debounce_ms),
            grace_period_ms: parsed(lookup, "JOBWATCH_GRACE_PERIOD_MS", self.grace_period_ms),
            poll_interval_ms: parsed(lookup, "JOBWATCH_POLL_INTERVAL_MS", self.poll_interval_ms),
            dispatch_warn_depth: self.dispatch_warn_depth,
            rate_limit: RateLimitConfig {
                enabled: lookup("JOBWATCH_RATE_LIMIT_ENABLED")
                    .map(|s| s == "true" || s == "1")
                    .unwrap_or(self.rate_limit.enabled),
                max_attempts: parsed(
                    lookup,
                    "JOBWATCH_RATE_LIMIT_MAX_ATTEMPTS",
                    self.rate_limit.max_attempts,
                ),
                window_ms: parsed(lookup, "JOBWATCH_RATE_LIMIT_WINDOW_MS", self.rate_limit.window_ms),
                reset_on_success: self.rate_limit.reset_on_success,
            },
            retry: RetryConfig {
                max_retries: parsed(lookup, "JOBWATCH_MAX_RETRIES", self.retry.max_retries),
                initial_backoff_ms: parsed(
                    lookup,
                    "JOBWATCH_INITIAL_BACKOFF_MS",
                    self.retry.initial_backoff_ms,
                ),
                max_backoff_ms: parsed(lookup, "JOBWATCH_MAX_BACKOFF_MS", self.retry.max_backoff_ms),
                ..self.retry
            },
        }
    }

    /// Parse a TOML document. Missing fields take their defaults.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: ManagerConfig = toml::from_str(contents).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML config file.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&contents)
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - rate-limit window and attempt budget are positive
    /// - poll interval is positive
    /// - backoff multiplier is finite and >= 1.0
    /// - max backoff is not below the initial backoff
    ///
    /// A zero grace period or debounce is allowed.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rate_limit.max_attempts == 0 {
            return Err(ConfigError::invalid(
                "rate_limit.max_attempts",
                self.rate_limit.max_attempts,
                "max_attempts must be greater than 0",
            ));
        }

        if self.rate_limit.window_ms == 0 {
            return Err(ConfigError::invalid(
                "rate_limit.window_ms",
                self.rate_limit.window_ms,
                "window_ms must be positive",
            ));
        }

        if self.poll_interval_ms == 0 {
            return Err(ConfigError::invalid(
                "poll_interval_ms",
                self.poll_interval_ms,
                "poll_interval_ms must be positive",
            ));
        }

        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return Err(ConfigError::invalid(
                "retry.multiplier",
                self.retry.multiplier,
                "multiplier must be a finite value >= 1.0",
            ));
        }

        if self.retry.max_backoff_ms < self.retry.initial_backoff_ms {
            return Err(ConfigError::invalid(
                "retry.max_backoff_ms",
                self.retry.max_backoff_ms,
                "max_backoff_ms must be >= initial_backoff_ms",
            ));
        }

        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_validate() {
        let config = ManagerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.grace_period(), Duration::from_secs(30));
        assert_eq!(config.rate_limit.max_attempts, 10);
        assert_eq!(config.rate_limit.window(), Duration::from_secs(60));
    }

    #[test]
    fn test_builder() {
        let config = ManagerConfig::new()
            .with_debounce(Duration::from_millis(5))
            .with_grace_period(Duration::from_secs(2))
            .with_poll_interval(Duration::from_millis(250));

        assert_eq!(config.debounce(), Duration::from_millis(5));
        assert_eq!(config.grace_period(), Duration::from_secs(2));
        assert_eq!(config.poll_interval(), Duration::from_millis(250));
    }

    #[test]
    fn test_validate_rejects_zero_window() {
        let mut config = ManagerConfig::default();
        config.rate_limit.window_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("rate_limit.window_ms"));
    }

    #[test]
    fn test_validate_rejects_shrinking_backoff() {
        let mut config = ManagerConfig::default();
        config.retry.multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = ManagerConfig::default();
        config.retry.max_backoff_ms = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_grace_is_allowed() {
        let config = ManagerConfig::default().with_grace_period(Duration::ZERO);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_delay_for_is_exponential_and_capped() {
        let retry = RetryConfig {
            max_retries: 10,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            multiplier: 2.0,
            jitter_ms: 0,
        };
        assert_eq!(retry.delay_for(1), Duration::from_millis(100));
        assert_eq!(retry.delay_for(2), Duration::from_millis(200));
        assert_eq!(retry.delay_for(4), Duration::from_millis(800));
        assert_eq!(retry.delay_for(5), Duration::from_millis(1_000));
        assert_eq!(retry.delay_for(200), Duration::from_millis(1_000));
    }

    #[test]
    fn test_delay_for_jitter_is_bounded() {
        let retry = RetryConfig {
            jitter_ms: 50,
            ..RetryConfig::default()
        };
        let delay = retry.delay_for(1);
        assert!(delay >= Duration::from_millis(1_000));
        assert!(delay < Duration::from_millis(1_050));
    }

    #[test]
    fn test_from_toml_partial() {
        let config = ManagerConfig::from_toml_str(
            r#"
            grace_period_ms = 5000

            [rate_limit]
            max_attempts = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.grace_period_ms, 5_000);
        assert_eq!(config.rate_limit.max_attempts, 3);
        assert_eq!(config.rate_limit.window_ms, 60_000);
        assert_eq!(config.debounce_ms, 100);
    }

    #[test]
    fn test_from_toml_rejects_unknown_fields() {
        let err = ManagerConfig::from_toml_str("grace = 1").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_from_toml_runs_validation() {
        let err = ManagerConfig::from_toml_str("poll_interval_ms = 0").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_from_path_missing_file() {
        let err = ManagerConfig::from_path(Path::new("/nonexistent/jobwatch.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_overlay_env() {
        let vars: HashMap<&str, &str> = [
            ("JOBWATCH_GRACE_PERIOD_MS", "1500"),
            ("JOBWATCH_RATE_LIMIT_ENABLED", "0"),
            ("JOBWATCH_MAX_RETRIES", "7"),
            ("JOBWATCH_DEBOUNCE_MS", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let config =
            ManagerConfig::default().overlay_env(|name| vars.get(name).map(|v| v.to_string()));
        assert_eq!(config.grace_period_ms, 1_500);
        assert!(!config.rate_limit.enabled);
        assert_eq!(config.retry.max_retries, 7);
        assert_eq!(config.debounce_ms, 100);
        assert_eq!(config.retry.multiplier, 2.0);
    }
}
