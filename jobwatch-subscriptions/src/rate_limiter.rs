//! Sliding-window admission control per resource key.
//!
//! Each key keeps its own history of `{timestamp, success}` attempts. The
//! history lives independently of registry entries: it is pruned by time,
//! never by subscription lifecycle, so a key that was torn down and
//! re-subscribed inside one window still counts against the same budget.

use dashmap::DashMap;
use jobwatch_core::{RateLimitConfig, ResourceKey, Scheduler};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct Attempt {
    at: Instant,
    success: bool,
}

#[derive(Debug, Default)]
struct RateLimitRecord {
    attempts: VecDeque<Attempt>,
}

impl RateLimitRecord {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(front) = self.attempts.front() {
            if now.saturating_duration_since(front.at) >= window {
                self.attempts.pop_front();
            } else {
                break;
            }
        }
    }

    fn live_attempts(&self, now: Instant, window: Duration) -> impl Iterator<Item = &Attempt> {
        self.attempts
            .iter()
            .filter(move |a| now.saturating_duration_since(a.at) < window)
    }
}

/// Per-key sliding-window rate limiter.
///
/// Reads the clock through the injected [`Scheduler`] so virtual time in
/// tests also moves the window.
pub struct RateLimiter {
    config: RateLimitConfig,
    clock: Arc<dyn Scheduler>,
    /// Per-key histories - DashMap keeps keys independent of each other.
    records: DashMap<ResourceKey, RateLimitRecord>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Scheduler>) -> Self {
        Self {
            config,
            clock,
            records: DashMap::new(),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Whether one more attempt for `key` fits in the current window.
    ///
    /// Pure query: does not record anything.
    pub fn is_allowed(&self, key: &ResourceKey) -> bool {
        if !self.config.enabled {
            return true;
        }
        self.attempts_in_window(key) < self.config.max_attempts as usize
    }

    /// Append an attempt to the key's history.
    ///
    /// With `reset_on_success`, a successful attempt discards every prior
    /// failed attempt for the key.
    pub fn record_request(&self, key: &ResourceKey, success: bool) {
        let now = self.clock.now();
        let window = self.config.window();
        let mut record = self.records.entry(key.clone()).or_default();
        record.prune(now, window);
        if success && self.config.reset_on_success {
            record.attempts.retain(|a| a.success);
        }
        record.attempts.push_back(Attempt { at: now, success });
    }

    /// Attempts left for `key` in the current window.
    pub fn remaining_requests(&self, key: &ResourceKey) -> u32 {
        let used = self.attempts_in_window(key) as u32;
        self.config.max_attempts.saturating_sub(used)
    }

    /// Time until the oldest attempt in the window expires, which frees one
    /// slot. Zero when the key has no live history.
    pub fn time_until_reset(&self, key: &ResourceKey) -> Duration {
        let now = self.clock.now();
        let window = self.config.window();
        self.records
            .get(key)
            .and_then(|record| record.live_attempts(now, window).next().map(|a| a.at))
            .map(|oldest| (oldest + window).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }

    /// Drop every key whose history has fully expired. Returns how many
    /// keys were removed.
    pub fn prune(&self) -> usize {
        let now = self.clock.now();
        let window = self.config.window();
        let before = self.records.len();
        self.records.retain(|_, record| {
            record.prune(now, window);
            !record.attempts.is_empty()
        });
        before.saturating_sub(self.records.len())
    }

    /// Forget the history for one key.
    pub fn reset(&self, key: &ResourceKey) {
        self.records.remove(key);
    }

    /// Keys with recorded history (expired or not).
    pub fn tracked_keys(&self) -> usize {
        self.records.len()
    }

    /// Approximate heap usage of all histories, in bytes.
    pub fn approximate_bytes(&self) -> usize {
        self.records
            .iter()
            .map(|entry| {
                entry.key().as_str().len()
                    + std::mem::size_of::<RateLimitRecord>()
                    + entry.value().attempts.capacity() * std::mem::size_of::<Attempt>()
            })
            .sum()
    }

    fn attempts_in_window(&self, key: &ResourceKey) -> usize {
        let now = self.clock.now();
        let window = self.config.window();
        self.records
            .get(key)
            .map(|record| record.live_attempts(now, window).count())
            .unwrap_or(0)
    }
}

// ============================================================================
// TESTS
// ============================================================================
