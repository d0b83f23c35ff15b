//! Read-only aggregation over the registry.
//!
//! Everything here is computed from a borrowed registry under the
//! manager's lock and returned as plain serializable data. Nothing is
//! mutated.

use crate::cleanup::CleanupScheduler;
use crate::dispatch::Dispatcher;
use crate::rate_limiter::RateLimiter;
use crate::registry::{ConsumerRegistration, SubscriptionEntry, SubscriptionRegistry};
use jobwatch_core::{CachedSnapshot, EntryState, ResourceKey, Timestamp};
use serde::Serialize;
use std::collections::BTreeMap;
use std::mem::size_of;

/// Snapshot of one entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntryStatus {
    pub key: ResourceKey,
    pub state: EntryState,
    pub consumers: usize,
    pub tags: Vec<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub has_snapshot: bool,
    pub snapshot_age_ms: Option<u64>,
    pub listener_open: bool,
    pub cleanup_pending: bool,
    pub timers_in_flight: usize,
    pub updates_accepted: u64,
    pub last_error: Option<String>,
    pub created_at: Timestamp,
}

/// A key whose open-listener count exceeds one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListenerAnomaly {
    pub key: ResourceKey,
    pub open_listeners: usize,
}

/// Manager-wide counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionStats {
    pub total_entries: usize,
    pub total_consumers: usize,
    pub open_listeners: usize,
    pub entries_by_state: BTreeMap<String, usize>,
    pub pending_cleanups: usize,
    /// Cleanup, retry and poll timers currently scheduled.
    pub timers_in_flight: usize,
    pub dispatch_queue_depth: usize,
    pub events_delivered: u64,
    pub callback_panics: u64,
    pub rate_limited_keys: usize,
    pub listener_anomalies: Vec<ListenerAnomaly>,
    pub shut_down: bool,
    pub entries: Vec<EntryStatus>,
}

impl SubscriptionStats {
    /// True when no key has more than one open listener.
    pub fn is_healthy(&self) -> bool {
        self.listener_anomalies.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Approximate memory footprint, in bytes.
///
/// Counts struct sizes and owned strings; heap owned by cached values
/// themselves is not visible and is left out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    pub entries: usize,
    pub consumers: usize,
    pub snapshots: usize,
    pub registry_bytes: usize,
    pub rate_limiter_bytes: usize,
    pub dispatch_queue_bytes: usize,
    pub total_bytes: usize,
}

/// Borrowing view used to build stats.
pub struct StatsCollector<'a, T> {
    registry: &'a SubscriptionRegistry<T>,
    cleanup: &'a CleanupScheduler,
    rate_limiter: &'a RateLimiter,
    dispatcher: &'a Dispatcher<T>,
    shut_down: bool,
}

impl<'a, T> StatsCollector<'a, T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(
        registry: &'a SubscriptionRegistry<T>,
        cleanup: &'a CleanupScheduler,
        rate_limiter: &'a RateLimiter,
        dispatcher: &'a Dispatcher<T>,
        shut_down: bool,
    ) -> Self {
        Self {
            registry,
            cleanup,
            rate_limiter,
            dispatcher,
            shut_down,
        }
    }

    pub fn entry_status(&self, key: &ResourceKey) -> Option<EntryStatus> {
        self.registry.get(key).map(|entry| self.status_of(entry))
    }

    pub fn listener_anomalies(&self) -> Vec<ListenerAnomaly> {
        self.registry
            .ledger()
            .anomalies()
            .into_iter()
            .map(|(key, open_listeners)| ListenerAnomaly {
                key,
                open_listeners,
            })
            .collect()
    }

    pub fn subscription_stats(&self) -> SubscriptionStats {
        let mut entries: Vec<EntryStatus> =
            self.registry.iter().map(|e| self.status_of(e)).collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));

        let mut entries_by_state = BTreeMap::new();
        for entry in &entries {
            *entries_by_state
                .entry(entry.state.as_str().to_string())
                .or_insert(0) += 1;
        }
        let pending_cleanups = self.cleanup.pending_count();
        let entry_timers: usize = self.registry.iter().map(SubscriptionEntry::timers_in_flight).sum();

        SubscriptionStats {
            total_entries: entries.len(),
            total_consumers: self.registry.total_consumers(),
            open_listeners: self.registry.ledger().total_open(),
            entries_by_state,
            pending_cleanups,
            timers_in_flight: pending_cleanups + entry_timers,
            dispatch_queue_depth: self.dispatcher.depth(),
            events_delivered: self.dispatcher.delivered(),
            callback_panics: self.dispatcher.panicked(),
            rate_limited_keys: self.rate_limiter.tracked_keys(),
            listener_anomalies: self.listener_anomalies(),
            shut_down: self.shut_down,
            entries,
        }
    }

    pub fn memory_stats(&self) -> MemoryStats {
        let mut consumers = 0;
        let mut snapshots = 0;
        let mut registry_bytes = 0;

        for entry in self.registry.iter() {
            consumers += entry.consumer_count();
            registry_bytes += size_of::<SubscriptionEntry<T>>() + entry.key.as_str().len() * 2;
            registry_bytes += entry.consumers.capacity() * size_of::<usize>();
            for consumer in &entry.consumers {
                registry_bytes += size_of::<ConsumerRegistration<T>>()
                    + consumer.tag().map_or(0, str::len);
            }
            if entry.snapshot.is_some() {
                snapshots += 1;
                registry_bytes += size_of::<CachedSnapshot<T>>();
            }
            registry_bytes += entry.last_error.as_ref().map_or(0, String::len);
        }

        let rate_limiter_bytes = self.rate_limiter.approximate_bytes();
        let dispatch_queue_bytes = self.dispatcher.approximate_bytes();
        MemoryStats {
            entries: self.registry.len(),
            consumers,
            snapshots,
            registry_bytes,
            rate_limiter_bytes,
            dispatch_queue_bytes,
            total_bytes: registry_bytes + rate_limiter_bytes + dispatch_queue_bytes,
        }
    }

    fn status_of(&self, entry: &SubscriptionEntry<T>) -> EntryStatus {
        EntryStatus {
            key: entry.key.clone(),
            state: entry.state,
            consumers: entry.consumer_count(),
            tags: entry.tags(),
            retry_count: entry.retry_count,
            max_retries: entry.max_retries,
            has_snapshot: entry.snapshot.is_some(),
            snapshot_age_ms: entry
                .snapshot
                .as_ref()
                .map(|s| s.age().as_millis() as u64),
            listener_open: entry.listener.is_some(),
            cleanup_pending: self.cleanup.is_pending(&entry.key),
            timers_in_flight: entry.timers_in_flight()
                + usize::from(self.cleanup.is_pending(&entry.key)),
            updates_accepted: entry.updates_accepted,
            last_error: entry.last_error.clone(),
            created_at: entry.created_at,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
