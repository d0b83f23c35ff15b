//! jobwatch Subscriptions - Shared Live Subscriptions to Job Records
//!
//! Many independent consumers watch the same backend record. This crate
//! puts one [`SubscriptionManager`] between them and the backend so that:
//!
//! - at most one underlying listener is open per key;
//! - every accepted update reaches every consumer of the key in arrival
//!   order, coalesced per consumer by a [`Debouncer`];
//! - new consumers get the cached snapshot before any later update;
//! - listener creation is admission-controlled by a sliding-window
//!   [`RateLimiter`];
//! - failed listeners are retried with exponential backoff, then fall back
//!   to polling (when a fetch capability exists) or fail visibly;
//! - the last consumer leaving starts a grace period
//!   ([`CleanupScheduler`]) before the listener closes.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use jobwatch_core::{InMemoryJobStore, ManagerConfig};
//! use jobwatch_subscriptions::{SubscribeOptions, SubscriptionManager};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let store: InMemoryJobStore<String> = InMemoryJobStore::new();
//! let manager = SubscriptionManager::builder(ManagerConfig::default())
//!     .transport(Arc::new(store.clone()))
//!     .fetcher(Arc::new(store))
//!     .build()?;
//!
//! let subscription = manager.subscribe(
//!     "jobs/J1",
//!     |event| println!("{}", event.kind()),
//!     SubscribeOptions::new().with_tag("status-badge"),
//! )?;
//!
//! // ... later, on unmount
//! subscription.unsubscribe();
//! manager.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod cleanup;
pub mod debouncer;
pub mod dispatch;
pub mod manager;
pub mod rate_limiter;
pub mod registry;
pub mod stats;
pub mod subscription;
pub mod watch;

pub use cleanup::CleanupScheduler;
pub use debouncer::{Debouncer, Offer};
pub use dispatch::{DispatchJob, Dispatcher};
pub use manager::{ManagerBuilder, SubscriptionManager};
pub use rate_limiter::RateLimiter;
pub use registry::{
    Callback, ConsumerRegistration, ListenerLedger, SubscriptionEntry, SubscriptionRegistry,
    TrackedListener,
};
pub use stats::{EntryStatus, ListenerAnomaly, MemoryStats, StatsCollector, SubscriptionStats};
pub use subscription::{Admission, SubscribeOptions, Subscription, UnsubscribeHandle};
pub use watch::{JobWatcher, WatchState};

pub use jobwatch_core::{
    CachedSnapshot, EntryState, ResourceKey, SubscriptionError, SubscriptionEvent, WatchResult,
};
