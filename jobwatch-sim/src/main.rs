//! jobwatch simulator
//!
//! Drives a subscription manager against the in-memory job store on the
//! tokio clock and prints the final stats as JSON.
//!
//! Configuration comes from the TOML file given as the first argument (or
//! `JOBWATCH_CONFIG`), overlaid with `JOBWATCH_*` environment variables.
//! Set `JOBWATCH_LOG_FORMAT=json` for JSON logs; filtering follows
//! `RUST_LOG`.

mod error;

use error::{SimError, SimResult};
use jobwatch_core::{
    EntryState, InMemoryJobStore, ManagerConfig, ResourceKey, TransportError,
};
use jobwatch_subscriptions::{SubscribeOptions, Subscription, SubscriptionManager};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const CONSUMERS: usize = 5;
const WAIT_STEP: Duration = Duration::from_millis(50);

#[tokio::main]
async fn main() -> SimResult<()> {
    init_logging()?;

    let config = load_config()?;
    let store: InMemoryJobStore<String> = InMemoryJobStore::new();
    let manager = SubscriptionManager::<String>::builder(config)
        .transport(Arc::new(store.clone()))
        .fetcher(Arc::new(store.clone()))
        .build()?;

    shared_listener(&manager, &store).await?;
    degraded_polling(&manager, &store).await?;

    let stats = manager.stats();
    println!("{}", stats.to_json()?);
    manager.shutdown();

    if !stats.is_healthy() {
        return Err(SimError::Check(format!(
            "listener anomalies: {:?}",
            stats.listener_anomalies
        )));
    }
    Ok(())
}

fn init_logging() -> SimResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("jobwatch_subscriptions=debug,jobwatch_sim=debug,info"));
    let json = std::env::var("JOBWATCH_LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if json {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
    result.map_err(|e| SimError::Logging(e.to_string()))
}

fn load_config() -> SimResult<ManagerConfig> {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("JOBWATCH_CONFIG").ok())
        .map(PathBuf::from);

    let config = match path {
        Some(path) => {
            info!(path = %path.display(), "Loading config file");
            ManagerConfig::from_path(&path)?.overlay_env(|name| std::env::var(name).ok())
        }
        None => ManagerConfig::from_env(),
    };
    config.validate()?;
    Ok(config)
}

// ============================================================================
// SCENARIOS
// ============================================================================

/// Shared log of what one consumer saw.
#[derive(Clone, Default)]
struct Seen(Arc<Mutex<Vec<String>>>);

impl Seen {
    fn subscribe(
        &self,
        manager: &SubscriptionManager<String>,
        key: &ResourceKey,
        name: &str,
    ) -> SimResult<Subscription> {
        let log = Arc::clone(&self.0);
        let tag = name.to_string();
        let name = name.to_string();
        let subscription = manager.subscribe(
            key,
            move |event| {
                let line = match event.value() {
                    Some(value) => format!("{}:{}", event.kind(), value),
                    None => event.kind().to_string(),
                };
                debug!(consumer = %name, event = %line, "Consumer received event");
                log.lock().unwrap_or_else(PoisonError::into_inner).push(line);
            },
            SubscribeOptions::new().with_tag(tag),
        )?;
        Ok(subscription)
    }

    fn lines(&self) -> Vec<String> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Five consumers share one listener; a sixth arriving inside the grace
/// period gets the cached value without a new listener.
async fn shared_listener(
    manager: &SubscriptionManager<String>,
    store: &InMemoryJobStore<String>,
) -> SimResult<()> {
    let key = ResourceKey::new("jobs/J1")?;
    let seen: Vec<Seen> = (0..CONSUMERS).map(|_| Seen::default()).collect();
    let subscriptions = seen
        .iter()
        .enumerate()
        .map(|(i, s)| s.subscribe(manager, &key, &format!("view-{}", i)))
        .collect::<SimResult<Vec<_>>>()?;

    store.publish(&key, "processing".to_string());
    store.publish(&key, "completed".to_string());
    for subscription in &subscriptions {
        subscription.unsubscribe();
    }

    let pause = manager.config().grace_period() / 3;
    info!(key = %key, pause_ms = pause.as_millis() as u64, "All consumers left, waiting inside grace period");
    tokio::time::sleep(pause).await;

    let late = Seen::default();
    let _late = late.subscribe(manager, &key, "late-view")?;

    let opens = store.total_opens(&key);
    info!(
        key = %key,
        first_consumer = ?seen[0].lines(),
        late_consumer = ?late.lines(),
        listener_opens = opens,
        "Shared listener scenario finished"
    );
    if opens != 1 || late.lines() != ["value:completed"] {
        return Err(SimError::Check(format!(
            "expected one listener and a cached value, got {} opens and {:?}",
            opens,
            late.lines()
        )));
    }
    Ok(())
}

/// A listener that keeps failing is retried, then the entry degrades to
/// polling and still picks up the final value.
async fn degraded_polling(
    manager: &SubscriptionManager<String>,
    store: &InMemoryJobStore<String>,
) -> SimResult<()> {
    let key = ResourceKey::new("jobs/J2")?;
    let seen = Seen::default();
    let _subscription = seen.subscribe(manager, &key, "progress-bar")?;
    store.publish(&key, "encoding".to_string());

    store.fail_next_opens(&key, manager.config().retry.max_retries + 1);
    store.break_listeners(&key, TransportError::disconnected("simulated connection reset"));

    let retry = &manager.config().retry;
    let budget = Duration::from_millis(retry.max_backoff_ms + retry.jitter_ms)
        * (retry.max_retries + 1)
        + manager.config().poll_interval() * 2;
    wait_until(budget, || {
        manager
            .entry_status(&key)
            .is_some_and(|status| status.state == EntryState::Degraded)
    })
    .await?;
    warn!(key = %key, "Entry degraded, publishing silently");

    store.put_silently(&key, "completed".to_string());
    wait_until(manager.config().poll_interval() * 3, || {
        seen.lines().last().map(String::as_str) == Some("value:completed")
    })
    .await?;

    let refreshed = manager.force_refresh(&key).await?;
    info!(
        key = %key,
        events = ?seen.lines(),
        refreshed = %refreshed.value(),
        "Degraded polling scenario finished"
    );
    Ok(())
}

async fn wait_until<F>(budget: Duration, mut done: F) -> SimResult<()>
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + budget;
    while !done() {
        if tokio::time::Instant::now() >= deadline {
            return Err(SimError::Check(format!(
                "condition not reached within {}ms",
                budget.as_millis()
            )));
        }
        tokio::time::sleep(WAIT_STEP).await;
    }
    Ok(())
}
