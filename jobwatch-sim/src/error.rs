//! Error types for the simulator.

use jobwatch_core::{ConfigError, SubscriptionError};

#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),
    #[error("Failed to serialize stats: {0}")]
    Stats(#[from] serde_json::Error),
    #[error("Failed to init logging: {0}")]
    Logging(String),
    #[error("Scenario check failed: {0}")]
    Check(String),
}

pub type SimResult<T> = Result<T, SimError>;
