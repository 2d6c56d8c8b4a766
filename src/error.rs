use std::{sync::Arc, time::Duration};

use thiserror::Error;

use crate::rate_limiter::TicketTimeout;

/// Errors returned by a [`ChainClient`](crate::chain::ChainClient) or by the
/// [`ChainService`](crate::chain::ChainService) wrapped around it.
///
/// Every variant is transient from the scanner's point of view: the caller retries.
#[derive(Error, Debug, Clone)]
pub enum ChainError {
    /// The ledger access node rejected or failed the request.
    #[error("Ledger request failed: {0}")]
    Request(Arc<str>),

    /// The call did not complete within the configured call timeout.
    #[error("Ledger request timed out after {0:?}")]
    Timeout(Duration),

    /// A bounded wait for rate limiter tickets elapsed.
    #[error(transparent)]
    RateLimited(#[from] TicketTimeout),
}

impl ChainError {
    /// Convenience constructor for [`ChainError::Request`].
    pub fn request(message: impl Into<Arc<str>>) -> Self {
        ChainError::Request(message.into())
    }
}

/// Errors raised by settings and delivery-tracker storage.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Storage connection lock poisoned")]
    Poisoned,

    #[error("Storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Storage has been closed")]
    Closed,

    /// Group discriminators are appended to every key and are capped at 16 characters.
    #[error("Group id {0:?} is longer than 16 characters")]
    InvalidGroupId(String),

    /// The handle's lease expired and was reclaimed, or was already released.
    #[error("Lease for {key:?} is no longer held")]
    LeaseNotHeld { key: String },
}

/// Errors raised while handing events to a [`Broadcaster`](crate::delivery::Broadcaster).
#[derive(Error, Debug)]
pub enum BroadcastError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Delivery failed: {0}")]
    Delivery(String),

    #[error("Failed to encode message: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors loading a [`ScannerConfig`](crate::ScannerConfig).
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Top-level errors surfaced by the scanner components.
///
/// None of these are fatal to a running scanner: every loop logs the error and retries on its
/// next cycle. They are returned from the one-shot entry points (`start`, `scan_once`,
/// `process_pending`, builders) so callers and tests can observe them.
#[derive(Error, Debug)]
pub enum ScannerError {
    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Broadcast(#[from] BroadcastError),

    #[error("Failed to register metrics: {0}")]
    Metrics(#[from] prometheus::Error),

    /// A topic on the event bus already has the maximum number of listeners.
    #[error("Event bus topic already has {limit} listeners")]
    TooManyListeners { limit: usize },

    #[error("At least one event type must be configured")]
    NoEventTypes,

    #[error("Max fetch size must be greater than 0")]
    InvalidMaxFetchSize,

    #[error("Max lookahead must be greater than 0")]
    InvalidMaxLookahead,
}
