//! Ledger-Scanner re-emits the events of an append-only, type-partitioned ledger in
//! deterministic per-block order, delivering each transaction at most once.
//!
//! The ledger only offers two primitives: the latest block height, and the events of one type
//! within a block range. On top of them the crate runs:
//!
//! * a [`HeadTracker`] polling the chain head,
//! * one [`TypeScanner`] per event type, fetching ahead of the confirmed watermark,
//! * a [`Coordinator`] that waits until every type has a batch for the next height, sorts the
//!   block's events by `(transaction_index, event_index)` and delivers them,
//! * a [`RateLimiter`] shared by every upstream request.
//!
//! Components talk to each other through an in-process [`EventBus`].
//!
//! # Delivery guarantees
//!
//! Blocks are delivered at least once: the watermark is persisted after delivery, so a block can
//! be re-delivered after a restart. Wrap the sink in a [`UniqueBroadcaster`] to narrow this to at
//! most once per transaction; its [`DeliveryTracker`] is the only correctness boundary, the
//! persisted watermark is merely a resume point.
//!
//! # Backpressure
//!
//! A type scanner never fetches past `confirmed + max_lookahead`. If delivery stalls, or one
//! event type cannot be fetched, every scanner stops within that distance.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use ledger_scanner::{
//!     ScannerBuilder, ScannerConfig,
//!     chain::{ChainClient, ChainServiceBuilder},
//!     delivery::{LogBroadcaster, SqliteDeliveryTracker, UniqueBroadcaster},
//!     settings::SqliteSettingsStore,
//! };
//!
//! # async fn example(client: Arc<dyn ChainClient>) -> anyhow::Result<()> {
//! let config = ScannerConfig::from_file("scanner.yaml")?;
//! let chain = ChainServiceBuilder::new(client).rate_limiter(config.rate_limiter()).build();
//! let tracker = SqliteDeliveryTracker::open("delivery.db")?.with_lock_ttl(config.lock_ttl());
//! let broadcaster = UniqueBroadcaster::new(Arc::new(tracker), Arc::new(LogBroadcaster));
//!
//! let mut coordinator = ScannerBuilder::from_config(&config).build(
//!     chain,
//!     Arc::new(SqliteSettingsStore::open("settings.db")?),
//!     Arc::new(broadcaster),
//! )?;
//! coordinator.start().await?;
//! // ...
//! coordinator.stop().await?;
//! # Ok(())
//! # }
//! ```

#[macro_use]
mod logging;

pub mod chain;
pub mod delivery;
pub mod event_bus;
pub mod settings;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

mod config;
mod error;
mod metrics;
mod rate_limiter;
mod scanner;
mod store;
mod types;

pub use config::ScannerConfig;
pub use error::{BroadcastError, ChainError, ConfigError, ScannerError, StoreError};
pub use metrics::ScannerMetrics;
pub use rate_limiter::{RateLimiter, TICKET_POLL_INTERVAL, TicketTimeout};
pub use store::IN_MEMORY;
pub use types::{BlockHeader, BlockHeight, Event, FetchedBatch, HeadUpdated, WatermarkAdvanced};

pub use chain::ChainService;
pub use delivery::{Broadcaster, DeliveryTracker, UniqueBroadcaster};
pub use event_bus::EventBus;
pub use scanner::{
    Coordinator, DEFAULT_HEAD_POLL_INTERVAL, DEFAULT_MAX_FETCH_SIZE, DEFAULT_MAX_LOOKAHEAD,
    DEFAULT_MERGE_INTERVAL, DEFAULT_SCAN_INTERVAL, HeadTracker, ScannerBuilder, TypeScanner,
    TypeScannerConfig,
};
pub use settings::SettingsStore;
