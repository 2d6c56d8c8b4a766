//! Rate-limited, timeout-bounded access to the ledger.
//!
//! The ledger exposes only two primitives: the latest block, and the events of one type within an
//! inclusive height range. [`ChainClient`] is the seam for whatever node client the embedder
//! brings; [`ChainService`] wraps it with:
//! * cooperative rate limiting through a shared [`RateLimiter`](crate::RateLimiter)
//! * a bounded per-call timeout
//! * request logging
//!
//! Retries are deliberately left to the callers: the type scanners shrink their range and back
//! off, the head tracker simply polls again on its next cycle.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::{sync::Arc, time::Duration};
//!
//! use ledger_scanner::{RateLimiter, chain::{ChainClient, ChainServiceBuilder}};
//!
//! # fn example(client: Arc<dyn ChainClient>) {
//! let service = ChainServiceBuilder::new(client)
//!     .rate_limiter(RateLimiter::new(10.0, 10.0))
//!     .call_timeout(Duration::from_secs(30))
//!     .build();
//! # }
//! ```

mod builder;
mod service;

pub use builder::{ChainServiceBuilder, DEFAULT_CALL_TIMEOUT};
pub use service::ChainService;

use async_trait::async_trait;

use crate::{
    ChainError,
    types::{BlockHeader, BlockHeight, Event},
};

/// Raw ledger access.
///
/// `get_events` may return fewer distinct heights than requested when some blocks had no
/// matching events; callers treat the whole range as served.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn get_latest_block(&self) -> Result<BlockHeader, ChainError>;

    async fn get_events(
        &self,
        event_type: &str,
        start_height: BlockHeight,
        end_height: BlockHeight,
    ) -> Result<Vec<Event>, ChainError>;
}
