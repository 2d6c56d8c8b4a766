use std::{sync::Arc, time::Duration};

use crate::{
    RateLimiter,
    chain::{ChainClient, ChainService},
};

/// Default timeout applied to each ledger call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Builder for constructing a [`ChainService`].
pub struct ChainServiceBuilder {
    client: Arc<dyn ChainClient>,
    rate_limiter: Option<RateLimiter>,
    ticket_timeout: Option<Duration>,
    call_timeout: Duration,
}

impl ChainServiceBuilder {
    /// Starts a builder around `client` with no rate limiting and [`DEFAULT_CALL_TIMEOUT`].
    #[must_use]
    pub fn new(client: Arc<dyn ChainClient>) -> Self {
        Self { client, rate_limiter: None, ticket_timeout: None, call_timeout: DEFAULT_CALL_TIMEOUT }
    }

    /// Reserve one ticket from `rate_limiter` before every call.
    #[must_use]
    pub fn rate_limiter(mut self, rate_limiter: RateLimiter) -> Self {
        self.rate_limiter = Some(rate_limiter);
        self
    }

    /// Bound the wait for rate limiter tickets.
    ///
    /// Unbounded by default. When set, an exceeded wait fails the call with
    /// [`ChainError::RateLimited`](crate::ChainError::RateLimited).
    #[must_use]
    pub fn ticket_timeout(mut self, timeout: Duration) -> Self {
        self.ticket_timeout = Some(timeout);
        self
    }

    /// Set the maximum duration of a single ledger call.
    #[must_use]
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    #[must_use]
    pub fn build(self) -> ChainService {
        debug!(
            call_timeout_ms = self.call_timeout.as_millis(),
            rate_limited = self.rate_limiter.is_some(),
            "Building ChainService"
        );
        ChainService {
            client: self.client,
            rate_limiter: self.rate_limiter,
            ticket_timeout: self.ticket_timeout,
            call_timeout: self.call_timeout,
        }
    }
}
