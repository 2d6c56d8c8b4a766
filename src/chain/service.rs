use std::{fmt, sync::Arc, time::Duration};

use tokio::time::timeout;

use crate::{
    ChainError, RateLimiter,
    chain::ChainClient,
    types::{BlockHeader, BlockHeight, Event},
};

/// [`ChainClient`] wrapper that reserves rate limiter tickets and bounds every call.
///
/// Cheap to clone; clones share the client and the rate limiter.
#[derive(Clone)]
pub struct ChainService {
    pub(crate) client: Arc<dyn ChainClient>,
    pub(crate) rate_limiter: Option<RateLimiter>,
    pub(crate) ticket_timeout: Option<Duration>,
    pub(crate) call_timeout: Duration,
}

impl ChainService {
    /// Wraps `client` without rate limiting, using the default call timeout.
    #[must_use]
    pub fn new(client: Arc<dyn ChainClient>) -> Self {
        super::ChainServiceBuilder::new(client).build()
    }

    /// Returns the shared rate limiter, if any.
    #[must_use]
    pub fn rate_limiter(&self) -> Option<&RateLimiter> {
        self.rate_limiter.as_ref()
    }

    /// Fetch the latest block.
    ///
    /// # Errors
    ///
    /// See [call errors](#call-errors).
    pub async fn get_latest_block(&self) -> Result<BlockHeader, ChainError> {
        trace!("get_latest_block called");
        let client = self.client.clone();
        let result = self.call(async move { client.get_latest_block().await }).await;
        if let Err(e) = &result {
            error!(error = %e, "get_latest_block failed");
        }
        result
    }

    /// Fetch all events of `event_type` in `[start_height, end_height]`.
    ///
    /// # Errors
    ///
    /// See [call errors](#call-errors).
    pub async fn get_events(
        &self,
        event_type: &str,
        start_height: BlockHeight,
        end_height: BlockHeight,
    ) -> Result<Vec<Event>, ChainError> {
        trace!(
            event_type = event_type,
            start_height = start_height,
            end_height = end_height,
            "get_events called"
        );
        let result = self
            .call(async { self.client.get_events(event_type, start_height, end_height).await })
            .await;
        if let Err(e) = &result {
            error!(
                event_type = event_type,
                start_height = start_height,
                end_height = end_height,
                error = %e,
                "get_events failed"
            );
        }
        result
    }

    /// Reserve a ticket, then run `operation` under the call timeout.
    ///
    /// # Errors
    /// <a name="call-errors"></a>
    ///
    /// * [`ChainError::RateLimited`] - if a ticket timeout is configured and elapses.
    /// * [`ChainError::Timeout`] - if the call exceeds the call timeout.
    /// * Propagates any [`ChainError`] returned by the underlying client.
    async fn call<T, Fut>(&self, operation: Fut) -> Result<T, ChainError>
    where
        Fut: Future<Output = Result<T, ChainError>>,
    {
        if let Some(rate_limiter) = &self.rate_limiter {
            rate_limiter.wait_for_tickets(1, self.ticket_timeout).await?;
        }

        timeout(self.call_timeout, operation)
            .await
            .map_err(|_| ChainError::Timeout(self.call_timeout))?
    }
}

impl fmt::Debug for ChainService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainService")
            .field("rate_limiter", &self.rate_limiter)
            .field("ticket_timeout", &self.ticket_timeout)
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chain::ChainServiceBuilder,
        test_utils::{MockChainClient, event},
    };
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counting_limiter() -> (RateLimiter, Arc<AtomicU32>) {
        let tickets = Arc::new(AtomicU32::new(0));
        let limiter = {
            let tickets = tickets.clone();
            RateLimiter::new(100.0, 100.0).with_observer(move |count| {
                tickets.fetch_add(count, Ordering::SeqCst);
            })
        };
        (limiter, tickets)
    }

    #[tokio::test(start_paused = true)]
    async fn head_requests_reserve_one_ticket_each() {
        let (limiter, tickets) = counting_limiter();
        let client = Arc::new(MockChainClient::new(10));
        let service = ChainServiceBuilder::new(client).rate_limiter(limiter).build();

        for _ in 0..20 {
            service.get_latest_block().await.unwrap();
        }

        assert_eq!(tickets.load(Ordering::SeqCst), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn event_requests_reserve_one_ticket_each() {
        let (limiter, tickets) = counting_limiter();
        let client = Arc::new(MockChainClient::new(10));
        let service = ChainServiceBuilder::new(client).rate_limiter(limiter).build();

        for _ in 0..20 {
            service.get_events("test", 1, 1).await.unwrap();
        }

        assert_eq!(tickets.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn forwards_requested_ranges() {
        let client = Arc::new(MockChainClient::new(10));
        client.set_events(vec![event("test", 3, "tx", 0, 0), event("test2", 12, "tx2", 0, 0)]);
        let service = ChainService::new(client.clone());

        let first = service.get_events("test", 1, 10).await.unwrap();
        let second = service.get_events("test2", 11, 20).await.unwrap();

        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_eq!(
            client.requests(),
            vec![("test".to_owned(), 1, 10), ("test2".to_owned(), 11, 20)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn call_timeout_is_enforced() {
        let client = Arc::new(MockChainClient::new(10));
        client.set_latency(Duration::from_secs(5));
        let service =
            ChainServiceBuilder::new(client).call_timeout(Duration::from_millis(100)).build();

        let result = service.get_latest_block().await;

        assert!(matches!(result, Err(ChainError::Timeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_ticket_wait_surfaces_rate_limit_error() {
        let limiter = RateLimiter::new(1.0, 0.0);
        assert!(limiter.reserve_tickets(1, false));
        let client = Arc::new(MockChainClient::new(10));
        let service = ChainServiceBuilder::new(client)
            .rate_limiter(limiter)
            .ticket_timeout(Duration::from_millis(30))
            .build();

        let result = service.get_latest_block().await;

        assert!(matches!(result, Err(ChainError::RateLimited(_))));
    }
}
