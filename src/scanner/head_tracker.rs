use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tokio::time::Instant;

use crate::{
    ChainError, ScannerMetrics,
    chain::ChainService,
    event_bus::EventBus,
    metrics::HEAD,
    scanner::ticker::{PeriodicTask, spawn_periodic},
    types::{BlockHeight, HeadUpdated},
};

/// Default period between head polls.
pub const DEFAULT_HEAD_POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// Polls the chain head and publishes [`HeadUpdated`] whenever it moves forward.
///
/// Failed polls are logged and retried on the next cycle with no backoff.
#[derive(Debug)]
pub struct HeadTracker {
    inner: Arc<HeadTrackerInner>,
    interval: Duration,
    task: Option<PeriodicTask>,
}

#[derive(Debug)]
struct HeadTrackerInner {
    chain: ChainService,
    bus: Arc<EventBus>,
    metrics: ScannerMetrics,
    current: Mutex<Option<BlockHeight>>,
}

impl HeadTracker {
    #[must_use]
    pub fn new(
        chain: ChainService,
        bus: Arc<EventBus>,
        metrics: ScannerMetrics,
        interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(HeadTrackerInner { chain, bus, metrics, current: Mutex::new(None) }),
            interval,
            task: None,
        }
    }

    /// Starts the polling loop. Calling `start` on a running tracker is a no-op.
    ///
    /// A head cached by an earlier run is republished first, so listeners subscribed since then
    /// learn it without waiting for the chain to grow.
    pub fn start(&mut self) {
        if self.task.is_some() {
            return;
        }
        info!("Starting head tracker");

        if let Some(block_height) = self.current_height() {
            self.inner.bus.head_updated.publish(&HeadUpdated { block_height });
        }

        let inner = self.inner.clone();
        self.task = Some(spawn_periodic(self.interval, move || {
            let inner = inner.clone();
            async move {
                // failures are already logged and counted; the next cycle retries
                let _ = inner.poll().await;
            }
        }));
    }

    /// Stops scheduling polls. An in-flight poll completes normally.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            info!("Stopping head tracker");
            task.stop();
        }
    }

    /// Highest head observed so far.
    #[must_use]
    pub fn current_height(&self) -> Option<BlockHeight> {
        *self.inner.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs a single poll cycle.
    ///
    /// # Errors
    ///
    /// * [`ChainError`] - if the head request fails.
    pub async fn poll_once(&self) -> Result<(), ChainError> {
        self.inner.poll().await
    }
}

impl HeadTrackerInner {
    async fn poll(&self) -> Result<(), ChainError> {
        let started = Instant::now();
        match self.chain.get_latest_block().await {
            Ok(head) => {
                self.metrics.chain_requests.with_label_values(&[HEAD]).inc();
                self.metrics
                    .chain_request_latency
                    .with_label_values(&[HEAD])
                    .observe(started.elapsed().as_secs_f64());

                let advanced = {
                    let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
                    if current.is_none_or(|height| height < head.height) {
                        *current = Some(head.height);
                        true
                    } else {
                        false
                    }
                };

                if advanced {
                    trace!(block_height = head.height, "Chain head advanced");
                    self.bus.head_updated.publish(&HeadUpdated { block_height: head.height });
                }
                Ok(())
            }
            Err(e) => {
                self.metrics.chain_request_errors.with_label_values(&[HEAD]).inc();
                warn!(error = %e, "Chain head poll failed, retrying next cycle");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockChainClient;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn tracker(client: Arc<MockChainClient>, bus: Arc<EventBus>) -> HeadTracker {
        HeadTracker::new(
            ChainService::new(client),
            bus,
            ScannerMetrics::detached(),
            DEFAULT_HEAD_POLL_INTERVAL,
        )
    }

    #[tokio::test]
    async fn publishes_only_strictly_higher_heads() {
        let client = Arc::new(MockChainClient::new(10));
        let bus = Arc::new(EventBus::new());
        let published = Arc::new(Mutex::new(Vec::new()));
        let _listener = {
            let published = published.clone();
            bus.head_updated
                .subscribe(move |ev| published.lock().unwrap().push(ev.block_height))
                .unwrap()
        };
        let tracker = tracker(client.clone(), bus);

        tracker.poll_once().await.unwrap();
        tracker.poll_once().await.unwrap();
        client.set_head(9);
        tracker.poll_once().await.unwrap();
        client.set_head(12);
        tracker.poll_once().await.unwrap();

        assert_eq!(*published.lock().unwrap(), vec![10, 12]);
        assert_eq!(tracker.current_height(), Some(12));
    }

    #[tokio::test]
    async fn failed_poll_is_counted_and_keeps_cached_height() {
        let client = Arc::new(MockChainClient::new(10));
        let bus = Arc::new(EventBus::new());
        let tracker = tracker(client.clone(), bus);
        tracker.poll_once().await.unwrap();

        client.fail_next_head_requests(1);
        assert!(tracker.poll_once().await.is_err());

        assert_eq!(tracker.current_height(), Some(10));
        assert_eq!(
            tracker.inner.metrics.chain_request_errors.with_label_values(&[HEAD]).get(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn loop_keeps_polling_through_failures() {
        let client = Arc::new(MockChainClient::new(5));
        let bus = Arc::new(EventBus::new());
        let updates = Arc::new(AtomicUsize::new(0));
        let _listener = {
            let updates = updates.clone();
            bus.head_updated
                .subscribe(move |_| {
                    updates.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap()
        };
        client.fail_next_head_requests(2);
        let mut tracker = tracker(client.clone(), bus);

        tracker.start();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        tracker.stop();

        assert_eq!(updates.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.current_height(), Some(5));
    }

    #[tokio::test(start_paused = true)]
    async fn restart_republishes_the_cached_head() {
        let client = Arc::new(MockChainClient::new(7));
        let bus = Arc::new(EventBus::new());
        let mut tracker = tracker(client, bus.clone());
        tracker.poll_once().await.unwrap();

        let published = Arc::new(Mutex::new(Vec::new()));
        let _listener = {
            let published = published.clone();
            bus.head_updated
                .subscribe(move |ev| published.lock().unwrap().push(ev.block_height))
                .unwrap()
        };
        tracker.start();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        tracker.stop();

        assert_eq!(*published.lock().unwrap(), vec![7]);
    }
}
