use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::time::sleep;

use crate::{
    BroadcastError, ScannerMetrics,
    delivery::{Broadcaster, DeliveryTracker, LockHandle},
    types::{BlockHeight, Event, group_by_transaction},
};

/// How often a busy lease is retried.
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Wraps a [`Broadcaster`] so each transaction reaches it at most once.
///
/// Each block is split by transaction id. For every transaction the wrapper takes the tracker's
/// lease, delivers the transaction's events only if it has not been consumed yet, marks it
/// consumed, and releases the lease on every path.
pub struct UniqueBroadcaster {
    tracker: Arc<dyn DeliveryTracker>,
    inner: Arc<dyn Broadcaster>,
    metrics: Option<ScannerMetrics>,
}

impl UniqueBroadcaster {
    #[must_use]
    pub fn new(tracker: Arc<dyn DeliveryTracker>, inner: Arc<dyn Broadcaster>) -> Self {
        Self { tracker, inner, metrics: None }
    }

    /// Counts skipped transactions in `ledger_scanner_duplicate_transactions`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: ScannerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Waits until the lease for `transaction_id` is free or has expired.
    async fn lock(&self, transaction_id: &str) -> Result<LockHandle, BroadcastError> {
        loop {
            if let Some(handle) = self.tracker.acquire_lock(transaction_id).await? {
                return Ok(handle);
            }
            trace!(transaction_id = transaction_id, "Delivery lease busy, waiting");
            sleep(LOCK_POLL_INTERVAL).await;
        }
    }

    async fn deliver_once(
        &self,
        handle: &LockHandle,
        block_height: BlockHeight,
        transaction_id: &str,
        events: &[Event],
    ) -> Result<(), BroadcastError> {
        if self.tracker.check_consumed(handle).await? {
            debug!(transaction_id = transaction_id, "Skipping transaction already delivered");
            if let Some(metrics) = &self.metrics {
                metrics.duplicate_transactions.inc();
            }
            return Ok(());
        }

        self.inner.broadcast_events(block_height, events).await?;
        self.tracker.set_consumed(handle, true).await?;
        Ok(())
    }
}

#[async_trait]
impl Broadcaster for UniqueBroadcaster {
    async fn broadcast_events(
        &self,
        block_height: BlockHeight,
        events: &[Event],
    ) -> Result<(), BroadcastError> {
        for (transaction_id, group) in group_by_transaction(events) {
            let handle = self.lock(&transaction_id).await?;
            let result = self.deliver_once(&handle, block_height, &transaction_id, &group).await;

            if let Err(e) = self.tracker.release_lock(&handle).await {
                error!(
                    transaction_id = %transaction_id,
                    error = %e,
                    "Failed to release delivery lease"
                );
                result?;
                return Err(e.into());
            }
            result?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BroadcastError> {
        let tracker = self.tracker.close().await;
        self.inner.close().await?;
        tracker?;
        Ok(())
    }
}

impl std::fmt::Debug for UniqueBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UniqueBroadcaster").finish_non_exhaustive()
    }
}
