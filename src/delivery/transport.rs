use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;

use crate::{
    BroadcastError,
    delivery::Broadcaster,
    types::{BlockHeight, Event, group_by_transaction},
};

/// Default cap on events carried by one [`TransportMessage`].
pub const DEFAULT_MAX_EVENTS_PER_MESSAGE: usize = 256;

const RETRY_STEP: Duration = Duration::from_millis(500);
const MAX_RETRY_STEPS: u32 = 4;
const RETRY_JITTER_MS: u64 = 500;

/// One unit of delivery: a transaction's events, or a chunk of them when the transaction is
/// larger than the transport allows.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportMessage {
    pub block_height: BlockHeight,
    pub transaction_id: String,
    pub chunk_index: usize,
    pub chunk_count: usize,
    pub events: Vec<Event>,
}

impl TransportMessage {
    /// Stable id for transports that deduplicate on their side.
    #[must_use]
    pub fn deduplication_id(&self) -> String {
        format!("{}-{}", self.transaction_id, self.chunk_index)
    }

    /// JSON body of the message.
    ///
    /// # Errors
    ///
    /// * [`BroadcastError::Serialization`] - if an event payload cannot be encoded.
    pub fn to_json(&self) -> Result<String, BroadcastError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A concrete delivery channel (HTTP endpoint, queue, topic).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one message. Errors are treated as transient and retried.
    async fn send(&self, message: &TransportMessage) -> Result<(), BroadcastError>;

    async fn close(&self) -> Result<(), BroadcastError> {
        Ok(())
    }
}

/// Backoff before the next attempt after `errors` consecutive failures.
#[must_use]
pub fn retry_delay(errors: u32) -> Duration {
    let jitter = rand::rng().random_range(0..RETRY_JITTER_MS);
    RETRY_STEP * errors.min(MAX_RETRY_STEPS) + Duration::from_millis(jitter)
}

/// Adapts a [`Transport`] into a [`Broadcaster`].
///
/// Events are grouped by transaction and each transaction is sent as one or more chunks, in
/// order, so a transaction is never mixed with another in a single message. Every message is
/// retried until the transport accepts it.
#[derive(Debug)]
pub struct RetryingBroadcaster<T> {
    transport: T,
    max_events_per_message: usize,
}

impl<T: Transport> RetryingBroadcaster<T> {
    #[must_use]
    pub fn new(transport: T) -> Self {
        Self { transport, max_events_per_message: DEFAULT_MAX_EVENTS_PER_MESSAGE }
    }

    /// Sets the per-message event cap. Values below 1 are treated as 1.
    #[must_use]
    pub fn max_events_per_message(mut self, max_events_per_message: usize) -> Self {
        self.max_events_per_message = max_events_per_message.max(1);
        self
    }

    #[must_use]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    async fn send_with_retry(&self, message: &TransportMessage) {
        let mut errors = 0;
        loop {
            match self.transport.send(message).await {
                Ok(()) => return,
                Err(e) => {
                    errors += 1;
                    error!(
                        transaction_id = %message.transaction_id,
                        chunk_index = message.chunk_index,
                        errors = errors,
                        error = %e,
                        "Failed to send message"
                    );
                    sleep(retry_delay(errors)).await;
                }
            }
        }
    }
}

#[async_trait]
impl<T: Transport> Broadcaster for RetryingBroadcaster<T> {
    async fn broadcast_events(
        &self,
        block_height: BlockHeight,
        events: &[Event],
    ) -> Result<(), BroadcastError> {
        let mut event_count = 0;
        let mut message_count = 0;

        for (transaction_id, group) in group_by_transaction(events) {
            let chunks: Vec<&[Event]> = group.chunks(self.max_events_per_message).collect();
            let chunk_count = chunks.len();
            for (chunk_index, chunk) in chunks.into_iter().enumerate() {
                let message = TransportMessage {
                    block_height,
                    transaction_id: transaction_id.clone(),
                    chunk_index,
                    chunk_count,
                    events: chunk.to_vec(),
                };
                self.send_with_retry(&message).await;
                event_count += chunk.len();
                message_count += 1;
            }
        }

        debug!(
            block_height = block_height,
            events = event_count,
            messages = message_count,
            "Sent events"
        );
        Ok(())
    }

    async fn close(&self) -> Result<(), BroadcastError> {
        self.transport.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::event;
    use std::sync::{
        Mutex,
        atomic::{AtomicU32, Ordering},
    };

    #[derive(Default)]
    struct FlakyTransport {
        failures_left: AtomicU32,
        sent: Mutex<Vec<TransportMessage>>,
    }

    #[async_trait]
    impl Transport for FlakyTransport {
        async fn send(&self, message: &TransportMessage) -> Result<(), BroadcastError> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(BroadcastError::Delivery("endpoint unavailable".into()));
            }
            self.sent.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    #[test]
    fn retry_delay_is_capped() {
        for errors in 1..10 {
            let delay = retry_delay(errors);
            let base = RETRY_STEP * errors.min(4);
            assert!(delay >= base && delay < base + Duration::from_millis(500));
        }
    }

    #[tokio::test]
    async fn transactions_are_chunked_in_order() -> anyhow::Result<()> {
        let broadcaster =
            RetryingBroadcaster::new(FlakyTransport::default()).max_events_per_message(2);
        let events = vec![
            event("A", 9, "tx-1", 0, 0),
            event("A", 9, "tx-1", 0, 1),
            event("A", 9, "tx-1", 0, 2),
            event("A", 9, "tx-2", 1, 0),
        ];

        broadcaster.broadcast_events(9, &events).await?;

        let sent = broadcaster.transport().sent.lock().unwrap().clone();
        let ids: Vec<_> = sent.iter().map(TransportMessage::deduplication_id).collect();
        assert_eq!(ids, vec!["tx-1-0", "tx-1-1", "tx-2-0"]);
        assert_eq!(sent[0].chunk_count, 2);
        assert_eq!(sent[1].events.len(), 1);
        assert_eq!(sent[2].chunk_count, 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn failed_sends_are_retried_until_accepted() -> anyhow::Result<()> {
        let transport = FlakyTransport { failures_left: AtomicU32::new(5), ..Default::default() };
        let broadcaster = RetryingBroadcaster::new(transport);

        broadcaster.broadcast_events(9, &[event("A", 9, "tx-1", 0, 0)]).await?;

        assert_eq!(broadcaster.transport().sent.lock().unwrap().len(), 1);
        Ok(())
    }

    #[test]
    fn message_body_uses_camel_case() -> anyhow::Result<()> {
        let message = TransportMessage {
            block_height: 9,
            transaction_id: "tx-1".into(),
            chunk_index: 0,
            chunk_count: 1,
            events: vec![event("A", 9, "tx-1", 0, 0)],
        };

        let json: serde_json::Value = serde_json::from_str(&message.to_json()?)?;

        assert_eq!(json["blockHeight"], 9);
        assert_eq!(json["chunkCount"], 1);
        assert_eq!(json["events"][0]["type"], "A");
        Ok(())
    }
}
