//! In-memory collaborators for tests: a scriptable ledger client and a recording broadcaster.

pub mod macros;

use std::{
    sync::{
        Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    BroadcastError, ChainError,
    chain::ChainClient,
    delivery::Broadcaster,
    types::{BlockHeader, BlockHeight, Event},
};

/// Builds an event with a deterministic block id, timestamp and payload.
#[must_use]
pub fn event(
    event_type: &str,
    block_height: BlockHeight,
    transaction_id: &str,
    transaction_index: u32,
    event_index: u32,
) -> Event {
    Event {
        block_id: format!("block-{block_height}"),
        block_height,
        block_timestamp: "2024-01-01T00:00:00Z".to_owned(),
        event_type: event_type.to_owned(),
        transaction_id: transaction_id.to_owned(),
        transaction_index,
        event_index,
        payload: serde_json::json!({ "tx": transaction_id, "index": event_index }),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct Script {
    max_range: Option<u64>,
    failing_heights: Vec<BlockHeight>,
}

/// A ledger held in memory.
///
/// Serves events filtered by type and range, records every event request, and can be scripted
/// to fail requests.
#[derive(Debug)]
pub struct MockChainClient {
    head: Mutex<BlockHeight>,
    events: Mutex<Vec<Event>>,
    requests: Mutex<Vec<(String, BlockHeight, BlockHeight)>>,
    latency: Mutex<Option<Duration>>,
    script: Mutex<Script>,
    head_failures: AtomicU32,
    event_failures: AtomicU32,
}

impl MockChainClient {
    #[must_use]
    pub fn new(head: BlockHeight) -> Self {
        Self {
            head: Mutex::new(head),
            events: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            latency: Mutex::new(None),
            script: Mutex::new(Script::default()),
            head_failures: AtomicU32::new(0),
            event_failures: AtomicU32::new(0),
        }
    }

    pub fn set_head(&self, head: BlockHeight) {
        *lock(&self.head) = head;
    }

    pub fn set_events(&self, events: Vec<Event>) {
        *lock(&self.events) = events;
    }

    pub fn push_events(&self, events: impl IntoIterator<Item = Event>) {
        lock(&self.events).extend(events);
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = Some(latency);
    }

    /// Fails the next `count` head requests.
    pub fn fail_next_head_requests(&self, count: u32) {
        self.head_failures.store(count, Ordering::SeqCst);
    }

    /// Fails the next `count` event requests.
    pub fn fail_next_event_requests(&self, count: u32) {
        self.event_failures.store(count, Ordering::SeqCst);
    }

    /// Fails every event request spanning more than `max_range` blocks.
    pub fn fail_ranges_larger_than(&self, max_range: u64) {
        lock(&self.script).max_range = Some(max_range);
    }

    /// Fails every event request whose range includes `height`.
    pub fn fail_height(&self, height: BlockHeight) {
        lock(&self.script).failing_heights.push(height);
    }

    /// Stops failing requests that include `height`.
    pub fn heal_height(&self, height: BlockHeight) {
        lock(&self.script).failing_heights.retain(|h| *h != height);
    }

    /// Event requests received so far, as `(event_type, start_height, end_height)`.
    #[must_use]
    pub fn requests(&self) -> Vec<(String, BlockHeight, BlockHeight)> {
        lock(&self.requests).clone()
    }

    async fn delay(&self) {
        let latency = *lock(&self.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

fn take_failure(counter: &AtomicU32) -> bool {
    counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok()
}

#[async_trait]
impl ChainClient for MockChainClient {
    async fn get_latest_block(&self) -> Result<BlockHeader, ChainError> {
        self.delay().await;
        if take_failure(&self.head_failures) {
            return Err(ChainError::request("head unavailable"));
        }
        let height = *lock(&self.head);
        Ok(BlockHeader { id: format!("block-{height}"), height })
    }

    async fn get_events(
        &self,
        event_type: &str,
        start_height: BlockHeight,
        end_height: BlockHeight,
    ) -> Result<Vec<Event>, ChainError> {
        lock(&self.requests).push((event_type.to_owned(), start_height, end_height));
        self.delay().await;

        if take_failure(&self.event_failures) {
            return Err(ChainError::request("events unavailable"));
        }
        {
            let script = lock(&self.script);
            if script.max_range.is_some_and(|max| end_height - start_height + 1 > max) {
                return Err(ChainError::request("response too large"));
            }
            if script.failing_heights.iter().any(|h| (start_height..=end_height).contains(h)) {
                return Err(ChainError::request("block unavailable"));
            }
        }

        Ok(lock(&self.events)
            .iter()
            .filter(|e| {
                e.event_type == event_type && (start_height..=end_height).contains(&e.block_height)
            })
            .cloned()
            .collect())
    }
}

/// Records every delivered block. Can be scripted to fail deliveries.
#[derive(Debug, Default)]
pub struct RecordingBroadcaster {
    deliveries: Mutex<Vec<(BlockHeight, Vec<Event>)>>,
    failures: AtomicU32,
    closed: AtomicBool,
}

impl RecordingBroadcaster {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the next `count` deliveries.
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Successful deliveries, in order.
    #[must_use]
    pub fn deliveries(&self) -> Vec<(BlockHeight, Vec<Event>)> {
        lock(&self.deliveries).clone()
    }

    /// Transaction ids of every delivered event, in delivery order.
    #[must_use]
    pub fn delivered_transactions(&self) -> Vec<String> {
        lock(&self.deliveries)
            .iter()
            .flat_map(|(_, events)| events.iter().map(|e| e.transaction_id.clone()))
            .collect()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Broadcaster for RecordingBroadcaster {
    async fn broadcast_events(
        &self,
        block_height: BlockHeight,
        events: &[Event],
    ) -> Result<(), BroadcastError> {
        if take_failure(&self.failures) {
            return Err(BroadcastError::Delivery("sink unavailable".to_owned()));
        }
        lock(&self.deliveries).push((block_height, events.to_vec()));
        Ok(())
    }

    async fn close(&self) -> Result<(), BroadcastError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
