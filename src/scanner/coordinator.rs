use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::time::Instant;

use crate::{
    ScannerError, ScannerMetrics,
    chain::ChainService,
    delivery::Broadcaster,
    event_bus::{EventBus, RemovableListener},
    scanner::{
        head_tracker::HeadTracker,
        ticker::{PeriodicTask, spawn_periodic},
        type_scanner::{TypeScanner, TypeScannerConfig},
    },
    settings::SettingsStore,
    types::{BlockHeight, Event, FetchedBatch, WatermarkAdvanced},
};

/// Everything the coordinator needs to know about how to scan.
#[derive(Clone, Debug)]
pub(crate) struct ScanPlan {
    pub(crate) event_types: Vec<String>,
    pub(crate) default_start_height: Option<BlockHeight>,
    pub(crate) scanner: TypeScannerConfig,
    pub(crate) head_poll_interval: Duration,
    pub(crate) merge_interval: Duration,
}

#[derive(Debug, Default)]
struct MergeState {
    confirmed: BlockHeight,
    /// event type -> height -> events, for heights above `confirmed`.
    pending: HashMap<String, BTreeMap<BlockHeight, Vec<Event>>>,
}

/// Drives a full scan: one [`TypeScanner`] per event type, a [`HeadTracker`], and the merge loop
/// that turns per-type batches into ordered, delivered blocks.
///
/// The confirmed watermark only moves to `h` once every event type has a batch for `h`, the
/// block's events have been delivered, and `h` has been persisted.
pub struct Coordinator {
    inner: Arc<CoordinatorInner>,
    plan: ScanPlan,
    head_tracker: HeadTracker,
    scanners: Vec<TypeScanner>,
    listeners: Vec<RemovableListener>,
    task: Option<PeriodicTask>,
}

struct CoordinatorInner {
    event_types: Vec<String>,
    bus: Arc<EventBus>,
    chain: ChainService,
    settings: Arc<dyn SettingsStore>,
    broadcaster: Arc<dyn Broadcaster>,
    metrics: ScannerMetrics,
    state: Mutex<MergeState>,
}

impl Coordinator {
    pub(crate) fn new(
        plan: ScanPlan,
        chain: ChainService,
        settings: Arc<dyn SettingsStore>,
        broadcaster: Arc<dyn Broadcaster>,
        bus: Arc<EventBus>,
        metrics: ScannerMetrics,
    ) -> Self {
        let head_tracker =
            HeadTracker::new(chain.clone(), bus.clone(), metrics.clone(), plan.head_poll_interval);
        Self {
            inner: Arc::new(CoordinatorInner {
                event_types: plan.event_types.clone(),
                bus,
                chain,
                settings,
                broadcaster,
                metrics,
                state: Mutex::new(MergeState::default()),
            }),
            plan,
            head_tracker,
            scanners: Vec::new(),
            listeners: Vec::new(),
            task: None,
        }
    }

    /// Recovers the confirmed watermark, subscribes to fetched batches and creates the type
    /// scanners, without starting any loop.
    ///
    /// Recovery order: the persisted watermark, else `default_start_height - 1`, else the current
    /// chain head minus one. Calling this on an initialized coordinator is a no-op.
    ///
    /// # Errors
    ///
    /// * [`ScannerError::Store`] - if the settings store cannot be read.
    /// * [`ScannerError::Chain`] - if the chain head is needed and cannot be fetched.
    /// * [`ScannerError::TooManyListeners`] - if the event bus is full.
    pub async fn initialize(&mut self) -> Result<(), ScannerError> {
        if !self.listeners.is_empty() {
            return Ok(());
        }

        let confirmed = self.recover_watermark().await?;
        {
            let mut state = self.inner.state();
            state.confirmed = confirmed;
            state.pending =
                self.inner.event_types.iter().map(|t| (t.clone(), BTreeMap::new())).collect();
        }
        self.inner.metrics.confirmed_watermark.set(gauge_value(confirmed));

        let inner = self.inner.clone();
        self.listeners.push(self.inner.bus.events_fetched.subscribe(move |batch| {
            inner.buffer(batch);
        })?);

        self.scanners = self
            .plan
            .event_types
            .iter()
            .map(|event_type| {
                TypeScanner::new(
                    event_type.clone(),
                    confirmed,
                    self.inner.chain.clone(),
                    self.inner.bus.clone(),
                    self.inner.metrics.clone(),
                    self.plan.scanner,
                )
            })
            .collect();

        info!(
            confirmed_watermark = confirmed,
            event_types = self.plan.event_types.len(),
            "Coordinator initialized"
        );
        Ok(())
    }

    /// Initializes if needed, then starts the type scanners, the head tracker and the merge loop.
    ///
    /// # Errors
    ///
    /// See [`initialize`](Self::initialize).
    pub async fn start(&mut self) -> Result<(), ScannerError> {
        if self.task.is_some() {
            return Ok(());
        }
        self.initialize().await?;

        info!("Starting coordinator");
        for scanner in &mut self.scanners {
            scanner.start()?;
        }
        self.head_tracker.start();

        let inner = self.inner.clone();
        self.task = Some(spawn_periodic(self.plan.merge_interval, move || {
            let inner = inner.clone();
            async move {
                // errors are logged inside; the next cycle retries the same height
                let _ = inner.process_pending().await;
            }
        }));
        Ok(())
    }

    /// Stops every loop, drops the subscriptions and closes the settings store and broadcaster.
    ///
    /// In-flight cycles are not aborted. Both collaborators are closed even if the first close
    /// fails; the first error is returned.
    ///
    /// # Errors
    ///
    /// * [`ScannerError::Store`] - if the settings store fails to close.
    /// * [`ScannerError::Broadcast`] - if the broadcaster fails to close.
    pub async fn stop(&mut self) -> Result<(), ScannerError> {
        info!("Stopping coordinator");
        for listener in self.listeners.drain(..) {
            listener.remove();
        }
        self.head_tracker.stop();
        for mut scanner in self.scanners.drain(..) {
            scanner.stop();
        }
        if let Some(task) = self.task.take() {
            task.stop();
        }

        let settings = self.inner.settings.close().await;
        let broadcaster = self.inner.broadcaster.close().await;
        settings?;
        broadcaster?;
        Ok(())
    }

    /// Runs one merge cycle, advancing the watermark over every height that is complete.
    ///
    /// Returns the number of heights advanced.
    ///
    /// # Errors
    ///
    /// * [`ScannerError::Broadcast`] - if delivery of a block fails.
    /// * [`ScannerError::Store`] - if the watermark cannot be persisted.
    ///
    /// Heights advanced before the failure stay advanced; the failing height is retried on the
    /// next call.
    pub async fn process_pending(&self) -> Result<u64, ScannerError> {
        self.inner.process_pending().await
    }

    /// Last height delivered for every event type.
    #[must_use]
    pub fn confirmed_watermark(&self) -> BlockHeight {
        self.inner.state().confirmed
    }

    #[must_use]
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.inner.bus
    }

    #[must_use]
    pub fn head_tracker(&self) -> &HeadTracker {
        &self.head_tracker
    }

    /// The per-type scanners, in configuration order. Empty until initialized.
    #[must_use]
    pub fn scanners(&self) -> &[TypeScanner] {
        &self.scanners
    }

    async fn recover_watermark(&self) -> Result<BlockHeight, ScannerError> {
        if let Some(height) = self.inner.settings.get_confirmed_watermark().await? {
            debug!(block_height = height, "Resuming from persisted watermark");
            return Ok(height);
        }
        if let Some(start) = self.plan.default_start_height {
            debug!(block_height = start, "Starting from configured height");
            return Ok(start.saturating_sub(1));
        }
        let head = self.inner.chain.get_latest_block().await?;
        debug!(block_height = head.height, "Starting from chain head");
        Ok(head.height.saturating_sub(1))
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("plan", &self.plan)
            .field("confirmed_watermark", &self.confirmed_watermark())
            .field("running", &self.task.is_some())
            .finish_non_exhaustive()
    }
}

impl CoordinatorInner {
    fn state(&self) -> MutexGuard<'_, MergeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn buffer(&self, batch: &FetchedBatch) {
        let mut state = self.state();
        if batch.block_height <= state.confirmed {
            return;
        }
        if let Some(heights) = state.pending.get_mut(&batch.event_type) {
            heights.insert(batch.block_height, batch.events.clone());
        }
    }

    /// Ordered events of `height`, or `None` while some event type has no batch for it.
    fn complete_block(&self, height: BlockHeight) -> Option<Vec<Event>> {
        let state = self.state();
        let mut events = Vec::new();
        for event_type in &self.event_types {
            events.extend_from_slice(state.pending.get(event_type)?.get(&height)?);
        }
        drop(state);

        events.sort_by_key(Event::order_key);
        Some(events)
    }

    async fn process_pending(&self) -> Result<u64, ScannerError> {
        let mut advanced = 0;
        loop {
            let started = Instant::now();
            let height = self.state().confirmed + 1;
            let Some(events) = self.complete_block(height) else {
                return Ok(advanced);
            };

            if let Err(e) = self.commit(height, &events).await {
                error!(block_height = height, error = %e, "Failed to process block");
                return Err(e);
            }

            {
                let mut state = self.state();
                for heights in state.pending.values_mut() {
                    heights.remove(&height);
                }
                state.confirmed = height;
            }

            self.metrics.blocks_processed.inc();
            self.metrics.events_delivered.inc_by(events.len() as u64);
            self.metrics.confirmed_watermark.set(gauge_value(height));
            self.metrics.block_processing_latency.observe(started.elapsed().as_secs_f64());
            trace!(block_height = height, events = events.len(), "Watermark advanced");

            self.bus.watermark_advanced.publish(&WatermarkAdvanced { block_height: height });
            advanced += 1;
        }
    }

    async fn commit(&self, height: BlockHeight, events: &[Event]) -> Result<(), ScannerError> {
        if !events.is_empty() {
            self.broadcaster.broadcast_events(height, events).await?;
        }
        self.settings.set_confirmed_watermark(height).await?;
        Ok(())
    }
}

fn gauge_value(height: BlockHeight) -> i64 {
    i64::try_from(height).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        settings::MemorySettingsStore,
        test_utils::{MockChainClient, RecordingBroadcaster, event},
        types::FetchedBatch,
    };

    fn plan(event_types: &[&str]) -> ScanPlan {
        ScanPlan {
            event_types: event_types.iter().map(|t| (*t).to_owned()).collect(),
            default_start_height: None,
            scanner: TypeScannerConfig::default(),
            head_poll_interval: Duration::from_millis(1000),
            merge_interval: Duration::from_millis(100),
        }
    }

    fn coordinator(
        plan: ScanPlan,
        settings: Arc<dyn SettingsStore>,
        broadcaster: Arc<RecordingBroadcaster>,
    ) -> Coordinator {
        Coordinator::new(
            plan,
            ChainService::new(Arc::new(MockChainClient::new(100))),
            settings,
            broadcaster,
            Arc::new(EventBus::new()),
            ScannerMetrics::detached(),
        )
    }

    fn batch(event_type: &str, height: BlockHeight, events: Vec<Event>) -> FetchedBatch {
        FetchedBatch { event_type: event_type.to_owned(), block_height: height, events }
    }

    #[tokio::test]
    async fn block_waits_for_every_event_type() -> anyhow::Result<()> {
        let broadcaster = Arc::new(RecordingBroadcaster::new());
        let settings = Arc::new(MemorySettingsStore::with_watermark(4));
        let mut coordinator = coordinator(plan(&["A", "B", "C"]), settings, broadcaster.clone());
        coordinator.initialize().await?;
        let bus = coordinator.event_bus().clone();

        bus.events_fetched.publish(&batch("A", 5, vec![event("A", 5, "tx-1", 0, 0)]));
        bus.events_fetched.publish(&batch("B", 5, vec![]));
        assert_eq!(coordinator.process_pending().await?, 0);
        assert_eq!(coordinator.confirmed_watermark(), 4);

        bus.events_fetched.publish(&batch("C", 5, vec![]));
        assert_eq!(coordinator.process_pending().await?, 1);
        assert_eq!(coordinator.confirmed_watermark(), 5);
        assert_eq!(broadcaster.deliveries().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn events_are_merged_in_transaction_order() -> anyhow::Result<()> {
        let broadcaster = Arc::new(RecordingBroadcaster::new());
        let settings = Arc::new(MemorySettingsStore::with_watermark(0));
        let mut coordinator = coordinator(plan(&["A", "B"]), settings, broadcaster.clone());
        coordinator.initialize().await?;
        let bus = coordinator.event_bus().clone();

        bus.events_fetched.publish(&batch("A", 1, vec![
            event("A", 1, "tx-3", 2, 0),
            event("A", 1, "tx-1", 0, 1),
        ]));
        bus.events_fetched.publish(&batch("B", 1, vec![
            event("B", 1, "tx-1", 0, 0),
            event("B", 1, "tx-2", 1, 0),
        ]));
        coordinator.process_pending().await?;

        let deliveries = broadcaster.deliveries();
        let order: Vec<_> = deliveries[0].1.iter().map(Event::order_key).collect();
        assert_eq!(order, vec![(0, 0), (0, 1), (1, 0), (2, 0)]);
        Ok(())
    }

    #[tokio::test]
    async fn advances_several_heights_in_one_cycle() -> anyhow::Result<()> {
        let broadcaster = Arc::new(RecordingBroadcaster::new());
        let settings = Arc::new(MemorySettingsStore::with_watermark(10));
        let mut coordinator = coordinator(plan(&["A"]), settings.clone(), broadcaster.clone());
        coordinator.initialize().await?;
        let bus = coordinator.event_bus().clone();
        let announced = Arc::new(Mutex::new(Vec::new()));
        let _listener = {
            let announced = announced.clone();
            bus.watermark_advanced
                .subscribe(move |ev| announced.lock().unwrap().push(ev.block_height))?
        };

        for height in 11..=13 {
            bus.events_fetched.publish(&batch("A", height, vec![]));
        }
        bus.events_fetched.publish(&batch("A", 15, vec![]));

        assert_eq!(coordinator.process_pending().await?, 3);
        assert_eq!(*announced.lock().unwrap(), vec![11, 12, 13]);
        assert_eq!(settings.get_confirmed_watermark().await?, Some(13));
        // empty blocks advance the watermark without a delivery
        assert!(broadcaster.deliveries().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn failed_delivery_keeps_the_block_for_retry() -> anyhow::Result<()> {
        let broadcaster = Arc::new(RecordingBroadcaster::new());
        let settings = Arc::new(MemorySettingsStore::with_watermark(0));
        let mut coordinator = coordinator(plan(&["A"]), settings.clone(), broadcaster.clone());
        coordinator.initialize().await?;
        let bus = coordinator.event_bus().clone();
        bus.events_fetched.publish(&batch("A", 1, vec![event("A", 1, "tx-1", 0, 0)]));

        broadcaster.fail_next(1);
        assert!(coordinator.process_pending().await.is_err());
        assert_eq!(coordinator.confirmed_watermark(), 0);
        assert_eq!(settings.get_confirmed_watermark().await?, Some(0));

        assert_eq!(coordinator.process_pending().await?, 1);
        assert_eq!(broadcaster.deliveries().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn stale_batches_are_ignored() -> anyhow::Result<()> {
        let broadcaster = Arc::new(RecordingBroadcaster::new());
        let settings = Arc::new(MemorySettingsStore::with_watermark(7));
        let mut coordinator = coordinator(plan(&["A"]), settings, broadcaster.clone());
        coordinator.initialize().await?;

        let stale = batch("A", 7, vec![event("A", 7, "tx", 0, 0)]);
        coordinator.event_bus().events_fetched.publish(&stale);

        assert_eq!(coordinator.process_pending().await?, 0);
        assert!(coordinator.inner.state().pending["A"].is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn watermark_recovery_order() -> anyhow::Result<()> {
        let broadcaster = Arc::new(RecordingBroadcaster::new());

        let mut from_settings = coordinator(
            ScanPlan { default_start_height: Some(50), ..plan(&["A"]) },
            Arc::new(MemorySettingsStore::with_watermark(20)),
            broadcaster.clone(),
        );
        from_settings.initialize().await?;
        assert_eq!(from_settings.confirmed_watermark(), 20);

        let mut from_config = coordinator(
            ScanPlan { default_start_height: Some(50), ..plan(&["A"]) },
            Arc::new(MemorySettingsStore::new()),
            broadcaster.clone(),
        );
        from_config.initialize().await?;
        assert_eq!(from_config.confirmed_watermark(), 49);

        let mut from_head =
            coordinator(plan(&["A"]), Arc::new(MemorySettingsStore::new()), broadcaster);
        from_head.initialize().await?;
        assert_eq!(from_head.confirmed_watermark(), 99);
        assert_eq!(from_head.scanners()[0].fetched_height(), 99);
        Ok(())
    }

    #[tokio::test]
    async fn stop_closes_collaborators_and_unsubscribes() -> anyhow::Result<()> {
        let broadcaster = Arc::new(RecordingBroadcaster::new());
        let settings = Arc::new(MemorySettingsStore::with_watermark(0));
        let mut coordinator = coordinator(plan(&["A", "B"]), settings, broadcaster.clone());

        coordinator.start().await?;
        assert_eq!(coordinator.event_bus().head_updated.listener_count(), 2);
        coordinator.stop().await?;

        assert!(broadcaster.is_closed());
        let bus = coordinator.event_bus();
        assert_eq!(bus.events_fetched.listener_count(), 0);
        assert_eq!(bus.head_updated.listener_count(), 0);
        assert_eq!(bus.watermark_advanced.listener_count(), 0);
        Ok(())
    }
}
