use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use rand::Rng;
use tokio::time::{Instant, sleep};

use crate::{
    ChainError, ScannerError, ScannerMetrics,
    chain::ChainService,
    event_bus::{EventBus, RemovableListener},
    metrics::EVENTS,
    scanner::ticker::{PeriodicTask, spawn_periodic},
    types::{BlockHeight, Event, FetchedBatch},
};

/// Default maximum number of blocks requested in one call.
pub const DEFAULT_MAX_FETCH_SIZE: u64 = 50;
/// Default maximum distance a scanner may run ahead of the confirmed watermark.
pub const DEFAULT_MAX_LOOKAHEAD: u64 = 100;
/// Default period of the per-type scan loop.
pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_millis(50);

/// Additional attempts allowed for a single block before giving up on the cycle.
const SINGLE_BLOCK_RETRIES: u32 = 3;
const RETRY_STEP: Duration = Duration::from_millis(250);
const RETRY_JITTER_MS: u64 = 1000;

/// Tuning for a [`TypeScanner`].
#[derive(Clone, Copy, Debug)]
pub struct TypeScannerConfig {
    pub max_fetch_size: u64,
    pub max_lookahead: u64,
    pub interval: Duration,
}

impl Default for TypeScannerConfig {
    fn default() -> Self {
        Self {
            max_fetch_size: DEFAULT_MAX_FETCH_SIZE,
            max_lookahead: DEFAULT_MAX_LOOKAHEAD,
            interval: DEFAULT_SCAN_INTERVAL,
        }
    }
}

#[derive(Debug)]
struct ScanState {
    head: Option<BlockHeight>,
    confirmed: BlockHeight,
    fetched: BlockHeight,
}

impl ScanState {
    /// Next range to request, or `None` when caught up to the head or held back by the
    /// lookahead cap.
    fn next_range(
        &self,
        max_fetch_size: u64,
        max_lookahead: u64,
    ) -> Option<(BlockHeight, BlockHeight)> {
        let head = self.head?;
        let start = self.fetched + 1;
        let end = head
            .min(start.saturating_add(max_fetch_size.saturating_sub(1)))
            .min(self.confirmed.saturating_add(max_lookahead));
        (start <= end).then_some((start, end))
    }
}

/// Fetches events of one type, publishing a [`FetchedBatch`] for every height it covers.
///
/// The scanner keeps a fetch watermark that only ever moves forward by contiguous heights. It
/// never requests a height above `confirmed + max_lookahead`, so a stalled coordinator stops
/// every scanner within a bounded distance.
#[derive(Debug)]
pub struct TypeScanner {
    inner: Arc<TypeScannerInner>,
    listeners: Vec<RemovableListener>,
    task: Option<PeriodicTask>,
}

#[derive(Debug)]
struct TypeScannerInner {
    event_type: String,
    chain: ChainService,
    bus: Arc<EventBus>,
    metrics: ScannerMetrics,
    config: TypeScannerConfig,
    state: Mutex<ScanState>,
}

impl TypeScanner {
    /// Creates a scanner that resumes right after `confirmed`.
    #[must_use]
    pub fn new(
        event_type: impl Into<String>,
        confirmed: BlockHeight,
        chain: ChainService,
        bus: Arc<EventBus>,
        metrics: ScannerMetrics,
        config: TypeScannerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(TypeScannerInner {
                event_type: event_type.into(),
                chain,
                bus,
                metrics,
                config,
                state: Mutex::new(ScanState { head: None, confirmed, fetched: confirmed }),
            }),
            listeners: Vec::new(),
            task: None,
        }
    }

    #[must_use]
    pub fn event_type(&self) -> &str {
        &self.inner.event_type
    }

    /// Highest height published so far.
    #[must_use]
    pub fn fetched_height(&self) -> BlockHeight {
        self.inner.state().fetched
    }

    /// Subscribes to head and watermark updates and starts the scan loop.
    ///
    /// # Errors
    ///
    /// * [`ScannerError::TooManyListeners`] - if the event bus is full.
    pub fn start(&mut self) -> Result<(), ScannerError> {
        if self.task.is_some() {
            return Ok(());
        }

        let on_head = {
            let inner = self.inner.clone();
            self.inner.bus.head_updated.subscribe(move |ev| inner.observe_head(ev.block_height))?
        };
        let on_watermark = {
            let inner = self.inner.clone();
            self.inner
                .bus
                .watermark_advanced
                .subscribe(move |ev| inner.observe_watermark(ev.block_height))?
        };
        self.listeners = vec![on_head, on_watermark];

        info!(event_type = %self.inner.event_type, "Starting event scanner");
        let inner = self.inner.clone();
        self.task = Some(spawn_periodic(self.inner.config.interval, move || {
            let inner = inner.clone();
            async move {
                if let Err(e) = inner.scan().await {
                    error!(event_type = %inner.event_type, error = %e, "Event scan cycle failed");
                }
            }
        }));
        Ok(())
    }

    /// Unsubscribes from the bus and stops scheduling cycles. An in-flight cycle completes.
    pub fn stop(&mut self) {
        for listener in self.listeners.drain(..) {
            listener.remove();
        }
        if let Some(task) = self.task.take() {
            info!(event_type = %self.inner.event_type, "Stopping event scanner");
            task.stop();
        }
    }

    /// Records a new chain head. Normally driven by [`HeadUpdated`](crate::HeadUpdated).
    pub fn observe_head(&self, height: BlockHeight) {
        self.inner.observe_head(height);
    }

    /// Records a new confirmed watermark. Normally driven by
    /// [`WatermarkAdvanced`](crate::WatermarkAdvanced).
    pub fn observe_watermark(&self, height: BlockHeight) {
        self.inner.observe_watermark(height);
    }

    /// Runs a single scan cycle.
    ///
    /// # Errors
    ///
    /// * [`ChainError`] - if a single block still fails after its retry budget. The fetch
    ///   watermark is left untouched so the next cycle retries the same block.
    pub async fn scan_once(&self) -> Result<(), ChainError> {
        self.inner.scan().await
    }
}

impl Drop for TypeScanner {
    fn drop(&mut self) {
        self.stop();
    }
}

impl TypeScannerInner {
    fn state(&self) -> MutexGuard<'_, ScanState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn observe_head(&self, height: BlockHeight) {
        let mut state = self.state();
        state.head = Some(state.head.map_or(height, |head| head.max(height)));
    }

    fn observe_watermark(&self, height: BlockHeight) {
        let mut state = self.state();
        state.confirmed = state.confirmed.max(height);
        state.fetched = state.fetched.max(state.confirmed);
    }

    async fn scan(&self) -> Result<(), ChainError> {
        let range = self.state().next_range(self.config.max_fetch_size, self.config.max_lookahead);
        let Some((start, end)) = range else {
            return Ok(());
        };

        let mut fetch_size = end - start + 1;
        let mut single_block_failures = 0u32;
        loop {
            let end = start + fetch_size - 1;
            debug!(
                event_type = %self.event_type,
                start_height = start,
                end_height = end,
                "Fetching events"
            );

            let started = Instant::now();
            match self.chain.get_events(&self.event_type, start, end).await {
                Ok(events) => {
                    self.metrics.chain_requests.with_label_values(&[EVENTS]).inc();
                    self.metrics
                        .chain_request_latency
                        .with_label_values(&[EVENTS])
                        .observe(started.elapsed().as_secs_f64());
                    self.publish(start, end, events);
                    return Ok(());
                }
                Err(e) => {
                    self.metrics.chain_request_errors.with_label_values(&[EVENTS]).inc();
                    warn!(
                        event_type = %self.event_type,
                        start_height = start,
                        end_height = end,
                        error = %e,
                        "Failed to fetch events"
                    );

                    if fetch_size > 1 {
                        fetch_size = (fetch_size / 4).max(1);
                        continue;
                    }

                    single_block_failures += 1;
                    if single_block_failures > SINGLE_BLOCK_RETRIES {
                        self.metrics.event_request_failures.inc();
                        return Err(e);
                    }
                    sleep(retry_delay(single_block_failures)).await;
                }
            }
        }
    }

    /// Publishes one batch per height in `[start, end]`, advancing the fetch watermark as it goes.
    fn publish(&self, start: BlockHeight, end: BlockHeight, events: Vec<Event>) {
        let mut by_height: BTreeMap<BlockHeight, Vec<Event>> = BTreeMap::new();
        for event in events {
            if (start..=end).contains(&event.block_height) {
                by_height.entry(event.block_height).or_default().push(event);
            }
        }

        for height in start..=end {
            let batch = FetchedBatch {
                event_type: self.event_type.clone(),
                block_height: height,
                events: by_height.remove(&height).unwrap_or_default(),
            };
            self.bus.events_fetched.publish(&batch);

            let mut state = self.state();
            state.fetched = state.fetched.max(height);
        }
        trace!(event_type = %self.event_type, end_height = end, "Fetch watermark advanced");
    }
}

fn retry_delay(attempt: u32) -> Duration {
    let jitter = rand::rng().random_range(0..RETRY_JITTER_MS);
    RETRY_STEP * attempt + Duration::from_millis(jitter)
}
