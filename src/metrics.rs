use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Registry,
    register_histogram_vec_with_registry, register_histogram_with_registry,
    register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry,
};

const LATENCY_SEC_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

/// Label value for head polling requests.
pub(crate) const HEAD: &str = "head";
/// Label value for event range requests.
pub(crate) const EVENTS: &str = "events";

/// Metrics emitted by the scanner. The sink is whatever scrapes the [`Registry`].
#[derive(Clone, Debug)]
pub struct ScannerMetrics {
    pub(crate) chain_requests: IntCounterVec,
    pub(crate) chain_request_errors: IntCounterVec,
    pub(crate) chain_request_latency: HistogramVec,
    pub(crate) event_request_failures: IntCounter,
    pub(crate) blocks_processed: IntCounter,
    pub(crate) events_delivered: IntCounter,
    pub(crate) duplicate_transactions: IntCounter,
    pub(crate) confirmed_watermark: IntGauge,
    pub(crate) block_processing_latency: Histogram,
}

impl ScannerMetrics {
    /// Registers all scanner metrics with `registry`.
    ///
    /// # Errors
    ///
    /// Returns an error if a metric with the same name is already registered.
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        Ok(Self {
            chain_requests: register_int_counter_vec_with_registry!(
                "ledger_scanner_chain_requests",
                "Total number of requests sent to the ledger access node",
                &["kind"],
                registry,
            )?,
            chain_request_errors: register_int_counter_vec_with_registry!(
                "ledger_scanner_chain_request_errors",
                "Total number of failed requests to the ledger access node",
                &["kind"],
                registry,
            )?,
            chain_request_latency: register_histogram_vec_with_registry!(
                "ledger_scanner_chain_request_latency_seconds",
                "Latency of successful ledger requests",
                &["kind"],
                LATENCY_SEC_BUCKETS.to_vec(),
                registry,
            )?,
            event_request_failures: register_int_counter_with_registry!(
                "ledger_scanner_event_request_failures",
                "Single-block event fetches that exhausted their retry budget",
                registry,
            )?,
            blocks_processed: register_int_counter_with_registry!(
                "ledger_scanner_blocks_processed",
                "Total number of blocks merged and delivered",
                registry,
            )?,
            events_delivered: register_int_counter_with_registry!(
                "ledger_scanner_events_delivered",
                "Total number of events handed to the delivery path",
                registry,
            )?,
            duplicate_transactions: register_int_counter_with_registry!(
                "ledger_scanner_duplicate_transactions",
                "Transactions skipped because they were already delivered",
                registry,
            )?,
            confirmed_watermark: register_int_gauge_with_registry!(
                "ledger_scanner_confirmed_watermark",
                "Last block height delivered for every configured event type",
                registry,
            )?,
            block_processing_latency: register_histogram_with_registry!(
                HistogramOpts::new(
                    "ledger_scanner_block_processing_latency_seconds",
                    "Time spent merging, delivering and persisting one block",
                )
                .buckets(LATENCY_SEC_BUCKETS.to_vec()),
                registry,
            )?,
        })
    }

    /// Metrics backed by a private registry that nothing scrapes.
    #[must_use]
    pub fn detached() -> Self {
        let registry = Registry::new();
        // A fresh registry has no name collisions.
        Self::new(&registry).unwrap_or_else(|e| unreachable!("fresh registry rejected metrics: {e}"))
    }
}
