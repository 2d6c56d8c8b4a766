use std::{sync::Arc, time::Duration};

use ledger_scanner::{
    Broadcaster, Coordinator, Event, ScannerBuilder, ScannerMetrics,
    chain::ChainServiceBuilder,
    settings::MemorySettingsStore,
    test_utils::{MockChainClient, RecordingBroadcaster, event},
};
use prometheus::Registry;

pub struct ScannerSetup {
    pub client: Arc<MockChainClient>,
    pub settings: Arc<MemorySettingsStore>,
    pub recorder: Arc<RecordingBroadcaster>,
    pub registry: Registry,
    pub coordinator: Coordinator,
}

/// A builder with short loop periods, scanning `event_types`.
pub fn fast_builder(event_types: &[&str]) -> ScannerBuilder {
    ScannerBuilder::new()
        .event_types(event_types.iter().copied())
        .head_poll_interval(Duration::from_millis(100))
        .scan_interval(Duration::from_millis(10))
        .merge_interval(Duration::from_millis(20))
}

/// Builds a coordinator over an in-memory ledger whose head is at `head`.
///
/// Blocks are recorded by `recorder`; `deliver_through` may wrap it (for example in a
/// `UniqueBroadcaster`) before it is handed to the coordinator.
pub fn setup_scanner_with(
    builder: ScannerBuilder,
    head: u64,
    settings: Arc<MemorySettingsStore>,
    deliver_through: impl FnOnce(Arc<RecordingBroadcaster>) -> Arc<dyn Broadcaster>,
) -> anyhow::Result<ScannerSetup> {
    let client = Arc::new(MockChainClient::new(head));
    let recorder = Arc::new(RecordingBroadcaster::new());
    let registry = Registry::new();
    let metrics = ScannerMetrics::new(&registry)?;

    let coordinator = builder.metrics(metrics).build(
        ChainServiceBuilder::new(client.clone()).build(),
        settings.clone(),
        deliver_through(recorder.clone()),
    )?;

    Ok(ScannerSetup { client, settings, recorder, registry, coordinator })
}

pub fn setup_scanner(builder: ScannerBuilder, head: u64) -> anyhow::Result<ScannerSetup> {
    setup_scanner_with(builder, head, Arc::new(MemorySettingsStore::new()), |recorder| {
        recorder as Arc<dyn Broadcaster>
    })
}

/// Events of `event_type`, one transaction per height.
pub fn one_per_height(event_type: &str, heights: impl IntoIterator<Item = u64>) -> Vec<Event> {
    heights
        .into_iter()
        .map(|h| event(event_type, h, &format!("tx-{event_type}-{h}"), 0, 0))
        .collect()
}

/// Current value of a counter or gauge registered in `registry`.
pub fn metric_value(registry: &Registry, name: &str) -> f64 {
    registry
        .gather()
        .iter()
        .find(|family| family.get_name() == name)
        .and_then(|family| family.get_metric().first())
        .map_or(0.0, |metric| {
            if metric.has_counter() {
                metric.get_counter().get_value()
            } else {
                metric.get_gauge().get_value()
            }
        })
}
