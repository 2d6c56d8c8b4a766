use std::{sync::Arc, time::Duration};

use ledger_scanner::{
    Broadcaster, RateLimiter, ScannerBuilder,
    chain::ChainServiceBuilder,
    delivery::{LogBroadcaster, MemoryDeliveryTracker, UniqueBroadcaster},
    settings::MemorySettingsStore,
    test_utils::{MockChainClient, event},
};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEPOSIT: &str = "A.0b2a3299cc857e29.Vault.Deposit";
const WITHDRAW: &str = "A.0b2a3299cc857e29.Vault.Withdraw";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).try_init();

    let client = Arc::new(MockChainClient::new(10));
    client.set_latency(Duration::from_millis(20));
    client.set_events(
        (1..=20)
            .flat_map(|h| {
                let tx = format!("tx-{h}");
                [event(WITHDRAW, h, &tx, 0, 0), event(DEPOSIT, h, &tx, 0, 1)]
            })
            .collect(),
    );

    let chain = ChainServiceBuilder::new(client.clone())
        .rate_limiter(RateLimiter::new(20.0, 20.0))
        .build();
    let broadcaster: Arc<dyn Broadcaster> = Arc::new(UniqueBroadcaster::new(
        Arc::new(MemoryDeliveryTracker::new()),
        Arc::new(LogBroadcaster),
    ));

    let mut coordinator = ScannerBuilder::new()
        .event_types([DEPOSIT, WITHDRAW])
        .default_start_height(1)
        .max_fetch_size(5)
        .head_poll_interval(Duration::from_millis(200))
        .build(chain, Arc::new(MemorySettingsStore::new()), broadcaster)?;

    let (tx, mut rx) = watch::channel(0);
    let _listener = coordinator.event_bus().watermark_advanced.subscribe(move |advanced| {
        let _ = tx.send(advanced.block_height);
    })?;

    coordinator.start().await?;
    rx.wait_for(|height| *height >= 10).await?;
    info!(watermark = coordinator.confirmed_watermark(), "Caught up with the initial head");

    client.set_head(20);
    rx.wait_for(|height| *height >= 20).await?;
    info!(watermark = coordinator.confirmed_watermark(), "Followed the head");

    coordinator.stop().await?;
    Ok(())
}
