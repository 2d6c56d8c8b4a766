use std::{sync::Arc, time::Duration};

use crate::{
    ScannerConfig, ScannerError, ScannerMetrics,
    chain::ChainService,
    delivery::Broadcaster,
    event_bus::EventBus,
    scanner::{
        coordinator::{Coordinator, ScanPlan},
        head_tracker::DEFAULT_HEAD_POLL_INTERVAL,
        type_scanner::{
            DEFAULT_MAX_FETCH_SIZE, DEFAULT_MAX_LOOKAHEAD, DEFAULT_SCAN_INTERVAL,
            TypeScannerConfig,
        },
    },
    settings::SettingsStore,
    types::BlockHeight,
};

/// Default period of the coordinator's merge loop.
pub const DEFAULT_MERGE_INTERVAL: Duration = Duration::from_millis(100);

/// Builder/configuration for a [`Coordinator`].
#[derive(Clone, Debug)]
pub struct ScannerBuilder {
    /// Event types to scan. Duplicates are ignored, including ones pushed onto this field directly.
    pub event_types: Vec<String>,
    /// Maximum number of blocks per event request.
    pub max_fetch_size: u64,
    /// How far a type scanner may run ahead of the confirmed watermark.
    pub max_lookahead: u64,
    /// First height to deliver when nothing has been persisted yet.
    pub default_start_height: Option<BlockHeight>,
    pub head_poll_interval: Duration,
    pub scan_interval: Duration,
    pub merge_interval: Duration,
    pub metrics: Option<ScannerMetrics>,
}

impl Default for ScannerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ScannerBuilder {
    /// Creates a builder with default configuration and no event types.
    #[must_use]
    pub fn new() -> Self {
        Self {
            event_types: Vec::new(),
            max_fetch_size: DEFAULT_MAX_FETCH_SIZE,
            max_lookahead: DEFAULT_MAX_LOOKAHEAD,
            default_start_height: None,
            head_poll_interval: DEFAULT_HEAD_POLL_INTERVAL,
            scan_interval: DEFAULT_SCAN_INTERVAL,
            merge_interval: DEFAULT_MERGE_INTERVAL,
            metrics: None,
        }
    }

    /// Takes event types, start height and fetch limits from `config`.
    #[must_use]
    pub fn from_config(config: &ScannerConfig) -> Self {
        let mut builder = Self::new()
            .event_types(config.event_types.iter().cloned())
            .max_fetch_size(config.max_fetch_size)
            .max_lookahead(config.max_lookahead);
        builder.default_start_height = config.default_start_height;
        builder
    }

    /// Adds a single event type.
    #[must_use]
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        let event_type = event_type.into();
        if !self.event_types.contains(&event_type) {
            self.event_types.push(event_type);
        }
        self
    }

    /// Adds several event types.
    #[must_use]
    pub fn event_types<I, S>(self, event_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        event_types.into_iter().fold(self, Self::event_type)
    }

    /// Must be greater than 0.
    #[must_use]
    pub fn max_fetch_size(mut self, max_fetch_size: u64) -> Self {
        self.max_fetch_size = max_fetch_size;
        self
    }

    /// Must be greater than 0.
    #[must_use]
    pub fn max_lookahead(mut self, max_lookahead: u64) -> Self {
        self.max_lookahead = max_lookahead;
        self
    }

    /// Starts at `height` when the settings store holds no watermark. Without it the scan starts
    /// at the chain head.
    #[must_use]
    pub fn default_start_height(mut self, height: BlockHeight) -> Self {
        self.default_start_height = Some(height);
        self
    }

    #[must_use]
    pub fn head_poll_interval(mut self, interval: Duration) -> Self {
        self.head_poll_interval = interval;
        self
    }

    #[must_use]
    pub fn scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = interval;
        self
    }

    #[must_use]
    pub fn merge_interval(mut self, interval: Duration) -> Self {
        self.merge_interval = interval;
        self
    }

    /// Records metrics into `metrics`. Without it, metrics go to a private registry.
    #[must_use]
    pub fn metrics(mut self, metrics: ScannerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Builds a [`Coordinator`] around the given collaborators. Nothing runs until
    /// [`Coordinator::start`].
    ///
    /// # Errors
    ///
    /// * [`ScannerError::NoEventTypes`] - if no event type was configured.
    /// * [`ScannerError::InvalidMaxFetchSize`] - if `max_fetch_size` is 0.
    /// * [`ScannerError::InvalidMaxLookahead`] - if `max_lookahead` is 0.
    pub fn build(
        self,
        chain: ChainService,
        settings: Arc<dyn SettingsStore>,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Result<Coordinator, ScannerError> {
        let mut event_types: Vec<String> = Vec::with_capacity(self.event_types.len());
        for event_type in self.event_types {
            if !event_types.contains(&event_type) {
                event_types.push(event_type);
            }
        }
        if event_types.is_empty() {
            return Err(ScannerError::NoEventTypes);
        }
        if self.max_fetch_size == 0 {
            return Err(ScannerError::InvalidMaxFetchSize);
        }
        if self.max_lookahead == 0 {
            return Err(ScannerError::InvalidMaxLookahead);
        }

        let plan = ScanPlan {
            event_types,
            default_start_height: self.default_start_height,
            scanner: TypeScannerConfig {
                max_fetch_size: self.max_fetch_size,
                max_lookahead: self.max_lookahead,
                interval: self.scan_interval,
            },
            head_poll_interval: self.head_poll_interval,
            merge_interval: self.merge_interval,
        };
        let metrics = self.metrics.unwrap_or_else(ScannerMetrics::detached);

        Ok(Coordinator::new(
            plan,
            chain,
            settings,
            broadcaster,
            Arc::new(EventBus::new()),
            metrics,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        delivery::NullBroadcaster, scanner::type_scanner::TypeScanner, settings::MemorySettingsStore,
        test_utils::MockChainClient,
    };

    fn build(builder: ScannerBuilder) -> Result<Coordinator, ScannerError> {
        builder.build(
            ChainService::new(Arc::new(MockChainClient::new(10))),
            Arc::new(MemorySettingsStore::new()),
            Arc::new(NullBroadcaster),
        )
    }

    #[test]
    fn rejects_invalid_configuration() {
        assert!(matches!(build(ScannerBuilder::new()), Err(ScannerError::NoEventTypes)));
        assert!(matches!(
            build(ScannerBuilder::new().event_type("A").max_fetch_size(0)),
            Err(ScannerError::InvalidMaxFetchSize)
        ));
        assert!(matches!(
            build(ScannerBuilder::new().event_type("A").max_lookahead(0)),
            Err(ScannerError::InvalidMaxLookahead)
        ));
    }

    #[test]
    fn duplicate_event_types_are_dropped() {
        let builder = ScannerBuilder::new().event_types(["A", "B", "A"]).event_type("B");

        assert_eq!(builder.event_types, vec!["A".to_owned(), "B".to_owned()]);
    }

    #[tokio::test]
    async fn duplicates_set_on_the_field_get_one_scanner() -> anyhow::Result<()> {
        let mut builder = ScannerBuilder::new().event_type("A");
        builder.event_types.extend(["A".to_owned(), "B".to_owned(), "B".to_owned()]);

        let mut coordinator = build(builder)?;
        coordinator.initialize().await?;

        let types: Vec<_> = coordinator.scanners().iter().map(TypeScanner::event_type).collect();
        assert_eq!(types, vec!["A", "B"]);
        Ok(())
    }

    #[test]
    fn config_values_carry_over() -> anyhow::Result<()> {
        let config = ScannerConfig::from_yaml_str(
            "eventTypes: [A.Deposit, A.Withdraw]\nmaxFetchSize: 20\ndefaultStartHeight: 1000\n",
        )?;

        let builder = ScannerBuilder::from_config(&config);

        assert_eq!(builder.event_types.len(), 2);
        assert_eq!(builder.max_fetch_size, 20);
        assert_eq!(builder.max_lookahead, DEFAULT_MAX_LOOKAHEAD);
        assert_eq!(builder.default_start_height, Some(1000));
        Ok(())
    }
}
