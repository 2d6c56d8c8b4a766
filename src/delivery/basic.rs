use async_trait::async_trait;

use crate::{
    BroadcastError,
    delivery::Broadcaster,
    types::{BlockHeight, Event},
};

/// Discards every block.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullBroadcaster;

#[async_trait]
impl Broadcaster for NullBroadcaster {
    async fn broadcast_events(&self, _: BlockHeight, _: &[Event]) -> Result<(), BroadcastError> {
        Ok(())
    }
}

/// Logs a summary of every block at `info`.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogBroadcaster;

#[async_trait]
impl Broadcaster for LogBroadcaster {
    async fn broadcast_events(
        &self,
        block_height: BlockHeight,
        events: &[Event],
    ) -> Result<(), BroadcastError> {
        info!(block_height = block_height, events = events.len(), "Broadcasting events");
        Ok(())
    }
}
