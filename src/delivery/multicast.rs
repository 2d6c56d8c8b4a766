use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;

use crate::{
    BroadcastError,
    delivery::Broadcaster,
    types::{BlockHeight, Event},
};

/// Fans each block out to several broadcasters concurrently.
///
/// A failing target is logged and does not fail the block, so the other targets are never
/// held back by it.
pub struct MulticastBroadcaster {
    targets: Vec<Arc<dyn Broadcaster>>,
}

impl MulticastBroadcaster {
    #[must_use]
    pub fn new(targets: Vec<Arc<dyn Broadcaster>>) -> Self {
        Self { targets }
    }
}

#[async_trait]
impl Broadcaster for MulticastBroadcaster {
    async fn broadcast_events(
        &self,
        block_height: BlockHeight,
        events: &[Event],
    ) -> Result<(), BroadcastError> {
        let results =
            join_all(self.targets.iter().map(|t| t.broadcast_events(block_height, events))).await;
        for (index, result) in results.into_iter().enumerate() {
            if let Err(e) = result {
                error!(
                    target_index = index,
                    block_height = block_height,
                    error = %e,
                    "Multicast target failed"
                );
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BroadcastError> {
        let results = join_all(self.targets.iter().map(|t| t.close())).await;
        results.into_iter().collect()
    }
}

impl std::fmt::Debug for MulticastBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MulticastBroadcaster").field("targets", &self.targets.len()).finish()
    }
}
