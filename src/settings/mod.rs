//! Persistence of the confirmed watermark.
//!
//! The stored height is a resume point only: after a restart the coordinator re-delivers every
//! block above it, and per-transaction deduplication is left to the
//! [`DeliveryTracker`](crate::delivery::DeliveryTracker).

use async_trait::async_trait;

use crate::{StoreError, types::BlockHeight};

mod memory;
mod sqlite;

pub use memory::MemorySettingsStore;
pub use sqlite::SqliteSettingsStore;

#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Last persisted confirmed watermark, if any.
    async fn get_confirmed_watermark(&self) -> Result<Option<BlockHeight>, StoreError>;

    /// Persists `height`. Must be durable when it returns, because the coordinator announces the
    /// new watermark right after.
    async fn set_confirmed_watermark(&self, height: BlockHeight) -> Result<(), StoreError>;

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
