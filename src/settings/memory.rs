use std::sync::Mutex;

use async_trait::async_trait;

use crate::{StoreError, settings::SettingsStore, types::BlockHeight};

/// Keeps the watermark in memory. Every restart starts from scratch.
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    watermark: Mutex<Option<BlockHeight>>,
}

impl MemorySettingsStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that already holds `height`, as if a previous run had persisted it.
    #[must_use]
    pub fn with_watermark(height: BlockHeight) -> Self {
        Self { watermark: Mutex::new(Some(height)) }
    }
}

#[async_trait]
impl SettingsStore for MemorySettingsStore {
    async fn get_confirmed_watermark(&self) -> Result<Option<BlockHeight>, StoreError> {
        Ok(*self.watermark.lock().map_err(|_| StoreError::Poisoned)?)
    }

    async fn set_confirmed_watermark(&self, height: BlockHeight) -> Result<(), StoreError> {
        *self.watermark.lock().map_err(|_| StoreError::Poisoned)? = Some(height);
        Ok(())
    }
}
