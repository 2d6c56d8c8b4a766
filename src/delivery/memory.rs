use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use tokio::time::Instant;
use uuid::Uuid;

use crate::{
    StoreError,
    delivery::{DEFAULT_LOCK_TTL, DeliveryTracker, LockHandle, scoped_key, validate_group_id},
};

#[derive(Debug, Default)]
struct Record {
    lease: Option<(Uuid, Instant)>,
    consumed: bool,
}

/// In-process [`DeliveryTracker`].
///
/// Records live as long as the tracker, so it only deduplicates within one process. Useful for
/// tests and for embedders that persist nothing.
#[derive(Debug)]
pub struct MemoryDeliveryTracker {
    records: Mutex<HashMap<String, Record>>,
    group: Option<String>,
    lock_ttl: Duration,
}

impl Default for MemoryDeliveryTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDeliveryTracker {
    #[must_use]
    pub fn new() -> Self {
        Self { records: Mutex::new(HashMap::new()), group: None, lock_ttl: DEFAULT_LOCK_TTL }
    }

    /// Scopes every key to `group`.
    ///
    /// # Errors
    ///
    /// * [`StoreError::InvalidGroupId`] - if `group` is longer than 16 characters.
    pub fn with_group(mut self, group: impl Into<String>) -> Result<Self, StoreError> {
        let group = group.into();
        validate_group_id(Some(&group))?;
        self.group = Some(group);
        Ok(self)
    }

    #[must_use]
    pub fn with_lock_ttl(mut self, lock_ttl: Duration) -> Self {
        self.lock_ttl = lock_ttl;
        self
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, Record>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn held<'a>(
        records: &'a mut HashMap<String, Record>,
        handle: &LockHandle,
    ) -> Result<&'a mut Record, StoreError> {
        records
            .get_mut(&handle.key)
            .filter(|record| matches!(record.lease, Some((id, _)) if id == handle.lock_id))
            .ok_or_else(|| StoreError::LeaseNotHeld { key: handle.key.clone() })
    }
}

#[async_trait]
impl DeliveryTracker for MemoryDeliveryTracker {
    async fn acquire_lock(&self, key: &str) -> Result<Option<LockHandle>, StoreError> {
        let key = scoped_key(key, self.group.as_deref());
        let now = Instant::now();
        let mut records = self.records();
        let record = records.entry(key.clone()).or_default();

        let free = record
            .lease
            .is_none_or(|(_, acquired)| now.duration_since(acquired) > self.lock_ttl);
        if !free {
            return Ok(None);
        }

        let lock_id = Uuid::new_v4();
        record.lease = Some((lock_id, now));
        Ok(Some(LockHandle { key, lock_id }))
    }

    async fn check_consumed(&self, handle: &LockHandle) -> Result<bool, StoreError> {
        let mut records = self.records();
        Ok(Self::held(&mut records, handle)?.consumed)
    }

    async fn set_consumed(&self, handle: &LockHandle, consumed: bool) -> Result<(), StoreError> {
        let mut records = self.records();
        let record = Self::held(&mut records, handle)?;
        record.consumed |= consumed;
        Ok(())
    }

    async fn release_lock(&self, handle: &LockHandle) -> Result<(), StoreError> {
        let mut records = self.records();
        if let Ok(record) = Self::held(&mut records, handle) {
            record.lease = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquirer_waits_for_release() -> anyhow::Result<()> {
        let tracker = MemoryDeliveryTracker::new();

        let first = tracker.acquire_lock("tx-1").await?.expect("free record");
        assert!(tracker.acquire_lock("tx-1").await?.is_none());

        tracker.release_lock(&first).await?;
        assert!(tracker.acquire_lock("tx-1").await?.is_some());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_is_reclaimed() -> anyhow::Result<()> {
        let tracker = MemoryDeliveryTracker::new().with_lock_ttl(Duration::from_millis(100));

        let stale = tracker.acquire_lock("tx-1").await?.expect("free record");
        tokio::time::advance(Duration::from_millis(50)).await;
        assert!(tracker.acquire_lock("tx-1").await?.is_none());

        tokio::time::advance(Duration::from_millis(51)).await;
        let fresh = tracker.acquire_lock("tx-1").await?.expect("expired lease");

        assert_ne!(stale.lock_id, fresh.lock_id);
        assert!(matches!(
            tracker.check_consumed(&stale).await,
            Err(StoreError::LeaseNotHeld { .. })
        ));
        // releasing the stale handle must not free the new holder's lease
        tracker.release_lock(&stale).await?;
        assert!(tracker.acquire_lock("tx-1").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn consumed_is_terminal() -> anyhow::Result<()> {
        let tracker = MemoryDeliveryTracker::new();

        let handle = tracker.acquire_lock("tx-1").await?.expect("free record");
        assert!(!tracker.check_consumed(&handle).await?);
        tracker.set_consumed(&handle, true).await?;
        tracker.set_consumed(&handle, false).await?;
        tracker.release_lock(&handle).await?;

        let handle = tracker.acquire_lock("tx-1").await?.expect("released record");
        assert!(tracker.check_consumed(&handle).await?);
        Ok(())
    }

    #[tokio::test]
    async fn groups_track_keys_independently() -> anyhow::Result<()> {
        let billing = MemoryDeliveryTracker::new().with_group("billing")?;

        let handle = billing.acquire_lock("tx-1").await?.expect("free record");

        assert_eq!(handle.key, "tx-1-billing");
        assert!(MemoryDeliveryTracker::new().with_group("a-group-name-too-long").is_err());
        Ok(())
    }
}
