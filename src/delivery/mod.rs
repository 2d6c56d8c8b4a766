//! Hand-off of ordered block events to downstream sinks.
//!
//! A [`Broadcaster`] receives every non-empty block from the coordinator. Block-level delivery is
//! at-least-once: a block is re-delivered if the process stops between delivering it and
//! persisting the watermark. Wrapping a broadcaster in a [`UniqueBroadcaster`] narrows that to
//! at-most-once per transaction, using a [`DeliveryTracker`] as the correctness boundary.

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::{BroadcastError, StoreError, types::BlockHeight, types::Event};

mod basic;
mod memory;
mod multicast;
mod sqlite;
mod transport;
mod unique;

pub use basic::{LogBroadcaster, NullBroadcaster};
pub use memory::MemoryDeliveryTracker;
pub use multicast::MulticastBroadcaster;
pub use sqlite::SqliteDeliveryTracker;
pub use transport::{
    DEFAULT_MAX_EVENTS_PER_MESSAGE, RetryingBroadcaster, Transport, TransportMessage, retry_delay,
};
pub use unique::UniqueBroadcaster;

/// Default age after which an unreleased lease can be reclaimed.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_millis(10_000);

/// Longest group discriminator accepted by the trackers.
pub const MAX_GROUP_ID_LEN: usize = 16;

/// Downstream sink for ordered block events.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Delivers the events of one block, already sorted by `(transaction_index, event_index)`.
    async fn broadcast_events(
        &self,
        block_height: BlockHeight,
        events: &[Event],
    ) -> Result<(), BroadcastError>;

    /// Releases any external resources.
    async fn close(&self) -> Result<(), BroadcastError> {
        Ok(())
    }
}

/// A lease on one delivery record.
///
/// Returned by [`DeliveryTracker::acquire_lock`]; only valid until released or until the lease
/// TTL elapses and another acquirer reclaims it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockHandle {
    pub key: String,
    pub lock_id: Uuid,
}

/// Lease-based record of which transactions have been delivered.
///
/// Implementations must make `acquire_lock` atomic with respect to concurrent callers, including
/// callers in other processes when the storage is shared.
#[async_trait]
pub trait DeliveryTracker: Send + Sync {
    /// Takes the lease for `key`, creating its record on first use.
    ///
    /// Returns `Ok(None)` while another holder's lease is still within its TTL.
    async fn acquire_lock(&self, key: &str) -> Result<Option<LockHandle>, StoreError>;

    /// Whether the record has been marked consumed.
    ///
    /// # Errors
    ///
    /// * [`StoreError::LeaseNotHeld`] - if `handle` no longer holds the lease.
    async fn check_consumed(&self, handle: &LockHandle) -> Result<bool, StoreError>;

    /// Marks the record consumed. A consumed record never goes back to unconsumed, so passing
    /// `false` after `true` has no effect.
    ///
    /// # Errors
    ///
    /// * [`StoreError::LeaseNotHeld`] - if `handle` no longer holds the lease.
    async fn set_consumed(&self, handle: &LockHandle, consumed: bool) -> Result<(), StoreError>;

    /// Gives up the lease without touching the consumed flag. Releasing a lease that was already
    /// reclaimed is a no-op.
    async fn release_lock(&self, handle: &LockHandle) -> Result<(), StoreError>;

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Appends a group discriminator to `key`, so independent consumers can track the same
/// transaction separately.
pub(crate) fn scoped_key(key: &str, group: Option<&str>) -> String {
    match group {
        Some(group) => format!("{key}-{group}"),
        None => key.to_owned(),
    }
}

pub(crate) fn validate_group_id(group: Option<&str>) -> Result<(), StoreError> {
    match group {
        Some(group) if group.chars().count() > MAX_GROUP_ID_LEN => {
            Err(StoreError::InvalidGroupId(group.to_owned()))
        }
        _ => Ok(()),
    }
}

/// Milliseconds since the Unix epoch, as stored in lease timestamps.
pub(crate) fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_discriminator_is_appended() {
        assert_eq!(scoped_key("tx-1", None), "tx-1");
        assert_eq!(scoped_key("tx-1", Some("billing")), "tx-1-billing");
    }

    #[test]
    fn long_group_ids_are_rejected() {
        assert!(validate_group_id(Some("exactly-16-chars")).is_ok());
        assert!(matches!(
            validate_group_id(Some("seventeen-chars!!")),
            Err(StoreError::InvalidGroupId(_))
        ));
        assert!(validate_group_id(None).is_ok());
    }
}
