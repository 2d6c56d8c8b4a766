use serde::{Deserialize, Serialize};

/// Position of a block in the ledger's block sequence.
pub type BlockHeight = u64;

/// The latest block reported by the ledger access node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub id: String,
    pub height: BlockHeight,
}

/// A single ledger-emitted event.
///
/// Within one block, events are totally ordered by `(transaction_index, event_index)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub block_id: String,
    pub block_height: BlockHeight,
    pub block_timestamp: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub transaction_id: String,
    pub transaction_index: u32,
    pub event_index: u32,
    pub payload: serde_json::Value,
}

impl Event {
    /// Key used to order events inside a block.
    #[must_use]
    pub fn order_key(&self) -> (u32, u32) {
        (self.transaction_index, self.event_index)
    }
}

/// Result of fetching one event type at one height.
///
/// Exactly one batch is published per `(event_type, height)` ever fetched. Heights without
/// matching events get an empty batch so the coordinator can tell "no events" apart from "not
/// fetched yet".
#[derive(Clone, Debug, PartialEq)]
pub struct FetchedBatch {
    pub event_type: String,
    pub block_height: BlockHeight,
    pub events: Vec<Event>,
}

/// Published when the head tracker observes a strictly higher chain head.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HeadUpdated {
    pub block_height: BlockHeight,
}

/// Published after the coordinator has delivered and persisted a height.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct WatermarkAdvanced {
    pub block_height: BlockHeight,
}

/// Groups events by transaction id, keeping the order in which transactions first appear.
pub(crate) fn group_by_transaction(events: &[Event]) -> Vec<(String, Vec<Event>)> {
    let mut groups: Vec<(String, Vec<Event>)> = Vec::new();
    for event in events {
        match groups.iter_mut().find(|(id, _)| *id == event.transaction_id) {
            Some((_, group)) => group.push(event.clone()),
            None => groups.push((event.transaction_id.clone(), vec![event.clone()])),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::event;

    #[test]
    fn groups_keep_first_appearance_order() {
        let events = vec![
            event("A", 1, "tx-2", 0, 0),
            event("A", 1, "tx-1", 1, 0),
            event("B", 1, "tx-2", 0, 1),
        ];

        let groups = group_by_transaction(&events);

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, "tx-2");
        assert_eq!(groups[0].1.len(), 2);
        assert_eq!(groups[1].0, "tx-1");
    }

    #[test]
    fn event_serializes_type_field() {
        let json = serde_json::to_value(event("A.Deposit", 7, "tx", 0, 0)).unwrap();

        assert_eq!(json["type"], "A.Deposit");
        assert_eq!(json["blockHeight"], 7);
        assert_eq!(json["transactionId"], "tx");
    }
}
