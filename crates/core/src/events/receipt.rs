//! Types for the `m.receipt` EDU.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{OwnedEventId, OwnedRoomId, OwnedUserId, UnixMillis};

/// The content of an `m.receipt` EDU: receipts keyed by room.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(transparent)]
pub struct ReceiptContent(pub BTreeMap<OwnedRoomId, ReceiptMap>);

impl IntoIterator for ReceiptContent {
    type Item = (OwnedRoomId, ReceiptMap);
    type IntoIter = std::collections::btree_map::IntoIter<OwnedRoomId, ReceiptMap>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Mapping between user and `ReceiptData`.
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct ReceiptMap {
    /// Read receipts for users in the room.
    #[serde(rename = "m.read", default)]
    pub read: BTreeMap<OwnedUserId, ReceiptData>,
}

impl ReceiptMap {
    /// Creates a new `ReceiptMap`.
    pub fn new(read: BTreeMap<OwnedUserId, ReceiptData>) -> Self {
        Self { read }
    }
}

/// Metadata about the event that was last read and when.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ReceiptData {
    /// Metadata for the read receipt.
    pub data: Receipt,

    /// The extremity event ID the user has read up to.
    pub event_ids: Vec<OwnedEventId>,
}

impl ReceiptData {
    /// Creates a new `ReceiptData`.
    pub fn new(data: Receipt, event_ids: Vec<OwnedEventId>) -> Self {
        Self { data, event_ids }
    }
}

/// A receipt marker attached to an event.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Receipt {
    /// The time when the receipt was sent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ts: Option<UnixMillis>,
}

impl Receipt {
    /// Creates a new `Receipt` with the given timestamp.
    pub fn new(ts: UnixMillis) -> Self {
        Self { ts: Some(ts) }
    }
}
