//! The storage interface the engine runs against.
//!
//! Persistent engines are out of scope; the contract below is everything
//! the core needs, and [`MemoryEventStore`] implements it for tests and
//! single-process runs. Durability rule: once `put` returns, the event is
//! visible to every subsequent read from any task.

mod memory;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;

pub use self::memory::MemoryEventStore;
use crate::core::identifiers::*;
use crate::core::serde::CanonicalJsonObject;
use crate::core::state::StateMap;
use crate::core::RoomVersionId;
use crate::event::PduEvent;
use crate::AppResult;

/// The per-PDU outcome map of a processed transaction.
pub type TransactionResultMap = BTreeMap<OwnedEventId, Result<(), String>>;

/// An event with its storage metadata.
#[derive(Clone, Debug)]
pub struct StoredPdu {
    /// The parsed event.
    pub pdu: Arc<PduEvent>,

    /// The canonical JSON the event arrived as.
    pub json: CanonicalJsonObject,

    /// Stored without full DAG context; excluded from resolved state until
    /// promoted.
    pub outlier: bool,

    /// Passed auth against its own auth events but failed against the
    /// current state; kept in the DAG, hidden from resolved state.
    pub soft_failed: bool,

    /// Why the event was rejected outright, if it was.
    pub rejection_reason: Option<String>,
}

impl StoredPdu {
    /// A plain, accepted timeline event.
    pub fn accepted(pdu: PduEvent, json: CanonicalJsonObject) -> Self {
        Self {
            pdu: Arc::new(pdu),
            json,
            outlier: false,
            soft_failed: false,
            rejection_reason: None,
        }
    }
}

/// Append-only event log, state index and auth-chain retrieval.
///
/// Writes are transactional; readers see a consistent snapshot.
/// `put` is idempotent on `event_id`, which makes duplicate writes safe
/// under races.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends an event. A duplicate `event_id` is a no-op.
    async fn put(&self, event: StoredPdu) -> AppResult<()>;

    /// Fetches a single event.
    async fn get(&self, event_id: &EventId) -> AppResult<Option<Arc<PduEvent>>>;

    /// Fetches a single event with its storage metadata.
    async fn get_full(&self, event_id: &EventId) -> AppResult<Option<StoredPdu>>;

    /// Fetches many events; missing ones are skipped.
    async fn get_many(&self, event_ids: &[OwnedEventId]) -> AppResult<Vec<Arc<PduEvent>>>;

    /// Clears the outlier flag once an event has gained full DAG context.
    async fn promote_outlier(&self, event_id: &EventId) -> AppResult<()>;

    /// Marks a stored event as soft-failed.
    async fn mark_soft_failed(&self, event_id: &EventId) -> AppResult<()>;

    /// Registers a room with its immutable version and creator.
    async fn create_room(
        &self,
        room_id: &RoomId,
        version: RoomVersionId,
        creator: &UserId,
    ) -> AppResult<()>;

    /// Whether the server holds the room.
    async fn room_exists(&self, room_id: &RoomId) -> AppResult<bool>;

    /// The room's version, fixed by its create event.
    async fn room_version(&self, room_id: &RoomId) -> AppResult<RoomVersionId>;

    /// The current resolved state of the room.
    async fn resolved_state(&self, room_id: &RoomId) -> AppResult<StateMap<OwnedEventId>>;

    /// Replaces the current resolved state of the room.
    async fn set_resolved_state(
        &self,
        room_id: &RoomId,
        state: StateMap<OwnedEventId>,
    ) -> AppResult<()>;

    /// The state of the room before the given event, if it was recorded
    /// when the event was processed.
    async fn state_before(
        &self,
        event_id: &EventId,
    ) -> AppResult<Option<StateMap<OwnedEventId>>>;

    /// Records the state of the room before the given event.
    async fn set_state_before(
        &self,
        event_id: &EventId,
        state: StateMap<OwnedEventId>,
    ) -> AppResult<()>;

    /// The transitive closure of `auth_events` over the given starting
    /// points, as IDs. Unknown events terminate their branch.
    async fn auth_chain(&self, starting: &[OwnedEventId]) -> AppResult<HashSet<OwnedEventId>>;

    /// The current DAG tips of the room, used as `prev_events` for new
    /// local events.
    async fn latest_forward_extremities(
        &self,
        room_id: &RoomId,
    ) -> AppResult<Vec<OwnedEventId>>;

    /// Replaces the DAG tips of the room.
    async fn set_forward_extremities(
        &self,
        room_id: &RoomId,
        extremities: Vec<OwnedEventId>,
    ) -> AppResult<()>;

    /// Breadth-first gap fill over `prev_events`: events between
    /// `earliest_events` and `latest_events`, newest first, capped by
    /// `limit` and `min_depth`.
    ///
    /// Outliers are not returned; they lack the context a remote peer
    /// would be asking for.
    async fn missing_events(
        &self,
        room_id: &RoomId,
        earliest_events: &[OwnedEventId],
        latest_events: &[OwnedEventId],
        limit: usize,
        min_depth: i64,
    ) -> AppResult<Vec<Arc<PduEvent>>>;

    /// The recorded outcome of a previously processed transaction.
    async fn transaction_result(
        &self,
        origin: &ServerName,
        txn_id: &TransactionId,
    ) -> AppResult<Option<TransactionResultMap>>;

    /// Records the outcome of a transaction for replay.
    async fn record_transaction_result(
        &self,
        origin: &ServerName,
        txn_id: &TransactionId,
        result: &TransactionResultMap,
    ) -> AppResult<()>;
}
