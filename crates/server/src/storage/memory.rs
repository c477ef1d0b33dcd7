//! An in-memory `EventStore`, the default backing for tests and
//! single-process runs.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use super::{EventStore, StoredPdu, TransactionResultMap};
use crate::core::identifiers::*;
use crate::core::state::StateMap;
use crate::core::{MatrixError, RoomVersionId};
use crate::event::PduEvent;
use crate::AppResult;

#[derive(Debug)]
struct RoomMeta {
    version: RoomVersionId,
    #[allow(dead_code)]
    creator: OwnedUserId,
    resolved_state: StateMap<OwnedEventId>,
    forward_extremities: Vec<OwnedEventId>,
}

#[derive(Default)]
struct Inner {
    events: HashMap<OwnedEventId, StoredPdu>,
    rooms: HashMap<OwnedRoomId, RoomMeta>,
    state_before: HashMap<OwnedEventId, StateMap<OwnedEventId>>,
    transactions: HashMap<(OwnedServerName, OwnedTransactionId), TransactionResultMap>,
}

/// Event log, state index and transaction journal behind one `RwLock`.
///
/// Writers take the lock exclusively, which gives `put` its
/// all-or-nothing visibility; readers share it.
#[derive(Default)]
pub struct MemoryEventStore {
    inner: RwLock<Inner>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().expect("store lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().expect("store lock poisoned")
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn put(&self, event: StoredPdu) -> AppResult<()> {
        let mut inner = self.write();
        let event_id = event.pdu.event_id.clone();
        // Duplicate puts are no-ops, which makes racing writers safe.
        inner.events.entry(event_id).or_insert(event);
        Ok(())
    }

    async fn get(&self, event_id: &EventId) -> AppResult<Option<Arc<PduEvent>>> {
        Ok(self.read().events.get(event_id).map(|e| e.pdu.clone()))
    }

    async fn get_full(&self, event_id: &EventId) -> AppResult<Option<StoredPdu>> {
        Ok(self.read().events.get(event_id).cloned())
    }

    async fn get_many(&self, event_ids: &[OwnedEventId]) -> AppResult<Vec<Arc<PduEvent>>> {
        let inner = self.read();
        Ok(event_ids
            .iter()
            .filter_map(|id| inner.events.get(id).map(|e| e.pdu.clone()))
            .collect())
    }

    async fn promote_outlier(&self, event_id: &EventId) -> AppResult<()> {
        if let Some(event) = self.write().events.get_mut(event_id) {
            event.outlier = false;
        }
        Ok(())
    }

    async fn mark_soft_failed(&self, event_id: &EventId) -> AppResult<()> {
        if let Some(event) = self.write().events.get_mut(event_id) {
            event.soft_failed = true;
        }
        Ok(())
    }

    async fn create_room(
        &self,
        room_id: &RoomId,
        version: RoomVersionId,
        creator: &UserId,
    ) -> AppResult<()> {
        let mut inner = self.write();
        inner.rooms.entry(room_id.to_owned()).or_insert(RoomMeta {
            version,
            creator: creator.to_owned(),
            resolved_state: StateMap::new(),
            forward_extremities: Vec::new(),
        });
        Ok(())
    }

    async fn room_exists(&self, room_id: &RoomId) -> AppResult<bool> {
        Ok(self.read().rooms.contains_key(room_id))
    }

    async fn room_version(&self, room_id: &RoomId) -> AppResult<RoomVersionId> {
        self.read()
            .rooms
            .get(room_id)
            .map(|meta| meta.version.clone())
            .ok_or_else(|| MatrixError::not_found("room is unknown to this server").into())
    }

    async fn resolved_state(&self, room_id: &RoomId) -> AppResult<StateMap<OwnedEventId>> {
        Ok(self
            .read()
            .rooms
            .get(room_id)
            .map(|meta| meta.resolved_state.clone())
            .unwrap_or_default())
    }

    async fn set_resolved_state(
        &self,
        room_id: &RoomId,
        state: StateMap<OwnedEventId>,
    ) -> AppResult<()> {
        let mut inner = self.write();
        let meta = inner
            .rooms
            .get_mut(room_id)
            .ok_or_else(|| MatrixError::not_found("room is unknown to this server"))?;
        meta.resolved_state = state;
        Ok(())
    }

    async fn state_before(
        &self,
        event_id: &EventId,
    ) -> AppResult<Option<StateMap<OwnedEventId>>> {
        Ok(self.read().state_before.get(event_id).cloned())
    }

    async fn set_state_before(
        &self,
        event_id: &EventId,
        state: StateMap<OwnedEventId>,
    ) -> AppResult<()> {
        self.write().state_before.insert(event_id.to_owned(), state);
        Ok(())
    }

    async fn auth_chain(&self, starting: &[OwnedEventId]) -> AppResult<HashSet<OwnedEventId>> {
        let inner = self.read();
        let mut chain = HashSet::new();
        let mut stack: Vec<OwnedEventId> = starting.to_vec();

        while let Some(event_id) = stack.pop() {
            if !chain.insert(event_id.clone()) {
                continue;
            }
            if let Some(event) = inner.events.get(&event_id) {
                stack.extend(event.pdu.auth_events.iter().cloned());
            }
        }

        Ok(chain)
    }

    async fn latest_forward_extremities(
        &self,
        room_id: &RoomId,
    ) -> AppResult<Vec<OwnedEventId>> {
        Ok(self
            .read()
            .rooms
            .get(room_id)
            .map(|meta| meta.forward_extremities.clone())
            .unwrap_or_default())
    }

    async fn set_forward_extremities(
        &self,
        room_id: &RoomId,
        extremities: Vec<OwnedEventId>,
    ) -> AppResult<()> {
        let mut inner = self.write();
        let meta = inner
            .rooms
            .get_mut(room_id)
            .ok_or_else(|| MatrixError::not_found("room is unknown to this server"))?;
        meta.forward_extremities = extremities;
        Ok(())
    }

    async fn missing_events(
        &self,
        room_id: &RoomId,
        earliest_events: &[OwnedEventId],
        latest_events: &[OwnedEventId],
        limit: usize,
        min_depth: i64,
    ) -> AppResult<Vec<Arc<PduEvent>>> {
        let inner = self.read();
        let stop: HashSet<&OwnedEventId> = earliest_events.iter().collect();

        let mut queue: VecDeque<OwnedEventId> = latest_events.iter().cloned().collect();
        let mut seen: HashSet<OwnedEventId> = queue.iter().cloned().collect();
        let mut found = Vec::new();

        while let Some(event_id) = queue.pop_front() {
            let Some(stored) = inner.events.get(&event_id) else {
                continue;
            };
            for prev_id in &stored.pdu.prev_events {
                if stop.contains(prev_id) || !seen.insert(prev_id.clone()) {
                    continue;
                }
                let Some(prev) = inner.events.get(prev_id) else {
                    continue;
                };
                if prev.pdu.room_id != room_id || prev.pdu.depth < min_depth {
                    continue;
                }
                // Outliers lack the context the peer is asking for.
                if prev.outlier {
                    continue;
                }
                found.push(prev.pdu.clone());
                if found.len() >= limit {
                    return Ok(found);
                }
                queue.push_back(prev_id.clone());
            }
        }

        Ok(found)
    }

    async fn transaction_result(
        &self,
        origin: &ServerName,
        txn_id: &TransactionId,
    ) -> AppResult<Option<TransactionResultMap>> {
        Ok(self
            .read()
            .transactions
            .get(&(origin.to_owned(), txn_id.to_owned()))
            .cloned())
    }

    async fn record_transaction_result(
        &self,
        origin: &ServerName,
        txn_id: &TransactionId,
        result: &TransactionResultMap,
    ) -> AppResult<()> {
        self.write()
            .transactions
            .insert((origin.to_owned(), txn_id.to_owned()), result.clone());
        Ok(())
    }
}
