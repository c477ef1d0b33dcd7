//! End-to-end PDU ingestion.
//!
//! When receiving an event one needs to:
//! 1. Skip the PDU if it is already known as a timeline event
//! 2. Check signatures, otherwise drop
//! 3. Check content hash, redact if it doesn't match
//! 4. Fetch any missing auth events as outliers
//! 5. Reject if the event doesn't pass auth based on its auth events
//! 6. Persist the event as an outlier
//! 7. If not a timeline event: stop
//! 8. Fetch any missing prev events
//! 9. Resolve the state before the event and re-check auth against it
//! 10. Check auth against the current resolved state; on failure soft-fail
//! 11. Use state resolution to derive the new room state
//! 12. Notify local subscribers
//!
//! The per-room lock is only held for the state update; every network
//! fetch happens outside it.

mod fetching;
mod state_at_incoming;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use crate::core::events::StateEventType;
use crate::core::identifiers::*;
use crate::core::serde::{canonical_json, CanonicalJsonObject};
use crate::core::signatures::Verified;
use crate::core::state::{event_auth, StateError, StateMap};
use crate::core::{MatrixError, RoomVersionId};
use crate::event::PduEvent;
use crate::storage::StoredPdu;
use crate::{AppResult, Server};

impl Server {
    /// Processes one inbound PDU end to end.
    ///
    /// `is_timeline_event` is false for events pulled in as context (auth
    /// chains, state fetches); those stop at the outlier stage.
    #[tracing::instrument(skip(self, value))]
    pub async fn process_incoming_pdu(
        &self,
        origin: &ServerName,
        event_id: &EventId,
        room_id: &RoomId,
        room_version_id: &RoomVersionId,
        value: CanonicalJsonObject,
        is_timeline_event: bool,
    ) -> AppResult<()> {
        if !self.store().room_exists(room_id).await? {
            return Err(MatrixError::not_found("room is unknown to this server").into());
        }

        // Room ACL applies to the origin and to the sender's server.
        self.acl_check(origin, room_id).await?;
        let sender: OwnedUserId = value
            .get("sender")
            .and_then(|v| v.as_str())
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| MatrixError::bad_json("PDU has no valid sender"))?;
        if sender.server_name() != origin {
            self.acl_check(sender.server_name(), room_id).await?;
        }

        // Skip the PDU if we already have it as a timeline event.
        if let Some(existing) = self.store().get_full(event_id).await? {
            if !existing.outlier {
                return Ok(());
            }
        }

        let (pdu, val) = self
            .process_to_outlier_pdu(origin, event_id, room_id, room_version_id, value)
            .await?;

        if !is_timeline_event {
            return Ok(());
        }

        // Fill DAG gaps behind this event, bounded; failure to backfill is
        // not fatal to the event itself.
        if let Err(e) = self
            .fetch_missing_prev_events(origin, room_id, room_version_id, &pdu)
            .await
        {
            warn!(%event_id, "error fetching missing prev events: {e}");
        }

        self.process_to_timeline_pdu(pdu, val, origin, room_id).await
    }

    /// Validation steps 2-6: signatures, hash, auth-against-auth-events,
    /// and persistence as an outlier.
    #[tracing::instrument(skip(self, value))]
    pub(crate) async fn process_to_outlier_pdu(
        &self,
        origin: &ServerName,
        event_id: &EventId,
        room_id: &RoomId,
        room_version_id: &RoomVersionId,
        mut value: CanonicalJsonObject,
    ) -> AppResult<(Arc<PduEvent>, CanonicalJsonObject)> {
        if let Some(existing) = self.store().get_full(event_id).await? {
            if existing.rejection_reason.is_some() {
                return Err(MatrixError::forbidden("event was already rejected").into());
            }
            return Ok((existing.pdu, existing.json));
        }

        let rules = room_version_id.rules();

        // 1.1 Remove the unsigned field; peers have no say over it.
        value.remove("unsigned");

        // 2./3. Signatures must verify over the redacted event; a hash
        // mismatch demotes the event to its redacted form.
        let val = match self.verify_event(&value, room_version_id).await {
            Ok(Verified::All) => value,
            Ok(Verified::Signatures) => {
                warn!("calculated hash does not match (redacting): {event_id}");
                canonical_json::redact(value, &rules.redaction, None)
                    .map_err(|_| MatrixError::invalid_param("redaction failed"))?
            }
            Err(e) => {
                warn!("dropping bad event {event_id}: {e}");
                return Err(
                    MatrixError::invalid_param("signature verification failed").into()
                );
            }
        };

        let pdu = PduEvent::from_canonical_object(event_id, val.clone())
            .map_err(|e| MatrixError::bad_json(format!("event is not a valid PDU: {e}")))?;
        check_room_id(room_id, &pdu)?;

        // 4. Fetch any missing auth events, as outliers.
        let missing_auth: Vec<OwnedEventId> = {
            let mut missing = Vec::new();
            for auth_id in &pdu.auth_events {
                if self.store().get(auth_id).await?.is_none() {
                    missing.push(auth_id.clone());
                }
            }
            missing
        };
        if !missing_auth.is_empty() {
            if let Err(e) = self
                .fetch_and_process_outliers(origin, &missing_auth, room_id, room_version_id)
                .await
            {
                warn!(%event_id, "failed to fetch auth events: {e}");
            }
        }

        // 5. Auth check based on the event's own auth events.
        let mut rejection_reason = None;

        let mut auth_state: StateMap<Arc<PduEvent>> = StateMap::new();
        let mut rejected_auth_events = Vec::new();
        for auth_id in &pdu.auth_events {
            match self.store().get_full(auth_id).await? {
                Some(stored) => {
                    if stored.rejection_reason.is_some() {
                        rejected_auth_events.push(auth_id.clone());
                        continue;
                    }
                    if let Some(state_key) = stored.pdu.state_key.clone() {
                        if stored.pdu.room_id != *room_id {
                            rejection_reason =
                                Some("auth event from a different room".to_owned());
                            continue;
                        }
                        let key = ((&stored.pdu.event_ty).into(), state_key);
                        if auth_state.insert(key, stored.pdu).is_some() {
                            rejection_reason =
                                Some("duplicate auth event slot".to_owned());
                        }
                    }
                }
                None => {
                    rejection_reason =
                        Some(format!("missing auth event {auth_id}"));
                }
            }
        }
        if !rejected_auth_events.is_empty() {
            rejection_reason = Some(format!(
                "event's auth events were rejected: {rejected_auth_events:?}"
            ));
        }

        if rejection_reason.is_none() {
            if let Err(e) = event_auth::auth_check(
                &rules.authorization,
                &pdu,
                third_party_invite_event(&auth_state, &pdu).as_ref(),
                |ty, key| auth_state.get(&(ty.clone(), key.to_owned())).cloned(),
            ) {
                rejection_reason = Some(e.to_string());
            }
        }

        if let Some(reason) = &rejection_reason {
            warn!(%event_id, %reason, "event rejected at the outlier stage");
        } else {
            debug!(%event_id, "validation successful, persisting outlier");
        }

        // 6. Persist as an outlier either way; rejected events stay
        // referenceable without ever entering the resolved state.
        let stored = StoredPdu {
            pdu: Arc::new(pdu),
            json: val.clone(),
            outlier: true,
            soft_failed: false,
            rejection_reason: rejection_reason.clone(),
        };
        self.store().put(stored.clone()).await?;

        if rejection_reason.is_some() {
            return Err(MatrixError::forbidden("event failed the auth check").into());
        }

        Ok((stored.pdu, val))
    }

    /// Steps 9-12: upgrade an outlier into the timeline, updating the
    /// room's resolved state.
    #[tracing::instrument(skip(self, pdu, json))]
    pub(crate) async fn process_to_timeline_pdu(
        &self,
        pdu: Arc<PduEvent>,
        _json: CanonicalJsonObject,
        origin: &ServerName,
        room_id: &RoomId,
    ) -> AppResult<()> {
        // Skip if it is already a timeline event.
        match self.store().get_full(&pdu.event_id).await? {
            Some(stored) if !stored.outlier => return Ok(()),
            _ => {}
        }

        info!("upgrading {} to timeline pdu", pdu.event_id);
        let room_version_id = self.room_version(room_id).await?;
        let rules = room_version_id.rules();

        // 9. The state before this event, from its prev events or by
        //    asking the origin.
        let state_at_event = match self.state_at_incoming_resolved(&pdu, room_id).await? {
            Some(state) => state,
            None => {
                self.fetch_state_for_event(origin, room_id, &room_version_id, &pdu.event_id)
                    .await?
            }
        };

        // Auth check against the state before the event.
        let fetched = self.prefetch_state_events(&state_at_event).await?;
        event_auth::auth_check(
            &rules.authorization,
            &pdu,
            third_party_invite_event(&fetched, &pdu).as_ref(),
            |ty, key| fetched.get(&(ty.clone(), key.to_owned())).cloned(),
        )
        .map_err(|e| {
            MatrixError::forbidden(format!("event failed auth against its prior state: {e}"))
        })?;
        debug!("auth check against prior state succeeded");

        // 10. Soft-fail check: the same auth rules against the *current*
        //     resolved state.
        let current_state = self.store().resolved_state(room_id).await?;
        let current_fetched = self.prefetch_state_events(&current_state).await?;
        let soft_fail = event_auth::auth_check(
            &rules.authorization,
            &pdu,
            third_party_invite_event(&current_fetched, &pdu).as_ref(),
            |ty, key| current_fetched.get(&(ty.clone(), key.to_owned())).cloned(),
        )
        .is_err();

        // 11. Single serialization point per room: everything from here
        //     to the state write happens under the room lock, with no
        //     network I/O inside.
        let state_lock = self.lock_room(room_id).await;

        let mut extremities: BTreeSet<OwnedEventId> = self
            .store()
            .latest_forward_extremities(room_id)
            .await?
            .into_iter()
            .collect();
        for prev_id in &pdu.prev_events {
            extremities.remove(prev_id);
        }
        extremities.insert(pdu.event_id.clone());

        self.store()
            .set_state_before(&pdu.event_id, state_at_event.clone())
            .await?;
        self.store().promote_outlier(&pdu.event_id).await?;
        self.store()
            .set_forward_extremities(room_id, extremities.into_iter().collect())
            .await?;

        if soft_fail {
            // Soft-failed events stay in the DAG, usable as prev_events
            // and counted in depth, but never reach the resolved state and
            // are not relayed. Not an error to the sender.
            warn!(event_id = %pdu.event_id, "event was soft failed");
            self.store().mark_soft_failed(&pdu.event_id).await?;
            drop(state_lock);
            return Ok(());
        }

        if let Some(state_key) = &pdu.state_key {
            let mut state_after = state_at_event;
            state_after.insert(
                ((&pdu.event_ty).into(), state_key.clone()),
                pdu.event_id.clone(),
            );
            let new_state = self.resolve_room_state(room_id, state_after).await?;
            self.store().set_resolved_state(room_id, new_state).await?;
        }

        drop(state_lock);

        // 12. Tell anyone listening.
        self.notify_pdu(&pdu.event_id);
        Ok(())
    }

    /// Runs state resolution between the room's current state and the
    /// given fork, returning the merged state.
    pub(crate) async fn resolve_room_state(
        &self,
        room_id: &RoomId,
        incoming_state: StateMap<OwnedEventId>,
    ) -> AppResult<StateMap<OwnedEventId>> {
        let rules = self.room_version_rules(room_id).await?;
        let current_state = self.store().resolved_state(room_id).await?;

        if current_state.is_empty() {
            return Ok(incoming_state);
        }

        let fork_states = [current_state, incoming_state];

        let mut auth_chain_sets = Vec::with_capacity(fork_states.len());
        for state in &fork_states {
            let starting: Vec<OwnedEventId> = state.values().cloned().collect();
            auth_chain_sets.push(self.store().auth_chain(&starting).await?);
        }

        // State resolution itself is CPU-bound and synchronous; give it a
        // snapshot of every event it could touch.
        let mut needed: HashSet<OwnedEventId> = HashSet::new();
        for state in &fork_states {
            needed.extend(state.values().cloned());
        }
        for chain in &auth_chain_sets {
            needed.extend(chain.iter().cloned());
        }
        let needed: Vec<OwnedEventId> = needed.into_iter().collect();
        let snapshot: HashMap<OwnedEventId, Arc<PduEvent>> = self
            .store()
            .get_many(&needed)
            .await?
            .into_iter()
            .map(|pdu| (pdu.event_id.clone(), pdu))
            .collect();

        let resolved = crate::core::state::resolve(
            &rules,
            &fork_states,
            &auth_chain_sets,
            &|event_id| snapshot.get(event_id).cloned(),
        )
        .map_err(|e| {
            error!("state resolution failed: {e}");
            StateError::other(format!("state resolution failed: {e}"))
        })?;

        Ok(resolved)
    }

    /// Loads the events a state map points at, keyed by slot.
    pub(crate) async fn prefetch_state_events(
        &self,
        state: &StateMap<OwnedEventId>,
    ) -> AppResult<StateMap<Arc<PduEvent>>> {
        let mut fetched = StateMap::new();
        for (key, event_id) in state {
            if let Some(pdu) = self.store().get(event_id).await? {
                fetched.insert(key.clone(), pdu);
            } else {
                warn!(%event_id, "state map points at an unknown event");
            }
        }
        Ok(fetched)
    }

    /// Broadcasts a newly accepted PDU to local subscribers.
    pub(crate) fn notify_pdu(&self, event_id: &EventId) {
        let _ = self.rooms().notifier().send(event_id.to_owned());
    }
}

/// The `m.room.third_party_invite` event matching the invite's token, if
/// the event carries one.
fn third_party_invite_event(
    state: &StateMap<Arc<PduEvent>>,
    pdu: &PduEvent,
) -> Option<Arc<PduEvent>> {
    #[derive(serde::Deserialize)]
    struct GetToken {
        third_party_invite: Option<TokenContainer>,
    }
    #[derive(serde::Deserialize)]
    struct TokenContainer {
        signed: TokenSigned,
    }
    #[derive(serde::Deserialize)]
    struct TokenSigned {
        token: String,
    }

    let token = serde_json::from_str::<GetToken>(pdu.content.get())
        .ok()?
        .third_party_invite?
        .signed
        .token;
    state
        .get(&(StateEventType::RoomThirdPartyInvite, token))
        .cloned()
}

fn check_room_id(room_id: &RoomId, pdu: &PduEvent) -> AppResult<()> {
    if pdu.room_id != *room_id {
        warn!("found event from room {} in room {}", pdu.room_id, room_id);
        return Err(MatrixError::invalid_param("event has wrong room id").into());
    }
    Ok(())
}
