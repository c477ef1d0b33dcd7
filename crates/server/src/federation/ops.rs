//! The operations behind the federation HTTP surface. A transport parses
//! the request, authenticates it via [`Server::verify_request`], and calls
//! these with typed arguments.

use std::collections::HashSet;

use serde_json::value::to_raw_value;

use crate::core::events::room::create::RoomCreateEventContent;
use crate::core::events::room::member::{MembershipState, RoomMemberEventContent};
use crate::core::events::{StateEventType, StrippedStateEvent, TimelineEventType};
use crate::core::federation::event::{
    BackfillResBody, EventResBody, MissingEventsReqBody, MissingEventsResBody,
    RoomStateIdsResBody, RoomStateResBody,
};
use crate::core::federation::membership::{
    InviteReqBody, InviteResBody, MakeJoinResBody, SendJoinResBody, SendLeaveResBody,
};
use crate::core::identifiers::*;
use crate::core::serde::{CanonicalJsonObject, CanonicalJsonValue, RawJsonValue};
use crate::core::state::{auth_types_for_event, StateMap};
use crate::core::{MatrixError, RoomVersionId, UnixMillis};
use crate::event::gen_event_id_canonical_json;
use crate::{AppResult, Server};

impl Server {
    /// `GET /_matrix/federation/v1/event/{event_id}`
    pub async fn federation_event(
        &self,
        origin: &ServerName,
        event_id: &EventId,
    ) -> AppResult<EventResBody> {
        let event = self
            .store()
            .get_full(event_id)
            .await?
            .ok_or_else(|| MatrixError::not_found("event not found"))?;

        self.access_check(origin, &event.pdu.room_id, Some(event_id))
            .await?;

        Ok(EventResBody {
            origin: self.server_name().as_str().to_owned(),
            origin_server_ts: UnixMillis::now(),
            pdu: to_outgoing_federation_event(event.json)?,
        })
    }

    /// `GET /_matrix/federation/v1/state/{room_id}?event_id=...`
    pub async fn federation_state(
        &self,
        origin: &ServerName,
        room_id: &RoomId,
        event_id: &EventId,
    ) -> AppResult<RoomStateResBody> {
        self.access_check(origin, room_id, Some(event_id)).await?;

        let state = self.state_at_event(room_id, event_id).await?;
        let state_ids: Vec<OwnedEventId> = state.values().cloned().collect();
        let auth_chain = self.store().auth_chain(&state_ids).await?;

        Ok(RoomStateResBody {
            auth_chain: self.load_outgoing(auth_chain.into_iter()).await?,
            pdus: self.load_outgoing(state_ids.into_iter()).await?,
        })
    }

    /// `GET /_matrix/federation/v1/state_ids/{room_id}?event_id=...`
    pub async fn federation_state_ids(
        &self,
        origin: &ServerName,
        room_id: &RoomId,
        event_id: &EventId,
    ) -> AppResult<RoomStateIdsResBody> {
        self.access_check(origin, room_id, Some(event_id)).await?;

        let state = self.state_at_event(room_id, event_id).await?;
        let pdu_ids: Vec<OwnedEventId> = state.values().cloned().collect();
        let auth_chain = self.store().auth_chain(&pdu_ids).await?;

        Ok(RoomStateIdsResBody {
            auth_chain_ids: auth_chain.into_iter().collect(),
            pdu_ids,
        })
    }

    /// `POST /_matrix/federation/v1/get_missing_events/{room_id}`
    pub async fn federation_missing_events(
        &self,
        origin: &ServerName,
        room_id: &RoomId,
        body: MissingEventsReqBody,
    ) -> AppResult<MissingEventsResBody> {
        self.access_check(origin, room_id, None).await?;

        let events = self
            .store()
            .missing_events(
                room_id,
                &body.earliest_events,
                &body.latest_events,
                body.limit,
                body.min_depth,
            )
            .await?;

        let mut outgoing = Vec::with_capacity(events.len());
        for event in events {
            if let Some(stored) = self.store().get_full(&event.event_id).await? {
                outgoing.push(to_outgoing_federation_event(stored.json)?);
            }
        }

        Ok(MissingEventsResBody { events: outgoing })
    }

    /// `GET /_matrix/federation/v1/backfill/{room_id}`
    pub async fn federation_backfill(
        &self,
        origin: &ServerName,
        room_id: &RoomId,
        from: &[OwnedEventId],
        limit: usize,
    ) -> AppResult<BackfillResBody> {
        self.access_check(origin, room_id, None).await?;

        let mut pdus = Vec::new();
        let mut include: Vec<OwnedEventId> = from.to_vec();
        let older = self
            .store()
            .missing_events(room_id, &[], from, limit.saturating_sub(from.len()), 0)
            .await?;
        include.extend(older.into_iter().map(|e| e.event_id.clone()));

        for event_id in include.into_iter().take(limit) {
            if let Some(stored) = self.store().get_full(&event_id).await? {
                if stored.outlier {
                    continue;
                }
                pdus.push(to_outgoing_federation_event(stored.json)?);
            }
        }

        Ok(BackfillResBody {
            origin: self.server_name().as_str().to_owned(),
            origin_server_ts: UnixMillis::now(),
            pdus,
        })
    }

    /// `GET /_matrix/federation/v1/make_join/{room_id}/{user_id}`
    ///
    /// Builds an unsigned join template against the current room state.
    pub async fn federation_make_join(
        &self,
        origin: &ServerName,
        room_id: &RoomId,
        user_id: &UserId,
        ver: &[RoomVersionId],
    ) -> AppResult<MakeJoinResBody> {
        if user_id.server_name() != origin {
            return Err(MatrixError::forbidden(
                "cannot make join events for users of other servers",
            )
            .into());
        }

        let room_version = self.room_version(room_id).await?;
        if !ver.is_empty() && !ver.contains(&room_version) {
            return Err(MatrixError::incompatible_room_version(
                room_version,
                "this room's version is not supported by the joining server",
            )
            .into());
        }

        self.acl_check(origin, room_id).await?;

        let content = to_raw_value(&RoomMemberEventContent::new(MembershipState::Join))
            .expect("static content serializes");
        let template = self
            .build_event_template(
                room_id,
                user_id,
                TimelineEventType::RoomMember,
                Some(user_id.as_str()),
                &content,
            )
            .await?;

        Ok(MakeJoinResBody {
            room_version: Some(room_version),
            event: to_outgoing_federation_event(template)?,
        })
    }

    /// `PUT /_matrix/federation/v2/send_join/{room_id}/{event_id}`
    ///
    /// Validates and admits a signed join event, then returns the room
    /// state the joining server needs.
    pub async fn federation_send_join(
        &self,
        origin: &ServerName,
        room_id: &RoomId,
        event_id: &EventId,
        raw_event: &RawJsonValue,
    ) -> AppResult<SendJoinResBody> {
        let room_version = self.room_version(room_id).await?;
        let (derived_id, mut value) =
            gen_event_id_canonical_json(raw_event, &room_version.rules())?;
        if derived_id != *event_id {
            return Err(
                MatrixError::invalid_param("event ID does not match the event").into()
            );
        }

        // Add our signature before processing so every copy that leaves
        // this server carries it.
        value.remove("unsigned");
        self.hash_and_sign_event(&mut value, &room_version.rules().redaction)?;

        self.process_incoming_pdu(origin, event_id, room_id, &room_version, value.clone(), true)
            .await?;

        let state = self.state_at_event(room_id, event_id).await?;
        let state_ids: Vec<OwnedEventId> = state.values().cloned().collect();
        let auth_chain = self.store().auth_chain(&state_ids).await?;

        Ok(SendJoinResBody {
            auth_chain: self.load_outgoing(auth_chain.into_iter()).await?,
            state: self.load_outgoing(state_ids.into_iter()).await?,
            event: Some(to_outgoing_federation_event(value)?),
            origin: self.server_name().to_owned(),
            members_omitted: false,
            servers_in_room: Vec::new(),
        })
    }

    /// `PUT /_matrix/federation/v2/invite/{room_id}/{event_id}`
    ///
    /// Accepts an invite for a local user. Trust is explicit here: a valid
    /// signature from the inviting server suffices, auth events are not
    /// required, and an unknown room is created lazily from the stripped
    /// state.
    pub async fn federation_invite(
        &self,
        origin: &ServerName,
        room_id: &RoomId,
        event_id: &EventId,
        body: InviteReqBody,
    ) -> AppResult<InviteResBody> {
        let rules = body.room_version.rules();
        let (derived_id, mut value) = gen_event_id_canonical_json(&body.event, &rules)?;
        if derived_id != *event_id {
            return Err(
                MatrixError::invalid_param("event ID does not match the event").into()
            );
        }

        let pdu = crate::event::PduEvent::from_canonical_object(event_id, value.clone())
            .map_err(|e| MatrixError::bad_json(format!("invite event is invalid: {e}")))?;

        if pdu.room_id != *room_id {
            return Err(MatrixError::invalid_param("event has wrong room id").into());
        }
        if pdu.event_ty != TimelineEventType::RoomMember {
            return Err(
                MatrixError::invalid_param("invite event is not a membership event").into()
            );
        }
        let content: RoomMemberEventContent = pdu.get_content()?;
        if content.membership != MembershipState::Invite {
            return Err(MatrixError::invalid_param("membership is not invite").into());
        }
        if pdu.sender.server_name() != origin {
            return Err(MatrixError::forbidden("invite sender belongs to another server").into());
        }

        let invited: OwnedUserId = pdu
            .state_key
            .as_deref()
            .and_then(|key| key.try_into().ok())
            .ok_or_else(|| MatrixError::bad_json("invite has no valid state_key"))?;
        if invited.server_name() != self.server_name() {
            return Err(MatrixError::forbidden("the invited user is not local").into());
        }

        // Signature check; the one gate invites pass through.
        self.verify_event(&value, &body.room_version).await.map_err(|e| {
            MatrixError::unauthorized(format!("invite signature verification failed: {e}"))
        })?;

        // The narrow unknown-room tolerance: record the room from the
        // stripped state so the invite can be shown and later joined.
        if !self.store().room_exists(room_id).await? {
            let creator = stripped_create_sender(&body.invite_room_state).ok_or_else(|| {
                MatrixError::invalid_param(
                    "invite to unknown room carries no stripped create event",
                )
            })?;
            let version = stripped_room_version(&body.invite_room_state)
                .unwrap_or_else(|| body.room_version.clone());
            self.store().create_room(room_id, version, &creator).await?;
        }

        // Counter-sign and keep the event as an outlier; it joins the
        // timeline when we actually join the room.
        value.remove("unsigned");
        self.hash_and_sign_event(&mut value, &rules.redaction)?;
        let signed_pdu = crate::event::PduEvent::from_canonical_object(event_id, value.clone())
            .map_err(|e| MatrixError::bad_json(format!("signed invite is invalid: {e}")))?;

        self.store()
            .put(crate::storage::StoredPdu {
                pdu: std::sync::Arc::new(signed_pdu),
                json: value.clone(),
                outlier: true,
                soft_failed: false,
                rejection_reason: None,
            })
            .await?;

        Ok(InviteResBody {
            event: to_outgoing_federation_event(value)?,
        })
    }

    /// `PUT /_matrix/federation/v2/send_leave/{room_id}/{event_id}`
    pub async fn federation_send_leave(
        &self,
        origin: &ServerName,
        room_id: &RoomId,
        event_id: &EventId,
        raw_event: &RawJsonValue,
    ) -> AppResult<SendLeaveResBody> {
        let room_version = self.room_version(room_id).await?;
        let (derived_id, value) =
            gen_event_id_canonical_json(raw_event, &room_version.rules())?;
        if derived_id != *event_id {
            return Err(
                MatrixError::invalid_param("event ID does not match the event").into()
            );
        }

        self.process_incoming_pdu(origin, event_id, room_id, &room_version, value, true)
            .await?;

        Ok(SendLeaveResBody::default())
    }

    /// The resolved state of the room at (including) the given event.
    pub async fn state_at_event(
        &self,
        room_id: &RoomId,
        event_id: &EventId,
    ) -> AppResult<StateMap<OwnedEventId>> {
        let mut state = self
            .store()
            .state_before(event_id)
            .await?
            .ok_or_else(|| MatrixError::not_found("no state known for that event"))?;

        let event = self
            .store()
            .get(event_id)
            .await?
            .ok_or_else(|| MatrixError::not_found("event not found"))?;
        if event.room_id != *room_id {
            return Err(MatrixError::invalid_param("event is not in this room").into());
        }
        if let Some(state_key) = &event.state_key {
            state.insert(
                ((&event.event_ty).into(), state_key.clone()),
                event_id.to_owned(),
            );
        }

        Ok(state)
    }

    /// Builds an unsigned event template on top of the room's current
    /// state and DAG tips.
    pub(crate) async fn build_event_template(
        &self,
        room_id: &RoomId,
        sender: &UserId,
        event_type: TimelineEventType,
        state_key: Option<&str>,
        content: &RawJsonValue,
    ) -> AppResult<CanonicalJsonObject> {
        let prev_events = self.store().latest_forward_extremities(room_id).await?;
        if prev_events.is_empty() {
            return Err(MatrixError::unknown("room has no forward extremities").into());
        }

        let mut depth = 0;
        for prev_id in &prev_events {
            if let Some(prev) = self.store().get(prev_id).await? {
                depth = depth.max(prev.depth);
            }
        }
        let depth = depth + 1;

        let state = self.store().resolved_state(room_id).await?;
        let auth_types = auth_types_for_event(&event_type, sender, state_key, content)
            .map_err(|e| MatrixError::bad_json(format!("invalid event content: {e}")))?;
        let mut auth_events = Vec::new();
        let mut seen = HashSet::new();
        for key in auth_types {
            if let Some(id) = state.get(&key) {
                if seen.insert(id.clone()) {
                    auth_events.push(id.clone());
                }
            }
        }

        let mut template = CanonicalJsonObject::new();
        template.insert(
            "room_id".to_owned(),
            CanonicalJsonValue::String(room_id.as_str().to_owned()),
        );
        template.insert(
            "sender".to_owned(),
            CanonicalJsonValue::String(sender.as_str().to_owned()),
        );
        template.insert(
            "type".to_owned(),
            CanonicalJsonValue::String(event_type.as_str().to_owned()),
        );
        if let Some(state_key) = state_key {
            template.insert(
                "state_key".to_owned(),
                CanonicalJsonValue::String(state_key.to_owned()),
            );
        }
        template.insert(
            "content".to_owned(),
            serde_json::from_str::<CanonicalJsonValue>(content.get())
                .map_err(|e| MatrixError::bad_json(format!("invalid content: {e}")))?,
        );
        template.insert(
            "origin_server_ts".to_owned(),
            CanonicalJsonValue::Integer(UnixMillis::now().get() as i64),
        );
        template.insert("depth".to_owned(), CanonicalJsonValue::Integer(depth));
        template.insert(
            "prev_events".to_owned(),
            CanonicalJsonValue::Array(
                prev_events
                    .iter()
                    .map(|id| CanonicalJsonValue::String(id.as_str().to_owned()))
                    .collect(),
            ),
        );
        template.insert(
            "auth_events".to_owned(),
            CanonicalJsonValue::Array(
                auth_events
                    .iter()
                    .map(|id| CanonicalJsonValue::String(id.as_str().to_owned()))
                    .collect(),
            ),
        );

        Ok(template)
    }

    async fn load_outgoing(
        &self,
        event_ids: impl Iterator<Item = OwnedEventId>,
    ) -> AppResult<Vec<Box<RawJsonValue>>> {
        let mut out = Vec::new();
        for event_id in event_ids {
            if let Some(stored) = self.store().get_full(&event_id).await? {
                out.push(to_outgoing_federation_event(stored.json)?);
            }
        }
        Ok(out)
    }
}

/// Strips the locally bookkept fields before an event goes back on the
/// wire.
fn to_outgoing_federation_event(
    mut pdu_json: CanonicalJsonObject,
) -> AppResult<Box<RawJsonValue>> {
    if let Some(unsigned) = pdu_json
        .get_mut("unsigned")
        .and_then(|val| val.as_object_mut())
    {
        unsigned.remove("transaction_id");
    }

    pdu_json.remove("event_id");

    Ok(to_raw_value(&CanonicalJsonValue::Object(pdu_json))?)
}

fn stripped_create_sender(state: &[StrippedStateEvent]) -> Option<OwnedUserId> {
    state
        .iter()
        .find(|ev| ev.event_type == TimelineEventType::RoomCreate)
        .map(|ev| ev.sender.clone())
}

fn stripped_room_version(state: &[StrippedStateEvent]) -> Option<RoomVersionId> {
    let create = state
        .iter()
        .find(|ev| ev.event_type == TimelineEventType::RoomCreate)?;
    serde_json::from_str::<RoomCreateEventContent>(create.content.get())
        .ok()?
        .room_version
}

#[cfg(test)]
mod tests {
    use serde_json::{json, value::to_raw_value};

    use crate::core::events::StrippedStateEvent;
    use crate::core::federation::membership::InviteReqBody;
    use crate::core::identifiers::*;
    use crate::core::serde::CanonicalJsonObject;
    use crate::core::RoomVersionId;
    use crate::event::gen_event_id;
    use crate::server::test::{test_server, test_server_named};

    /// The invite-to-unknown-room exception, end to end: a remote server
    /// invites a local user into a room this server has never seen.
    #[tokio::test]
    async fn invite_to_unknown_room_creates_it() {
        let local = test_server_named("local.test");
        let remote = test_server_named("remote.test");

        // The local server must know the remote's keys to verify the
        // invite's signature; exchange them out of band.
        let document = remote.server_keys_document().unwrap();
        let doc_json = crate::core::serde::to_canonical_value(&document)
            .unwrap()
            .as_object()
            .cloned()
            .unwrap();
        local.remember_keys(doc_json).unwrap();

        let room_id: OwnedRoomId = "!fresh:remote.test".try_into().unwrap();
        let room_version = RoomVersionId::V10;

        let mut invite: CanonicalJsonObject = serde_json::from_value(json!({
            "room_id": room_id.as_str(),
            "sender": "@inviter:remote.test",
            "type": "m.room.member",
            "state_key": "@invitee:local.test",
            "origin_server_ts": 1_700_000_000_000_i64,
            "content": { "membership": "invite" },
            "prev_events": ["$prev:remote.test"],
            "auth_events": [],
            "depth": 12,
        }))
        .unwrap();
        remote
            .hash_and_sign_event(&mut invite, &room_version.rules().redaction)
            .unwrap();
        let event_id = gen_event_id(&invite, &room_version.rules()).unwrap();

        let stripped_state = vec![StrippedStateEvent {
            content: to_raw_value(&json!({ "room_version": "10" })).unwrap(),
            sender: "@inviter:remote.test".try_into().unwrap(),
            state_key: "".to_owned(),
            event_type: "m.room.create".into(),
        }];

        let body = InviteReqBody {
            room_version: room_version.clone(),
            event: to_raw_value(&crate::core::serde::CanonicalJsonValue::Object(
                invite.clone(),
            ))
            .unwrap(),
            invite_room_state: stripped_state,
            via: vec![],
        };

        let origin: OwnedServerName = "remote.test".try_into().unwrap();
        let response = local
            .federation_invite(&origin, &room_id, &event_id, body)
            .await
            .unwrap();

        // The room now exists with the stripped create event's version...
        assert!(local.store().room_exists(&room_id).await.unwrap());
        assert_eq!(
            local.store().room_version(&room_id).await.unwrap(),
            room_version
        );

        // ...the invite is stored as an outlier...
        let stored = local
            .store()
            .get_full(&event_id)
            .await
            .unwrap()
            .expect("invite persisted");
        assert!(stored.outlier);

        // ...and the returned copy carries both servers' signatures.
        let returned: serde_json::Value =
            serde_json::from_str(response.event.get()).unwrap();
        let signatures = returned["signatures"].as_object().unwrap();
        assert!(signatures.contains_key("remote.test"));
        assert!(signatures.contains_key("local.test"));
    }

    #[tokio::test]
    async fn invite_for_remote_user_is_refused() {
        let local = test_server_named("local.test");

        let room_id: OwnedRoomId = "!fresh:remote.test".try_into().unwrap();
        let invite: CanonicalJsonObject = serde_json::from_value(json!({
            "room_id": room_id.as_str(),
            "sender": "@inviter:remote.test",
            "type": "m.room.member",
            "state_key": "@someone:elsewhere.test",
            "origin_server_ts": 1_700_000_000_000_i64,
            "content": { "membership": "invite" },
            "prev_events": [],
            "auth_events": [],
            "depth": 1,
        }))
        .unwrap();
        let event_id = gen_event_id(&invite, &RoomVersionId::V10.rules()).unwrap();

        let body = InviteReqBody {
            room_version: RoomVersionId::V10,
            event: to_raw_value(&crate::core::serde::CanonicalJsonValue::Object(invite))
                .unwrap(),
            invite_room_state: vec![],
            via: vec![],
        };

        let origin: OwnedServerName = "remote.test".try_into().unwrap();
        assert!(local
            .federation_invite(&origin, &room_id, &event_id, body)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn unknown_event_is_not_found() {
        let server = test_server();
        let origin: OwnedServerName = "remote.test".try_into().unwrap();
        let event_id: OwnedEventId = "$missing:remote.test".try_into().unwrap();
        assert!(server.federation_event(&origin, &event_id).await.is_err());
    }
}
