//! The PDU type and parsing of inbound events.

pub mod handler;

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

use crate::core::events::TimelineEventType;
use crate::core::identifiers::*;
use crate::core::room_version::RoomVersionRules;
use crate::core::serde::{CanonicalJsonObject, CanonicalJsonValue, RawJsonValue};
use crate::core::state::Event;
use crate::core::{MatrixError, UnixMillis};
use crate::AppResult;

/// Content hashes of a PDU.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EventHash {
    /// The SHA-256 hash.
    pub sha256: String,
}

/// A persistent data unit: one signed event of a room DAG.
///
/// The `event_id` is never part of the wire form in room versions that
/// derive it; the constructors inject it after validation.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PduEvent {
    pub event_id: OwnedEventId,
    pub room_id: OwnedRoomId,
    pub sender: OwnedUserId,
    pub origin_server_ts: UnixMillis,
    #[serde(rename = "type")]
    pub event_ty: TimelineEventType,
    pub content: Box<RawJsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    #[serde(deserialize_with = "deserialize_event_id_refs")]
    pub prev_events: Vec<OwnedEventId>,
    #[serde(default, deserialize_with = "deserialize_event_id_refs")]
    pub auth_events: Vec<OwnedEventId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redacts: Option<OwnedEventId>,
    #[serde(default)]
    pub depth: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hashes: Option<EventHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signatures: Option<Box<RawJsonValue>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub unsigned: BTreeMap<String, Box<RawJsonValue>>,
}

/// Room v1 and v2 reference parents as `[id, hash]` pairs; later versions
/// as bare IDs. Accept both.
fn deserialize_event_id_refs<'de, D>(deserializer: D) -> Result<Vec<OwnedEventId>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum EventIdRef {
        Bare(OwnedEventId),
        WithHash(OwnedEventId, serde_json::Value),
    }

    let refs = Vec::<EventIdRef>::deserialize(deserializer)?;
    Ok(refs
        .into_iter()
        .map(|r| match r {
            EventIdRef::Bare(id) => id,
            EventIdRef::WithHash(id, _) => id,
        })
        .collect())
}

impl PduEvent {
    /// Builds a `PduEvent` from the canonical JSON of an already validated
    /// event, injecting the given event ID.
    pub fn from_canonical_object(
        event_id: &EventId,
        mut json: CanonicalJsonObject,
    ) -> Result<Self, serde_json::Error> {
        json.insert(
            "event_id".to_owned(),
            CanonicalJsonValue::String(event_id.as_str().to_owned()),
        );
        serde_json::from_value(serde_json::to_value(CanonicalJsonValue::Object(json))?)
    }

    /// Deserializes the event's content.
    pub fn get_content<T: DeserializeOwned>(&self) -> AppResult<T> {
        serde_json::from_str(self.content.get())
            .map_err(|e| MatrixError::bad_json(format!("invalid event content: {e}")).into())
    }

    /// Whether this is a state event.
    pub fn is_state(&self) -> bool {
        self.state_key.is_some()
    }

    /// The event this one redacts, honoring the room version's choice of
    /// field.
    pub fn redacts_id(&self, rules: &RoomVersionRules) -> Option<OwnedEventId> {
        if self.event_ty != TimelineEventType::RoomRedaction {
            return None;
        }

        if rules.redaction.content_field_redacts {
            #[derive(Deserialize)]
            struct ContentRedacts {
                redacts: OwnedEventId,
            }
            self.get_content::<ContentRedacts>().ok().map(|c| c.redacts)
        } else {
            self.redacts.clone()
        }
    }
}

impl Event for PduEvent {
    fn event_id(&self) -> &EventId {
        &self.event_id
    }

    fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    fn sender(&self) -> &UserId {
        &self.sender
    }

    fn event_type(&self) -> &TimelineEventType {
        &self.event_ty
    }

    fn content(&self) -> &RawJsonValue {
        &self.content
    }

    fn origin_server_ts(&self) -> UnixMillis {
        self.origin_server_ts
    }

    fn state_key(&self) -> Option<&str> {
        self.state_key.as_deref()
    }

    fn prev_events(&self) -> &[OwnedEventId] {
        &self.prev_events
    }

    fn auth_events(&self) -> &[OwnedEventId] {
        &self.auth_events
    }

    fn redacts(&self) -> Option<&EventId> {
        self.redacts.as_deref()
    }
}

/// Derives the correct event ID for the incoming PDU.
///
/// Returns a tuple of the new `EventId` and the PDU as a canonical JSON
/// object.
pub fn gen_event_id_canonical_json(
    pdu: &RawJsonValue,
    rules: &RoomVersionRules,
) -> AppResult<(OwnedEventId, CanonicalJsonObject)> {
    let value: CanonicalJsonObject = serde_json::from_str(pdu.get()).map_err(|e| {
        warn!("invalid PDU in server response: {e}");
        MatrixError::bad_json("invalid PDU in server response")
    })?;
    let event_id = gen_event_id(&value, rules)?;
    Ok((event_id, value))
}

/// Derives the event ID of the given canonical event object.
pub fn gen_event_id(
    value: &CanonicalJsonObject,
    rules: &RoomVersionRules,
) -> AppResult<OwnedEventId> {
    if !rules.derived_event_ids() {
        // v1/v2 events carry their ID.
        let carried = value
            .get("event_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| MatrixError::bad_json("event is missing its event_id"))?;
        return Ok(EventId::parse(carried)?.to_owned());
    }

    let reference_hash = crate::core::signatures::reference_hash(value, rules)?;
    let event_id: OwnedEventId = format!("${reference_hash}").try_into()?;
    Ok(event_id)
}

/// First-stage validation of an inbound PDU: required fields present with
/// the right shapes.
///
/// Returns the room ID so the caller can route the event before paying for
/// full deserialization.
pub fn check_pdu_shape(value: &CanonicalJsonObject) -> AppResult<OwnedRoomId> {
    let room_id = value
        .get("room_id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| MatrixError::bad_json("PDU is missing the room_id field"))?;
    if !room_id.starts_with('!') {
        return Err(MatrixError::bad_json("room_id does not start with `!`").into());
    }
    let room_id = RoomId::parse(room_id)?.to_owned();

    let sender = value
        .get("sender")
        .and_then(|v| v.as_str())
        .ok_or_else(|| MatrixError::bad_json("PDU is missing the sender field"))?;
    if !sender.starts_with('@') || !sender.contains(':') {
        return Err(MatrixError::bad_json("sender is not a valid user ID").into());
    }

    match value.get("type") {
        Some(CanonicalJsonValue::String(ty)) if !ty.is_empty() => {}
        _ => return Err(MatrixError::bad_json("PDU has no usable type field").into()),
    }

    match value.get("origin_server_ts") {
        Some(CanonicalJsonValue::Integer(ts)) if *ts >= 0 => {}
        _ => {
            return Err(
                MatrixError::bad_json("origin_server_ts must be a positive integer").into(),
            );
        }
    }

    if !matches!(value.get("content"), Some(CanonicalJsonValue::Object(_))) {
        return Err(MatrixError::bad_json("content must be an object").into());
    }

    Ok(room_id)
}

/// Splits a raw inbound PDU into its room and canonical object, after the
/// shape check.
pub fn parse_incoming_pdu(
    pdu: &RawJsonValue,
) -> AppResult<(OwnedRoomId, CanonicalJsonObject)> {
    let value: CanonicalJsonObject = serde_json::from_str(pdu.get())
        .map_err(|e| MatrixError::bad_json(format!("invalid PDU: {e}")))?;
    let room_id = check_pdu_shape(&value)?;
    Ok((room_id, value))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{check_pdu_shape, gen_event_id, PduEvent};
    use crate::core::serde::CanonicalJsonObject;
    use crate::core::RoomVersionId;

    fn shaped(value: serde_json::Value) -> CanonicalJsonObject {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn shape_check_accepts_minimal_pdu() {
        let value = shaped(json!({
            "room_id": "!r:hs.example",
            "sender": "@u:hs.example",
            "type": "m.room.message",
            "origin_server_ts": 1_700_000_000_000_i64,
            "content": {},
        }));
        assert_eq!(check_pdu_shape(&value).unwrap(), "!r:hs.example");
    }

    #[test]
    fn shape_check_rejects_bad_fields() {
        for broken in [
            json!({ "sender": "@u:h", "type": "m.a", "origin_server_ts": 1, "content": {} }),
            json!({ "room_id": "r:h", "sender": "@u:h", "type": "m.a", "origin_server_ts": 1, "content": {} }),
            json!({ "room_id": "!r:h", "sender": "u:h", "type": "m.a", "origin_server_ts": 1, "content": {} }),
            json!({ "room_id": "!r:h", "sender": "@u:h", "type": "", "origin_server_ts": 1, "content": {} }),
            json!({ "room_id": "!r:h", "sender": "@u:h", "type": "m.a", "content": {} }),
            json!({ "room_id": "!r:h", "sender": "@u:h", "type": "m.a", "origin_server_ts": 1, "content": 7 }),
        ] {
            assert!(check_pdu_shape(&shaped(broken)).is_err());
        }
    }

    #[test]
    fn carried_and_derived_event_ids() {
        let mut value = shaped(json!({
            "room_id": "!r:hs.example",
            "sender": "@u:hs.example",
            "type": "m.room.message",
            "origin_server_ts": 1_700_000_000_000_i64,
            "content": { "body": "hi" },
            "prev_events": [],
            "auth_events": [],
            "depth": 1,
        }));

        // v6 derives the ID from the reference hash.
        let derived = gen_event_id(&value, &RoomVersionId::V6.rules()).unwrap();
        assert!(derived.as_str().starts_with('$'));
        assert!(!derived.as_str().contains(':'));

        // v1 requires the carried ID.
        assert!(gen_event_id(&value, &RoomVersionId::V1.rules()).is_err());
        value.insert(
            "event_id".to_owned(),
            crate::core::serde::CanonicalJsonValue::String("$0:hs.example".to_owned()),
        );
        assert_eq!(
            gen_event_id(&value, &RoomVersionId::V1.rules())
                .unwrap()
                .as_str(),
            "$0:hs.example"
        );
    }

    #[test]
    fn pdu_round_trips_with_pair_refs() {
        let value = shaped(json!({
            "room_id": "!r:hs.example",
            "sender": "@u:hs.example",
            "type": "m.room.message",
            "origin_server_ts": 1_700_000_000_000_i64,
            "content": { "body": "hi" },
            "prev_events": [["$p:hs.example", { "sha256": "hash" }]],
            "auth_events": ["$a:hs.example"],
            "depth": 4,
        }));

        let event_id: crate::core::OwnedEventId = "$0:hs.example".try_into().unwrap();
        let pdu = PduEvent::from_canonical_object(&event_id, value).unwrap();
        assert_eq!(pdu.prev_events.len(), 1);
        assert_eq!(pdu.prev_events[0].as_str(), "$p:hs.example");
        assert_eq!(pdu.auth_events[0].as_str(), "$a:hs.example");
        assert_eq!(pdu.depth, 4);
    }
}
