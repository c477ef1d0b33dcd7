//! Endpoints for retrieving events, room state and DAG gap fill.

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::sending::{SendRequest, SendResult};
use crate::serde::RawJsonValue;
use crate::{EventId, OwnedEventId, RoomId, UnixMillis};

/// `GET /_matrix/federation/v1/event/{event_id}`
pub fn event_request(origin: &str, event_id: &EventId) -> SendResult<SendRequest> {
    let url = Url::parse(&format!("{origin}/_matrix/federation/v1/event/{event_id}"))?;
    Ok(crate::sending::get(url))
}

/// Response type for the `get_event` endpoint: a transaction containing a
/// single PDU.
#[derive(Debug, Deserialize, Serialize)]
pub struct EventResBody {
    /// The `server_name` of the homeserver sending this transaction.
    pub origin: String,

    /// POSIX timestamp in milliseconds on originating homeserver when this
    /// transaction started.
    pub origin_server_ts: UnixMillis,

    /// The event.
    #[serde(rename = "pdus", with = "crate::serde::single_element_seq")]
    pub pdu: Box<RawJsonValue>,
}

/// `GET /_matrix/federation/v1/state/{room_id}?event_id=...`
pub fn room_state_request(
    origin: &str,
    room_id: &RoomId,
    event_id: &EventId,
) -> SendResult<SendRequest> {
    let url = Url::parse(&format!(
        "{origin}/_matrix/federation/v1/state/{room_id}?event_id={event_id}"
    ))?;
    Ok(crate::sending::get(url))
}

/// Response type for the `get_room_state` endpoint.
#[derive(Debug, Deserialize, Serialize)]
pub struct RoomStateResBody {
    /// The full set of authorization events that make up the state of the
    /// room, and their authorization events, recursively.
    pub auth_chain: Vec<Box<RawJsonValue>>,

    /// The fully resolved state of the room at the given event.
    pub pdus: Vec<Box<RawJsonValue>>,
}

/// `GET /_matrix/federation/v1/state_ids/{room_id}?event_id=...`
pub fn room_state_ids_request(
    origin: &str,
    room_id: &RoomId,
    event_id: &EventId,
) -> SendResult<SendRequest> {
    let url = Url::parse(&format!(
        "{origin}/_matrix/federation/v1/state_ids/{room_id}?event_id={event_id}"
    ))?;
    Ok(crate::sending::get(url))
}

/// Response type for the `get_room_state_ids` endpoint.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RoomStateIdsResBody {
    /// The full set of authorization events that make up the state of the
    /// room, and their authorization events, recursively.
    pub auth_chain_ids: Vec<OwnedEventId>,

    /// The fully resolved state of the room at the given event.
    pub pdu_ids: Vec<OwnedEventId>,
}

/// `POST /_matrix/federation/v1/get_missing_events/{room_id}`
pub fn missing_events_request(
    origin: &str,
    room_id: &RoomId,
    body: MissingEventsReqBody,
) -> SendResult<SendRequest> {
    let url = Url::parse(&format!(
        "{origin}/_matrix/federation/v1/get_missing_events/{room_id}"
    ))?;
    crate::sending::post(url).json_body(&body)
}

/// Request body for the `get_missing_events` endpoint.
#[derive(Debug, Deserialize, Serialize)]
pub struct MissingEventsReqBody {
    /// The maximum number of events to retrieve.
    ///
    /// Defaults to 10.
    #[serde(default = "default_missing_events_limit")]
    pub limit: usize,

    /// The minimum depth of events to retrieve.
    ///
    /// Defaults to 0.
    #[serde(default)]
    pub min_depth: i64,

    /// The latest event IDs that the sender already has.
    ///
    /// These are skipped when retrieving the previous events of
    /// `latest_events`.
    pub earliest_events: Vec<OwnedEventId>,

    /// The event IDs to retrieve the previous events for.
    pub latest_events: Vec<OwnedEventId>,
}

fn default_missing_events_limit() -> usize {
    10
}

/// Response type for the `get_missing_events` endpoint.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct MissingEventsResBody {
    /// The missing PDUs.
    pub events: Vec<Box<RawJsonValue>>,
}

/// `GET /_matrix/federation/v1/backfill/{room_id}?v=...&limit=...`
pub fn backfill_request(
    origin: &str,
    room_id: &RoomId,
    from: &[OwnedEventId],
    limit: usize,
) -> SendResult<SendRequest> {
    let mut url = Url::parse(&format!(
        "{origin}/_matrix/federation/v1/backfill/{room_id}"
    ))?;
    {
        let mut query = url.query_pairs_mut();
        for event_id in from {
            query.append_pair("v", event_id.as_str());
        }
        query.append_pair("limit", &limit.to_string());
    }
    Ok(crate::sending::get(url))
}

/// Response type for the `backfill` endpoint.
#[derive(Debug, Deserialize, Serialize)]
pub struct BackfillResBody {
    /// The `server_name` of the homeserver sending this transaction.
    pub origin: String,

    /// POSIX timestamp in milliseconds on originating homeserver when this
    /// transaction started.
    pub origin_server_ts: UnixMillis,

    /// List of persistent updates to rooms.
    pub pdus: Vec<Box<RawJsonValue>>,
}
