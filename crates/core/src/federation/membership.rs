//! Membership endpoints: join templates, joins, invites and leaves across
//! the federation boundary.

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::events::StrippedStateEvent;
use crate::sending::{SendRequest, SendResult};
use crate::serde::RawJsonValue;
use crate::{EventId, OwnedServerName, RoomId, RoomVersionId, UserId};

/// `GET /_matrix/federation/v1/make_join/{room_id}/{user_id}?ver=...`
pub fn make_join_request(
    origin: &str,
    room_id: &RoomId,
    user_id: &UserId,
    ver: &[RoomVersionId],
) -> SendResult<SendRequest> {
    let mut url = Url::parse(&format!(
        "{origin}/_matrix/federation/v1/make_join/{room_id}/{user_id}"
    ))?;
    {
        let mut query = url.query_pairs_mut();
        for version in ver {
            query.append_pair("ver", version.as_str());
        }
    }
    Ok(crate::sending::get(url))
}

/// Response type for the `create_join_event_template` endpoint.
#[derive(Debug, Deserialize, Serialize)]
pub struct MakeJoinResBody {
    /// The version of the room where the server is trying to join.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_version: Option<RoomVersionId>,

    /// An unsigned template event.
    pub event: Box<RawJsonValue>,
}

/// `PUT /_matrix/federation/v2/send_join/{room_id}/{event_id}`
pub fn send_join_request(
    origin: &str,
    room_id: &RoomId,
    event_id: &EventId,
    body: SendJoinReqBody,
) -> SendResult<SendRequest> {
    let url = Url::parse(&format!(
        "{origin}/_matrix/federation/v2/send_join/{room_id}/{event_id}"
    ))?;
    crate::sending::put(url).json_body(&body)
}

/// Request body for the `create_join_event` endpoint: the signed join
/// event.
#[derive(Debug, Deserialize, Serialize)]
#[serde(transparent)]
pub struct SendJoinReqBody(pub Box<RawJsonValue>);

/// Response type for the `create_join_event` endpoint.
#[derive(Debug, Deserialize, Serialize)]
pub struct SendJoinResBody {
    /// The full set of authorization events that make up the state of the
    /// room, and their authorization events, recursively.
    pub auth_chain: Vec<Box<RawJsonValue>>,

    /// The room state.
    pub state: Vec<Box<RawJsonValue>>,

    /// The signed copy of the membership event sent to other servers by the
    /// resident server, including the resident server's signature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<Box<RawJsonValue>>,

    /// The resident server's DNS name.
    pub origin: OwnedServerName,

    /// Whether `m.room.member` events along the join are omitted from
    /// `state`.
    #[serde(default, skip_serializing_if = "crate::serde::is_default")]
    pub members_omitted: bool,

    /// The servers whose members are omitted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub servers_in_room: Vec<String>,
}

/// `PUT /_matrix/federation/v2/invite/{room_id}/{event_id}`
pub fn invite_request(
    origin: &str,
    room_id: &RoomId,
    event_id: &EventId,
    body: InviteReqBody,
) -> SendResult<SendRequest> {
    let url = Url::parse(&format!(
        "{origin}/_matrix/federation/v2/invite/{room_id}/{event_id}"
    ))?;
    crate::sending::put(url).json_body(&body)
}

/// Request body for the `create_invite` endpoint.
#[derive(Debug, Deserialize, Serialize)]
pub struct InviteReqBody {
    /// The version of the room where the user is being invited to.
    pub room_version: RoomVersionId,

    /// The invite event which needs to be signed.
    pub event: Box<RawJsonValue>,

    /// An optional list of simplified events to help the receiver of the
    /// invite identify the room.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub invite_room_state: Vec<StrippedStateEvent>,

    /// An optional flag to indicate that the invited user is a direct chat
    /// target.
    #[serde(default, skip_serializing_if = "crate::serde::is_default")]
    pub via: Vec<OwnedServerName>,
}

/// Response type for the `create_invite` endpoint.
#[derive(Debug, Deserialize, Serialize)]
pub struct InviteResBody {
    /// The invite event, signed by the invited homeserver.
    pub event: Box<RawJsonValue>,
}

/// `PUT /_matrix/federation/v2/send_leave/{room_id}/{event_id}`
pub fn send_leave_request(
    origin: &str,
    room_id: &RoomId,
    event_id: &EventId,
    body: SendLeaveReqBody,
) -> SendResult<SendRequest> {
    let url = Url::parse(&format!(
        "{origin}/_matrix/federation/v2/send_leave/{room_id}/{event_id}"
    ))?;
    crate::sending::put(url).json_body(&body)
}

/// Request body for the `send_leave` endpoint: the signed leave event.
#[derive(Debug, Deserialize, Serialize)]
#[serde(transparent)]
pub struct SendLeaveReqBody(pub Box<RawJsonValue>);

/// Response type for the `send_leave` endpoint.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct SendLeaveResBody {}
