//! Shared fixtures for the state resolution and auth tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering::SeqCst};
use std::sync::Arc;

use serde_json::{json, value::to_raw_value as to_raw_json_value};

use super::{Event, StateMap};
use crate::events::room::join_rule::{JoinRule, RoomJoinRulesEventContent};
use crate::events::room::member::{MembershipState, RoomMemberEventContent};
use crate::events::TimelineEventType;
use crate::serde::RawJsonValue;
use crate::{
    EventId, OwnedEventId, OwnedRoomId, OwnedUserId, RoomId, UnixMillis, UserId,
};

static SERVER_TIMESTAMP: AtomicU64 = AtomicU64::new(1);

/// A bare-bones state event for driving the resolver in tests.
#[derive(Clone, Debug)]
pub(crate) struct StateEvent {
    pub event_id: OwnedEventId,
    pub room_id: OwnedRoomId,
    pub sender: OwnedUserId,
    pub event_type: TimelineEventType,
    pub content: Box<RawJsonValue>,
    pub origin_server_ts: UnixMillis,
    pub state_key: Option<String>,
    pub prev_events: Vec<OwnedEventId>,
    pub auth_events: Vec<OwnedEventId>,
}

impl Event for StateEvent {
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
        &self.event_type
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
        None
    }
}

pub(crate) fn event_id(id: &str) -> OwnedEventId {
    if id.contains('$') {
        return id.try_into().unwrap();
    }
    format!("${id}:foo").try_into().unwrap()
}

pub(crate) fn alice() -> OwnedUserId {
    "@alice:foo".try_into().unwrap()
}

pub(crate) fn bob() -> OwnedUserId {
    "@bob:foo".try_into().unwrap()
}

pub(crate) fn charlie() -> OwnedUserId {
    "@charlie:foo".try_into().unwrap()
}

pub(crate) fn room_id() -> OwnedRoomId {
    "!test:foo".try_into().unwrap()
}

pub(crate) fn member_content_join() -> Box<RawJsonValue> {
    to_raw_json_value(&RoomMemberEventContent::new(MembershipState::Join)).unwrap()
}

pub(crate) fn member_content_ban() -> Box<RawJsonValue> {
    to_raw_json_value(&RoomMemberEventContent::new(MembershipState::Ban)).unwrap()
}

pub(crate) fn to_pdu_event(
    id: &str,
    sender: OwnedUserId,
    ev_type: TimelineEventType,
    state_key: Option<&str>,
    content: Box<RawJsonValue>,
    auth_events: &[&str],
    prev_events: &[&str],
) -> Arc<StateEvent> {
    let ts = SERVER_TIMESTAMP.fetch_add(1, SeqCst);
    Arc::new(StateEvent {
        event_id: event_id(id),
        room_id: room_id(),
        sender,
        event_type: ev_type,
        content,
        origin_server_ts: UnixMillis(ts),
        state_key: state_key.map(ToOwned::to_owned),
        prev_events: prev_events.iter().map(|id| event_id(id)).collect(),
        auth_events: auth_events.iter().map(|id| event_id(id)).collect(),
    })
}

/// All resolver test graphs start from this handful of events: the room is
/// created by alice, she joins, sets power levels and a public join rule,
/// then bob and charlie join.
#[allow(non_snake_case)]
pub(crate) fn INITIAL_EVENTS() -> HashMap<OwnedEventId, Arc<StateEvent>> {
    [
        to_pdu_event(
            "CREATE",
            alice(),
            TimelineEventType::RoomCreate,
            Some(""),
            to_raw_json_value(&json!({ "creator": alice() })).unwrap(),
            &[],
            &[],
        ),
        to_pdu_event(
            "IMA",
            alice(),
            TimelineEventType::RoomMember,
            Some(alice().as_str()),
            member_content_join(),
            &["CREATE"],
            &["CREATE"],
        ),
        to_pdu_event(
            "IPOWER",
            alice(),
            TimelineEventType::RoomPowerLevels,
            Some(""),
            to_raw_json_value(&json!({ "users": { alice().as_str(): 100 } })).unwrap(),
            &["CREATE", "IMA"],
            &["IMA"],
        ),
        to_pdu_event(
            "IJR",
            alice(),
            TimelineEventType::RoomJoinRules,
            Some(""),
            to_raw_json_value(&RoomJoinRulesEventContent::new(JoinRule::Public)).unwrap(),
            &["CREATE", "IMA", "IPOWER"],
            &["IPOWER"],
        ),
        to_pdu_event(
            "IMB",
            bob(),
            TimelineEventType::RoomMember,
            Some(bob().as_str()),
            member_content_join(),
            &["CREATE", "IJR", "IPOWER"],
            &["IJR"],
        ),
        to_pdu_event(
            "IMC",
            charlie(),
            TimelineEventType::RoomMember,
            Some(charlie().as_str()),
            member_content_join(),
            &["CREATE", "IJR", "IPOWER"],
            &["IMB"],
        ),
    ]
    .into_iter()
    .map(|ev| (ev.event_id.clone(), ev))
    .collect()
}

/// The `(type, state_key)` map of the initial events.
pub(crate) fn initial_state(
    events: &HashMap<OwnedEventId, Arc<StateEvent>>,
) -> StateMap<OwnedEventId> {
    events
        .values()
        .filter_map(|ev| {
            let state_key = ev.state_key.clone()?;
            Some((
                (ev.event_type.as_str().into(), state_key),
                ev.event_id.clone(),
            ))
        })
        .collect()
}

/// The transitive auth chain of the given events, by walking the test map.
pub(crate) fn auth_chain_for(
    events: &HashMap<OwnedEventId, Arc<StateEvent>>,
    start: &[OwnedEventId],
) -> HashSet<OwnedEventId> {
    let mut result = HashSet::new();
    let mut stack: Vec<OwnedEventId> = start.to_vec();

    while let Some(ev_id) = stack.pop() {
        if !result.insert(ev_id.clone()) {
            continue;
        }
        if let Some(event) = events.get(&ev_id) {
            stack.extend(event.auth_events.iter().cloned());
        }
    }

    result
}
