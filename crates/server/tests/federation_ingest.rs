//! End-to-end ingestion of a federated room: signed events flow from a
//! "remote" engine into a local one through the full validation pipeline.

use std::sync::Arc;

use serde_json::json;

use lodestar_server::core::events::StateEventType;
use lodestar_server::core::federation::transaction::SendMessageReqBody;
use lodestar_server::core::identifiers::*;
use lodestar_server::core::serde::{CanonicalJsonObject, CanonicalJsonValue};
use lodestar_server::core::signatures::Ed25519KeyPair;
use lodestar_server::core::{RoomVersionId, UnixMillis};
use lodestar_server::event::gen_event_id;
use lodestar_server::storage::MemoryEventStore;
use lodestar_server::{Server, ServerConfig};

const ROOM_VERSION: RoomVersionId = RoomVersionId::V10;

fn make_server(name: &str) -> Arc<Server> {
    let config: ServerConfig = serde_json::from_value(json!({
        "server_name": name,
        "allow_federation": false,
    }))
    .unwrap();
    let der = Ed25519KeyPair::generate().unwrap();
    let keypair = Ed25519KeyPair::from_der(&der, "0".to_owned()).unwrap();
    Server::with_keypair(config, Arc::new(MemoryEventStore::new()), keypair)
}

/// Exchange key documents so the local server can verify the remote's
/// signatures.
fn exchange_keys(from: &Server, to: &Server) {
    let document = from.server_keys_document().unwrap();
    let json = lodestar_server::core::serde::to_canonical_value(&document)
        .unwrap()
        .as_object()
        .cloned()
        .unwrap();
    to.remember_keys(json).unwrap();
}

struct RemoteRoom {
    server: Arc<Server>,
    room_id: OwnedRoomId,
    ts: u64,
}

impl RemoteRoom {
    fn new(server: Arc<Server>, room_id: &str) -> Self {
        Self {
            server,
            room_id: room_id.try_into().unwrap(),
            ts: 1_700_000_000_000,
        }
    }

    /// Builds and signs an event as the remote server.
    fn event(
        &mut self,
        sender: &str,
        event_type: &str,
        state_key: Option<&str>,
        content: serde_json::Value,
        prev_events: &[&OwnedEventId],
        auth_events: &[&OwnedEventId],
        depth: i64,
    ) -> (OwnedEventId, CanonicalJsonObject) {
        self.ts += 1000;
        let mut value: CanonicalJsonObject = serde_json::from_value(json!({
            "room_id": self.room_id.as_str(),
            "sender": sender,
            "type": event_type,
            "origin_server_ts": self.ts,
            "content": content,
            "prev_events": prev_events.iter().map(|id| id.as_str()).collect::<Vec<_>>(),
            "auth_events": auth_events.iter().map(|id| id.as_str()).collect::<Vec<_>>(),
            "depth": depth,
        }))
        .unwrap();
        if let Some(state_key) = state_key {
            value.insert(
                "state_key".to_owned(),
                CanonicalJsonValue::String(state_key.to_owned()),
            );
        }

        self.server
            .hash_and_sign_event(&mut value, &ROOM_VERSION.rules().redaction)
            .unwrap();
        let event_id = gen_event_id(&value, &ROOM_VERSION.rules()).unwrap();
        (event_id, value)
    }
}

/// Drives a remotely created room through the local pipeline and checks
/// auth, state updates and soft-fail semantics.
#[tokio::test]
async fn ingests_a_remote_room_and_soft_fails_stale_events() {
    let local = make_server("local.test");
    let remote = make_server("remote.test");
    exchange_keys(&remote, &local);

    let origin: OwnedServerName = "remote.test".try_into().unwrap();
    let alice = "@alice:remote.test";
    let bob = "@bob:remote.test";
    let mut room = RemoteRoom::new(remote.clone(), "!room:remote.test");
    let room_id = room.room_id.clone();

    let creator: OwnedUserId = alice.try_into().unwrap();
    local
        .store()
        .create_room(&room_id, ROOM_VERSION, &creator)
        .await
        .unwrap();

    // The DAG: create -> alice joins -> power levels -> bob joins.
    let (create_id, create) = room.event(
        alice,
        "m.room.create",
        Some(""),
        json!({ "room_version": "10", "creator": alice }),
        &[],
        &[],
        1,
    );
    let (alice_join_id, alice_join) = room.event(
        alice,
        "m.room.member",
        Some(alice),
        json!({ "membership": "join" }),
        &[&create_id],
        &[&create_id],
        2,
    );
    let (power_id, power) = room.event(
        alice,
        "m.room.power_levels",
        Some(""),
        json!({ "users": { alice: 100 }, "ban": 50 }),
        &[&alice_join_id],
        &[&create_id, &alice_join_id],
        3,
    );
    let (join_rules_id, join_rules) = room.event(
        alice,
        "m.room.join_rules",
        Some(""),
        json!({ "join_rule": "public" }),
        &[&power_id],
        &[&create_id, &alice_join_id, &power_id],
        4,
    );
    let (bob_join_id, bob_join) = room.event(
        bob,
        "m.room.member",
        Some(bob),
        json!({ "membership": "join" }),
        &[&join_rules_id],
        &[&create_id, &join_rules_id, &power_id],
        5,
    );

    for (event_id, value) in [
        (&create_id, create),
        (&alice_join_id, alice_join),
        (&power_id, power),
        (&join_rules_id, join_rules),
        (&bob_join_id, bob_join),
    ] {
        local
            .process_incoming_pdu(&origin, event_id, &room_id, &ROOM_VERSION, value, true)
            .await
            .unwrap();
    }

    // The resolved state reflects the whole chain.
    let state = local.store().resolved_state(&room_id).await.unwrap();
    assert_eq!(
        state[&(StateEventType::RoomMember, bob.to_owned())],
        bob_join_id
    );
    assert_eq!(
        state[&(StateEventType::RoomPowerLevels, String::new())],
        power_id
    );

    // Alice bans bob.
    let (ban_id, ban) = room.event(
        alice,
        "m.room.member",
        Some(bob),
        json!({ "membership": "ban" }),
        &[&bob_join_id],
        &[&create_id, &alice_join_id, &power_id, &bob_join_id],
        6,
    );
    local
        .process_incoming_pdu(&origin, &ban_id, &room_id, &ROOM_VERSION, ban, true)
        .await
        .unwrap();

    let state = local.store().resolved_state(&room_id).await.unwrap();
    assert_eq!(state[&(StateEventType::RoomMember, bob.to_owned())], ban_id);

    // Bob sends a message whose auth events predate the ban: valid
    // against its declared auth events, stale against the current state.
    // It must be soft-failed: persisted, outside the resolved state.
    let (stale_id, stale) = room.event(
        bob,
        "m.room.message",
        None,
        json!({ "body": "you cannot silence me" }),
        &[&bob_join_id],
        &[&create_id, &bob_join_id, &power_id],
        6,
    );
    local
        .process_incoming_pdu(&origin, &stale_id, &room_id, &ROOM_VERSION, stale, true)
        .await
        .unwrap();

    let stored = local
        .store()
        .get_full(&stale_id)
        .await
        .unwrap()
        .expect("soft-failed event is persisted");
    assert!(stored.soft_failed);
    assert!(!stored.outlier);

    let state = local.store().resolved_state(&room_id).await.unwrap();
    assert!(
        !state
            .values()
            .any(|id| *id == stale_id),
        "soft-failed events must not enter the resolved state"
    );

    // Soft-failed events stay referenceable as prev_events.
    let (next_id, next) = room.event(
        alice,
        "m.room.topic",
        Some(""),
        json!({ "topic": "after the storm" }),
        &[&stale_id],
        &[&create_id, &alice_join_id, &power_id],
        7,
    );
    local
        .process_incoming_pdu(&origin, &next_id, &room_id, &ROOM_VERSION, next, true)
        .await
        .unwrap();

    let state = local.store().resolved_state(&room_id).await.unwrap();
    assert_eq!(state[&(StateEventType::RoomTopic, String::new())], next_id);
}

/// An event whose sender fails auth against its own auth events is
/// rejected outright, not soft-failed.
#[tokio::test]
async fn rejects_events_that_fail_auth_against_their_auth_events() {
    let local = make_server("local.test");
    let remote = make_server("remote.test");
    exchange_keys(&remote, &local);

    let origin: OwnedServerName = "remote.test".try_into().unwrap();
    let alice = "@alice:remote.test";
    let mallory = "@mallory:remote.test";
    let mut room = RemoteRoom::new(remote.clone(), "!room:remote.test");
    let room_id = room.room_id.clone();

    let creator: OwnedUserId = alice.try_into().unwrap();
    local
        .store()
        .create_room(&room_id, ROOM_VERSION, &creator)
        .await
        .unwrap();

    let (create_id, create) = room.event(
        alice,
        "m.room.create",
        Some(""),
        json!({ "room_version": "10", "creator": alice }),
        &[],
        &[],
        1,
    );
    let (alice_join_id, alice_join) = room.event(
        alice,
        "m.room.member",
        Some(alice),
        json!({ "membership": "join" }),
        &[&create_id],
        &[&create_id],
        2,
    );
    for (event_id, value) in [(&create_id, create), (&alice_join_id, alice_join)] {
        local
            .process_incoming_pdu(&origin, event_id, &room_id, &ROOM_VERSION, value, true)
            .await
            .unwrap();
    }

    // Mallory never joined; her message cannot pass auth.
    let (bad_id, bad) = room.event(
        mallory,
        "m.room.message",
        None,
        json!({ "body": "let me in" }),
        &[&alice_join_id],
        &[&create_id, &alice_join_id],
        3,
    );
    let result = local
        .process_incoming_pdu(&origin, &bad_id, &room_id, &ROOM_VERSION, bad, true)
        .await;
    assert!(result.is_err());

    let stored = local
        .store()
        .get_full(&bad_id)
        .await
        .unwrap()
        .expect("rejected events are still recorded");
    assert!(stored.rejection_reason.is_some());
}

/// Transaction idempotency over real PDUs: the second delivery returns the
/// first delivery's results and does not duplicate anything.
#[tokio::test]
async fn transactions_are_idempotent() {
    let local = make_server("local.test");
    let remote = make_server("remote.test");
    exchange_keys(&remote, &local);

    let origin: OwnedServerName = "remote.test".try_into().unwrap();
    let alice = "@alice:remote.test";
    let mut room = RemoteRoom::new(remote.clone(), "!room:remote.test");
    let room_id = room.room_id.clone();

    let creator: OwnedUserId = alice.try_into().unwrap();
    local
        .store()
        .create_room(&room_id, ROOM_VERSION, &creator)
        .await
        .unwrap();

    let (create_id, create) = room.event(
        alice,
        "m.room.create",
        Some(""),
        json!({ "room_version": "10", "creator": alice }),
        &[],
        &[],
        1,
    );
    let (join_id, join) = room.event(
        alice,
        "m.room.member",
        Some(alice),
        json!({ "membership": "join" }),
        &[&create_id],
        &[&create_id],
        2,
    );

    let to_raw = |value: &CanonicalJsonObject| {
        serde_json::value::to_raw_value(&CanonicalJsonValue::Object(value.clone())).unwrap()
    };
    let body = || SendMessageReqBody {
        origin: "remote.test".try_into().unwrap(),
        origin_server_ts: UnixMillis::now(),
        pdus: vec![to_raw(&create), to_raw(&join)],
        edus: vec![],
    };

    let txn_id: OwnedTransactionId = "txn-1".try_into().unwrap();
    let first = local
        .process_transaction(&origin, &txn_id, body())
        .await
        .unwrap();
    assert!(first.pdus[&create_id].is_ok());
    assert!(first.pdus[&join_id].is_ok());

    let second = local
        .process_transaction(&origin, &txn_id, body())
        .await
        .unwrap();
    assert_eq!(first.pdus, second.pdus);
}
