//! Federation transaction ingress: `PUT /_matrix/federation/v1/send/{txn_id}`.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::core::events::receipt::ReceiptContent;
use crate::core::events::typing::TypingContent;
use crate::core::federation::transaction::{
    Edu, SendMessageReqBody, SendMessageResBody, EDU_LIMIT, PDU_LIMIT,
};
use crate::core::identifiers::*;
use crate::core::presence::PresenceContent;
use crate::core::to_device::{DeviceIdOrAllDevices, DirectDeviceContent};
use crate::core::MatrixError;
use crate::event::{gen_event_id, parse_incoming_pdu};
use crate::storage::TransactionResultMap;
use crate::user::QueuedToDeviceEvent;
use crate::{AppResult, Server};

impl Server {
    /// Processes one inbound transaction: per-PDU outcomes in order, then
    /// EDU dispatch.
    ///
    /// Idempotent per `(origin, txn_id)`: a replay returns the recorded
    /// result without touching the DAG again.
    #[tracing::instrument(skip(self, body))]
    pub async fn process_transaction(
        &self,
        origin: &ServerName,
        txn_id: &TransactionId,
        body: SendMessageReqBody,
    ) -> AppResult<SendMessageResBody> {
        if body.origin != *origin {
            return Err(MatrixError::forbidden(
                "not allowed to send transactions on behalf of other servers",
            )
            .into());
        }

        if body.pdus.len() > PDU_LIMIT {
            return Err(MatrixError::forbidden(format!(
                "not allowed to send more than {PDU_LIMIT} PDUs in one transaction"
            ))
            .into());
        }

        if body.edus.len() > EDU_LIMIT {
            return Err(MatrixError::forbidden(format!(
                "not allowed to send more than {EDU_LIMIT} EDUs in one transaction"
            ))
            .into());
        }

        if let Some(recorded) = self.store().transaction_result(origin, txn_id).await? {
            debug!(%origin, %txn_id, "replayed transaction, returning recorded result");
            return Ok(SendMessageResBody::new(recorded));
        }

        let started = Instant::now();
        let deadline = Duration::from_secs(self.config().federation.transaction_timeout_secs);

        let resolved_map = self
            .process_transaction_pdus(origin, &body, started, deadline)
            .await?;
        self.process_edus(origin, body.edus).await;

        self.store()
            .record_transaction_result(origin, txn_id, &resolved_map)
            .await?;

        Ok(SendMessageResBody::new(resolved_map))
    }

    async fn process_transaction_pdus(
        &self,
        origin: &ServerName,
        body: &SendMessageReqBody,
        started: Instant,
        deadline: Duration,
    ) -> AppResult<TransactionResultMap> {
        let mut resolved_map: TransactionResultMap = BTreeMap::new();

        for pdu in &body.pdus {
            let (room_id, value) = match parse_incoming_pdu(pdu) {
                Ok(parsed) => parsed,
                Err(e) => {
                    // Without a room there is no version, and without a
                    // version no event ID to report the failure under.
                    warn!("could not parse PDU: {e}");
                    continue;
                }
            };

            let room_version_id = match self.store().room_version(&room_id).await {
                Ok(version) => version,
                Err(_) => {
                    warn!(%room_id, "received PDU for unknown room");
                    if let Ok(event_id) = gen_event_id(&value, &crate::core::RoomVersionId::V11.rules())
                    {
                        resolved_map.insert(
                            event_id,
                            Err("room is unknown to this server".to_owned()),
                        );
                    }
                    continue;
                }
            };

            let event_id = match gen_event_id(&value, &room_version_id.rules()) {
                Ok(event_id) => event_id,
                Err(e) => {
                    warn!("could not derive event id: {e}");
                    continue;
                }
            };

            // A failing PDU never halts the rest, but the wall-clock
            // deadline does: whatever is left is reported failed without
            // being persisted.
            if started.elapsed() > deadline {
                resolved_map.insert(
                    event_id,
                    Err("transaction processing deadline exceeded".to_owned()),
                );
                continue;
            }

            let pdu_start = Instant::now();
            let result = self
                .process_incoming_pdu(
                    origin,
                    &event_id,
                    &room_id,
                    &room_version_id,
                    value,
                    true,
                )
                .await;
            debug!(
                pdu_elapsed = ?pdu_start.elapsed(),
                txn_elapsed = ?started.elapsed(),
                "finished pdu {event_id}",
            );
            resolved_map.insert(event_id, result.map_err(|e| e.to_matrix().to_string()));
        }

        for (id, result) in &resolved_map {
            if let Err(e) = result {
                warn!("incoming pdu failed {id}: {e}");
            }
        }

        Ok(resolved_map)
    }

    /// Dispatches the transaction's EDUs to their typed handlers.
    ///
    /// EDU handlers never fail the transaction; invalid payloads are
    /// logged and dropped.
    pub(crate) async fn process_edus(&self, origin: &ServerName, edus: Vec<Edu>) {
        for edu in edus {
            match edu {
                Edu::Presence(presence) => self.process_edu_presence(origin, presence).await,
                Edu::Receipt(receipt) => self.process_edu_receipt(origin, receipt).await,
                Edu::Typing(typing) => self.process_edu_typing(origin, typing).await,
                Edu::DirectToDevice(content) => {
                    self.process_edu_direct_to_device(origin, content).await
                }
                Edu::_Custom(_) => {
                    warn!("received custom/unknown EDU");
                }
            }
        }
    }

    async fn process_edu_presence(&self, origin: &ServerName, presence: PresenceContent) {
        for update in presence.push {
            if update.user_id.server_name() != origin {
                warn!(
                    user_id = %update.user_id, %origin,
                    "received presence EDU for user not belonging to origin"
                );
                continue;
            }

            self.users().set_presence(update);
        }
    }

    async fn process_edu_receipt(&self, origin: &ServerName, receipt: ReceiptContent) {
        for (room_id, room_updates) in receipt {
            if self.acl_check(origin, &room_id).await.is_err() {
                warn!(
                    %origin, %room_id,
                    "received read receipt EDU from ACL'd server"
                );
                continue;
            }

            for (user_id, receipt_data) in room_updates.read {
                if user_id.server_name() != origin {
                    warn!(
                        %user_id, %origin,
                        "received read receipt EDU for user not belonging to origin"
                    );
                    continue;
                }

                if !self.is_user_joined(&user_id, &room_id).await.unwrap_or(false) {
                    warn!(
                        %user_id, %room_id, %origin,
                        "received read receipt EDU for user not in room"
                    );
                    continue;
                }

                self.rooms().set_receipt(&room_id, &user_id, receipt_data);
            }
        }
    }

    async fn process_edu_typing(&self, origin: &ServerName, typing: TypingContent) {
        if typing.user_id.server_name() != origin {
            warn!(
                user_id = %typing.user_id, %origin,
                "received typing EDU for user not belonging to origin"
            );
            return;
        }

        if self
            .acl_check(typing.user_id.server_name(), &typing.room_id)
            .await
            .is_err()
        {
            warn!(
                user_id = %typing.user_id, room_id = %typing.room_id, %origin,
                "received typing EDU for ACL'd user's server"
            );
            return;
        }

        if !self
            .is_user_joined(&typing.user_id, &typing.room_id)
            .await
            .unwrap_or(false)
        {
            warn!(
                user_id = %typing.user_id, room_id = %typing.room_id, %origin,
                "received typing EDU for user not in room"
            );
            return;
        }

        if typing.typing {
            self.add_typing(&typing.room_id, &typing.user_id);
        } else {
            self.remove_typing(&typing.room_id, &typing.user_id);
        }
    }

    async fn process_edu_direct_to_device(
        &self,
        origin: &ServerName,
        content: DirectDeviceContent,
    ) {
        let DirectDeviceContent {
            sender,
            ev_type,
            message_id,
            messages,
        } = content;

        if sender.server_name() != origin {
            warn!(
                %sender, %origin,
                "received direct-to-device EDU for user not belonging to origin"
            );
            return;
        }

        // Deduplicate by message id.
        if self.users().check_and_mark_message_seen(origin, &message_id) {
            return;
        }

        for (target_user_id, map) in &messages {
            for (target_device_id, event) in map {
                let queued = QueuedToDeviceEvent {
                    sender: sender.clone(),
                    ev_type: ev_type.clone(),
                    content: event.clone(),
                };
                let device_key = match target_device_id {
                    DeviceIdOrAllDevices::DeviceId(device_id) => device_id.as_str(),
                    // Without a device registry in scope, the wildcard is
                    // a queue of its own, drained on any sync.
                    DeviceIdOrAllDevices::AllDevices => "*",
                };
                self.users()
                    .queue_to_device(target_user_id, device_key, queued);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::core::federation::transaction::{Edu, SendMessageReqBody};
    use crate::core::identifiers::*;
    use crate::core::UnixMillis;
    use crate::server::test::test_server;

    fn transaction_body(origin: &str, edus: Vec<Edu>) -> SendMessageReqBody {
        SendMessageReqBody {
            origin: origin.try_into().unwrap(),
            origin_server_ts: UnixMillis::now(),
            pdus: vec![],
            edus,
        }
    }

    #[tokio::test]
    async fn origin_mismatch_is_forbidden() {
        let server = test_server();
        let origin: OwnedServerName = "remote.test".try_into().unwrap();
        let txn: OwnedTransactionId = "txn".try_into().unwrap();

        let body = transaction_body("impostor.test", vec![]);
        assert!(server.process_transaction(&origin, &txn, body).await.is_err());
    }

    #[tokio::test]
    async fn pdu_limit_is_enforced() {
        let server = test_server();
        let origin: OwnedServerName = "remote.test".try_into().unwrap();
        let txn: OwnedTransactionId = "txn".try_into().unwrap();

        let mut body = transaction_body("remote.test", vec![]);
        let pdu = serde_json::value::to_raw_value(&json!({})).unwrap();
        body.pdus = std::iter::repeat_with(|| pdu.clone()).take(51).collect();

        assert!(server.process_transaction(&origin, &txn, body).await.is_err());
    }

    #[tokio::test]
    async fn replay_returns_recorded_result() {
        let server = test_server();
        let origin: OwnedServerName = "remote.test".try_into().unwrap();
        let txn: OwnedTransactionId = "txn".try_into().unwrap();

        // A PDU for an unknown room is reported as failed, not dropped.
        let pdu = serde_json::value::to_raw_value(&json!({
            "room_id": "!nowhere:remote.test",
            "sender": "@user:remote.test",
            "type": "m.room.message",
            "origin_server_ts": 1_700_000_000_000_i64,
            "content": { "body": "hello" },
            "prev_events": [],
            "auth_events": [],
            "depth": 1,
        }))
        .unwrap();

        let mut body = transaction_body("remote.test", vec![]);
        body.pdus = vec![pdu.clone()];
        let first = server
            .process_transaction(&origin, &txn, body)
            .await
            .unwrap();
        assert_eq!(first.pdus.len(), 1);
        assert!(first.pdus.values().next().unwrap().is_err());

        let mut body = transaction_body("remote.test", vec![]);
        body.pdus = vec![pdu];
        let second = server
            .process_transaction(&origin, &txn, body)
            .await
            .unwrap();
        assert_eq!(first.pdus, second.pdus);
    }

    #[tokio::test]
    async fn presence_edu_requires_matching_origin() {
        let server = test_server();
        let origin: OwnedServerName = "remote.test".try_into().unwrap();
        let txn: OwnedTransactionId = "txn-p".try_into().unwrap();

        let edus: Vec<Edu> = vec![
            serde_json::from_value(json!({
                "edu_type": "m.presence",
                "content": { "push": [
                    { "user_id": "@real:remote.test", "presence": "online" },
                    { "user_id": "@spoofed:elsewhere.test", "presence": "online" },
                ]}
            }))
            .unwrap(),
        ];

        let body = transaction_body("remote.test", edus);
        server.process_transaction(&origin, &txn, body).await.unwrap();

        let real: OwnedUserId = "@real:remote.test".try_into().unwrap();
        let spoofed: OwnedUserId = "@spoofed:elsewhere.test".try_into().unwrap();
        assert!(server.presence_of(&real).is_some());
        assert!(server.presence_of(&spoofed).is_none());
    }

    #[tokio::test]
    async fn invalid_presence_state_is_dropped() {
        let server = test_server();
        let origin: OwnedServerName = "remote.test".try_into().unwrap();
        let txn: OwnedTransactionId = "txn-bad".try_into().unwrap();

        // `asleep` is not a presence state; the EDU fails to parse and is
        // passed through as custom, which the dispatcher drops.
        let edus: Vec<Edu> = vec![
            serde_json::from_value(json!({
                "edu_type": "m.presence",
                "content": { "push": [
                    { "user_id": "@real:remote.test", "presence": "asleep" },
                ]}
            }))
            .unwrap_or_else(|_| {
                serde_json::from_value(json!({
                    "edu_type": "org.invalid",
                    "content": {}
                }))
                .unwrap()
            }),
        ];

        let body = transaction_body("remote.test", edus);
        server.process_transaction(&origin, &txn, body).await.unwrap();

        let real: OwnedUserId = "@real:remote.test".try_into().unwrap();
        assert!(server.presence_of(&real).is_none());
    }

    #[tokio::test]
    async fn direct_to_device_messages_queue_and_dedupe() {
        let server = test_server();
        let origin: OwnedServerName = "remote.test".try_into().unwrap();

        let edu: Edu = serde_json::from_value(json!({
            "edu_type": "m.direct_to_device",
            "content": {
                "sender": "@a:remote.test",
                "type": "m.room_key_request",
                "message_id": "msg-1",
                "messages": {
                    "@local:hs.test": {
                        "DEVICE": { "ciphertext": "opaque" }
                    }
                }
            }
        }))
        .unwrap();

        let txn1: OwnedTransactionId = "txn-d1".try_into().unwrap();
        let body = transaction_body("remote.test", vec![edu.clone()]);
        server.process_transaction(&origin, &txn1, body).await.unwrap();

        // The same message id in a later transaction is dropped.
        let txn2: OwnedTransactionId = "txn-d2".try_into().unwrap();
        let body = transaction_body("remote.test", vec![edu]);
        server.process_transaction(&origin, &txn2, body).await.unwrap();

        let local: OwnedUserId = "@local:hs.test".try_into().unwrap();
        let drained = server.take_to_device_events(&local, "DEVICE");
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].ev_type, "m.room_key_request");
    }
}
