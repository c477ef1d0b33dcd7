//! Per-user ephemeral state: presence and queued device-to-device
//! messages.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use lru_cache::LruCache;

use crate::config::ServerConfig;
use crate::core::identifiers::*;
use crate::core::presence::PresenceUpdate;
use crate::core::serde::RawJsonValue;
use crate::core::UnixMillis;
use crate::Server;

/// How many direct-to-device `message_id`s are remembered for
/// deduplication.
const SEEN_MESSAGE_IDS: usize = 4096;

/// A queued device-to-device message, waiting for client sync delivery.
#[derive(Clone, Debug)]
pub struct QueuedToDeviceEvent {
    /// The sending user.
    pub sender: OwnedUserId,

    /// The event type of the payload.
    pub ev_type: String,

    /// The opaque payload.
    pub content: Box<RawJsonValue>,
}

/// The last known presence of a user.
#[derive(Clone, Debug)]
pub struct PresenceRecord {
    /// The update as it arrived.
    pub update: PresenceUpdate,

    /// When this server stored it.
    pub updated_at: UnixMillis,
}

/// Ephemeral per-user state the EDU handlers feed.
pub struct UserService {
    presence: Mutex<HashMap<OwnedUserId, PresenceRecord>>,
    to_device: Mutex<HashMap<(OwnedUserId, String), VecDeque<QueuedToDeviceEvent>>>,
    seen_message_ids: Mutex<LruCache<(OwnedServerName, OwnedTransactionId), ()>>,
    to_device_capacity: usize,
}

impl UserService {
    pub(crate) fn new(config: &ServerConfig) -> Self {
        Self {
            presence: Mutex::new(HashMap::new()),
            to_device: Mutex::new(HashMap::new()),
            seen_message_ids: Mutex::new(LruCache::new(SEEN_MESSAGE_IDS)),
            to_device_capacity: config.to_device.queue_capacity,
        }
    }

    pub(crate) fn set_presence(&self, update: PresenceUpdate) {
        self.presence.lock().expect("presence lock poisoned").insert(
            update.user_id.clone(),
            PresenceRecord {
                update,
                updated_at: UnixMillis::now(),
            },
        );
    }

    pub(crate) fn presence(&self, user_id: &UserId) -> Option<PresenceRecord> {
        self.presence
            .lock()
            .expect("presence lock poisoned")
            .get(user_id)
            .cloned()
    }

    /// Whether the direct-to-device `message_id` was seen before; marks it
    /// seen either way.
    pub(crate) fn check_and_mark_message_seen(
        &self,
        origin: &ServerName,
        message_id: &TransactionId,
    ) -> bool {
        let mut seen = self
            .seen_message_ids
            .lock()
            .expect("message id lock poisoned");
        seen.insert((origin.to_owned(), message_id.to_owned()), ())
            .is_some()
    }

    /// Enqueues a message for a device, dropping the oldest entry beyond
    /// the per-device bound.
    pub(crate) fn queue_to_device(
        &self,
        user_id: &UserId,
        device_id: &str,
        event: QueuedToDeviceEvent,
    ) {
        let mut queues = self.to_device.lock().expect("to-device lock poisoned");
        let queue = queues
            .entry((user_id.to_owned(), device_id.to_owned()))
            .or_default();
        if queue.len() >= self.to_device_capacity {
            queue.pop_front();
        }
        queue.push_back(event);
    }

    /// Drains the queued messages for a device, for sync delivery.
    pub(crate) fn take_to_device(
        &self,
        user_id: &UserId,
        device_id: &str,
    ) -> Vec<QueuedToDeviceEvent> {
        self.to_device
            .lock()
            .expect("to-device lock poisoned")
            .remove(&(user_id.to_owned(), device_id.to_owned()))
            .map(Vec::from)
            .unwrap_or_default()
    }
}

impl Server {
    /// The last known presence of a user, if any.
    pub fn presence_of(&self, user_id: &UserId) -> Option<PresenceRecord> {
        self.users().presence(user_id)
    }

    /// Drains the device-to-device queue of a device.
    pub fn take_to_device_events(
        &self,
        user_id: &UserId,
        device_id: &str,
    ) -> Vec<QueuedToDeviceEvent> {
        self.users().take_to_device(user_id, device_id)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::value::to_raw_value;

    use super::*;

    fn service() -> UserService {
        let config: ServerConfig = serde_json::from_value(serde_json::json!({
            "server_name": "hs.test",
            "to_device": { "queue_capacity": 2 },
        }))
        .unwrap();
        UserService::new(&config)
    }

    fn message(n: u64) -> QueuedToDeviceEvent {
        QueuedToDeviceEvent {
            sender: "@a:hs.test".try_into().unwrap(),
            ev_type: "m.room_key_request".to_owned(),
            content: to_raw_value(&serde_json::json!({ "n": n })).unwrap(),
        }
    }

    #[test]
    fn to_device_queue_drops_oldest_beyond_bound() {
        let users = service();
        let user: OwnedUserId = "@b:hs.test".try_into().unwrap();

        for n in 0..3 {
            users.queue_to_device(&user, "DEVICE", message(n));
        }

        let drained = users.take_to_device(&user, "DEVICE");
        assert_eq!(drained.len(), 2);
        assert!(drained[0].content.get().contains('1'));
        assert!(drained[1].content.get().contains('2'));

        // Drained means gone.
        assert!(users.take_to_device(&user, "DEVICE").is_empty());
    }

    #[test]
    fn message_ids_deduplicate() {
        let users = service();
        let origin: OwnedServerName = "remote.test".try_into().unwrap();
        let message_id: OwnedTransactionId = "txn-1".try_into().unwrap();

        assert!(!users.check_and_mark_message_seen(&origin, &message_id));
        assert!(users.check_and_mark_message_seen(&origin, &message_id));
    }
}
