//! Per-room shared state: the serialization locks, room metadata helpers
//! over the store, and the ephemeral typing sets.

pub mod typing;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use tokio::sync::broadcast;

use self::typing::TypingState;
use crate::core::events::receipt::ReceiptData;
use crate::core::events::room::create::RoomCreateEventContent;
use crate::core::events::room::member::{MembershipState, RoomMemberEventContent};
use crate::core::events::room::server_acl::RoomServerAclEventContent;
use crate::core::events::StateEventType;
use crate::core::identifiers::*;
use crate::core::{MatrixError, RoomVersionId, RoomVersionRules};
use crate::event::PduEvent;
use crate::{AppResult, Server};

/// Mutable per-room engine state.
pub struct RoomService {
    /// One mutex per room; PDU ingestion serializes on it. Never held
    /// across network I/O.
    locks: Mutex<HashMap<OwnedRoomId, Arc<AsyncMutex<()>>>>,

    /// Who is typing where, with expiries.
    pub(crate) typing: TypingState,

    /// Latest `m.read` marker per room and user.
    receipts: Mutex<HashMap<(OwnedRoomId, OwnedUserId), ReceiptData>>,

    /// Fan-out of newly accepted timeline events.
    notifier: broadcast::Sender<OwnedEventId>,
}

impl Default for RoomService {
    fn default() -> Self {
        let (notifier, _) = broadcast::channel(256);
        Self {
            locks: Mutex::new(HashMap::new()),
            typing: TypingState::default(),
            receipts: Mutex::new(HashMap::new()),
            notifier,
        }
    }
}

impl RoomService {
    fn lock_handle(&self, room_id: &RoomId) -> Arc<AsyncMutex<()>> {
        self.locks
            .lock()
            .expect("room lock registry poisoned")
            .entry(room_id.to_owned())
            .or_default()
            .clone()
    }

    pub(crate) fn notifier(&self) -> &broadcast::Sender<OwnedEventId> {
        &self.notifier
    }

    pub(crate) fn set_receipt(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
        receipt: ReceiptData,
    ) {
        self.receipts
            .lock()
            .expect("receipt lock poisoned")
            .insert((room_id.to_owned(), user_id.to_owned()), receipt);
    }

    pub(crate) fn receipt(&self, room_id: &RoomId, user_id: &UserId) -> Option<ReceiptData> {
        self.receipts
            .lock()
            .expect("receipt lock poisoned")
            .get(&(room_id.to_owned(), user_id.to_owned()))
            .cloned()
    }
}

impl Server {
    /// Takes the room's state lock. Concurrent transactions touching the
    /// same room queue here; disjoint rooms proceed in parallel.
    pub async fn lock_room(&self, room_id: &RoomId) -> OwnedMutexGuard<()> {
        self.rooms().lock_handle(room_id).lock_owned().await
    }

    /// A stream of newly accepted timeline events.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<OwnedEventId> {
        self.rooms().notifier().subscribe()
    }

    /// The latest read receipt of a user in a room, if any.
    pub fn read_receipt(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
    ) -> Option<crate::core::events::receipt::ReceiptData> {
        self.rooms().receipt(room_id, user_id)
    }

    /// The room's version.
    pub async fn room_version(&self, room_id: &RoomId) -> AppResult<RoomVersionId> {
        self.store().room_version(room_id).await
    }

    /// The rule set of the room's version.
    pub async fn room_version_rules(&self, room_id: &RoomId) -> AppResult<RoomVersionRules> {
        Ok(self.room_version(room_id).await?.rules())
    }

    /// The event currently holding the given state slot, per the resolved
    /// state.
    pub async fn state_event(
        &self,
        room_id: &RoomId,
        event_type: &StateEventType,
        state_key: &str,
    ) -> AppResult<Option<Arc<PduEvent>>> {
        let state = self.store().resolved_state(room_id).await?;
        let Some(event_id) = state.get(&(event_type.clone(), state_key.to_owned())) else {
            return Ok(None);
        };
        self.store().get(event_id).await
    }

    /// The room's `m.room.create` event.
    pub async fn room_create_event(&self, room_id: &RoomId) -> AppResult<Arc<PduEvent>> {
        self.state_event(room_id, &StateEventType::RoomCreate, "")
            .await?
            .ok_or_else(|| MatrixError::not_found("room has no create event").into())
    }

    /// The creator of the room, per its create event and room version.
    pub async fn room_creator(&self, room_id: &RoomId) -> AppResult<OwnedUserId> {
        let create = self.room_create_event(room_id).await?;
        let rules = self.room_version_rules(room_id).await?;
        if rules.authorization.use_room_create_sender {
            Ok(create.sender.clone())
        } else {
            let content: RoomCreateEventContent = create.get_content()?;
            content
                .creator
                .ok_or_else(|| MatrixError::bad_json("create event has no creator").into())
        }
    }

    /// Whether any user of the given server is joined to the room.
    pub async fn is_server_in_room(
        &self,
        server: &ServerName,
        room_id: &RoomId,
    ) -> AppResult<bool> {
        let state = self.store().resolved_state(room_id).await?;

        for ((event_type, state_key), event_id) in &state {
            if *event_type != StateEventType::RoomMember {
                continue;
            }
            let Ok(user) = <&UserId>::try_from(state_key.as_str()) else {
                continue;
            };
            if user.server_name() != server {
                continue;
            }
            let Some(member) = self.store().get(event_id).await? else {
                continue;
            };
            let Ok(content) = member.get_content::<RoomMemberEventContent>() else {
                continue;
            };
            if content.membership == MembershipState::Join {
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Whether the given user is joined to the room.
    pub async fn is_user_joined(&self, user_id: &UserId, room_id: &RoomId) -> AppResult<bool> {
        let member = self
            .state_event(room_id, &StateEventType::RoomMember, user_id.as_str())
            .await?;
        Ok(match member {
            Some(member) => {
                member
                    .get_content::<RoomMemberEventContent>()
                    .map(|c| c.membership == MembershipState::Join)
                    .unwrap_or(false)
            }
            None => false,
        })
    }

    /// Returns Ok when the room's server ACL allows the server.
    pub async fn acl_check(&self, server_name: &ServerName, room_id: &RoomId) -> AppResult<()> {
        let acl_event = match self
            .state_event(room_id, &StateEventType::RoomServerAcl, "")
            .await?
        {
            Some(acl) => acl,
            None => return Ok(()),
        };

        let acl_content: RoomServerAclEventContent = match acl_event.get_content() {
            Ok(content) => content,
            Err(_) => {
                warn!("invalid ACL event");
                return Ok(());
            }
        };

        if acl_content.allow.is_empty() {
            // Ignore broken acl events.
            return Ok(());
        }

        if acl_content.is_allowed(server_name) {
            Ok(())
        } else {
            info!("server {server_name} was denied by room ACL in {room_id}");
            Err(MatrixError::forbidden("server was denied by room ACL").into())
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::{timeout, Duration};

    use crate::server::test::test_server;

    #[tokio::test]
    async fn room_locks_serialize_per_room() {
        let server = test_server();
        let room_a: crate::core::OwnedRoomId = "!a:hs.test".try_into().unwrap();
        let room_b: crate::core::OwnedRoomId = "!b:hs.test".try_into().unwrap();

        let guard_a = server.lock_room(&room_a).await;

        // The same room blocks...
        assert!(
            timeout(Duration::from_millis(50), server.lock_room(&room_a))
                .await
                .is_err()
        );
        // ...a different room does not.
        assert!(
            timeout(Duration::from_millis(50), server.lock_room(&room_b))
                .await
                .is_ok()
        );

        drop(guard_a);
        assert!(
            timeout(Duration::from_millis(50), server.lock_room(&room_a))
                .await
                .is_ok()
        );
    }
}
