//! Ephemeral typing state, fed by `m.typing` EDUs.
//!
//! Entries expire after the configured timeout (30 seconds by default);
//! expiry happens opportunistically on access plus through the periodic
//! sweeper.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::core::identifiers::*;
use crate::Server;

#[derive(Default)]
pub(crate) struct TypingState {
    rooms: Mutex<HashMap<OwnedRoomId, HashMap<OwnedUserId, Instant>>>,
}

impl TypingState {
    fn prune_room(room: &mut HashMap<OwnedUserId, Instant>) {
        let now = Instant::now();
        room.retain(|_, expires| *expires > now);
    }

    pub(crate) fn add(&self, room_id: &RoomId, user_id: &UserId, timeout: Duration) {
        let mut rooms = self.rooms.lock().expect("typing lock poisoned");
        let room = rooms.entry(room_id.to_owned()).or_default();
        Self::prune_room(room);
        room.insert(user_id.to_owned(), Instant::now() + timeout);
    }

    pub(crate) fn remove(&self, room_id: &RoomId, user_id: &UserId) {
        let mut rooms = self.rooms.lock().expect("typing lock poisoned");
        if let Some(room) = rooms.get_mut(room_id) {
            room.remove(user_id);
            if room.is_empty() {
                rooms.remove(room_id);
            }
        }
    }

    pub(crate) fn current(&self, room_id: &RoomId) -> Vec<OwnedUserId> {
        let mut rooms = self.rooms.lock().expect("typing lock poisoned");
        let Some(room) = rooms.get_mut(room_id) else {
            return Vec::new();
        };
        Self::prune_room(room);
        let mut users: Vec<OwnedUserId> = room.keys().cloned().collect();
        users.sort();
        users
    }

    pub(crate) fn sweep(&self) {
        let mut rooms = self.rooms.lock().expect("typing lock poisoned");
        for room in rooms.values_mut() {
            Self::prune_room(room);
        }
        rooms.retain(|_, room| !room.is_empty());
    }
}

impl Server {
    /// Records that a user is typing in a room, expiring after the
    /// federation typing timeout.
    pub fn add_typing(&self, room_id: &RoomId, user_id: &UserId) {
        let timeout = Duration::from_secs(self.config().typing.federation_timeout_secs);
        self.rooms().typing.add(room_id, user_id, timeout);
    }

    /// Clears a user's typing notification.
    pub fn remove_typing(&self, room_id: &RoomId, user_id: &UserId) {
        self.rooms().typing.remove(room_id, user_id);
    }

    /// The users currently typing in a room.
    pub fn typing_users(&self, room_id: &RoomId) -> Vec<OwnedUserId> {
        self.rooms().typing.current(room_id)
    }

    /// Spawns the periodic sweeper over ephemeral state.
    pub fn start_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let server = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            loop {
                interval.tick().await;
                server.rooms().typing.sweep();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::TypingState;
    use crate::core::identifiers::*;

    #[test]
    fn entries_expire() {
        let state = TypingState::default();
        let room: OwnedRoomId = "!r:hs".try_into().unwrap();
        let user: OwnedUserId = "@u:hs".try_into().unwrap();

        state.add(&room, &user, Duration::from_secs(30));
        assert_eq!(state.current(&room), [user.clone()]);

        // An already-expired entry disappears on the next read.
        state.add(&room, &user, Duration::from_secs(0));
        assert!(state.current(&room).is_empty());
    }

    #[test]
    fn stop_typing_removes_immediately() {
        let state = TypingState::default();
        let room: OwnedRoomId = "!r:hs".try_into().unwrap();
        let user: OwnedUserId = "@u:hs".try_into().unwrap();

        state.add(&room, &user, Duration::from_secs(30));
        state.remove(&room, &user);
        assert!(state.current(&room).is_empty());

        state.sweep();
    }
}
