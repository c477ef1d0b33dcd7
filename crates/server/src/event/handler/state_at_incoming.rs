//! Computing the room state before an incoming event from its prev
//! events.

use std::sync::Arc;

use crate::core::identifiers::*;
use crate::core::state::StateMap;
use crate::event::PduEvent;
use crate::{AppResult, Server};

impl Server {
    /// The state of the room immediately before `pdu`, derived from the
    /// recorded state of its prev events.
    ///
    /// Returns `None` when some prev event's state is not known locally;
    /// the caller then has to ask the origin via `/state_ids`.
    pub(crate) async fn state_at_incoming_resolved(
        &self,
        pdu: &Arc<PduEvent>,
        room_id: &RoomId,
    ) -> AppResult<Option<StateMap<OwnedEventId>>> {
        if pdu.prev_events.is_empty() {
            // Only the create event has no prev events; the state before
            // it is empty.
            return Ok(Some(StateMap::new()));
        }

        let mut fork_states: Vec<StateMap<OwnedEventId>> =
            Vec::with_capacity(pdu.prev_events.len());

        for prev_id in &pdu.prev_events {
            let Some(state) = self.store().state_before(prev_id).await? else {
                debug!(%prev_id, "no recorded state for prev event");
                return Ok(None);
            };
            let Some(prev) = self.store().get(prev_id).await? else {
                return Ok(None);
            };

            // The prev event itself contributes to the state after it.
            let mut state = state;
            if let Some(state_key) = &prev.state_key {
                state.insert(
                    ((&prev.event_ty).into(), state_key.clone()),
                    prev_id.clone(),
                );
            }
            fork_states.push(state);
        }

        if fork_states.len() == 1 {
            return Ok(fork_states.pop());
        }

        // Divergent prev events: resolve the forks without touching the
        // room's current state.
        let rules = self.room_version_rules(room_id).await?;
        let mut auth_chain_sets = Vec::with_capacity(fork_states.len());
        for state in &fork_states {
            let starting: Vec<OwnedEventId> = state.values().cloned().collect();
            auth_chain_sets.push(self.store().auth_chain(&starting).await?);
        }

        let mut needed: std::collections::HashSet<OwnedEventId> =
            std::collections::HashSet::new();
        for state in &fork_states {
            needed.extend(state.values().cloned());
        }
        for chain in &auth_chain_sets {
            needed.extend(chain.iter().cloned());
        }
        let needed: Vec<OwnedEventId> = needed.into_iter().collect();
        let snapshot: std::collections::HashMap<OwnedEventId, Arc<PduEvent>> = self
            .store()
            .get_many(&needed)
            .await?
            .into_iter()
            .map(|event| (event.event_id.clone(), event))
            .collect();

        match crate::core::state::resolve(
            &rules,
            &fork_states,
            &auth_chain_sets,
            &|event_id| snapshot.get(event_id).cloned(),
        ) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                warn!("state resolution across prev events failed: {e}");
                Ok(None)
            }
        }
    }
}
