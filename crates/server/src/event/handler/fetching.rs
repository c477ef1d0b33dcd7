//! Fetching missing DAG context over federation: auth chains, prev
//! events and state snapshots.

use std::collections::{HashSet, VecDeque};

use crate::core::federation::event::{
    event_request, missing_events_request, room_state_ids_request, EventResBody,
    MissingEventsReqBody, MissingEventsResBody, RoomStateIdsResBody,
};
use crate::core::identifiers::*;
use crate::core::state::StateMap;
use crate::core::{MatrixError, RoomVersionId};
use crate::event::{gen_event_id_canonical_json, PduEvent};
use crate::{AppResult, Server};

/// Ceiling on events pulled in while chasing one event's auth chain.
const MAX_AUTH_FETCH: usize = 100;

/// Ceiling on prev events requested per gap fill.
const MISSING_EVENTS_LIMIT: usize = 10;

impl Server {
    /// Fetches the given events from the origin and persists them (and
    /// their auth chains) as outliers, deepest first.
    pub(crate) async fn fetch_and_process_outliers(
        &self,
        origin: &ServerName,
        event_ids: &[OwnedEventId],
        room_id: &RoomId,
        room_version_id: &RoomVersionId,
    ) -> AppResult<()> {
        let rules = room_version_id.rules();

        for event_id in event_ids {
            if self.store().get(event_id).await?.is_some() {
                continue;
            }

            // Pull the event and walk its auth chain breadth-first; the
            // events come back newest-first, so processing happens in
            // reverse.
            let mut todo: VecDeque<OwnedEventId> = [event_id.clone()].into();
            let mut fetched: Vec<(OwnedEventId, crate::core::serde::CanonicalJsonObject)> =
                Vec::new();
            let mut seen: HashSet<OwnedEventId> = HashSet::new();

            while let Some(next_id) = todo.pop_front() {
                if seen.len() >= MAX_AUTH_FETCH {
                    warn!(%event_id, "auth chain fetch hit its ceiling");
                    break;
                }
                if !seen.insert(next_id.clone()) {
                    continue;
                }
                if self.store().get(&next_id).await?.is_some() {
                    continue;
                }

                info!("fetching event {next_id} over federation");
                let base_url = self.resolve_origin_url(origin).await?;
                let request = event_request(&base_url, &next_id)?.into_inner();
                let response = match self.send_federation_request(origin, request, None).await
                {
                    Ok(response) => response,
                    Err(e) => {
                        warn!("failed to fetch event {next_id}: {e}");
                        continue;
                    }
                };
                let body: EventResBody = match response.json().await {
                    Ok(body) => body,
                    Err(e) => {
                        warn!("failed to parse event {next_id}: {e}");
                        continue;
                    }
                };

                let Ok((calculated_id, value)) =
                    gen_event_id_canonical_json(&body.pdu, &rules)
                else {
                    warn!("server returned an unparsable event for {next_id}");
                    continue;
                };
                if calculated_id != next_id {
                    warn!(
                        "server didn't return the event we requested: wanted {next_id}, got {calculated_id}"
                    );
                }

                if let Some(auth_events) =
                    value.get("auth_events").and_then(|v| v.as_array())
                {
                    for auth_event in auth_events {
                        if let Some(Ok(auth_id)) = auth_event
                            .as_str()
                            .map(|s| OwnedEventId::try_from(s))
                        {
                            todo.push_back(auth_id);
                        }
                    }
                }

                fetched.push((calculated_id, value));
            }

            for (next_id, value) in fetched.into_iter().rev() {
                // Boxed: the outlier stage fetches auth chains, which lands
                // back here for their parents.
                let process = Box::pin(self.process_to_outlier_pdu(
                    origin,
                    &next_id,
                    room_id,
                    room_version_id,
                    value,
                ));
                if let Err(e) = process.await {
                    warn!("authentication of fetched event {next_id} failed: {e}");
                }
            }
        }

        Ok(())
    }

    /// Fills the gap behind an incoming event via `/get_missing_events`,
    /// bounded by depth and count.
    pub(crate) async fn fetch_missing_prev_events(
        &self,
        origin: &ServerName,
        room_id: &RoomId,
        room_version_id: &RoomVersionId,
        pdu: &PduEvent,
    ) -> AppResult<()> {
        let mut missing = Vec::new();
        for prev_id in &pdu.prev_events {
            if self.store().get(prev_id).await?.is_none() {
                missing.push(prev_id.clone());
            }
        }
        if missing.is_empty() {
            return Ok(());
        }

        let earliest_events = self.store().latest_forward_extremities(room_id).await?;
        let base_url = self.resolve_origin_url(origin).await?;
        let request = missing_events_request(
            &base_url,
            room_id,
            MissingEventsReqBody {
                limit: MISSING_EVENTS_LIMIT,
                min_depth: 0,
                earliest_events,
                latest_events: vec![pdu.event_id.clone()],
            },
        )?
        .into_inner();

        let response = self.send_federation_request(origin, request, None).await?;
        let body: MissingEventsResBody = response.json().await?;

        // Oldest first, so parents land before children.
        let rules = room_version_id.rules();
        let mut events: Vec<(i64, OwnedEventId, crate::core::serde::CanonicalJsonObject)> =
            Vec::with_capacity(body.events.len());
        for event in &body.events {
            let Ok((event_id, value)) = gen_event_id_canonical_json(event, &rules) else {
                warn!("skipping unparsable missing event");
                continue;
            };
            let depth = value
                .get("depth")
                .and_then(|v| v.as_integer())
                .unwrap_or(0);
            events.push((depth, event_id, value));
        }
        events.sort_by_key(|(depth, _, _)| *depth);

        for (_, event_id, value) in events {
            if self.store().get(&event_id).await?.is_some() {
                continue;
            }
            match self
                .process_to_outlier_pdu(origin, &event_id, room_id, room_version_id, value)
                .await
            {
                Ok((prev_pdu, prev_json)) => {
                    if let Err(e) = self
                        .process_to_timeline_pdu(prev_pdu, prev_json, origin, room_id)
                        .await
                    {
                        warn!("failed to process fetched prev event {event_id}: {e}");
                    }
                }
                Err(e) => {
                    warn!("failed to process fetched prev event {event_id}: {e}");
                }
            }
        }

        Ok(())
    }

    /// Asks the origin for the state of the room at an event, fetching any
    /// events named there that are missing locally.
    pub(crate) async fn fetch_state_for_event(
        &self,
        origin: &ServerName,
        room_id: &RoomId,
        room_version_id: &RoomVersionId,
        event_id: &EventId,
    ) -> AppResult<StateMap<OwnedEventId>> {
        debug!("calling /state_ids");
        let base_url = self.resolve_origin_url(origin).await?;
        let request = room_state_ids_request(&base_url, room_id, event_id)?.into_inner();
        let response = self.send_federation_request(origin, request, None).await?;
        let body: RoomStateIdsResBody = response.json().await?;

        let mut wanted: Vec<OwnedEventId> = Vec::new();
        for id in body.pdu_ids.iter().chain(body.auth_chain_ids.iter()) {
            if self.store().get(id).await?.is_none() {
                wanted.push(id.clone());
            }
        }
        self.fetch_and_process_outliers(origin, &wanted, room_id, room_version_id)
            .await?;

        let mut state: StateMap<OwnedEventId> = StateMap::new();
        for id in &body.pdu_ids {
            let Some(event) = self.store().get(id).await? else {
                return Err(MatrixError::unknown(format!(
                    "origin's state references {id}, which could not be fetched"
                ))
                .into());
            };
            let Some(state_key) = event.state_key.clone() else {
                return Err(
                    MatrixError::bad_json("state_ids returned a non-state event").into()
                );
            };
            state.insert(((&event.event_ty).into(), state_key), id.clone());
        }

        Ok(state)
    }
}
