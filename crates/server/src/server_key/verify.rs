//! Event and JSON verification against resolved keys.

use crate::core::identifiers::*;
use crate::core::serde::{CanonicalJsonObject, CanonicalJsonValue};
use crate::core::signatures::{self, Verified};
use crate::core::{MatrixError, RoomVersionId};
use crate::event::gen_event_id_canonical_json;
use crate::core::serde::RawJsonValue;
use crate::{AppResult, Server};

impl Server {
    /// Verifies the signatures and content hash of an event, resolving any
    /// missing keys over federation.
    pub async fn verify_event(
        &self,
        event: &CanonicalJsonObject,
        room_version: &RoomVersionId,
    ) -> AppResult<Verified> {
        let rules = room_version.rules();
        let keys = self.event_verify_keys(event, &rules).await?;
        signatures::verify_event(&keys, event, &rules)
            .map_err(|e| MatrixError::unauthorized(format!("event verification failed: {e}")).into())
    }

    /// Verifies the signatures on an arbitrary JSON object, resolving
    /// missing keys over federation.
    pub async fn verify_json(
        &self,
        object: &CanonicalJsonObject,
        room_version: &RoomVersionId,
    ) -> AppResult<()> {
        let rules = room_version.rules();
        let keys = self.event_verify_keys(object, &rules).await?;
        signatures::verify_json(&keys, object)
            .map_err(|e| MatrixError::unauthorized(format!("JSON verification failed: {e}")).into())
    }

    /// Derives the event ID for a raw PDU, verifies the event, and injects
    /// the ID into the returned object.
    pub async fn validate_and_add_event_id(
        &self,
        pdu: &RawJsonValue,
        room_version: &RoomVersionId,
    ) -> AppResult<(OwnedEventId, CanonicalJsonObject)> {
        let (event_id, mut value) = gen_event_id_canonical_json(pdu, &room_version.rules())?;
        if let Err(e) = self.verify_event(&value, room_version).await {
            return Err(
                MatrixError::unauthorized(format!("event {event_id} failed verification: {e}"))
                    .into(),
            );
        }

        value.insert(
            "event_id".into(),
            CanonicalJsonValue::String(event_id.as_str().into()),
        );

        Ok((event_id, value))
    }
}
