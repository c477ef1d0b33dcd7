//! Network fetching of remote signing keys, from origins and notaries.

use crate::core::federation::discovery::{
    remote_server_keys_request, server_keys_request, RemoteServerKeysReqArgs,
    RemoteServerKeysResBody, ServerKeysResBody,
};
use crate::core::identifiers::*;
use crate::core::serde::{Base64, CanonicalJsonObject};
use crate::core::{MatrixError, UnixMillis};
use crate::{AppError, AppResult, Server};

use super::key_usable_at;

impl Server {
    pub(super) async fn fetch_key_from_origin(
        &self,
        origin: &ServerName,
        key_id: &SigningKeyId,
        at: Option<UnixMillis>,
        enforce_key_validity: bool,
    ) -> AppResult<Base64> {
        let document = self.server_request(origin).await?;
        self.remember_keys(document)?;

        self.keys()
            .cached(origin)
            .and_then(|keys| key_usable_at(&keys, key_id, at, enforce_key_validity))
            .ok_or_else(|| {
                MatrixError::unauthorized("origin did not serve the required key").into()
            })
    }

    pub(super) async fn fetch_key_from_notaries(
        &self,
        origin: &ServerName,
        key_id: &SigningKeyId,
        at: Option<UnixMillis>,
        enforce_key_validity: bool,
    ) -> AppResult<Base64> {
        for notary in &self.config().trusted_servers {
            match self.notary_request(notary, origin).await {
                Ok(documents) => {
                    for document in documents {
                        if let Err(e) = self.remember_keys(document) {
                            warn!(%notary, "notary served an invalid keys document: {e}");
                        }
                    }
                }
                Err(e) => {
                    debug!(%notary, "notary key query failed: {e}");
                    continue;
                }
            }

            if let Some(key) = self
                .keys()
                .cached(origin)
                .and_then(|keys| key_usable_at(&keys, key_id, at, enforce_key_validity))
            {
                return Ok(key);
            }
        }

        Err(MatrixError::unauthorized("no notary could serve the required key").into())
    }

    /// `GET /_matrix/key/v2/server` on the target itself.
    ///
    /// Returns the raw canonical object so the self-signature can be
    /// checked before anything is parsed out of it.
    pub(super) async fn server_request(
        &self,
        target: &ServerName,
    ) -> AppResult<CanonicalJsonObject> {
        let origin = self.resolve_origin_url(target).await?;
        let request = server_keys_request(&origin)?.into_inner();
        let response = self.send_federation_request(target, request, None).await?;
        let document: CanonicalJsonObject = response.json().await?;

        // A server responding on behalf of another is lying.
        let body: ServerKeysResBody = serde_json::from_value(serde_json::to_value(
            crate::core::serde::CanonicalJsonValue::Object(document.clone()),
        )?)?;
        if body.0.server_name != *target {
            warn!(
                requested = %target,
                response = %body.0.server_name,
                "server responded with bogus server_name"
            );
            return Err(MatrixError::unknown("server responded with bogus server_name").into());
        }

        Ok(document)
    }

    /// `GET /_matrix/key/v2/query/{target}` against a notary.
    pub(super) async fn notary_request(
        &self,
        notary: &ServerName,
        target: &ServerName,
    ) -> AppResult<Vec<CanonicalJsonObject>> {
        let origin = self.resolve_origin_url(notary).await?;
        let request = remote_server_keys_request(
            &origin,
            RemoteServerKeysReqArgs {
                server_name: target.to_owned(),
                minimum_valid_until_ts: minimum_valid_ts(),
            },
        )?
        .into_inner();

        let response = self.send_federation_request(notary, request, None).await?;
        let body: serde_json::Value = response.json().await?;

        // Split the documents back out as canonical objects for
        // per-document signature validation.
        let parsed: RemoteServerKeysResBody = serde_json::from_value(body.clone())?;
        let raw_documents = body
            .get("server_keys")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        if parsed.server_keys.len() != raw_documents.len() {
            return Err(AppError::public("notary response shape mismatch"));
        }

        raw_documents
            .into_iter()
            .map(|document| {
                Ok(crate::core::serde::CanonicalJsonValue::try_from(document)?
                    .as_object()
                    .cloned()
                    .ok_or_else(|| AppError::public("notary served a non-object document"))?)
            })
            .collect()
    }
}

/// Keys fetched now should stay valid for at least an hour.
fn minimum_valid_ts() -> UnixMillis {
    UnixMillis::from_system_time(
        std::time::SystemTime::now() + std::time::Duration::from_secs(3600),
    )
    .expect("system clock in range")
}
