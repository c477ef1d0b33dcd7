//! Outbound request signing and inbound request authentication, plus the
//! access checks shared by the federation surface.

pub mod ops;

use reqwest::header::{AUTHORIZATION, HOST};

use crate::core::federation::authorization::XMatrix;
use crate::core::identifiers::*;
use crate::core::serde::{CanonicalJsonObject, CanonicalJsonValue, JsonValue};
use crate::core::{ErrorKind, MatrixError};
use crate::{AppError, AppResult, Server};

/// Signs the request with this server's key, attaches the `X-Matrix`
/// authorization and `Host` headers, and executes it.
///
/// Callers go through [`Server::send_federation_request`], which wraps this
/// in the concurrency bounds and circuit breaker.
pub(crate) async fn send_request(
    server: &Server,
    destination: &ServerName,
    mut request: reqwest::Request,
) -> AppResult<reqwest::Response> {
    if !server.config().allow_federation {
        return Err(AppError::public("federation is disabled"));
    }

    if destination == server.server_name() {
        return Err(AppError::public("won't send federation request to ourselves"));
    }

    debug!("preparing to send request to {destination}");
    let mut request_map = CanonicalJsonObject::new();

    if let Some(body) = request.body() {
        let content: CanonicalJsonValue =
            serde_json::from_slice(body.as_bytes().unwrap_or_default())
                .map_err(|_| AppError::internal("request body is not JSON"))?;
        request_map.insert("content".to_owned(), content);
    }

    request_map.insert(
        "method".to_owned(),
        CanonicalJsonValue::String(request.method().to_string()),
    );
    request_map.insert(
        "uri".to_owned(),
        CanonicalJsonValue::String(format!(
            "{}{}",
            request.url().path(),
            request
                .url()
                .query()
                .map(|q| format!("?{q}"))
                .unwrap_or_default()
        )),
    );
    request_map.insert(
        "origin".to_owned(),
        CanonicalJsonValue::String(server.server_name().as_str().to_owned()),
    );
    request_map.insert(
        "destination".to_owned(),
        CanonicalJsonValue::String(destination.as_str().to_owned()),
    );

    server.sign_json(&mut request_map)?;

    let signatures = request_map
        .get("signatures")
        .and_then(|v| v.as_object())
        .and_then(|sigs| sigs.get(server.server_name().as_str()))
        .and_then(|v| v.as_object())
        .ok_or_else(|| AppError::internal("request signing left no signature"))?;

    for (key_id, signature) in signatures {
        let key_id: OwnedSigningKeyId = key_id
            .as_str()
            .try_into()
            .map_err(|_| AppError::internal("signed with an invalid key id"))?;
        let signature = signature
            .as_str()
            .ok_or_else(|| AppError::internal("signature is not a string"))?;

        let header = XMatrix::new(
            server.server_name().to_owned(),
            destination.to_owned(),
            key_id,
            signature.to_owned(),
        );
        request.headers_mut().insert(
            AUTHORIZATION,
            header
                .encode()
                .parse()
                .map_err(|_| AppError::internal("X-Matrix header failed to encode"))?,
        );
    }

    // SRV indirection keeps the delegating name in the Host header.
    let actual = server.resolve_actual_dest(destination).await?;
    request.headers_mut().insert(
        HOST,
        actual
            .host_header
            .parse()
            .map_err(|_| AppError::internal("host header failed to encode"))?,
    );

    let url = request.url().clone();
    debug!("sending request to {destination} at {url}");
    let response = server.sending().federation_client().execute(request).await;

    match response {
        Ok(response) => {
            let status = response.status();
            if status.is_success() {
                Ok(response)
            } else {
                let body = response.text().await.unwrap_or_default();
                warn!("answer from {destination}({url}) {status}: {body}");
                let mut extra =
                    serde_json::from_str::<serde_json::Map<String, JsonValue>>(&body)
                        .unwrap_or_default();
                let message = extra
                    .remove("error")
                    .and_then(|v| v.as_str().map(ToOwned::to_owned))
                    .unwrap_or_else(|| "failed to parse remote response".to_owned());
                let kind = extra
                    .remove("errcode")
                    .and_then(|v| v.as_str().map(parse_errcode))
                    .unwrap_or(ErrorKind::Unknown);
                let mut error = MatrixError::new(kind, message);
                error.status_code = Some(status);
                Err(error.into())
            }
        }
        Err(e) => {
            warn!("could not send request to {destination} at {url}: {e}");
            Err(e.into())
        }
    }
}

fn parse_errcode(code: &str) -> ErrorKind {
    match code {
        "M_FORBIDDEN" => ErrorKind::Forbidden,
        "M_UNAUTHORIZED" => ErrorKind::Unauthorized,
        "M_NOT_FOUND" => ErrorKind::NotFound,
        "M_BAD_JSON" => ErrorKind::BadJson,
        "M_UNRECOGNIZED" => ErrorKind::Unrecognized,
        "M_UNSUPPORTED_ROOM_VERSION" => ErrorKind::UnsupportedRoomVersion,
        "M_LIMIT_EXCEEDED" => ErrorKind::LimitExceeded {
            retry_after_ms: None,
        },
        _ => ErrorKind::Unknown,
    }
}

impl Server {
    /// Authenticates an inbound federation request from its `X-Matrix`
    /// authorization header(s).
    ///
    /// Rebuilds the signed object from the method, URI and body, fetches
    /// the origin's key and verifies the signature. Returns the verified
    /// origin, or `M_UNAUTHORIZED`.
    pub async fn verify_request(
        &self,
        authorization_headers: &[String],
        method: &str,
        uri: &str,
        body: Option<&JsonValue>,
    ) -> AppResult<OwnedServerName> {
        if authorization_headers.is_empty() {
            return Err(MatrixError::unauthorized("missing X-Matrix authorization").into());
        }

        let mut last_error: AppError =
            MatrixError::unauthorized("no valid X-Matrix signature").into();

        for header in authorization_headers {
            let parsed = match XMatrix::parse(header) {
                Ok(parsed) => parsed,
                Err(e) => {
                    last_error = e.into();
                    continue;
                }
            };

            if let Some(destination) = &parsed.destination {
                if destination != self.server_name() {
                    last_error = MatrixError::unauthorized(
                        "X-Matrix destination does not name this server",
                    )
                    .into();
                    continue;
                }
            }

            match self.verify_one_signature(&parsed, method, uri, body).await {
                Ok(()) => return Ok(parsed.origin),
                Err(e) => last_error = e,
            }
        }

        Err(last_error)
    }

    async fn verify_one_signature(
        &self,
        header: &XMatrix,
        method: &str,
        uri: &str,
        body: Option<&JsonValue>,
    ) -> AppResult<()> {
        let mut request_map = CanonicalJsonObject::new();
        if let Some(body) = body {
            request_map.insert("content".to_owned(), body.clone().try_into()?);
        }
        request_map.insert(
            "method".to_owned(),
            CanonicalJsonValue::String(method.to_owned()),
        );
        request_map.insert("uri".to_owned(), CanonicalJsonValue::String(uri.to_owned()));
        request_map.insert(
            "origin".to_owned(),
            CanonicalJsonValue::String(header.origin.as_str().to_owned()),
        );
        request_map.insert(
            "destination".to_owned(),
            CanonicalJsonValue::String(self.server_name().as_str().to_owned()),
        );

        let mut origin_signatures = CanonicalJsonObject::new();
        origin_signatures.insert(
            header.key.as_str().to_owned(),
            CanonicalJsonValue::String(header.sig.clone()),
        );
        let mut signatures = CanonicalJsonObject::new();
        signatures.insert(
            header.origin.as_str().to_owned(),
            CanonicalJsonValue::Object(origin_signatures),
        );
        request_map.insert(
            "signatures".to_owned(),
            CanonicalJsonValue::Object(signatures),
        );

        let key = self
            .get_verify_key(&header.origin, &header.key, None, false)
            .await?;

        let mut key_set = crate::core::signatures::PublicKeySet::new();
        key_set.insert(header.key.clone(), key);
        let mut public_key_map = crate::core::signatures::PublicKeyMap::new();
        public_key_map.insert(header.origin.clone(), key_set);

        crate::core::signatures::verify_json(&public_key_map, &request_map).map_err(|e| {
            MatrixError::unauthorized(format!("request signature verification failed: {e}"))
                .into()
        })
    }

    /// The standard access check for read endpoints: the origin must be in
    /// the room and not be denied by the room's server ACL.
    pub async fn access_check(
        &self,
        origin: &ServerName,
        room_id: &RoomId,
        event_id: Option<&EventId>,
    ) -> AppResult<()> {
        if !self.is_server_in_room(origin, room_id).await? {
            return Err(MatrixError::forbidden("server is not in room").into());
        }

        self.acl_check(origin, room_id).await?;

        if let Some(event_id) = event_id {
            let event = self
                .store()
                .get(event_id)
                .await?
                .ok_or_else(|| MatrixError::not_found("event not found"))?;
            if event.room_id != *room_id {
                return Err(MatrixError::forbidden("event is not in this room").into());
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::server::test::{test_server, test_server_named};

    /// Two engines: one signs a request object the way `send_request`
    /// does, the other must authenticate it from the header alone.
    #[tokio::test]
    async fn request_signatures_round_trip() {
        let origin = test_server_named("origin.test");
        let destination = test_server_named("dest.test");

        // Make the origin's keys known to the destination out of band.
        let document = origin.server_keys_document().unwrap();
        let json_doc = crate::core::serde::to_canonical_value(&document)
            .unwrap()
            .as_object()
            .cloned()
            .unwrap();
        destination.remember_keys(json_doc).unwrap();

        let body = json!({ "origin": "origin.test", "pdus": [] });
        let uri = "/_matrix/federation/v1/send/1";

        let mut request_map: crate::core::serde::CanonicalJsonObject =
            serde_json::from_value(json!({
                "method": "PUT",
                "uri": uri,
                "origin": "origin.test",
                "destination": "dest.test",
                "content": body,
            }))
            .unwrap();
        origin.sign_json(&mut request_map).unwrap();

        let signature = request_map["signatures"]
            .as_object()
            .unwrap()["origin.test"]
            .as_object()
            .unwrap()
            .iter()
            .next()
            .map(|(key, sig)| (key.clone(), sig.as_str().unwrap().to_owned()))
            .unwrap();

        let header = format!(
            "X-Matrix origin=\"origin.test\",destination=\"dest.test\",key=\"{}\",sig=\"{}\"",
            signature.0, signature.1
        );

        let verified = destination
            .verify_request(&[header.clone()], "PUT", uri, Some(&body))
            .await
            .unwrap();
        assert_eq!(verified, "origin.test");

        // A different body must not verify.
        let tampered = json!({ "origin": "origin.test", "pdus": [ { "fake": true } ] });
        assert!(destination
            .verify_request(&[header.clone()], "PUT", uri, Some(&tampered))
            .await
            .is_err());

        // Neither does a wrong destination.
        let other = test_server_named("elsewhere.test");
        let doc = origin.server_keys_document().unwrap();
        let json_doc = crate::core::serde::to_canonical_value(&doc)
            .unwrap()
            .as_object()
            .cloned()
            .unwrap();
        other.remember_keys(json_doc).unwrap();
        assert!(other
            .verify_request(&[header], "PUT", uri, Some(&body))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn missing_header_is_unauthorized() {
        let server = test_server();
        let err = server
            .verify_request(&[], "GET", "/_matrix/federation/v1/event/$e", None)
            .await
            .unwrap_err();
        assert_eq!(err.to_matrix().http_status().as_u16(), 401);
    }
}
