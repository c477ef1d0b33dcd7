//! Functions for signing and verifying JSON and events.

use std::collections::{BTreeMap, BTreeSet};

use sha2::{Digest, Sha256};

use super::error::{JsonError, ParseError, VerificationError};
use super::keys::{verify_ed25519, PublicKeyMap};
use super::{Algorithm, Ed25519KeyPair, Error, KeyPair, Signature, Verified};
use crate::room_version::{
    EventIdFormatVersion, RedactionRules, RoomVersionRules, SignaturesRules,
};
use crate::serde::base64::{Standard, UrlSafe};
use crate::serde::canonical_json::redact;
use crate::serde::{Base64, CanonicalJsonObject, CanonicalJsonValue};
use crate::{EventId, OwnedServerName, OwnedSigningKeyId, ServerName, SigningKeyId, UserId};

/// The fields stripped before signing an object.
const CANONICAL_JSON_FIELDS_TO_REMOVE: &[&str] = &["signatures", "unsigned"];

/// The fields stripped before computing a content hash.
const CONTENT_HASH_FIELDS_TO_REMOVE: &[&str] = &["hashes", "signatures", "unsigned"];

/// The fields stripped, after redaction, before computing a reference hash.
const REFERENCE_HASH_FIELDS_TO_REMOVE: &[&str] = &["age_ts", "signatures", "unsigned"];

/// Serializes the given object to canonical JSON, with `signatures` and
/// `unsigned` removed.
pub fn canonical_json(object: &CanonicalJsonObject) -> Result<String, Error> {
    canonical_json_with_fields_to_remove(object, CANONICAL_JSON_FIELDS_TO_REMOVE)
}

fn canonical_json_with_fields_to_remove(
    object: &CanonicalJsonObject,
    fields: &[&str],
) -> Result<String, Error> {
    let mut owned = object.clone();
    for field in fields {
        owned.remove(*field);
    }
    serde_json::to_string(&CanonicalJsonValue::Object(owned))
        .map_err(|e| Error::Json(JsonError::Serde(e)))
}

/// Signs the given JSON object with the given key pair, inserting the
/// signature under `signatures.{entity_id}.{key_id}`.
///
/// Any existing `signatures` of other entities are preserved; `unsigned` is
/// excluded from the signed bytes but kept on the object.
pub fn sign_json(
    entity_id: &str,
    key_pair: &Ed25519KeyPair,
    object: &mut CanonicalJsonObject,
) -> Result<(), Error> {
    let existing_signatures = match object.remove("signatures") {
        None => CanonicalJsonObject::new(),
        Some(CanonicalJsonValue::Object(signatures)) => signatures,
        Some(_) => return Err(JsonError::not_of_type("signatures", "object")),
    };
    let unsigned = object.remove("unsigned");

    let json = serde_json::to_string(&CanonicalJsonValue::Object(object.clone()))
        .map_err(|e| Error::Json(JsonError::Serde(e)))?;
    let signature = key_pair.sign(json.as_bytes());

    let mut signatures = existing_signatures;
    let entity_set = signatures
        .entry(entity_id.to_owned())
        .or_insert_with(|| CanonicalJsonValue::Object(CanonicalJsonObject::new()));
    let Some(entity_set) = entity_set.as_object_mut() else {
        return Err(JsonError::not_of_type("signatures entity", "object"));
    };
    entity_set.insert(
        signature.id(),
        CanonicalJsonValue::String(signature.base64()),
    );

    object.insert(
        "signatures".to_owned(),
        CanonicalJsonValue::Object(signatures),
    );
    if let Some(unsigned) = unsigned {
        object.insert("unsigned".to_owned(), unsigned);
    }

    Ok(())
}

/// Computes the SHA-256 content hash of an event: the event with `hashes`,
/// `signatures` and `unsigned` stripped, canonicalized and digested.
pub fn content_hash(object: &CanonicalJsonObject) -> Result<Base64<Standard, [u8; 32]>, Error> {
    let json = canonical_json_with_fields_to_remove(object, CONTENT_HASH_FIELDS_TO_REMOVE)?;
    let hash = Sha256::digest(json.as_bytes());
    Ok(Base64::new(hash.into()))
}

/// Computes the SHA-256 reference hash of an event: the event redacted per
/// the room version, stripped of `signatures` and `unsigned`, canonicalized
/// and digested.
///
/// In room versions that derive event IDs, the event ID is `$` followed by
/// this value.
pub fn reference_hash(
    object: &CanonicalJsonObject,
    rules: &RoomVersionRules,
) -> Result<String, Error> {
    let redacted = redact(object.clone(), &rules.redaction, None)
        .map_err(|e| Error::Json(JsonError::Canonical(e)))?;
    let json =
        canonical_json_with_fields_to_remove(&redacted, REFERENCE_HASH_FIELDS_TO_REMOVE)?;
    let hash = Sha256::digest(json.as_bytes());

    Ok(match rules.event_id_format {
        EventIdFormatVersion::V3 => Base64::<UrlSafe, _>::new(hash.as_slice()).encode(),
        _ => Base64::<Standard, _>::new(hash.as_slice()).encode(),
    })
}

/// Hashes and signs an event.
///
/// The content hash is computed first and written into `hashes.sha256`, then
/// the event is redacted and the redacted form is signed, so the signature
/// survives redaction.
pub fn hash_and_sign_event(
    entity_id: &str,
    key_pair: &Ed25519KeyPair,
    object: &mut CanonicalJsonObject,
    rules: &RedactionRules,
) -> Result<(), Error> {
    let hash = content_hash(object)?;

    let mut hashes = CanonicalJsonObject::new();
    hashes.insert(
        "sha256".to_owned(),
        CanonicalJsonValue::String(hash.encode()),
    );
    object.insert("hashes".to_owned(), CanonicalJsonValue::Object(hashes));

    let mut redacted = redact(object.clone(), rules, None)
        .map_err(|e| Error::Json(JsonError::Canonical(e)))?;
    sign_json(entity_id, key_pair, &mut redacted)?;

    // Carry over the signatures to the unredacted event.
    if let Some(signatures) = redacted.remove("signatures") {
        object.insert("signatures".to_owned(), signatures);
    }

    Ok(())
}

/// Verifies that at least one signature of every entity in `public_key_map`
/// is valid on the given JSON object.
pub fn verify_json(
    public_key_map: &PublicKeyMap,
    object: &CanonicalJsonObject,
) -> Result<(), Error> {
    let signature_map = signatures_of(object)?;
    let message = canonical_json(object)?;

    for (entity_id, key_set) in public_key_map {
        let entity_signatures = signature_map
            .get(entity_id.as_str())
            .and_then(|v| v.as_object())
            .ok_or_else(|| VerificationError::signature_not_found(entity_id.as_str()))?;

        verify_entity_signature(entity_id, entity_signatures, key_set, message.as_bytes())?;
    }

    Ok(())
}

/// Verifies the signatures and content hash of an event.
///
/// Returns [`Verified::All`] when everything matched, or
/// [`Verified::Signatures`] when the signatures are valid but the content
/// hash differs, in which case the caller must redact the event before
/// using it.
pub fn verify_event(
    public_key_map: &PublicKeyMap,
    object: &CanonicalJsonObject,
    rules: &RoomVersionRules,
) -> Result<Verified, Error> {
    let signature_map = signatures_of(object)?;

    let redacted = redact(object.clone(), &rules.redaction, None)
        .map_err(|e| Error::Json(JsonError::Canonical(e)))?;
    let message = canonical_json(&redacted)?;

    for entity_id in servers_to_check_signatures(object, &rules.signatures)? {
        let entity_signatures = signature_map
            .get(entity_id.as_str())
            .and_then(|v| v.as_object())
            .ok_or_else(|| VerificationError::signature_not_found(entity_id.as_str()))?;

        let key_set = public_key_map
            .get(&entity_id)
            .ok_or_else(|| VerificationError::public_key_not_found(entity_id.as_str()))?;

        verify_entity_signature(&entity_id, entity_signatures, key_set, message.as_bytes())?;
    }

    let carried_hash = object
        .get("hashes")
        .and_then(|h| h.as_object())
        .and_then(|h| h.get("sha256"))
        .and_then(|h| h.as_str())
        .ok_or_else(|| JsonError::field_missing("hashes.sha256"))?;
    let computed_hash = content_hash(object)?;

    if carried_hash == computed_hash.encode() {
        Ok(Verified::All)
    } else {
        Ok(Verified::Signatures)
    }
}

/// The entities whose signatures a caller must resolve keys for before it
/// can verify the given event.
///
/// The value per server is the set of key IDs appearing in the event's
/// signatures for that server.
pub fn required_keys(
    object: &CanonicalJsonObject,
    rules: &SignaturesRules,
) -> Result<BTreeMap<OwnedServerName, BTreeSet<OwnedSigningKeyId>>, Error> {
    let signature_map = signatures_of(object)?;
    let mut required = BTreeMap::new();

    for entity_id in servers_to_check_signatures(object, rules)? {
        let key_ids = signature_map
            .get(entity_id.as_str())
            .and_then(|v| v.as_object())
            .map(|sigs| {
                sigs.keys()
                    .filter_map(|id| OwnedSigningKeyId::try_from(id.as_str()).ok())
                    .collect::<BTreeSet<_>>()
            })
            .unwrap_or_default();
        required.insert(entity_id, key_ids);
    }

    Ok(required)
}

/// Verifies a signature over raw canonical JSON bytes.
///
/// Used for third-party invite tokens, where the signed object is carried
/// inside the event.
pub fn verify_canonical_json_bytes(
    algorithm: &Algorithm,
    public_key: &[u8],
    signature: &[u8],
    message: &[u8],
) -> Result<(), Error> {
    match algorithm {
        Algorithm::Ed25519 => verify_ed25519(public_key, signature, message),
    }
}

fn signatures_of(object: &CanonicalJsonObject) -> Result<&CanonicalJsonObject, Error> {
    match object.get("signatures") {
        Some(CanonicalJsonValue::Object(signatures)) => Ok(signatures),
        Some(_) => Err(JsonError::not_of_type("signatures", "object")),
        None => Err(JsonError::field_missing("signatures")),
    }
}

fn verify_entity_signature(
    entity_id: &ServerName,
    entity_signatures: &CanonicalJsonObject,
    key_set: &BTreeMap<OwnedSigningKeyId, Base64>,
    message: &[u8],
) -> Result<(), Error> {
    // Find a key id present both in the event's signatures and in the keys
    // we resolved for this entity.
    for (key_id, signature_value) in entity_signatures {
        let Ok(key_id) = <&SigningKeyId>::try_from(key_id.as_str()) else {
            continue;
        };
        let Ok((algorithm, _)) = super::split_id(key_id.as_str()) else {
            continue;
        };
        let Some(public_key) = key_set.get(key_id) else {
            continue;
        };
        let Some(signature_str) = signature_value.as_str() else {
            continue;
        };
        let signature = Base64::<Standard>::parse(signature_str)
            .map_err(|e| VerificationError::Base64(e.to_string()))?;
        let signature = Signature::new(key_id.as_str(), signature.as_bytes())?;

        return match algorithm {
            Algorithm::Ed25519 => {
                verify_ed25519(public_key.as_bytes(), signature.as_bytes(), message)
            }
        };
    }

    debug!(entity = %entity_id, "no usable key for signature");
    Err(Error::Verification(
        VerificationError::UnknownPublicKeysForSignature,
    ))
}

fn servers_to_check_signatures(
    object: &CanonicalJsonObject,
    rules: &SignaturesRules,
) -> Result<BTreeSet<OwnedServerName>, Error> {
    let mut servers = BTreeSet::new();

    let sender = string_field(object, "sender")?
        .ok_or_else(|| JsonError::field_missing("sender"))?;
    let sender = <&UserId>::try_from(sender).map_err(|e| ParseError::id("user ID", e))?;
    servers.insert(sender.server_name().to_owned());

    if rules.check_event_id_server {
        if let Some(event_id) = string_field(object, "event_id")? {
            let event_id =
                <&EventId>::try_from(event_id).map_err(|e| ParseError::id("event ID", e))?;
            let server = event_id
                .as_str()
                .split_once(':')
                .map(|(_, s)| s)
                .ok_or_else(|| JsonError::not_of_type("event_id", "v1-format event ID"))?;
            let server =
                ServerName::parse(server).map_err(|e| ParseError::id("server name", e))?;
            servers.insert(server.to_owned());
        }
    }

    if rules.check_join_authorised_via_users_server
        && string_field(object, "type")? == Some("m.room.member")
    {
        if let Some(CanonicalJsonValue::Object(content)) = object.get("content") {
            if let Some(authorizer) = content
                .get("join_authorised_via_users_server")
                .and_then(|v| v.as_str())
            {
                let authorizer = <&UserId>::try_from(authorizer)
                    .map_err(|e| ParseError::id("user ID", e))?;
                servers.insert(authorizer.server_name().to_owned());
            }
        }
    }

    Ok(servers)
}

fn string_field<'a>(
    object: &'a CanonicalJsonObject,
    field: &str,
) -> Result<Option<&'a str>, Error> {
    match object.get(field) {
        None => Ok(None),
        Some(CanonicalJsonValue::String(s)) => Ok(Some(s)),
        Some(_) => Err(JsonError::not_of_type(field, "string")),
    }
}
