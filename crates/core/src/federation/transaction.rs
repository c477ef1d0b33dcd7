//! Endpoints for exchanging transaction messages between homeservers.
//!
//! `PUT /_matrix/federation/v1/send/{txn_id}` carries up to 50 PDUs and
//! 100 EDUs from an origin server to a destination; the pair
//! `(origin, txn_id)` identifies a transaction and makes retries
//! idempotent.

use std::collections::BTreeMap;

use reqwest::Url;
use serde::{de, Deserialize, Serialize};

use crate::events::receipt::ReceiptContent;
use crate::events::typing::TypingContent;
use crate::presence::PresenceContent;
use crate::sending::{SendRequest, SendResult};
use crate::serde::{from_raw_json_value, JsonValue, RawJsonValue};
use crate::to_device::DirectDeviceContent;
use crate::{OwnedEventId, OwnedServerName, TransactionId, UnixMillis};

/// The maximum number of PDUs in one transaction.
pub const PDU_LIMIT: usize = 50;

/// The maximum number of EDUs in one transaction.
pub const EDU_LIMIT: usize = 100;

/// `PUT /_matrix/federation/v1/send/{txn_id}`
pub fn send_message_request(
    origin: &str,
    txn_id: &TransactionId,
    body: SendMessageReqBody,
) -> SendResult<SendRequest> {
    let url = Url::parse(&format!("{origin}/_matrix/federation/v1/send/{txn_id}"))?;
    crate::sending::put(url).json_body(&body)
}

/// Request type for the `send_transaction_message` endpoint.
#[derive(Deserialize, Serialize, Debug)]
pub struct SendMessageReqBody {
    /// The server_name of the homeserver sending this transaction.
    pub origin: OwnedServerName,

    /// POSIX timestamp in milliseconds on the originating homeserver when
    /// this transaction started.
    pub origin_server_ts: UnixMillis,

    /// List of persistent updates to rooms.
    ///
    /// Must not be more than 50 items.
    #[serde(default, skip_serializing_if = "<[_]>::is_empty")]
    pub pdus: Vec<Box<RawJsonValue>>,

    /// List of ephemeral messages.
    ///
    /// Must not be more than 100 items.
    #[serde(default, skip_serializing_if = "<[_]>::is_empty")]
    pub edus: Vec<Edu>,
}

/// Response type for the `send_transaction_message` endpoint.
#[derive(Serialize, Deserialize, Debug, Default)]
pub struct SendMessageResBody {
    /// Map of event IDs and response for each PDU given in the request.
    #[serde(default, with = "pdu_process_response")]
    pub pdus: BTreeMap<OwnedEventId, Result<(), String>>,
}

impl SendMessageResBody {
    /// Creates a new `Response` with the given PDU results.
    pub fn new(pdus: BTreeMap<OwnedEventId, Result<(), String>>) -> Self {
        Self { pdus }
    }
}

/// Type for passing ephemeral data to homeservers.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "edu_type", content = "content")]
#[non_exhaustive]
pub enum Edu {
    /// An EDU representing presence updates for users of the sending
    /// homeserver.
    #[serde(rename = "m.presence")]
    Presence(PresenceContent),

    /// An EDU representing receipt updates for users of the sending
    /// homeserver.
    #[serde(rename = "m.receipt")]
    Receipt(ReceiptContent),

    /// A typing notification EDU for a user in a room.
    #[serde(rename = "m.typing")]
    Typing(TypingContent),

    /// An EDU that lets servers push send events directly to a specific
    /// device on a remote server, e.g. for Olm-encrypted message channels.
    /// The payloads pass through opaquely.
    #[serde(rename = "m.direct_to_device")]
    DirectToDevice(DirectDeviceContent),

    /// An EDU of a type this server has no handler for.
    #[doc(hidden)]
    _Custom(JsonValue),
}

#[derive(Debug, Deserialize)]
struct EduDeHelper {
    /// The message type field.
    edu_type: String,
    content: Box<RawJsonValue>,
}

impl<'de> Deserialize<'de> for Edu {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: de::Deserializer<'de>,
    {
        let json = Box::<RawJsonValue>::deserialize(deserializer)?;
        let EduDeHelper { edu_type, content } = from_raw_json_value(&json)?;

        Ok(match edu_type.as_ref() {
            "m.presence" => Self::Presence(from_raw_json_value(&content)?),
            "m.receipt" => Self::Receipt(from_raw_json_value(&content)?),
            "m.typing" => Self::Typing(from_raw_json_value(&content)?),
            "m.direct_to_device" => Self::DirectToDevice(from_raw_json_value(&content)?),
            _ => Self::_Custom(from_raw_json_value(&content)?),
        })
    }
}

/// Serde support for the per-PDU response map, whose wire form wraps each
/// result in an object with an optional `error` key.
mod pdu_process_response {
    use std::collections::BTreeMap;

    use serde::{
        de::{Deserializer, Error},
        ser::Serializer,
        Deserialize, Serialize,
    };

    use crate::OwnedEventId;

    #[derive(Deserialize, Serialize)]
    struct WrappedError {
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    }

    pub fn serialize<S>(
        response: &BTreeMap<OwnedEventId, Result<(), String>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let wrapped: BTreeMap<&OwnedEventId, WrappedError> = response
            .iter()
            .map(|(id, result)| {
                (
                    id,
                    WrappedError {
                        error: result.clone().err(),
                    },
                )
            })
            .collect();
        wrapped.serialize(serializer)
    }

    pub fn deserialize<'de, D>(
        deserializer: D,
    ) -> Result<BTreeMap<OwnedEventId, Result<(), String>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let wrapped = BTreeMap::<String, WrappedError>::deserialize(deserializer)?;
        wrapped
            .into_iter()
            .map(|(id, error)| {
                let id = OwnedEventId::try_from(id.as_str()).map_err(D::Error::custom)?;
                Ok((
                    id,
                    match error.error {
                        None => Ok(()),
                        Some(error) => Err(error),
                    },
                ))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{Edu, SendMessageResBody};

    #[test]
    fn typing_edu_round_trip() {
        let json = json!({
            "content": {
                "room_id": "!somewhere:matrix.org",
                "typing": true,
                "user_id": "@john:matrix.org"
            },
            "edu_type": "m.typing"
        });

        let edu = serde_json::from_value::<Edu>(json.clone()).unwrap();
        match &edu {
            Edu::Typing(content) => {
                assert_eq!(content.room_id, "!somewhere:matrix.org");
                assert_eq!(content.user_id, "@john:matrix.org");
                assert!(content.typing);
            }
            other => panic!("deserialized wrong variant: {other:?}"),
        }

        assert_eq!(serde_json::to_value(&edu).unwrap(), json);
    }

    #[test]
    fn receipt_edu() {
        let json = json!({
            "content": {
                "!some_room:example.org": {
                    "m.read": {
                        "@john:matrix.org": {
                            "data": { "ts": 1_533_358 },
                            "event_ids": [ "$read_this_event:matrix.org" ]
                        }
                    }
                }
            },
            "edu_type": "m.receipt"
        });

        let edu = serde_json::from_value::<Edu>(json.clone()).unwrap();
        match &edu {
            Edu::Receipt(content) => {
                let room: crate::OwnedRoomId = "!some_room:example.org".try_into().unwrap();
                assert!(content.0.contains_key(&room));
            }
            other => panic!("deserialized wrong variant: {other:?}"),
        }

        assert_eq!(serde_json::to_value(&edu).unwrap(), json);
    }

    #[test]
    fn unknown_edu_is_preserved_as_custom() {
        let json = json!({
            "content": { "anything": 1 },
            "edu_type": "org.example.custom"
        });
        let edu = serde_json::from_value::<Edu>(json).unwrap();
        assert!(matches!(edu, Edu::_Custom(_)));
    }

    #[test]
    fn response_map_wire_format() {
        let good: crate::OwnedEventId = "$good:a".try_into().unwrap();
        let bad: crate::OwnedEventId = "$bad:a".try_into().unwrap();

        let mut body = SendMessageResBody::default();
        body.pdus.insert(good.clone(), Ok(()));
        body.pdus.insert(bad.clone(), Err("rejected".to_owned()));

        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(
            value,
            json!({
                "pdus": {
                    "$good:a": {},
                    "$bad:a": { "error": "rejected" }
                }
            })
        );

        let parsed: SendMessageResBody = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.pdus.len(), 2);
        assert!(parsed.pdus[&good].is_ok());
        assert!(parsed.pdus[&bad].is_err());
    }
}
