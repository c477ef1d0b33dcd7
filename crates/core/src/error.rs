//! Errors surfaced across the federation boundary.

use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

use http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map as JsonMap, Value as JsonValue};

use crate::RoomVersionId;

/// The Matrix error code carried in the `errcode` field of error responses.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// M_FORBIDDEN
    Forbidden,

    /// M_UNAUTHORIZED
    Unauthorized,

    /// M_BAD_JSON
    BadJson,

    /// M_NOT_JSON
    NotJson,

    /// M_NOT_FOUND
    NotFound,

    /// M_UNRECOGNIZED
    Unrecognized,

    /// M_LIMIT_EXCEEDED
    LimitExceeded {
        /// How long a client should wait before retrying.
        retry_after_ms: Option<Duration>,
    },

    /// M_UNSUPPORTED_ROOM_VERSION
    UnsupportedRoomVersion,

    /// M_INCOMPATIBLE_ROOM_VERSION
    IncompatibleRoomVersion {
        /// The room's version.
        room_version: RoomVersionId,
    },

    /// M_MISSING_PARAM
    MissingParam,

    /// M_INVALID_PARAM
    InvalidParam,

    /// M_TOO_LARGE
    TooLarge,

    /// M_SERVER_NOT_TRUSTED
    ServerNotTrusted,

    /// M_UNABLE_TO_AUTHORISE_JOIN
    UnableToAuthorizeJoin,

    /// M_UNKNOWN
    Unknown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            Self::Forbidden => "M_FORBIDDEN",
            Self::Unauthorized => "M_UNAUTHORIZED",
            Self::BadJson => "M_BAD_JSON",
            Self::NotJson => "M_NOT_JSON",
            Self::NotFound => "M_NOT_FOUND",
            Self::Unrecognized => "M_UNRECOGNIZED",
            Self::LimitExceeded { .. } => "M_LIMIT_EXCEEDED",
            Self::UnsupportedRoomVersion => "M_UNSUPPORTED_ROOM_VERSION",
            Self::IncompatibleRoomVersion { .. } => "M_INCOMPATIBLE_ROOM_VERSION",
            Self::MissingParam => "M_MISSING_PARAM",
            Self::InvalidParam => "M_INVALID_PARAM",
            Self::TooLarge => "M_TOO_LARGE",
            Self::ServerNotTrusted => "M_SERVER_NOT_TRUSTED",
            Self::UnableToAuthorizeJoin => "M_UNABLE_TO_AUTHORISE_JOIN",
            Self::Unknown => "M_UNKNOWN",
        };
        f.write_str(code)
    }
}

/// The JSON body of an error response.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ErrorBody(pub JsonMap<String, JsonValue>);

impl From<String> for ErrorBody {
    fn from(message: String) -> Self {
        Self(JsonMap::from_iter([("error".to_owned(), json!(message))]))
    }
}

impl From<&str> for ErrorBody {
    fn from(message: &str) -> Self {
        message.to_owned().into()
    }
}

macro_rules! simple_kind_fns {
    ($($fname:ident, $kind:ident;)+) => {
        $(
            /// Create a new `MatrixError`.
            pub fn $fname(body: impl Into<ErrorBody>) -> Self {
                Self::new(ErrorKind::$kind, body)
            }
        )+
    }
}

/// A Matrix error.
#[derive(Debug, Clone)]
#[allow(clippy::exhaustive_structs)]
pub struct MatrixError {
    /// The http status code.
    pub status_code: Option<StatusCode>,

    /// The error code.
    pub kind: ErrorKind,

    /// The http response's body.
    pub body: ErrorBody,
}

impl MatrixError {
    pub fn new(kind: ErrorKind, body: impl Into<ErrorBody>) -> Self {
        Self {
            status_code: None,
            kind,
            body: body.into(),
        }
    }

    simple_kind_fns! {
        forbidden, Forbidden;
        unauthorized, Unauthorized;
        bad_json, BadJson;
        not_json, NotJson;
        not_found, NotFound;
        unknown, Unknown;
        unrecognized, Unrecognized;
        unsupported_room_version, UnsupportedRoomVersion;
        missing_param, MissingParam;
        invalid_param, InvalidParam;
        too_large, TooLarge;
        server_not_trusted, ServerNotTrusted;
        unable_to_authorize_join, UnableToAuthorizeJoin;
    }

    pub fn limit_exceeded(retry_after_ms: Option<Duration>, body: impl Into<ErrorBody>) -> Self {
        Self::new(ErrorKind::LimitExceeded { retry_after_ms }, body)
    }

    pub fn incompatible_room_version(
        room_version: RoomVersionId,
        body: impl Into<ErrorBody>,
    ) -> Self {
        Self::new(ErrorKind::IncompatibleRoomVersion { room_version }, body)
    }

    /// The status code this error maps to at the transport boundary.
    pub fn http_status(&self) -> StatusCode {
        self.status_code.unwrap_or_else(|| {
            use ErrorKind::*;
            match &self.kind {
                Forbidden => StatusCode::FORBIDDEN,
                Unauthorized => StatusCode::UNAUTHORIZED,
                NotFound | Unrecognized => StatusCode::NOT_FOUND,
                LimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
                TooLarge => StatusCode::PAYLOAD_TOO_LARGE,
                _ => StatusCode::BAD_REQUEST,
            }
        })
    }

    /// The full JSON body including the `errcode`, as sent on the wire.
    pub fn to_body(&self) -> JsonMap<String, JsonValue> {
        let mut body = self.body.0.clone();
        body.insert("errcode".to_owned(), self.kind.to_string().into());
        if let ErrorKind::LimitExceeded {
            retry_after_ms: Some(duration),
        } = &self.kind
        {
            body.insert(
                "retry_after_ms".to_owned(),
                (duration.as_millis() as u64).into(),
            );
        }
        if let ErrorKind::IncompatibleRoomVersion { room_version } = &self.kind {
            body.insert("room_version".to_owned(), room_version.as_str().into());
        }
        body
    }
}

impl Serialize for MatrixError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_body().serialize(serializer)
    }
}

impl fmt::Display for MatrixError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = self
            .body
            .0
            .get("error")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        write!(f, "[{} / {}] {message}", self.http_status().as_u16(), self.kind)
    }
}

impl StdError for MatrixError {}

#[cfg(test)]
mod tests {
    use super::MatrixError;

    #[test]
    fn body_carries_errcode() {
        let err = MatrixError::unauthorized("signature verification failed");
        let body = err.to_body();
        assert_eq!(body["errcode"], "M_UNAUTHORIZED");
        assert_eq!(body["error"], "signature verification failed");
        assert_eq!(err.http_status().as_u16(), 401);
    }

    #[test]
    fn limit_exceeded_carries_retry_after() {
        let err = MatrixError::limit_exceeded(
            Some(std::time::Duration::from_millis(2000)),
            "too many requests",
        );
        assert_eq!(err.to_body()["retry_after_ms"], 2000);
        assert_eq!(err.http_status().as_u16(), 429);
    }
}
