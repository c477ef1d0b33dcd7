//! Identifiers for servers, users, rooms, events, keys and transactions.
//!
//! Each identifier comes as a borrowed slice type (`ServerName`) and an
//! owned type (`OwnedServerName`). The borrowed types are unsized wrappers
//! around `str`, so they can be produced from any string without
//! allocating once validated.

use std::fmt;

use thiserror::Error;

#[macro_use]
mod macros;

mod event_id;
mod key_id;
mod room_id;
mod server_name;
mod transaction_id;
mod user_id;

pub use self::event_id::{EventId, OwnedEventId};
pub use self::key_id::{OwnedSigningKeyId, SigningKeyId};
pub use self::room_id::{OwnedRoomId, RoomId};
pub use self::server_name::{OwnedServerName, ServerName};
pub use self::transaction_id::{OwnedTransactionId, TransactionId};
pub use self::user_id::{OwnedUserId, UserId};

/// An error occurred while validating an identifier.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum IdParseError {
    /// The identifier or a required part of it is empty.
    #[error("identifier or required part of it is empty")]
    Empty,

    /// The identifier does not start with the required sigil.
    #[error("identifier is missing the leading `{0}` sigil")]
    MissingSigil(char),

    /// The identifier is missing a colon-delimited part.
    #[error("identifier is missing a `:` delimiter")]
    MissingDelimiter,

    /// The server name part failed validation.
    #[error("invalid server name: {0}")]
    InvalidServerName(&'static str),

    /// A part of the identifier contains disallowed characters.
    #[error("identifier contains invalid characters")]
    InvalidCharacters,
}

impl IdParseError {
    pub(super) fn server(reason: &'static str) -> Self {
        Self::InvalidServerName(reason)
    }
}

pub(super) fn validate_delimited(
    s: &str,
    sigil: char,
) -> Result<(&str, &str), IdParseError> {
    let rest = s
        .strip_prefix(sigil)
        .ok_or(IdParseError::MissingSigil(sigil))?;
    let (localpart, server_name) = rest
        .split_once(':')
        .ok_or(IdParseError::MissingDelimiter)?;
    if localpart.is_empty() {
        return Err(IdParseError::Empty);
    }
    Ok((localpart, server_name))
}

/// Helper for `Debug` impls of the borrowed identifier types.
pub(super) fn debug_id(name: &str, value: &str, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{name}({value:?})")
}
