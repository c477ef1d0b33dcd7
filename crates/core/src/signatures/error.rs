//! Error conditions for signing and verification.

use thiserror::Error;

use crate::identifiers::IdParseError;

/// An error when trying to sign or verify JSON or events.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Invalid JSON shape.
    #[error(transparent)]
    Json(#[from] JsonError),

    /// Signature verification failed.
    #[error(transparent)]
    Verification(#[from] VerificationError),

    /// A parse failure in a key id or identifier.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// A key identifier has the wrong number of parts.
    #[error("malformed signature id: expected exactly 2 segments, got {0}")]
    InvalidLength(usize),

    /// A key identifier carries an invalid version string.
    #[error("malformed signature id: expected version to be alphanumeric, got {0}")]
    InvalidVersion(String),

    /// The algorithm in a key identifier is not supported.
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// PKCS#8 decoding failed.
    #[error("invalid PKCS#8 document: {0}")]
    DerParse(String),
}

impl Error {
    pub(crate) fn der<E: std::fmt::Display>(e: E) -> Self {
        Self::DerParse(e.to_string())
    }
}

/// A JSON shape problem found while signing or verifying.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum JsonError {
    /// The `{0}` field is missing from the object.
    #[error("JSON object must contain the field {0:?}")]
    JsonFieldMissingFromObject(String),

    /// The field has the wrong type.
    #[error("field {0:?} must be a JSON {1}")]
    NotOfType(String, &'static str),

    /// A canonical JSON conversion failed.
    #[error(transparent)]
    Canonical(#[from] crate::serde::CanonicalJsonError),

    /// A serde_json failure.
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

impl JsonError {
    pub(crate) fn field_missing(field: impl Into<String>) -> Error {
        Error::Json(Self::JsonFieldMissingFromObject(field.into()))
    }

    pub(crate) fn not_of_type(field: impl Into<String>, ty: &'static str) -> Error {
        Error::Json(Self::NotOfType(field.into(), ty))
    }
}

/// A verification failure.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum VerificationError {
    /// No signature from the given entity could be found.
    #[error("could not find signatures for {0:?}")]
    SignatureNotFound(String),

    /// No public key for the given entity is known.
    #[error("could not find public key for {0:?}")]
    PublicKeyNotFound(String),

    /// No (key id, signature, public key) triple matched up.
    #[error("not signed with any of the given public keys")]
    UnknownPublicKeysForSignature,

    /// The cryptographic check itself failed.
    #[error("signature verification failed: {0}")]
    Signature(String),

    /// Base64 decoding of a key or signature failed.
    #[error("invalid base64: {0}")]
    Base64(String),
}

impl VerificationError {
    pub(crate) fn signature_not_found(entity: impl Into<String>) -> Error {
        Error::Verification(Self::SignatureNotFound(entity.into()))
    }

    pub(crate) fn public_key_not_found(entity: impl Into<String>) -> Error {
        Error::Verification(Self::PublicKeyNotFound(entity.into()))
    }
}

/// A parse failure for identifiers encountered while verifying.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// An identifier failed validation.
    #[error("invalid {of}: {source}")]
    Id {
        /// What was being parsed.
        of: &'static str,
        /// The underlying error.
        #[source]
        source: IdParseError,
    },
}

impl ParseError {
    pub(crate) fn id(of: &'static str, source: IdParseError) -> Error {
        Error::Parse(Self::Id { of, source })
    }
}
