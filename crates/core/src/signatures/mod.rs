//! Digital signatures according to the Matrix specification.
//!
//! Each homeserver has one or more signing key pairs which it uses to sign
//! all events and federation requests. Other servers ask the homeserver for
//! its public keys and use those to verify the signed data.
//!
//! Each key pair has an identifier consisting of the name of the signature
//! algorithm and a "version" string separated by a colon, e.g. `ed25519:1`.
//!
//! Arbitrary JSON objects can be signed as well as events. In both cases the
//! signatures are stored within the JSON object itself under a `signatures`
//! key, and events additionally carry hashes of their content under a
//! `hashes` key. Signatures and hashes appear as unpadded base64 strings.
//!
//! To sign an arbitrary JSON object use [`sign_json`]; to hash and sign an
//! event use [`hash_and_sign_event`] (events need the extra step because
//! signatures must stay valid across redaction). The verification
//! counterparts are [`verify_json`] and [`verify_event`].

use std::fmt;

pub use self::error::{Error, JsonError, ParseError, VerificationError};
pub use self::functions::{
    canonical_json, content_hash, hash_and_sign_event, reference_hash, required_keys,
    sign_json, verify_canonical_json_bytes, verify_event, verify_json,
};
pub use self::keys::{Ed25519KeyPair, KeyPair, PublicKeyMap, PublicKeySet};
pub use self::verification::Verified;
use crate::serde::{base64::Standard, Base64};

mod error;
mod functions;
mod keys;
mod verification;

/// The algorithm used for signing data.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum Algorithm {
    /// The Ed25519 digital signature algorithm.
    Ed25519,
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ed25519 => f.write_str("ed25519"),
        }
    }
}

/// Extract the algorithm and version from a key identifier.
fn split_id(id: &str) -> Result<(Algorithm, String), Error> {
    /// The length of a valid signature ID.
    const SIGNATURE_ID_LENGTH: usize = 2;

    let signature_id: Vec<&str> = id.split(':').collect();

    let signature_id_length = signature_id.len();

    if signature_id_length != SIGNATURE_ID_LENGTH {
        return Err(Error::InvalidLength(signature_id_length));
    }

    let version = signature_id[1];

    const EXTRA_ALLOWED: [u8; 1] = [b'_'];
    if !version
        .bytes()
        .all(|ch| ch.is_ascii_alphanumeric() || EXTRA_ALLOWED.contains(&ch))
    {
        return Err(Error::InvalidVersion(version.into()));
    }

    let algorithm_input = signature_id[0];

    let algorithm = match algorithm_input {
        "ed25519" => Algorithm::Ed25519,
        algorithm => return Err(Error::UnsupportedAlgorithm(algorithm.into())),
    };

    Ok((algorithm, signature_id[1].to_owned()))
}

/// A digital signature.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Signature {
    /// The cryptographic algorithm that generated this signature.
    pub(crate) algorithm: Algorithm,

    /// The signature data.
    pub(crate) signature: Vec<u8>,

    /// The "version" of the key identifier for the public key used to
    /// generate this signature.
    pub(crate) version: String,
}

impl Signature {
    /// Creates a signature from raw bytes.
    ///
    /// This constructor determines the algorithm and version from a key
    /// identifier in the form *algorithm:version*, e.g. "ed25519:1", and
    /// ensures the version does not contain characters violating the
    /// specification's guidelines.
    pub fn new(id: &str, bytes: &[u8]) -> Result<Self, Error> {
        let (algorithm, version) = split_id(id)?;

        Ok(Self {
            algorithm,
            signature: bytes.to_vec(),
            version,
        })
    }

    /// The algorithm used to generate the signature.
    pub fn algorithm(&self) -> &Algorithm {
        &self.algorithm
    }

    /// The raw bytes of the signature.
    pub fn as_bytes(&self) -> &[u8] {
        self.signature.as_slice()
    }

    /// A base64 encoding of the signature.
    ///
    /// Uses the standard character set with no padding.
    pub fn base64(&self) -> String {
        Base64::<Standard, _>::new(self.signature.as_slice()).encode()
    }

    /// The key identifier, a string containing the signature algorithm and
    /// the key "version" separated by a colon, e.g. "ed25519:1".
    pub fn id(&self) -> String {
        format!("{}:{}", self.algorithm, self.version)
    }

    /// The "version" of the key used for this signature.
    pub fn version(&self) -> &str {
        &self.version
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::{from_str as from_json_str, to_string as to_json_string};

    use super::{
        canonical_json, content_hash, hash_and_sign_event, reference_hash, sign_json,
        verify_event, verify_json, Ed25519KeyPair, Signature, Verified,
    };
    use crate::room_version::RoomVersionRules;
    use crate::serde::{Base64, CanonicalJsonObject};

    /// The seed of the Matrix specification's signing key test vector,
    /// `ed25519 1 YJDBA9Xn...`.
    const SPEC_SEED: &str = "YJDBA9Xnr2sVqXD9Vj7XVUnmFZcZrlw8Md7kMW+3XA1";

    fn test_vector_keypair() -> Ed25519KeyPair {
        let seed = Base64::<crate::serde::base64::Standard>::parse(SPEC_SEED).unwrap();
        Ed25519KeyPair::from_seed(seed.as_bytes(), "1".into()).unwrap()
    }

    fn public_key_map_for(keypair: &Ed25519KeyPair, entity: &str) -> super::PublicKeyMap {
        let mut signature_set = BTreeMap::new();
        signature_set.insert(
            format!("ed25519:{}", keypair.version()).try_into().unwrap(),
            Base64::new(keypair.public_key().to_vec()),
        );

        let mut public_key_map = BTreeMap::new();
        public_key_map.insert(entity.try_into().unwrap(), signature_set);
        public_key_map
    }

    #[test]
    fn valid_key_id() {
        Signature::new("ed25519:abcdef", &[]).unwrap();
    }

    #[test]
    fn invalid_key_id_length() {
        Signature::new("ed25519:abcdef:123456", &[]).unwrap_err();
    }

    #[test]
    fn invalid_key_id_version() {
        Signature::new("ed25519:abc!def", &[]).unwrap_err();
    }

    #[test]
    fn invalid_key_id_algorithm() {
        Signature::new("foobar:abcdef", &[]).unwrap_err();
    }

    /// Convenience for converting a string of JSON into its canonical form.
    fn test_canonical_json(input: &str) -> String {
        let object: CanonicalJsonObject = from_json_str(input).unwrap();
        canonical_json(&object).unwrap()
    }

    #[test]
    fn canonical_json_examples() {
        assert_eq!(&test_canonical_json("{}"), "{}");

        assert_eq!(
            &test_canonical_json(r#"{"one": 1, "two": "Two"}"#),
            r#"{"one":1,"two":"Two"}"#
        );

        assert_eq!(
            &test_canonical_json(r#"{"b": "2", "a": "1"}"#),
            r#"{"a":"1","b":"2"}"#
        );

        assert_eq!(&test_canonical_json(r#"{"a": "日本語"}"#), r#"{"a":"日本語"}"#);

        assert_eq!(&test_canonical_json(r#"{"a": "日"}"#), r#"{"a":"日"}"#);

        assert_eq!(&test_canonical_json(r#"{"a": null}"#), r#"{"a":null}"#);
    }

    #[test]
    fn sign_empty_json() {
        let keypair = test_vector_keypair();

        let mut value = from_json_str("{}").unwrap();
        sign_json("domain", &keypair, &mut value).unwrap();

        assert_eq!(
            to_json_string(&crate::serde::CanonicalJsonValue::Object(value)).unwrap(),
            r#"{"signatures":{"domain":{"ed25519:1":"K8280/U9SSy9IVtjBuVeLr+HpOB4BQFWbg+UZaADMtTdGYI7Geitb76LTrr5QV/7Xg4ahLwYGYZzuHGZKM5ZAQ"}}}"#
        );
    }

    #[test]
    fn sign_minimal_json() {
        let keypair = test_vector_keypair();

        let mut alpha_object = from_json_str(r#"{ "one": 1, "two": "Two" }"#).unwrap();
        sign_json("domain", &keypair, &mut alpha_object).unwrap();

        assert_eq!(
            to_json_string(&crate::serde::CanonicalJsonValue::Object(alpha_object)).unwrap(),
            r#"{"one":1,"signatures":{"domain":{"ed25519:1":"KqmLSbO39/Bzb0QIYE82zqLwsA+PDzYIpIRA2sRQ4sL53+sN6/fpNSoqE7BP7vBZhG6kYdD13EIMJpvhJI+6Bw"}},"two":"Two"}"#
        );

        let mut reverse_alpha_object =
            from_json_str(r#"{ "two": "Two", "one": 1 }"#).expect("reverse alpha should parse");
        sign_json("domain", &keypair, &mut reverse_alpha_object).unwrap();

        assert_eq!(
            to_json_string(&crate::serde::CanonicalJsonValue::Object(reverse_alpha_object))
                .unwrap(),
            r#"{"one":1,"signatures":{"domain":{"ed25519:1":"KqmLSbO39/Bzb0QIYE82zqLwsA+PDzYIpIRA2sRQ4sL53+sN6/fpNSoqE7BP7vBZhG6kYdD13EIMJpvhJI+6Bw"}},"two":"Two"}"#
        );
    }

    #[test]
    fn verify_minimal_json() {
        let keypair = test_vector_keypair();
        let public_key_map = public_key_map_for(&keypair, "domain");

        let value = from_json_str(
            r#"{"one":1,"signatures":{"domain":{"ed25519:1":"KqmLSbO39/Bzb0QIYE82zqLwsA+PDzYIpIRA2sRQ4sL53+sN6/fpNSoqE7BP7vBZhG6kYdD13EIMJpvhJI+6Bw"}},"two":"Two"}"#,
        )
        .unwrap();
        verify_json(&public_key_map, &value).unwrap();

        let reverse_value = from_json_str(
            r#"{"two":"Two","signatures":{"domain":{"ed25519:1":"KqmLSbO39/Bzb0QIYE82zqLwsA+PDzYIpIRA2sRQ4sL53+sN6/fpNSoqE7BP7vBZhG6kYdD13EIMJpvhJI+6Bw"}},"one":1}"#,
        )
        .unwrap();
        verify_json(&public_key_map, &reverse_value).unwrap();
    }

    #[test]
    fn fail_verify_json() {
        let keypair = test_vector_keypair();
        let public_key_map = public_key_map_for(&keypair, "domain");

        // Signature of the empty object on a non-empty one.
        let value = from_json_str(
            r#"{"not":"empty","signatures":{"domain":{"ed25519:1":"K8280/U9SSy9IVtjBuVeLr+HpOB4BQFWbg+UZaADMtTdGYI7Geitb76LTrr5QV/7Xg4ahLwYGYZzuHGZKM5ZAQ"}}}"#,
        )
        .unwrap();
        verify_json(&public_key_map, &value).unwrap_err();
    }

    #[test]
    fn minimal_event_content_hash() {
        let object: CanonicalJsonObject = from_json_str(
            r#"{
                "event_id": "$0:domain",
                "origin_server_ts": 1000000,
                "type": "X",
                "signatures": {}
            }"#,
        )
        .unwrap();

        assert_eq!(
            content_hash(&object).unwrap().encode(),
            "A6Nco6sqoy18PPfPDVdYvoowfc0PVBk9g9OiyT3ncRM"
        );
    }

    #[test]
    fn hash_sign_verify_round_trip() {
        let keypair = test_vector_keypair();

        let json = r#"{
            "room_id": "!x:domain",
            "sender": "@a:domain",
            "origin_server_ts": 1000000,
            "signatures": {},
            "hashes": {},
            "type": "X",
            "content": {},
            "prev_events": [],
            "auth_events": [],
            "depth": 3,
            "unsigned": {
                "age_ts": 1000000
            }
        }"#;

        let mut object: CanonicalJsonObject = from_json_str(json).unwrap();
        hash_and_sign_event("domain", &keypair, &mut object, &RoomVersionRules::V5.redaction)
            .unwrap();

        let public_key_map = public_key_map_for(&keypair, "domain");
        assert_eq!(
            verify_event(&public_key_map, &object, &RoomVersionRules::V5).unwrap(),
            Verified::All
        );

        // Tampering with the content must demote the verification result.
        let mut tampered = object.clone();
        tampered.insert(
            "content".to_owned(),
            crate::serde::CanonicalJsonValue::Object(
                [(
                    "body".to_owned(),
                    crate::serde::CanonicalJsonValue::String("inserted".into()),
                )]
                .into(),
            ),
        );
        assert_eq!(
            verify_event(&public_key_map, &tampered, &RoomVersionRules::V5).unwrap(),
            Verified::Signatures
        );
    }

    #[test]
    fn reference_hash_is_stable_across_signatures() {
        let keypair = test_vector_keypair();

        let json = r#"{
            "room_id": "!x:domain",
            "sender": "@a:domain",
            "origin_server_ts": 1000000,
            "type": "X",
            "content": {},
            "prev_events": [],
            "auth_events": [],
            "depth": 3
        }"#;

        let mut object: CanonicalJsonObject = from_json_str(json).unwrap();
        let before = reference_hash(&object, &RoomVersionRules::V6).unwrap();
        hash_and_sign_event("domain", &keypair, &mut object, &RoomVersionRules::V6.redaction)
            .unwrap();
        let after = reference_hash(&object, &RoomVersionRules::V6).unwrap();

        // `hashes` enters the reference hash, signing alone must not.
        let mut signed_again = object.clone();
        sign_json("other", &keypair, &mut signed_again).unwrap();
        assert_eq!(
            reference_hash(&signed_again, &RoomVersionRules::V6).unwrap(),
            after
        );
        assert_ne!(before, after);
    }
}
