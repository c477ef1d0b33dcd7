//! Key pairs for signing.

use std::collections::BTreeMap;
use std::fmt;

use ed25519_dalek::{Signer, SigningKey, VerifyingKey, SECRET_KEY_LENGTH};
use pkcs8::der::{asn1::OctetStringRef, Decode, Encode};
use pkcs8::{AlgorithmIdentifierRef, ObjectIdentifier, PrivateKeyInfo};

use super::{Error, Signature};
use crate::serde::Base64;
use crate::{OwnedServerName, OwnedSigningKeyId};

/// The OID of the Ed25519 algorithm, `1.3.101.112`.
const ED25519_OID: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.101.112");

/// A map of server names to a map of key identifiers to public keys.
pub type PublicKeyMap = BTreeMap<OwnedServerName, PublicKeySet>;

/// A map of key identifiers to public keys.
pub type PublicKeySet = BTreeMap<OwnedSigningKeyId, Base64>;

/// A cryptographic key pair for digitally signing data.
pub trait KeyPair: Sized {
    /// Signs a JSON object.
    fn sign(&self, message: &[u8]) -> Signature;
}

/// An Ed25519 key pair.
pub struct Ed25519KeyPair {
    signing_key: SigningKey,

    /// The specific name of the key pair.
    version: String,
}

impl Ed25519KeyPair {
    /// Create a key pair from its constituent parts.
    pub fn from_seed(seed: &[u8], version: String) -> Result<Self, Error> {
        let seed: &[u8; SECRET_KEY_LENGTH] = seed
            .try_into()
            .map_err(|_| Error::der("seed must be exactly 32 bytes"))?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(seed),
            version,
        })
    }

    /// Initializes a new key pair from a PKCS#8 v1 or v2 DER document.
    pub fn from_der(document: &[u8], version: String) -> Result<Self, Error> {
        let info = PrivateKeyInfo::from_der(document).map_err(Error::der)?;
        if info.algorithm.oid != ED25519_OID {
            return Err(Error::UnsupportedAlgorithm(
                info.algorithm.oid.to_string(),
            ));
        }

        // The private key is an OCTET STRING wrapping the 32-byte seed.
        let seed = match info.private_key.len() {
            SECRET_KEY_LENGTH => info.private_key,
            _ => OctetStringRef::from_der(info.private_key)
                .map_err(Error::der)?
                .as_bytes(),
        };
        let keypair = Self::from_seed(seed, version)?;

        if let Some(public) = info.public_key {
            let derived = keypair.signing_key.verifying_key();
            if public != derived.as_bytes().as_slice() {
                return Err(Error::der(
                    "PKCS#8 public key does not match the derived one",
                ));
            }
        }

        Ok(keypair)
    }

    /// Generates a new key pair, returning its PKCS#8 DER document.
    ///
    /// The caller persists the document and reconstructs the pair with
    /// [`Ed25519KeyPair::from_der`].
    pub fn generate() -> Result<Vec<u8>, Error> {
        let mut csprng = rand::rngs::OsRng;
        let signing_key = SigningKey::generate(&mut csprng);

        let private_key = OctetStringRef::new(signing_key.as_bytes())
            .map_err(Error::der)?
            .to_der()
            .map_err(Error::der)?;
        let info = PrivateKeyInfo::new(
            AlgorithmIdentifierRef {
                oid: ED25519_OID,
                parameters: None,
            },
            &private_key,
        );

        info.to_der().map_err(Error::der)
    }

    /// The public key of this pair.
    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// The version string of this pair, the second half of its key ID.
    pub fn version(&self) -> &str {
        &self.version
    }
}

impl KeyPair for Ed25519KeyPair {
    fn sign(&self, message: &[u8]) -> Signature {
        Signature {
            algorithm: super::Algorithm::Ed25519,
            signature: self.signing_key.sign(message).to_bytes().to_vec(),
            version: self.version.clone(),
        }
    }
}

impl fmt::Debug for Ed25519KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ed25519KeyPair")
            .field("public_key", &Base64::<crate::serde::base64::Standard>::new(self.public_key().to_vec()))
            .field("version", &self.version)
            .finish()
    }
}

/// Verifies an Ed25519 signature over a message with the given public key.
pub(super) fn verify_ed25519(
    public_key: &[u8],
    signature: &[u8],
    message: &[u8],
) -> Result<(), Error> {
    use super::error::VerificationError;

    let public_key: &[u8; 32] = public_key
        .try_into()
        .map_err(|_| VerificationError::Signature("public key must be 32 bytes".into()))?;
    let key = VerifyingKey::from_bytes(public_key)
        .map_err(|e| VerificationError::Signature(e.to_string()))?;
    let signature: &[u8; 64] = signature
        .try_into()
        .map_err(|_| VerificationError::Signature("signature must be 64 bytes".into()))?;

    key.verify_strict(message, &ed25519_dalek::Signature::from_bytes(signature))
        .map_err(|e| VerificationError::Signature(e.to_string()).into())
}

#[cfg(test)]
mod tests {
    use super::Ed25519KeyPair;

    #[test]
    fn generated_der_round_trips() {
        let der = Ed25519KeyPair::generate().unwrap();
        let pair = Ed25519KeyPair::from_der(&der, "1".into()).unwrap();
        let again = Ed25519KeyPair::from_der(&der, "1".into()).unwrap();
        assert_eq!(pair.public_key(), again.public_key());
    }

    #[test]
    fn sign_and_verify() {
        let der = Ed25519KeyPair::generate().unwrap();
        let pair = Ed25519KeyPair::from_der(&der, "1".into()).unwrap();
        let message = b"some message";

        let signature = super::KeyPair::sign(&pair, message);
        super::verify_ed25519(&pair.public_key(), signature.as_bytes(), message).unwrap();
        assert!(
            super::verify_ed25519(&pair.public_key(), signature.as_bytes(), b"other").is_err()
        );
    }
}
