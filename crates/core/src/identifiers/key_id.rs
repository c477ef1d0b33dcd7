use super::IdParseError;

opaque_identifier! {
    /// A signing key identifier of the form `algorithm:version`, e.g.
    /// `ed25519:0`.
    pub type SigningKeyId, OwnedSigningKeyId, validate_key_id;
}

fn validate_key_id(s: &str) -> Result<(), IdParseError> {
    let (algorithm, version) = s.split_once(':').ok_or(IdParseError::MissingDelimiter)?;
    if algorithm.is_empty() || version.is_empty() {
        return Err(IdParseError::Empty);
    }
    if !version
        .bytes()
        .all(|c| c.is_ascii_alphanumeric() || c == b'_')
    {
        return Err(IdParseError::InvalidCharacters);
    }
    Ok(())
}

impl SigningKeyId {
    /// The algorithm half of the identifier.
    pub fn algorithm_name(&self) -> &str {
        self.as_str()
            .split_once(':')
            .expect("validated on construction")
            .0
    }

    /// The version half of the identifier.
    pub fn version(&self) -> &str {
        self.as_str()
            .split_once(':')
            .expect("validated on construction")
            .1
    }
}

impl OwnedSigningKeyId {
    /// Builds an `ed25519:{version}` key ID.
    pub fn ed25519(version: &str) -> Result<Self, IdParseError> {
        format!("ed25519:{version}").try_into()
    }
}

#[cfg(test)]
mod tests {
    use super::SigningKeyId;

    #[test]
    fn splits_parts() {
        let id = SigningKeyId::parse("ed25519:abc_123").unwrap();
        assert_eq!(id.algorithm_name(), "ed25519");
        assert_eq!(id.version(), "abc_123");
    }

    #[test]
    fn rejects_bad_versions() {
        assert!(SigningKeyId::parse("ed25519").is_err());
        assert!(SigningKeyId::parse("ed25519:").is_err());
        assert!(SigningKeyId::parse("ed25519:abc!def").is_err());
        assert!(SigningKeyId::parse("ed25519:abc:def").is_err());
    }
}
