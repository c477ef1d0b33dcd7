use super::{validate_delimited, IdParseError, ServerName};

opaque_identifier! {
    /// A Matrix user ID of the form `@localpart:server.name`.
    pub type UserId, OwnedUserId, validate_user_id;
}

fn validate_user_id(s: &str) -> Result<(), IdParseError> {
    let (_localpart, server_name) = validate_delimited(s, '@')?;
    ServerName::parse(server_name)?;
    Ok(())
}

impl UserId {
    /// The part between `@` and the first `:`.
    pub fn localpart(&self) -> &str {
        let rest = &self.as_str()[1..];
        &rest[..rest.find(':').expect("validated on construction")]
    }

    /// The server the user belongs to.
    pub fn server_name(&self) -> &ServerName {
        let rest = &self.as_str()[1..];
        let idx = rest.find(':').expect("validated on construction");
        ServerName::from_borrowed(&rest[idx + 1..])
    }
}

#[cfg(test)]
mod tests {
    use super::UserId;

    #[test]
    fn parts() {
        let user = UserId::parse("@carol:example.com").unwrap();
        assert_eq!(user.localpart(), "carol");
        assert_eq!(user.server_name().as_str(), "example.com");
    }

    #[test]
    fn rejects_malformed() {
        assert!(UserId::parse("carol:example.com").is_err());
        assert!(UserId::parse("@carol").is_err());
        assert!(UserId::parse("@:example.com").is_err());
    }
}
