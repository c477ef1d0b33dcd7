use super::IdParseError;

opaque_identifier! {
    /// An event ID.
    ///
    /// Room v1 and v2 carry `$localpart:server.name`; later versions derive
    /// `$` plus the url-safe unpadded base64 of the event's reference hash.
    pub type EventId, OwnedEventId, validate_event_id;
}

fn validate_event_id(s: &str) -> Result<(), IdParseError> {
    let rest = s.strip_prefix('$').ok_or(IdParseError::MissingSigil('$'))?;
    if rest.is_empty() {
        return Err(IdParseError::Empty);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::EventId;

    #[test]
    fn accepts_both_formats() {
        assert!(EventId::parse("$0:domain").is_ok());
        assert!(EventId::parse("$Rqnc-F-dvnEYJTyHq_iKxU2bZ1CI92-kuZq3a5lr5Zg").is_ok());
    }

    #[test]
    fn rejects_missing_sigil() {
        assert!(EventId::parse("no-sigil").is_err());
        assert!(EventId::parse("$").is_err());
    }
}
