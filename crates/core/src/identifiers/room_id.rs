use super::{IdParseError, ServerName};

opaque_identifier! {
    /// A room ID of the form `!opaque:server.name`.
    ///
    /// Room versions that derive the room ID from the create event's
    /// reference hash omit the server part.
    pub type RoomId, OwnedRoomId, validate_room_id;
}

fn validate_room_id(s: &str) -> Result<(), IdParseError> {
    let rest = s.strip_prefix('!').ok_or(IdParseError::MissingSigil('!'))?;
    if rest.is_empty() {
        return Err(IdParseError::Empty);
    }
    if let Some((opaque, server_name)) = rest.split_once(':') {
        if opaque.is_empty() {
            return Err(IdParseError::Empty);
        }
        ServerName::parse(server_name)?;
    }
    Ok(())
}

impl RoomId {
    /// The server part of the room ID, when the room version carries one.
    pub fn server_name(&self) -> Option<&ServerName> {
        let rest = &self.as_str()[1..];
        let idx = rest.find(':')?;
        Some(ServerName::from_borrowed(&rest[idx + 1..]))
    }
}

#[cfg(test)]
mod tests {
    use super::RoomId;

    #[test]
    fn with_and_without_server_part() {
        let room = RoomId::parse("!abc:matrix.org").unwrap();
        assert_eq!(room.server_name().unwrap().as_str(), "matrix.org");

        let hashed = RoomId::parse("!31hneApxJ_1o-63DmFrpeqnkFfWppnzWso1JvH3ogLU").unwrap();
        assert!(hashed.server_name().is_none());
    }

    #[test]
    fn rejects_missing_sigil() {
        assert!(RoomId::parse("abc:matrix.org").is_err());
        assert!(RoomId::parse("!").is_err());
    }
}
