use super::IdParseError;

opaque_identifier! {
    /// The name of a homeserver: a hostname or IP literal with an optional
    /// port, e.g. `matrix.org` or `[2001:db8::1]:8448`.
    pub type ServerName, OwnedServerName, validate_server_name;
}

fn validate_server_name(s: &str) -> Result<(), IdParseError> {
    if s.is_empty() {
        return Err(IdParseError::Empty);
    }

    let host = if s.starts_with('[') {
        // IPv6 literal, optionally followed by `:port`.
        let end = s
            .find(']')
            .ok_or(IdParseError::server("unclosed IPv6 literal"))?;
        let (literal, rest) = s.split_at(end + 1);
        if literal[1..literal.len() - 1].parse::<std::net::Ipv6Addr>().is_err() {
            return Err(IdParseError::server("invalid IPv6 literal"));
        }
        if !rest.is_empty() {
            let port = rest
                .strip_prefix(':')
                .ok_or(IdParseError::server("expected `:` before port"))?;
            validate_port(port)?;
        }
        return Ok(());
    } else if let Some((host, port)) = s.rsplit_once(':') {
        validate_port(port)?;
        host
    } else {
        s
    };

    if host.is_empty() {
        return Err(IdParseError::Empty);
    }
    if !host
        .bytes()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, b'-' | b'.'))
    {
        return Err(IdParseError::server("invalid characters in hostname"));
    }

    Ok(())
}

fn validate_port(port: &str) -> Result<(), IdParseError> {
    if port.is_empty() || port.parse::<u16>().is_err() {
        return Err(IdParseError::server("invalid port"));
    }
    Ok(())
}

impl ServerName {
    /// The host part, with any port stripped.
    pub fn host(&self) -> &str {
        if let Some(end) = self.as_str().find(']') {
            &self.as_str()[..=end]
        } else if let Some((host, _)) = self.as_str().rsplit_once(':') {
            host
        } else {
            self.as_str()
        }
    }

    /// The explicit port, if one is present.
    pub fn port(&self) -> Option<u16> {
        let s = self.as_str();
        let rest = if let Some(end) = s.find(']') {
            &s[end + 1..]
        } else {
            s
        };
        rest.rsplit_once(':').and_then(|(_, p)| p.parse().ok())
    }

    /// Whether the host part is an IPv4 or IPv6 literal.
    pub fn is_ip_literal(&self) -> bool {
        let host = self.host();
        host.starts_with('[') || host.parse::<std::net::Ipv4Addr>().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::ServerName;

    #[test]
    fn valid_names() {
        assert!(ServerName::parse("matrix.org").is_ok());
        assert!(ServerName::parse("matrix.org:8448").is_ok());
        assert!(ServerName::parse("127.0.0.1").is_ok());
        assert!(ServerName::parse("[::1]").is_ok());
        assert!(ServerName::parse("[2001:db8::1]:7000").is_ok());
    }

    #[test]
    fn invalid_names() {
        assert!(ServerName::parse("").is_err());
        assert!(ServerName::parse("matrix.org:port").is_err());
        assert!(ServerName::parse("white space").is_err());
        assert!(ServerName::parse("[not-v6]").is_err());
    }

    #[test]
    fn host_and_port() {
        let name = ServerName::parse("edge.example:7000").unwrap();
        assert_eq!(name.host(), "edge.example");
        assert_eq!(name.port(), Some(7000));

        let name = ServerName::parse("[2001:db8::1]:7000").unwrap();
        assert_eq!(name.host(), "[2001:db8::1]");
        assert_eq!(name.port(), Some(7000));
        assert!(name.is_ip_literal());

        let bare = ServerName::parse("host.example").unwrap();
        assert_eq!(bare.port(), None);
        assert!(!bare.is_ip_literal());
    }
}
