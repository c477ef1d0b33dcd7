//! The `X-Matrix` HTTP authorization scheme.
//!
//! Every authenticated federation request carries an `Authorization` header
//! of the form:
//!
//! ```text
//! X-Matrix origin="origin.hs",destination="dest.hs",key="ed25519:1",sig="ABC..."
//! ```
//!
//! Parameter values may be quoted or unquoted; pairs are comma-separated
//! and may appear in any order.

use std::collections::HashMap;
use std::fmt;

use crate::{MatrixError, OwnedServerName, OwnedSigningKeyId};

/// The parsed contents of an `X-Matrix` Authorization header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XMatrix {
    /// The server making the request.
    pub origin: OwnedServerName,

    /// The server the request is addressed to.
    ///
    /// Optional for compatibility with servers predating Matrix 1.3.
    pub destination: Option<OwnedServerName>,

    /// The ID of the key that signed the request.
    pub key: OwnedSigningKeyId,

    /// The unpadded base64 signature.
    pub sig: String,
}

impl XMatrix {
    /// Creates a new `XMatrix` header value.
    pub fn new(
        origin: OwnedServerName,
        destination: OwnedServerName,
        key: OwnedSigningKeyId,
        sig: String,
    ) -> Self {
        Self {
            origin,
            destination: Some(destination),
            key,
            sig,
        }
    }

    /// Parses an `Authorization` header value.
    pub fn parse(header: &str) -> Result<Self, MatrixError> {
        let params_str = header
            .strip_prefix("X-Matrix ")
            .ok_or_else(|| MatrixError::unauthorized("unsupported authorization scheme"))?;

        let params = parse_auth_params(params_str)?;

        let get = |name: &str| {
            params.get(name).cloned().ok_or_else(|| {
                MatrixError::unauthorized(format!("missing `{name}` in X-Matrix header"))
            })
        };

        let origin = get("origin")?
            .try_into()
            .map_err(|_| MatrixError::unauthorized("invalid origin in X-Matrix header"))?;
        let destination = match params.get("destination") {
            Some(d) => Some(d.clone().try_into().map_err(|_| {
                MatrixError::unauthorized("invalid destination in X-Matrix header")
            })?),
            None => None,
        };
        let key = get("key")?
            .try_into()
            .map_err(|_| MatrixError::unauthorized("invalid key id in X-Matrix header"))?;
        let sig = get("sig")?;

        Ok(Self {
            origin,
            destination,
            key,
            sig,
        })
    }

    /// Encodes the header value, quoting every parameter.
    pub fn encode(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for XMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "X-Matrix origin=\"{}\"", self.origin)?;
        if let Some(destination) = &self.destination {
            write!(f, ",destination=\"{destination}\"")?;
        }
        write!(f, ",key=\"{}\",sig=\"{}\"", self.key, self.sig)
    }
}

/// Parses comma-separated `name=value` pairs, values quoted or unquoted,
/// backslash escapes honored inside quotes.
fn parse_auth_params(params_str: &str) -> Result<HashMap<String, String>, MatrixError> {
    let mut params = HashMap::new();

    let mut chars = params_str.chars().peekable();
    loop {
        // Parameter name, up to `=`.
        let mut name = String::new();
        while let Some(&c) = chars.peek() {
            match c {
                '=' => break,
                ' ' | '\t' | ',' => {
                    chars.next();
                }
                _ => {
                    name.push(c);
                    chars.next();
                }
            }
        }
        if chars.next().is_none() {
            break;
        }
        if name.is_empty() {
            return Err(MatrixError::unauthorized("empty parameter name"));
        }

        // Parameter value, quoted or bare.
        let mut value = String::new();
        match chars.peek() {
            Some('"') => {
                chars.next();
                let mut terminated = false;
                while let Some(c) = chars.next() {
                    match c {
                        '"' => {
                            terminated = true;
                            break;
                        }
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                value.push(escaped);
                            }
                        }
                        _ => value.push(c),
                    }
                }
                if !terminated {
                    return Err(MatrixError::unauthorized("unterminated quoted string"));
                }
            }
            _ => {
                while let Some(&c) = chars.peek() {
                    if c == ',' {
                        break;
                    }
                    if c != ' ' && c != '\t' {
                        value.push(c);
                    }
                    chars.next();
                }
            }
        }

        params.insert(name.trim().to_ascii_lowercase(), value);
    }

    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::XMatrix;

    #[test]
    fn parse_unquoted() {
        let value = XMatrix::parse(
            "X-Matrix origin=origin.hs.example.com,key=ed25519:key1,sig=ABCDEF",
        )
        .unwrap();
        assert_eq!(value.origin, "origin.hs.example.com");
        assert_eq!(value.destination, None);
        assert_eq!(value.key.as_str(), "ed25519:key1");
        assert_eq!(value.sig, "ABCDEF");
    }

    #[test]
    fn parse_quoted_any_order() {
        let value = XMatrix::parse(
            r#"X-Matrix sig="ABCDEF", key="ed25519:key1", destination="dest.example", origin="origin.hs.example.com:8448""#,
        )
        .unwrap();
        assert_eq!(value.origin, "origin.hs.example.com:8448");
        assert_eq!(value.destination.as_deref().unwrap(), "dest.example");
        assert_eq!(value.key.as_str(), "ed25519:key1");
        assert_eq!(value.sig, "ABCDEF");
    }

    #[test]
    fn parse_rejects_other_schemes() {
        assert!(XMatrix::parse("Bearer abc").is_err());
    }

    #[test]
    fn parse_rejects_missing_params() {
        assert!(XMatrix::parse("X-Matrix origin=a.example,key=ed25519:1").is_err());
    }

    #[test]
    fn round_trip() {
        let value = XMatrix::new(
            "origin.example".try_into().unwrap(),
            "dest.example".try_into().unwrap(),
            "ed25519:1".try_into().unwrap(),
            "sIgNaTuRe".to_owned(),
        );
        assert_eq!(XMatrix::parse(&value.encode()).unwrap(), value);
    }
}
