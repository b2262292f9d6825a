//! Validated MQTT client identifiers.

use std::borrow::Borrow;
use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

/// The maximum length a [`ClientId`] is allowed to be, in bytes.
///
/// The specification only *requires* servers to accept IDs up to 23 bytes of
/// `[0-9a-zA-Z]` [MQTT-3.1.3-5], but explicitly permits accepting more;
/// plenty of client libraries generate IDs outside the minimum charset
/// (MQTT.js pads with underscores, for one), so we take the permissive route
/// and only bound the length.
pub const MAX_LEN: usize = 256;

/// A non-empty MQTT client identifier, unique across the broker's registry.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ClientId(Box<str>);

#[derive(Debug, thiserror::Error)]
#[cfg_attr(test, derive(PartialEq, Eq))]
pub enum ParseError {
    #[error("client ID must not be empty")]
    Empty,
    #[error("client ID is {0} bytes long, maximum is {MAX_LEN}")]
    TooLong(usize),
    #[error("client ID contains a control character at byte {0}")]
    ControlCharacter(usize),
}

impl FromStr for ClientId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseError::Empty);
        }

        if s.len() > MAX_LEN {
            return Err(ParseError::TooLong(s.len()));
        }

        if let Some(position) = s.find(|ch: char| ch.is_control()) {
            return Err(ParseError::ControlCharacter(position));
        }

        Ok(ClientId(s.into()))
    }
}

impl ClientId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Deref for ClientId {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for ClientId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::{ClientId, ParseError, MAX_LEN};

    #[test]
    fn accepts_typical_ids() {
        for id in ["A", "sensor-17", "mqttjs_2f9e81ab", "телеметрия"] {
            let parsed: ClientId = id.parse().unwrap();
            assert_eq!(parsed.as_str(), id);
        }
    }

    #[test]
    fn rejects_invalid_ids() {
        assert_eq!("".parse::<ClientId>().unwrap_err(), ParseError::Empty);
        assert_eq!(
            "a\nb".parse::<ClientId>().unwrap_err(),
            ParseError::ControlCharacter(1)
        );

        let long = "x".repeat(MAX_LEN + 1);
        assert_eq!(
            long.parse::<ClientId>().unwrap_err(),
            ParseError::TooLong(MAX_LEN + 1)
        );
    }
}
