//! Topic filter parsing and matching.

use std::fmt;
use std::str::FromStr;

/// A validated MQTT topic filter.
///
/// Grammar per MQTT 3.1.1 §4.7: levels are separated by `/`, `+` matches
/// exactly one level (and must occupy a whole level), `#` matches any number
/// of trailing levels and must be the final level.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Filter {
    /// The unadulterated filter string. Must not be empty.
    string: Box<str>,
}

#[derive(Debug, thiserror::Error)]
#[cfg_attr(test, derive(PartialEq, Eq))]
pub enum FilterParseError {
    #[error("filter must not be empty")]
    EmptyFilter,

    /// A `+` or `#` appeared inside a level instead of occupying it, or the
    /// filter contains a NUL character.
    #[error("level {level:?} contains an invalid character (`{ch}`)")]
    InvalidLevel { level: String, ch: char },

    /// Found a `#` wildcard and it wasn't the end of the filter.
    #[error("filter contains a `#` wildcard that isn't trailing")]
    InvalidWildcard,
}

impl FromStr for Filter {
    type Err = FilterParseError;

    fn from_str(string: &str) -> Result<Self, Self::Err> {
        if string.is_empty() {
            return Err(FilterParseError::EmptyFilter);
        }

        let mut levels = string.split('/');

        while let Some(level) = levels.next() {
            if level == "#" {
                // `#` cannot appear in the middle of a filter. [MQTT-4.7.1-2]
                if levels.next().is_some() {
                    return Err(FilterParseError::InvalidWildcard);
                }

                break;
            }

            // `+` occupies a whole level on its own. [MQTT-4.7.1-3]
            if level == "+" {
                continue;
            }

            if let Some(ch) = level.chars().find(|ch| matches!(ch, '#' | '+' | '\0')) {
                return Err(FilterParseError::InvalidLevel {
                    level: level.to_string(),
                    ch,
                });
            }
        }

        Ok(Filter {
            string: string.into(),
        })
    }
}

impl Filter {
    pub fn as_str(&self) -> &str {
        &self.string
    }

    /// Returns `true` if the first level is a wildcard.
    ///
    /// Such filters never match topics whose first level starts with `$`,
    /// so that a blanket `#` subscription does not receive server-reserved
    /// topics. [MQTT-4.7.2-1]
    fn starts_with_wildcard(&self) -> bool {
        matches!(self.levels().next(), Some("+" | "#"))
    }

    fn levels(&self) -> std::str::Split<'_, char> {
        self.string.split('/')
    }

    /// Returns `true` if this filter matches the given topic name.
    ///
    /// The topic doesn't need to be well-formed; empty topics never match.
    pub fn matches_topic(&self, topic: &str) -> bool {
        if topic.is_empty() {
            return false;
        }

        if topic.starts_with('$') && self.starts_with_wildcard() {
            return false;
        }

        let mut levels = self.levels();

        for name in topic.split('/') {
            match levels.next() {
                // `#` swallows this level and everything after it,
                // including the zero-levels case handled below.
                Some("#") => return true,
                Some("+") => {}
                Some(literal) => {
                    if literal != name {
                        return false;
                    }
                }
                // More levels in the topic than in the filter.
                None => return false,
            }
        }

        // The filter must be fully consumed, except for a trailing `#`
        // which also matches the parent level itself. [MQTT-4.7.1-2]
        match levels.next() {
            None => true,
            Some("#") => levels.next().is_none(),
            Some(_) => false,
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.string)
    }
}
