//! The hex identifier that names every artifact the plugin drops into the
//! staging tree: `out/<ID>`, `in/<ID>`, `request/<ID>`, `trash/<ID>`.

use std::fmt;
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};

fn pattern() -> &'static Regex {
    use std::sync::OnceLock;
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[0-9A-Fa-f]+$").unwrap())
}

/// A validated staging-tree identifier. Construction guarantees the name
/// matches `^[0-9A-Fa-f]+$`; everything else observed in a staging
/// subdirectory is not a payload (invariant 2, SPEC_FULL §3).
#[derive(Clone, Debug, Eq, PartialEq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identifier(String);

#[derive(Debug)]
pub struct InvalidIdentifier(pub String);

impl fmt::Display for InvalidIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "not a valid identifier: {:?}", self.0)
    }
}

impl std::error::Error for InvalidIdentifier {}

impl Identifier {
    /// Returns `Some` if `name` matches the identifier pattern, else `None`.
    /// This is the filter every staging-directory scan applies before
    /// treating a directory entry as payload.
    pub fn parse(name: &str) -> Option<Self> {
        if pattern().is_match(name) {
            Some(Self(name.to_string()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Identifier {
    type Err = InvalidIdentifier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| InvalidIdentifier(s.to_string()))
    }
}

impl TryFrom<String> for Identifier {
    type Error = InvalidIdentifier;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or(InvalidIdentifier(value))
    }
}

impl From<Identifier> for String {
    fn from(value: Identifier) -> Self {
        value.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Identifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_hex() {
        assert!(Identifier::parse("deadBEEF0123").is_some());
        assert!(Identifier::parse("0").is_some());
    }

    #[test]
    fn rejects_non_hex() {
        assert!(Identifier::parse("").is_none());
        assert!(Identifier::parse("not-hex").is_none());
        assert!(Identifier::parse("deadbeef.err").is_none());
        assert!(Identifier::parse("deadbeef ").is_none());
    }

    #[test]
    fn roundtrips_through_serde() {
        let id = Identifier::parse("AbC123").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"AbC123\"");
        let back: Identifier = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
