use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque per-operation correlation token.
///
/// Backed by a v4 UUID (122 random bits from the OS generator) and rendered as
/// 32 lowercase hex characters, so it can be embedded verbatim in channel names,
/// URL paths, and query strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(Uuid);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid operation id: {raw}")]
pub struct InvalidOperationId {
    pub raw: String,
}

impl OperationId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(raw: &str) -> Result<Self, InvalidOperationId> {
        let trimmed = raw.trim();
        let well_formed = trimmed.len() == 32
            && trimmed
                .chars()
                .all(|ch| ch.is_ascii_digit() || ('a'..='f').contains(&ch));
        if !well_formed {
            return Err(InvalidOperationId {
                raw: raw.to_string(),
            });
        }
        Uuid::try_parse(trimmed)
            .map(Self)
            .map_err(|_| InvalidOperationId {
                raw: raw.to_string(),
            })
    }

    #[must_use]
    pub fn as_token(&self) -> String {
        self.0.simple().to_string()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl FromStr for OperationId {
    type Err = InvalidOperationId;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::parse(raw)
    }
}

impl Serialize for OperationId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_token())
    }
}

impl<'de> Deserialize<'de> for OperationId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn generated_ids_are_hex_tokens() {
        let id = OperationId::generate();
        let token = id.to_string();
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|ch| ch.is_ascii_hexdigit()));
        assert_eq!(OperationId::parse(&token), Ok(id));
    }

    #[test]
    fn generated_ids_do_not_repeat() {
        let ids: HashSet<OperationId> = (0..2_000).map(|_| OperationId::generate()).collect();
        assert_eq!(ids.len(), 2_000);
    }

    #[test]
    fn parse_rejects_hyphenated_and_uppercase_forms() {
        let id = OperationId::generate();
        let hyphenated = id.0.hyphenated().to_string();
        assert!(OperationId::parse(&hyphenated).is_err());
        let upper = id.to_string().to_uppercase();
        if upper != id.to_string() {
            assert!(OperationId::parse(&upper).is_err());
        }
        assert!(OperationId::parse("").is_err());
    }

    #[test]
    fn serde_uses_token_form() {
        let id = OperationId::generate();
        let encoded = serde_json::to_string(&id).expect("encode id");
        assert_eq!(encoded, format!("\"{id}\""));
        let decoded: OperationId = serde_json::from_str(&encoded).expect("decode id");
        assert_eq!(decoded, id);
    }
}
