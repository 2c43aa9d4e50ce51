//! Session identifier type and random sources.

use std::fmt;
use std::str::FromStr;

use rand::RngCore;

use crate::error::SessionError;

/// Longest identifier accepted, leaving room for the namespace inside
/// memcached's 250-byte key limit.
pub const MAX_ID_LEN: usize = 200;

/// Default number of random bytes per identifier (128 bits).
pub const DEFAULT_ID_BYTES: usize = 16;

/// Opaque identifier of a stored session.
///
/// Identifiers are usually produced by an [`IdSource`] and travel to the
/// client inside a cookie, so parsing only checks that the value can be
/// embedded in a store key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume the identifier, returning the inner string.
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SessionId {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let valid = !s.is_empty()
            && s.len() <= MAX_ID_LEN
            && !s.chars().any(|c| c.is_whitespace() || c.is_control());

        if valid {
            Ok(SessionId(s.to_string()))
        } else {
            Err(SessionError::InvalidSessionId(s.into()))
        }
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Source of candidate session identifiers.
///
/// Candidates need not be unique; the session manager probes the store
/// and asks again on collision.
pub trait IdSource: Send + Sync {
    /// Produce a candidate identifier.
    fn generate(&self) -> SessionId;
}

/// Hex identifiers drawn from the thread-local CSPRNG.
#[derive(Debug, Clone, Copy)]
pub struct RandomIds {
    bytes: usize,
}

impl RandomIds {
    /// Identifiers carrying `bytes` random bytes (two hex chars each).
    pub fn new(bytes: usize) -> Self {
        Self {
            bytes: bytes.clamp(1, MAX_ID_LEN / 2),
        }
    }

    /// Number of random bytes per identifier.
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

impl Default for RandomIds {
    fn default() -> Self {
        Self::new(DEFAULT_ID_BYTES)
    }
}

impl IdSource for RandomIds {
    fn generate(&self) -> SessionId {
        let mut buf = vec![0u8; self.bytes];
        rand::rng().fill_bytes(&mut buf);
        SessionId(hex::encode(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_uniqueness() {
        let source = RandomIds::default();
        let mut ids = HashSet::new();
        for _ in 0..10_000 {
            let id = source.generate();
            assert!(ids.insert(id.clone()), "Duplicate ID generated: {}", id);
        }
        assert_eq!(ids.len(), 10_000);
    }

    #[test]
    fn test_default_format() {
        let id = RandomIds::default().generate();
        assert_eq!(id.as_str().len(), 32);
        assert!(id
            .as_str()
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_custom_length() {
        assert_eq!(RandomIds::new(8).generate().as_str().len(), 16);
        assert_eq!(RandomIds::new(0).bytes(), 1);
        assert_eq!(RandomIds::new(10_000).bytes(), MAX_ID_LEN / 2);
    }

    #[test]
    fn test_parse_valid() {
        let id: SessionId = "4f2a9c".parse().unwrap();
        assert_eq!(id.as_str(), "4f2a9c");

        let id2: SessionId = "BAh7B0kiD3Nlc3Npb25faWQ-Ggg".parse().unwrap();
        assert_eq!(id2.to_string(), "BAh7B0kiD3Nlc3Npb25faWQ-Ggg");
    }

    #[test]
    fn test_parse_invalid() {
        // Empty
        assert!("".parse::<SessionId>().is_err());

        // Whitespace would split a memcached command
        assert!("abc def".parse::<SessionId>().is_err());
        assert!("abc\r\n".parse::<SessionId>().is_err());

        // Too long
        let long = "a".repeat(MAX_ID_LEN + 1);
        assert!(long.parse::<SessionId>().is_err());
    }

    #[test]
    fn test_roundtrip() {
        let original = RandomIds::default().generate();
        let parsed: SessionId = original.to_string().parse().unwrap();
        assert_eq!(original, parsed);
    }

    #[test]
    fn test_hash_eq() {
        let id1: SessionId = "abc".parse().unwrap();
        let id2: SessionId = "abc".parse().unwrap();
        let id3: SessionId = "abd".parse().unwrap();

        assert_eq!(id1, id2);
        assert_ne!(id1, id3);

        let mut set = HashSet::new();
        set.insert(id1);
        assert!(set.contains(&id2));
        assert!(!set.contains(&id3));
    }
}
