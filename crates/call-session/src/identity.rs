//! Participant identity resolution.
//!
//! The transport addresses endpoints by an identifier restricted to
//! `[A-Za-z0-9_-]`. [`resolve`] maps an account key onto that alphabet
//! deterministically; [`resolve_unique`] adds a random suffix for the single
//! retry allowed after the deterministic identity turns out to be taken.

use crate::errors::CallError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Length of the random suffix appended by [`resolve_unique`].
pub const UNIQUE_SUFFIX_LEN: usize = 6;

const REPLACEMENT: char = '-';

/// Connection identifier of a participant on the peer transport.
///
/// Always non-empty and restricted to ASCII alphanumerics, `_` and `-`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ParticipantIdentity(String);

impl ParticipantIdentity {
    /// Validates an identity received from a collaborator.
    pub fn parse(raw: impl Into<String>) -> Result<Self, CallError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(CallError::Internal("empty participant identity".to_string()));
        }
        if !raw.chars().all(is_allowed) {
            return Err(CallError::Internal(format!(
                "participant identity contains characters outside [A-Za-z0-9_-]: {raw:?}"
            )));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ParticipantIdentity {
    type Error = CallError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(raw)
    }
}

impl From<ParticipantIdentity> for String {
    fn from(identity: ParticipantIdentity) -> Self {
        identity.0
    }
}

fn is_allowed(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// Derives the deterministic identity for an account key.
///
/// Every UTF-16 code unit outside the transport alphabet becomes `-`, so a
/// character outside the Basic Multilingual Plane (an emoji, say) becomes
/// `--`. An empty key maps to a single `-` so the result is always a valid
/// identity.
pub fn resolve(account_key: &str) -> ParticipantIdentity {
    let mut sanitized = String::with_capacity(account_key.len());
    for c in account_key.chars() {
        if is_allowed(c) {
            sanitized.push(c);
        } else {
            sanitized.extend(std::iter::repeat(REPLACEMENT).take(c.len_utf16()));
        }
    }
    if sanitized.is_empty() {
        ParticipantIdentity(REPLACEMENT.to_string())
    } else {
        ParticipantIdentity(sanitized)
    }
}

/// Derives a collision-avoiding identity: `resolve(account_key)` plus `-` and
/// six random base-36 characters.
pub fn resolve_unique(account_key: &str) -> ParticipantIdentity {
    resolve_unique_with(account_key, &mut rand::thread_rng())
}

/// [`resolve_unique`] with a caller-supplied random source.
pub fn resolve_unique_with<R: Rng + ?Sized>(account_key: &str, rng: &mut R) -> ParticipantIdentity {
    let base = resolve(account_key);
    let suffix: String = (0..UNIQUE_SUFFIX_LEN)
        .filter_map(|_| char::from_digit(rng.gen_range(0..36), 36))
        .collect();
    ParticipantIdentity(format!("{}{REPLACEMENT}{suffix}", base.0))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_resolve_replaces_disallowed_characters() {
        assert_eq!(resolve("alice@example.com").as_str(), "alice-example-com");
        assert_eq!(resolve("bob_smith-01").as_str(), "bob_smith-01");
        assert_eq!(resolve("a b+c").as_str(), "a-b-c");
    }

    #[test]
    fn test_resolve_is_deterministic() {
        assert_eq!(resolve("carol@example.org"), resolve("carol@example.org"));
    }

    #[test]
    fn test_resolve_non_ascii_maps_each_code_unit() {
        assert_eq!(resolve("zoë").as_str(), "zo-");
        assert_eq!(resolve("a\u{1F600}b").as_str(), "a--b");
        assert_eq!(resolve("\u{1D11E}").as_str(), "--");
    }

    #[test]
    fn test_resolve_empty_key_is_still_valid() {
        let identity = resolve("");
        assert_eq!(identity.as_str(), "-");
        assert!(ParticipantIdentity::parse(identity.as_str()).is_ok());
    }

    #[test]
    fn test_resolve_unique_shape() {
        let identity = resolve_unique("alice@example.com");
        let raw = identity.as_str();

        assert!(raw.starts_with("alice-example-com-"));
        let suffix = raw.strip_prefix("alice-example-com-").unwrap();
        assert_eq!(suffix.len(), UNIQUE_SUFFIX_LEN);
        assert!(suffix
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
    }

    #[test]
    fn test_resolve_unique_differs_from_deterministic() {
        let mut rng = StdRng::seed_from_u64(7);
        let unique = resolve_unique_with("alice@example.com", &mut rng);
        assert_ne!(unique, resolve("alice@example.com"));
    }

    #[test]
    fn test_resolve_unique_seeded_is_reproducible() {
        let a = resolve_unique_with("dave", &mut StdRng::seed_from_u64(42));
        let b = resolve_unique_with("dave", &mut StdRng::seed_from_u64(42));
        assert_eq!(a, b);
    }

    #[test]
    fn test_parse_rejects_invalid() {
        assert!(ParticipantIdentity::parse("").is_err());
        assert!(ParticipantIdentity::parse("has space").is_err());
        assert!(ParticipantIdentity::parse("alice@example.com").is_err());
        assert!(ParticipantIdentity::parse("alice-example-com").is_ok());
    }

    #[test]
    fn test_serde_validates_on_deserialize() {
        let ok: ParticipantIdentity = serde_json::from_str("\"bob-1\"").unwrap();
        assert_eq!(ok.as_str(), "bob-1");
        assert_eq!(serde_json::to_string(&ok).unwrap(), "\"bob-1\"");

        let bad: Result<ParticipantIdentity, _> = serde_json::from_str("\"bob@x\"");
        assert!(bad.is_err());
    }
}
