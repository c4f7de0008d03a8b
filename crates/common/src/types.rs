//! Common data types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a meeting as stored by the meeting directory.
///
/// Opaque to the coordinator; it only scopes presence and signaling.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MeetingId(String);

impl MeetingId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MeetingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MeetingId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for MeetingId {
    fn from(id: String) -> Self {
        Self(id)
    }
}
