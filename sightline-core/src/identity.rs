//! Participant identity
//!
//! Every call has exactly two participants. Each one is addressed on the
//! signaling relay by a stable participant id issued by the account backend.

use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display};

/// Stable identifier of one call participant
///
/// Signaling envelopes carry these in their `from` / `to` fields, and the
/// relay reports room membership changes with them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(pub String);

impl ParticipantId {
    /// Create a new participant id
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Parse a participant id, rejecting blank input
    ///
    /// # Errors
    ///
    /// Returns error if the id is empty or only whitespace
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            anyhow::bail!("participant id cannot be empty");
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ParticipantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ParticipantId {
    fn from(s: String) -> Self {
        Self(s)
    }
}
