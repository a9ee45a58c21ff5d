//! Session configuration
//!
//! All timing knobs of the call core live here. Values are plain
//! milliseconds so a config file stays readable; accessors hand out
//! [`Duration`]s.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Value out of range
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    /// Config document could not be parsed
    #[error("Failed to parse configuration: {0}")]
    Parse(String),
}

/// ICE server entry handed to the peer transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// Server URLs (`stun:` / `turn:`)
    pub urls: Vec<String>,
    /// TURN username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// TURN credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// STUN server without credentials
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Signal channel timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// How long `open` waits for the relay to confirm the subscription
    pub subscribe_timeout_ms: u64,
    /// How long `send` waits for a pending subscription before giving up
    pub send_wait_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            subscribe_timeout_ms: 10_000,
            send_wait_ms: 5_000,
        }
    }
}

impl ChannelConfig {
    /// Subscription confirmation bound
    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_millis(self.subscribe_timeout_ms)
    }

    /// Send wait bound
    pub fn send_wait(&self) -> Duration {
        Duration::from_millis(self.send_wait_ms)
    }
}

/// Reconnection policy after transport failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Attempts before the session gives up
    pub max_attempts: u32,
    /// Delay before each attempt; the last entry repeats
    pub backoff_ms: Vec<u64>,
    /// Reset the attempt counter when the transport reports `connected`
    pub reset_on_connected: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: vec![1_000, 2_000, 4_000],
            reset_on_connected: false,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let index = attempt.saturating_sub(1) as usize;
        let ms = self
            .backoff_ms
            .get(index)
            .or_else(|| self.backoff_ms.last())
            .copied()
            .unwrap_or(0);
        Duration::from_millis(ms)
    }
}

/// Room capacity policy
///
/// A room holding more than `max_members` participants means someone else
/// joined the call. Relays can briefly double-count a member that
/// re-registers during setup, so the overcount must persist for `grace_ms`
/// before it is fatal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomCapacity {
    /// Maximum durable members
    pub max_members: usize,
    /// How long an overcount is tolerated
    pub grace_ms: u64,
}

impl Default for RoomCapacity {
    fn default() -> Self {
        Self {
            max_members: 2,
            grace_ms: 0,
        }
    }
}

impl RoomCapacity {
    /// Overcount grace period
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }
}

/// Call session configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Fixed ICE server list
    pub ice_servers: Vec<IceServer>,
    /// How long the initiator waits for `ready` before offering anyway
    pub ready_timeout_ms: u64,
    /// How long an early answer waits for its offer
    pub pending_answer_timeout_ms: u64,
    /// Signal channel timing
    pub channel: ChannelConfig,
    /// Reconnection policy
    pub reconnect: ReconnectPolicy,
    /// Room capacity policy
    pub capacity: RoomCapacity,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![
                IceServer::stun("stun:stun.l.google.com:19302"),
                IceServer::stun("stun:stun1.l.google.com:19302"),
            ],
            ready_timeout_ms: 5_000,
            pending_answer_timeout_ms: 10_000,
            channel: ChannelConfig::default(),
            reconnect: ReconnectPolicy::default(),
            capacity: RoomCapacity::default(),
        }
    }
}

impl SessionConfig {
    /// Parse a JSON config document; missing fields take defaults
    ///
    /// # Errors
    ///
    /// Returns error if the document is malformed or fails validation
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns error describing the first invalid value
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity.max_members < 2 {
            return Err(ConfigError::Invalid(format!(
                "capacity.max_members must be at least 2, got {}",
                self.capacity.max_members
            )));
        }
        if self.reconnect.max_attempts > 0 && self.reconnect.backoff_ms.is_empty() {
            return Err(ConfigError::Invalid(
                "reconnect.backoff_ms cannot be empty when reconnection is enabled".to_string(),
            ));
        }
        if self.ready_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "ready_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Ready handshake bound
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    /// Early answer bound
    pub fn pending_answer_timeout(&self) -> Duration {
        Duration::from_millis(self.pending_answer_timeout_ms)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config_is_valid() {
        let config = SessionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ready_timeout(), Duration::from_secs(5));
        assert_eq!(config.pending_answer_timeout(), Duration::from_secs(10));
        assert_eq!(config.channel.send_wait(), Duration::from_secs(5));
        assert_eq!(config.capacity.max_members, 2);
    }

    #[test]
    fn test_backoff_last_entry_repeats() {
        let policy = ReconnectPolicy {
            max_attempts: 6,
            backoff_ms: vec![100, 500, 1_000],
            reset_on_connected: false,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(500));
        assert_eq!(policy.delay_for(3), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(4), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(6), Duration::from_millis(1_000));
    }

    #[test]
    fn test_backoff_is_non_decreasing_by_default() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<_> = (1..=6).map(|a| policy.delay_for(a)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let config = SessionConfig::from_json(
            r#"{"ready_timeout_ms": 2500, "capacity": {"grace_ms": 1500}}"#,
        )
        .unwrap();
        assert_eq!(config.ready_timeout_ms, 2_500);
        assert_eq!(config.capacity.grace_ms, 1_500);
        assert_eq!(config.capacity.max_members, 2);
        assert_eq!(config.reconnect, ReconnectPolicy::default());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = SessionConfig::default();
        config.capacity.max_members = 1;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = SessionConfig::default();
        config.reconnect.backoff_ms.clear();
        assert!(config.validate().is_err());

        config.reconnect.max_attempts = 0;
        assert!(config.validate().is_ok());

        assert!(matches!(
            SessionConfig::from_json("{not json"),
            Err(ConfigError::Parse(_))
        ));
    }
}
