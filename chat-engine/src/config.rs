//! Engine tuning knobs

use serde::{Deserialize, Serialize};
use shared::Sender;
use std::time::Duration;

/// Timing and policy settings for a `ChatEngine`.
///
/// Durations are written as whole seconds in config files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Session directory refresh interval
    #[serde(with = "duration_secs")]
    pub poll_interval: Duration,
    /// How long a send may stay pending before it is marked failed
    #[serde(with = "duration_secs")]
    pub ack_timeout: Duration,
    /// First reconnect delay
    #[serde(with = "duration_secs")]
    pub backoff_base: Duration,
    /// Upper bound for a single reconnect delay
    #[serde(with = "duration_secs")]
    pub backoff_max: Duration,
    /// Reconnect attempts before the channel gives up and goes offline
    pub max_reconnect_attempts: u32,
    /// Silence after which the next message starts a new visual group
    #[serde(with = "duration_secs")]
    pub group_gap: Duration,
    /// Role of the local operator; messages from this sender are "mine"
    pub local_role: Sender,
    /// Accept sends while connecting/reconnecting and flush them on connect
    pub queue_while_reconnecting: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(8),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            max_reconnect_attempts: 5,
            group_gap: Duration::from_secs(5 * 60),
            local_role: Sender::Business,
            queue_while_reconnecting: true,
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}
