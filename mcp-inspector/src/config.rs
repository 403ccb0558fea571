use crate::handshake::PROTOCOL_VERSION;
use crate::types::Implementation;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Knobs for a [`crate::Bridge`].
///
/// Durations are (de)serialized as whole milliseconds.  Anything missing from a serialized
/// config falls back to the default.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeOptions {
    /// How the bridge introduces itself in the handshake
    pub client_info: Implementation,

    pub protocol_version: String,

    #[serde(with = "millis")]
    pub handshake_timeout: Duration,

    /// Deadline for listing, resource and prompt requests
    #[serde(with = "millis")]
    pub request_timeout: Duration,

    /// Deadline for tool calls, which tend to do real work and so get longer
    #[serde(with = "millis")]
    pub tool_timeout: Duration,

    /// How long the server gets to exit after being asked nicely, before it's killed
    #[serde(with = "millis")]
    pub shutdown_grace: Duration,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            client_info: Implementation {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            protocol_version: PROTOCOL_VERSION.to_string(),
            handshake_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            tool_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis().try_into().unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
