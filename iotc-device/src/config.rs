use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::provisioning::ProvisioningConfig;
use crate::transport::Qos;
use crate::util::json::{deserialize_duration_from_ms, serialize_duration_to_ms};

/// API version announced to the hub on connect
pub const DEFAULT_HUB_API_VERSION: &str = "2019-07-01-preview";

/// Session configuration
///
/// Read once when the session is built, changing it requires a new session.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    pub provisioning: ProvisioningConfig,

    /// Model the device announces when registering
    pub model_id: Option<String>,

    /// Delivery guarantee for every publish and subscription
    pub qos: Qos,

    /// Content type of telemetry payloads (`$.ct`)
    pub content_type: String,

    /// Content encoding of telemetry payloads (`$.ce`)
    pub content_encoding: String,

    /// Validity of the hub connection token
    #[serde(
        deserialize_with = "deserialize_duration_from_ms",
        serialize_with = "serialize_duration_to_ms"
    )]
    pub sas_ttl: Duration,

    pub hub_api_version: String,

    /// Reconnect attempts after an unexpected disconnect before the session
    /// is considered failed
    pub max_reconnect_attempts: u32,

    /// Wait before the first reconnect attempt, doubled on every further
    /// attempt
    #[serde(
        deserialize_with = "deserialize_duration_from_ms",
        serialize_with = "serialize_duration_to_ms"
    )]
    pub reconnect_backoff: Duration,

    #[serde(
        deserialize_with = "deserialize_duration_from_ms",
        serialize_with = "serialize_duration_to_ms"
    )]
    pub max_reconnect_backoff: Duration,

    /// How long `disconnect` waits for background tasks to finish
    #[serde(
        deserialize_with = "deserialize_duration_from_ms",
        serialize_with = "serialize_duration_to_ms"
    )]
    pub teardown_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            provisioning: ProvisioningConfig::default(),
            model_id: None,
            qos: Qos::default(),
            content_type: "application/json".to_owned(),
            content_encoding: "utf-8".to_owned(),
            sas_ttl: Duration::from_secs(21600),
            hub_api_version: DEFAULT_HUB_API_VERSION.to_owned(),
            max_reconnect_attempts: 5,
            reconnect_backoff: Duration::from_secs(2),
            max_reconnect_backoff: Duration::from_secs(60),
            teardown_grace: Duration::from_secs(5),
        }
    }
}

impl SessionConfig {
    /// Wait before reconnect attempt `attempt` (starting at 1)
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.reconnect_backoff
            .saturating_mul(factor)
            .min(self.max_reconnect_backoff)
    }
}
