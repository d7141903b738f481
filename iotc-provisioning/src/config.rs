use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::util::http::Uri;
use crate::util::json::{deserialize_duration_from_ms, serialize_duration_to_ms};

/// Global provisioning endpoint
pub const DEFAULT_ENDPOINT: &str = "global.azure-devices-provisioning.net";

/// API version sent with every provisioning request
pub const DEFAULT_API_VERSION: &str = "2019-03-31";

/// Provisioning service configuration
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    pub endpoint: Uri,

    pub api_version: String,

    /// Wait between operation polls when the service does not send a
    /// `retry-after`
    #[serde(
        deserialize_with = "deserialize_duration_from_ms",
        serialize_with = "serialize_duration_to_ms"
    )]
    pub poll_interval: Duration,

    /// Maximum number of requests per registration, including the initial
    /// one
    pub max_attempts: u32,

    #[serde(
        deserialize_with = "deserialize_duration_from_ms",
        serialize_with = "serialize_duration_to_ms"
    )]
    pub request_timeout: Duration,

    /// Validity of the registration token
    #[serde(
        deserialize_with = "deserialize_duration_from_ms",
        serialize_with = "serialize_duration_to_ms"
    )]
    pub sas_ttl: Duration,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            endpoint: Uri::from_static("https://global.azure-devices-provisioning.net"),
            api_version: DEFAULT_API_VERSION.to_owned(),
            poll_interval: Duration::from_secs(3),
            max_attempts: 20,
            request_timeout: Duration::from_secs(30),
            sas_ttl: Duration::from_secs(3600),
        }
    }
}
