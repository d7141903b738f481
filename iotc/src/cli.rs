use clap::{ArgGroup, Args, Parser, Subcommand, ValueEnum};
use std::num::ParseIntError;
use std::path::PathBuf;
use std::time::Duration;

use crate::device::{Credential, X509Certificate};
use crate::provisioning::DEFAULT_API_VERSION;
use crate::util::http::Uri;
use crate::util::types::SecretKey;

fn parse_duration(s: &str) -> Result<Duration, ParseIntError> {
    let millis: u64 = s.parse()?;
    Ok(Duration::from_millis(millis))
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Disabled,
    #[default]
    ApiOnly,
    All,
}

impl LogLevel {
    /// Default filter, `RUST_LOG` takes precedence
    pub fn directive(&self) -> &'static str {
        match self {
            Self::Disabled => "off",
            Self::ApiOnly => "info",
            Self::All => "trace,hyper=error,reqwest=debug",
        }
    }
}

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)] // read from Cargo.toml
pub struct Cli {
    /// Log verbosity
    #[arg(
        env = "IOTC_LOG_LEVEL",
        long = "log-level",
        value_name = "level",
        value_enum,
        default_value_t = LogLevel::ApiOnly,
        global = true
    )]
    pub log_level: LogLevel,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Clone, Debug, Subcommand)]
pub enum Command {
    /// Derive a device key from a group enrollment key
    DeriveKey {
        /// Group enrollment key (base64)
        #[arg(env = "IOTC_GROUP_KEY", long = "group-key", value_name = "key")]
        group_key: SecretKey,

        /// Device (registration) id
        #[arg(env = "IOTC_DEVICE_ID", long = "device-id", value_name = "id")]
        device_id: String,
    },

    /// Generate the username and SAS password for a hub connection
    SasToken {
        /// Host name of the assigned hub
        #[arg(env = "IOTC_HUB", long = "hub", value_name = "host")]
        hub: String,

        #[arg(env = "IOTC_DEVICE_ID", long = "device-id", value_name = "id")]
        device_id: String,

        /// Device key (base64)
        #[arg(env = "IOTC_DEVICE_KEY", long = "device-key", value_name = "key")]
        device_key: SecretKey,

        /// Token validity in milliseconds
        #[arg(
            env = "IOTC_SAS_TTL_MS",
            long = "ttl-ms",
            value_name = "ms",
            value_parser = parse_duration,
            default_value = "21600000"
        )]
        ttl: Duration,

        /// Hub API version announced in the username
        #[arg(
            env = "IOTC_HUB_API_VERSION",
            long = "api-version",
            value_name = "version",
            default_value = crate::device::DEFAULT_HUB_API_VERSION
        )]
        api_version: String,
    },

    /// Register the device with the provisioning service and print its
    /// connection string
    Register(RegisterArgs),
}

#[derive(Clone, Debug, Args)]
#[command(group(
    ArgGroup::new("credential")
        .required(true)
        .args(["group_key", "device_key", "cert_file"])
))]
pub struct RegisterArgs {
    /// ID scope of the application
    #[arg(env = "IOTC_SCOPE_ID", long = "scope-id", value_name = "scope")]
    pub scope_id: String,

    #[arg(env = "IOTC_DEVICE_ID", long = "device-id", value_name = "id")]
    pub device_id: String,

    /// Group enrollment key, the device key is derived from it
    #[arg(env = "IOTC_GROUP_KEY", long = "group-key", value_name = "key")]
    pub group_key: Option<SecretKey>,

    /// Device key
    #[arg(env = "IOTC_DEVICE_KEY", long = "device-key", value_name = "key")]
    pub device_key: Option<SecretKey>,

    /// PEM certificate for X509 authentication
    #[arg(
        env = "IOTC_CERT_FILE",
        long = "cert-file",
        value_name = "path",
        requires = "key_file"
    )]
    pub cert_file: Option<PathBuf>,

    /// PEM private key for X509 authentication
    #[arg(
        env = "IOTC_KEY_FILE",
        long = "key-file",
        value_name = "path",
        requires = "cert_file"
    )]
    pub key_file: Option<PathBuf>,

    /// Model the device implements
    #[arg(env = "IOTC_MODEL_ID", long = "model-id", value_name = "id")]
    pub model_id: Option<String>,

    /// Provisioning service endpoint
    #[arg(
        env = "IOTC_PROVISIONING_ENDPOINT",
        long = "endpoint",
        value_name = "host",
        value_parser = Uri::from_host
    )]
    pub endpoint: Option<Uri>,

    #[arg(
        env = "IOTC_PROVISIONING_API_VERSION",
        long = "provisioning-api-version",
        value_name = "version",
        default_value = DEFAULT_API_VERSION
    )]
    pub api_version: String,

    /// Provisioning request timeout in milliseconds
    #[arg(
        env = "IOTC_PROVISIONING_TIMEOUT_MS",
        long = "timeout-ms",
        value_name = "ms",
        value_parser = parse_duration
    )]
    pub request_timeout: Option<Duration>,

    /// Keep the assignment in the local credential cache
    #[arg(long = "save")]
    pub save: bool,
}

impl RegisterArgs {
    pub fn credential(&self) -> Option<Credential> {
        if let (Some(cert_file), Some(key_file)) = (&self.cert_file, &self.key_file) {
            return Some(Credential::X509(X509Certificate {
                cert_file: cert_file.clone(),
                key_file: key_file.clone(),
                passphrase: None,
            }));
        }
        self.group_key
            .clone()
            .map(Credential::SymmetricKey)
            .or_else(|| self.device_key.clone().map(Credential::DeviceKey))
    }
}

pub fn parse() -> Cli {
    Parser::parse()
}
