use std::error::Error;

use tracing::{debug, info};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

mod cli;

use iotc_device as device;
use iotc_provisioning as provisioning;
use iotc_util as util;

use crate::cli::{Cli, Command, LogLevel, RegisterArgs};
use crate::device::{CredentialCache, CredentialStore, DeviceIdentity, FileCredentialStore};
use crate::provisioning::{ProvisioningClient, ProvisioningConfig};
use crate::util::crypto::{SasToken, derive_key};
use crate::util::dirs::config_dir;

fn initialize_tracing(level: LogLevel) {
    tracing_subscriber::registry()
        .with(
            // RUST_LOG overrides the level given on the command line
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.directive())),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_span_events(FmtSpan::CLOSE)
                .event_format(fmt::format().compact().with_target(false).without_time()),
        )
        .init();
}

async fn register(args: RegisterArgs) -> Result<(), Box<dyn Error>> {
    let credential = args
        .credential()
        .ok_or("a group key, device key or certificate is required")?;
    let identity = DeviceIdentity::new(args.device_id, args.scope_id, credential);

    let mut config = ProvisioningConfig {
        api_version: args.api_version,
        ..ProvisioningConfig::default()
    };
    if let Some(endpoint) = args.endpoint {
        config.endpoint = endpoint;
    }
    if let Some(timeout) = args.request_timeout {
        config.request_timeout = timeout;
    }
    debug!(endpoint = %config.endpoint, "registering device");

    let client = ProvisioningClient::https(config);
    let hub = client.register(&identity, args.model_id.as_deref()).await?;

    let cache = CredentialCache {
        hub_name: hub,
        device_id: identity.device_id().clone(),
        device_key: identity.device_key()?.cloned(),
        certificate: identity.certificate().cloned(),
    };

    if args.save {
        let dir = config_dir();
        FileCredentialStore::new(&dir, identity.scope_id(), identity.device_id())
            .persist(&cache)
            .await?;
        info!("credentials saved to {}", dir.display());
    }

    println!("{}", cache.connection_string());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let Cli { log_level, command } = cli::parse();
    initialize_tracing(log_level);

    match command {
        Command::DeriveKey {
            group_key,
            device_id,
        } => {
            println!("{}", derive_key(&group_key, &device_id)?);
        }
        Command::SasToken {
            hub,
            device_id,
            device_key,
            ttl,
            api_version,
        } => {
            let resource_uri = format!("{hub}/devices/{device_id}");
            let token = SasToken {
                resource_uri: &resource_uri,
                key: &device_key,
                ttl,
                key_name: None,
            }
            .build()?;
            println!("{hub}/{device_id}/?api-version={api_version}");
            println!("{token}");
        }
        Command::Register(args) => register(args).await?,
    }

    Ok(())
}
