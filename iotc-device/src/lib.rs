//! Device session
//!
//! Connects a device to its hub and keeps it connected: resolves the hub
//! through the credential cache or the provisioning service, subscribes to
//! the twin and command topics, routes inbound messages to the application
//! handlers and acknowledges desired properties.

mod config;
mod credentials;
mod dispatch;
mod error;
mod events;
mod pending;
mod session;
mod transport;

#[cfg(test)]
mod testing;

pub use config::{DEFAULT_HUB_API_VERSION, SessionConfig};
pub use credentials::{CredentialCache, CredentialStore, FileCredentialStore};
pub use dispatch::{Command, Reply};
pub use error::{CommandError, SessionError};
pub use events::{
    BoxFuture, CommandHandler, ConnectionStatus, ConnectionStatusHandler, EnqueuedCommandHandler,
    EventKind, Handler, MessageSentHandler, PropertiesHandler,
};
pub use pending::PendingMessage;
pub use session::{DeviceClient, DeviceClientBuilder, SessionState};
pub use transport::{ConnectParams, MessageId, Qos, Transport, TransportError, TransportEvent};

pub use iotc_protocol::command::EnqueuedCommand;
pub use iotc_protocol::twin::PropertyUpdate;
pub use iotc_util::identity::{Credential, DeviceIdentity, X509Certificate};

use iotc_protocol as protocol;
use iotc_provisioning as provisioning;
use iotc_util as util;
