/*
Everything needed to resolve the hub a device should connect to.

The device submits a registration request to the provisioning service and
polls the resulting operation until the service assigns it a hub, rejects it
or the attempt budget runs out. Only one registration may be in flight per
client.
*/

mod config;
mod provisioning;
mod transport;

pub use config::{DEFAULT_API_VERSION, DEFAULT_ENDPOINT, ProvisioningConfig};
pub use provisioning::{FailureReason, ProvisioningClient, ProvisioningError, RegistrationState};
pub use transport::{
    Assignment, Authorization, HttpsProvisioning, OperationState, OperationStatus,
    ProvisioningTransport, RegistrationRequest, TransportError,
};

use iotc_util as util;
