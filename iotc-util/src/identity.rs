use std::path::PathBuf;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::crypto::{InvalidSecretFormat, decode_secret, derive_key};
use crate::types::{DeviceId, ScopeId, SecretKey};

/// Client certificate material for X509 attestation
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct X509Certificate {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
}

/// How the device proves its identity
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Credential {
    /// Group enrollment key, the device key is derived from it
    SymmetricKey(SecretKey),
    /// Per-device key, used as is
    DeviceKey(SecretKey),
    /// Client certificate
    X509(X509Certificate),
}

/// The identity of the device
///
/// Immutable once built, except for the derived device key that is computed
/// on first use and cached.
#[derive(Clone, Debug)]
pub struct DeviceIdentity {
    device_id: DeviceId,
    scope_id: ScopeId,
    credential: Credential,
    derived_key: OnceLock<SecretKey>,
}

impl DeviceIdentity {
    pub fn new(
        device_id: impl Into<DeviceId>,
        scope_id: impl Into<ScopeId>,
        credential: Credential,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            scope_id: scope_id.into(),
            credential,
            derived_key: OnceLock::new(),
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn scope_id(&self) -> &ScopeId {
        &self.scope_id
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    /// The key used to sign tokens for this device.
    ///
    /// Group keys are turned into a device key on first call. Certificate
    /// identities have no key.
    pub fn device_key(&self) -> Result<Option<&SecretKey>, InvalidSecretFormat> {
        match &self.credential {
            Credential::SymmetricKey(group_key) => {
                if let Some(key) = self.derived_key.get() {
                    return Ok(Some(key));
                }
                let key = derive_key(group_key, &self.device_id)?;
                debug!(device_id = %self.device_id, "derived device key");
                Ok(Some(self.derived_key.get_or_init(|| key.into())))
            }
            Credential::DeviceKey(key) => {
                decode_secret(key)?;
                Ok(Some(key))
            }
            Credential::X509(_) => Ok(None),
        }
    }

    /// Whether a device key was derived from a group key
    pub fn has_derived_key(&self) -> bool {
        self.derived_key.get().is_some()
    }

    pub fn certificate(&self) -> Option<&X509Certificate> {
        match &self.credential {
            Credential::X509(cert) => Some(cert),
            _ => None,
        }
    }
}
