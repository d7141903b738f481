use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::util::crypto::sha256_hex_digest;
use crate::util::identity::X509Certificate;
use crate::util::store::{Store, StoreError};
use crate::util::types::{DeviceId, ScopeId, SecretKey};

// Persisted to disk, keep changes backwards compatible or devices will
// provision again after an update.

/// The hub a device was assigned to and the credentials to connect with
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialCache {
    pub hub_name: String,
    pub device_id: DeviceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_key: Option<SecretKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<X509Certificate>,
}

impl CredentialCache {
    /// Render as a hub connection string
    ///
    /// ```
    /// use iotc_device::CredentialCache;
    ///
    /// let cache = CredentialCache {
    ///     hub_name: "h.example.net".into(),
    ///     device_id: "dev1".into(),
    ///     device_key: Some("a2V5".into()),
    ///     certificate: None,
    /// };
    /// assert_eq!(
    ///     cache.connection_string(),
    ///     "HostName=h.example.net;DeviceId=dev1;SharedAccessKey=a2V5"
    /// );
    /// ```
    pub fn connection_string(&self) -> String {
        match &self.device_key {
            Some(key) => format!(
                "HostName={};DeviceId={};SharedAccessKey={}",
                self.hub_name,
                self.device_id,
                key.as_str()
            ),
            None => format!(
                "HostName={};DeviceId={};x509=true",
                self.hub_name, self.device_id
            ),
        }
    }
}

/// Where hub assignments survive restarts
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn retrieve(&self) -> Result<Option<CredentialCache>, StoreError>;

    async fn persist(&self, cache: &CredentialCache) -> Result<(), StoreError>;

    /// Forget the stored credentials
    async fn clear(&self) -> Result<(), StoreError>;
}

#[async_trait]
impl<T: CredentialStore + ?Sized> CredentialStore for Arc<T> {
    async fn retrieve(&self) -> Result<Option<CredentialCache>, StoreError> {
        self.as_ref().retrieve().await
    }

    async fn persist(&self, cache: &CredentialCache) -> Result<(), StoreError> {
        self.as_ref().persist(cache).await
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.as_ref().clear().await
    }
}

const COLLECTION: &str = "/credentials";

/// Keeps credentials as JSON documents, one per scope and device
#[derive(Clone, Debug)]
pub struct FileCredentialStore {
    store: Store,
    key: String,
}

impl FileCredentialStore {
    pub fn new<P: AsRef<Path>>(root: P, scope_id: &ScopeId, device_id: &DeviceId) -> Self {
        Self {
            store: Store::new(root),
            key: sha256_hex_digest(format!("{scope_id}/{device_id}")),
        }
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn retrieve(&self) -> Result<Option<CredentialCache>, StoreError> {
        let cache = self.store.read(COLLECTION, &self.key).await?;
        debug!(found = cache.is_some(), "read cached credentials");
        Ok(cache)
    }

    async fn persist(&self, cache: &CredentialCache) -> Result<(), StoreError> {
        self.store.write(COLLECTION, &self.key, cache).await?;
        debug!(hub = %cache.hub_name, "stored credentials");
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.store.delete(COLLECTION, &self.key).await
    }
}
