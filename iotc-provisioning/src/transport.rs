use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderMap, RETRY_AFTER};
use reqwest::{Client, Identity, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{Span, debug, field, instrument};

use crate::config::ProvisioningConfig;
use crate::util::http::{InvalidUriError, Uri};
use crate::util::identity::X509Certificate;
use crate::util::types::{DeviceId, ScopeId};

/// Errors talking to the provisioning service
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Network(String),

    #[error("service replied with {status}: {message}")]
    Status {
        status: StatusCode,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("invalid endpoint URI: {0}")]
    InvalidEndpoint(#[from] InvalidUriError),

    #[error("cannot load client certificate: {0}")]
    Certificate(String),
}

impl TransportError {
    /// Network failures, throttling and server side errors may go away on
    /// their own
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Status { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
            }
            _ => false,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// How a request proves the device identity
#[derive(Clone, Debug)]
pub enum Authorization {
    /// A registration SAS token sent in the `Authorization` header
    Sas(String),
    /// TLS client authentication
    Certificate(X509Certificate),
}

/// A registration as submitted to the service
#[derive(Clone, Debug)]
pub struct RegistrationRequest {
    pub scope_id: ScopeId,
    pub registration_id: DeviceId,
    pub model_id: Option<String>,
    pub authorization: Authorization,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterBody<'a> {
    registration_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<ModelPayload<'a>>,
}

#[derive(Serialize)]
struct ModelPayload<'a> {
    iotcmodel_id: &'a str,
}

impl<'a> From<&'a RegistrationRequest> for RegisterBody<'a> {
    fn from(value: &'a RegistrationRequest) -> Self {
        Self {
            registration_id: &value.registration_id,
            payload: value
                .model_id
                .as_deref()
                .map(|iotcmodel_id| ModelPayload { iotcmodel_id }),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationState {
    Unassigned,
    Assigning,
    Assigned,
    Failed,
    Disabled,
    #[serde(other)]
    Unknown,
}

/// Registration details once the operation completes
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    pub assigned_hub: Option<String>,
    pub device_id: Option<String>,
    pub error_message: Option<String>,
}

/// Body of a register or operation status response
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationStatus {
    pub operation_id: Option<String>,
    pub status: OperationState,
    #[serde(default)]
    pub registration_state: Option<Assignment>,

    /// Poll delay requested by the service
    #[serde(skip)]
    pub retry_after: Option<Duration>,
}

/// The HTTP side of provisioning
#[async_trait]
pub trait ProvisioningTransport: Send + Sync {
    /// Submit the registration, returning the operation it started
    async fn register(
        &self,
        request: &RegistrationRequest,
    ) -> Result<OperationStatus, TransportError>;

    /// Query the status of a registration operation
    async fn operation_status(
        &self,
        request: &RegistrationRequest,
        operation_id: &str,
    ) -> Result<OperationStatus, TransportError>;
}

#[async_trait]
impl<T: ProvisioningTransport + ?Sized> ProvisioningTransport for Arc<T> {
    async fn register(
        &self,
        request: &RegistrationRequest,
    ) -> Result<OperationStatus, TransportError> {
        self.as_ref().register(request).await
    }

    async fn operation_status(
        &self,
        request: &RegistrationRequest,
        operation_id: &str,
    ) -> Result<OperationStatus, TransportError> {
        self.as_ref().operation_status(request, operation_id).await
    }
}

/// Provisioning over HTTPS
#[derive(Clone, Debug)]
pub struct HttpsProvisioning {
    client: Client,
    endpoint: Uri,
    api_version: String,
    timeout: Duration,
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

impl HttpsProvisioning {
    pub fn new(config: &ProvisioningConfig) -> Self {
        Self {
            client: Client::new(),
            endpoint: config.endpoint.clone(),
            api_version: config.api_version.clone(),
            timeout: config.request_timeout,
        }
    }

    fn endpoint(&self, path: &str) -> Result<Uri, TransportError> {
        let query = format!("api-version={}", self.api_version);
        Ok(Uri::from_parts(self.endpoint.clone(), path, Some(&query))?)
    }

    async fn client_for(&self, authorization: &Authorization) -> Result<Client, TransportError> {
        match authorization {
            Authorization::Sas(_) => Ok(self.client.clone()),
            Authorization::Certificate(cert) => {
                if cert.passphrase.is_some() {
                    return Err(TransportError::Certificate(
                        "encrypted private keys are not supported".into(),
                    ));
                }
                let mut pem = tokio::fs::read(&cert.cert_file)
                    .await
                    .map_err(|e| TransportError::Certificate(e.to_string()))?;
                pem.push(b'\n');
                pem.extend(
                    tokio::fs::read(&cert.key_file)
                        .await
                        .map_err(|e| TransportError::Certificate(e.to_string()))?,
                );
                let identity = Identity::from_pem(&pem)
                    .map_err(|e| TransportError::Certificate(e.to_string()))?;

                Client::builder()
                    .identity(identity)
                    .build()
                    .map_err(|e| TransportError::Certificate(e.to_string()))
            }
        }
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        authorization: &Authorization,
    ) -> Result<OperationStatus, TransportError> {
        let mut request = request
            .timeout(self.timeout)
            .header("Accept", "application/json");
        if let Authorization::Sas(token) = authorization {
            request = request.header(AUTHORIZATION, token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let status = response.status();
        Span::current().record("status", field::display(status));

        let retry_after = parse_retry_after(response.headers());
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status,
                message,
                retry_after,
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;
        let mut operation: OperationStatus = serde_json::from_slice(&body)
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;
        operation.retry_after = retry_after;
        Ok(operation)
    }
}

#[async_trait]
impl ProvisioningTransport for HttpsProvisioning {
    #[instrument(skip_all, fields(registration_id = %request.registration_id, status = field::Empty), err)]
    async fn register(
        &self,
        request: &RegistrationRequest,
    ) -> Result<OperationStatus, TransportError> {
        let endpoint = self.endpoint(&format!(
            "/{}/registrations/{}/register",
            request.scope_id, request.registration_id
        ))?;
        let client = self.client_for(&request.authorization).await?;

        debug!("submitting registration");
        let builder = client
            .put(endpoint.to_string())
            .json(&RegisterBody::from(request));
        self.send(builder, &request.authorization).await
    }

    #[instrument(skip_all, fields(operation_id = %operation_id, status = field::Empty), err)]
    async fn operation_status(
        &self,
        request: &RegistrationRequest,
        operation_id: &str,
    ) -> Result<OperationStatus, TransportError> {
        let endpoint = self.endpoint(&format!(
            "/{}/registrations/{}/operations/{}",
            request.scope_id, request.registration_id, operation_id
        ))?;
        let client = self.client_for(&request.authorization).await?;

        debug!("polling registration status");
        self.send(client.get(endpoint.to_string()), &request.authorization)
            .await
    }
}
