use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tracing::{Span, debug, field, info, instrument, warn};

use crate::config::ProvisioningConfig;
use crate::transport::{
    Authorization, HttpsProvisioning, OperationState, OperationStatus, ProvisioningTransport,
    RegistrationRequest, TransportError,
};
use crate::util::crypto::{InvalidSecretFormat, SasToken};
use crate::util::identity::DeviceIdentity;

#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error(transparent)]
    InvalidSecret(#[from] InvalidSecretFormat),

    #[error("registration still pending after {0} attempts")]
    MaxAttemptsExceeded(u32),

    #[error("unexpected response from provisioning service: {0}")]
    Protocol(String),

    #[error("registration rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ProvisioningError {
    /// Whether registering again later may succeed. Everything else was
    /// refused by the service or failed locally
    pub fn is_transient(&self) -> bool {
        match self {
            Self::MaxAttemptsExceeded(_) => true,
            Self::Transport(err) => err.is_transient(),
            _ => false,
        }
    }

    fn reason(&self) -> FailureReason {
        match self {
            Self::MaxAttemptsExceeded(_) => FailureReason::MaxAttemptsExceeded,
            Self::Rejected(msg) => FailureReason::Rejected(msg.clone()),
            Self::InvalidSecret(err) => FailureReason::InvalidCredential(err.to_string()),
            Self::Protocol(msg) => FailureReason::ProtocolError(msg.clone()),
            Self::Transport(err) => FailureReason::ProtocolError(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    MaxAttemptsExceeded,
    ProtocolError(String),
    Rejected(String),
    InvalidCredential(String),
}

/// Progress of the last registration
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RegistrationState {
    #[default]
    NotStarted,
    Assigning {
        operation_id: String,
        attempt: u32,
    },
    Assigned {
        hub: String,
    },
    Failed(FailureReason),
}

/// Registers devices with the provisioning service
///
/// Registrations are serialized, a second caller waits for the first one to
/// finish before submitting its own request.
pub struct ProvisioningClient<T = HttpsProvisioning> {
    transport: T,
    config: ProvisioningConfig,
    state: watch::Sender<RegistrationState>,
    in_flight: Mutex<()>,
}

impl ProvisioningClient<HttpsProvisioning> {
    /// Create a client talking HTTPS to the configured endpoint
    pub fn https(config: ProvisioningConfig) -> Self {
        let transport = HttpsProvisioning::new(&config);
        Self::new(transport, config)
    }
}

impl<T: ProvisioningTransport> ProvisioningClient<T> {
    pub fn new(transport: T, config: ProvisioningConfig) -> Self {
        let (state, _) = watch::channel(RegistrationState::NotStarted);
        Self {
            transport,
            config,
            state,
            in_flight: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &ProvisioningConfig {
        &self.config
    }

    /// The current registration state
    pub fn state(&self) -> RegistrationState {
        self.state.borrow().clone()
    }

    /// Watch registration state changes
    pub fn subscribe(&self) -> watch::Receiver<RegistrationState> {
        self.state.subscribe()
    }

    fn authorization(&self, identity: &DeviceIdentity) -> Result<Authorization, ProvisioningError> {
        if let Some(cert) = identity.certificate() {
            return Ok(Authorization::Certificate(cert.clone()));
        }

        // every other credential resolves to a device key
        let key = identity
            .device_key()?
            .ok_or_else(|| ProvisioningError::Protocol("identity has no signing key".into()))?;
        let resource_uri = format!(
            "{}/registrations/{}",
            identity.scope_id(),
            identity.device_id()
        );
        let token = SasToken {
            resource_uri: &resource_uri,
            key,
            ttl: self.config.sas_ttl,
            key_name: Some("registration"),
        }
        .build()?;
        Ok(Authorization::Sas(token))
    }

    /// Register the device and return the host name of the assigned hub
    #[instrument(skip_all, fields(device_id = %identity.device_id(), hub = field::Empty), err)]
    pub async fn register(
        &self,
        identity: &DeviceIdentity,
        model_id: Option<&str>,
    ) -> Result<String, ProvisioningError> {
        let _guard = self.in_flight.lock().await;
        self.state.send_replace(RegistrationState::NotStarted);

        let result = self.try_register(identity, model_id).await;
        match &result {
            Ok(hub) => {
                Span::current().record("hub", field::display(hub));
                info!("device assigned to {hub}");
                self.state
                    .send_replace(RegistrationState::Assigned { hub: hub.clone() });
            }
            Err(err) => {
                self.state
                    .send_replace(RegistrationState::Failed(err.reason()));
            }
        }
        result
    }

    async fn try_register(
        &self,
        identity: &DeviceIdentity,
        model_id: Option<&str>,
    ) -> Result<String, ProvisioningError> {
        let request = RegistrationRequest {
            scope_id: identity.scope_id().clone(),
            registration_id: identity.device_id().clone(),
            model_id: model_id.map(String::from),
            authorization: self.authorization(identity)?,
        };

        let max_attempts = self.config.max_attempts.max(1);
        let mut operation_id: Option<String> = None;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let response = match &operation_id {
                None => self.transport.register(&request).await,
                Some(id) => self.transport.operation_status(&request, id).await,
            };

            let delay = match response {
                Ok(status) => match self.next_step(status, &mut operation_id, attempt)? {
                    Step::Done(hub) => return Ok(hub),
                    Step::Poll(delay) => delay,
                },
                Err(err) if err.is_transient() => {
                    warn!(attempt, "provisioning request failed: {err}");
                    err.retry_after().unwrap_or(self.config.poll_interval)
                }
                Err(err) => return Err(err.into()),
            };

            if attempt >= max_attempts {
                return Err(ProvisioningError::MaxAttemptsExceeded(attempt));
            }
            tokio::time::sleep(delay).await;
        }
    }

    fn next_step(
        &self,
        status: OperationStatus,
        operation_id: &mut Option<String>,
        attempt: u32,
    ) -> Result<Step, ProvisioningError> {
        match status.status {
            OperationState::Assigned => status
                .registration_state
                .and_then(|state| state.assigned_hub)
                .filter(|hub| !hub.is_empty())
                .map(Step::Done)
                .ok_or_else(|| ProvisioningError::Protocol("missing assignedHub".into())),
            OperationState::Assigning | OperationState::Unassigned => {
                let id = status
                    .operation_id
                    .or_else(|| operation_id.take())
                    .ok_or_else(|| ProvisioningError::Protocol("missing operationId".into()))?;
                debug!(attempt, operation_id = %id, "registration in progress");
                self.state.send_replace(RegistrationState::Assigning {
                    operation_id: id.clone(),
                    attempt,
                });
                *operation_id = Some(id);
                Ok(Step::Poll(
                    status.retry_after.unwrap_or(self.config.poll_interval),
                ))
            }
            OperationState::Failed | OperationState::Disabled => {
                let message = status
                    .registration_state
                    .and_then(|state| state.error_message)
                    .unwrap_or_else(|| format!("{:?}", status.status).to_lowercase());
                Err(ProvisioningError::Rejected(message))
            }
            OperationState::Unknown => Err(ProvisioningError::Protocol(
                "unknown registration status".into(),
            )),
        }
    }
}

enum Step {
    Done(String),
    Poll(Duration),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use mockito::{Matcher, Server};
    use reqwest::StatusCode;
    use serde_json::json;
    use tokio::time::Instant;

    use crate::transport::Assignment;
    use crate::util::http::Uri;
    use crate::util::identity::{Credential, X509Certificate};

    const DEVICE_KEY: &str = "XLXPHX5ND3KBL0BU9Y4C3ZIg4/oSSv3QlYZ0eBfbQtE=";

    type Response = Result<OperationStatus, TransportError>;

    #[derive(Default)]
    struct MockTransport {
        responses: StdMutex<VecDeque<Response>>,
        register_calls: AtomicUsize,
        status_calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        last_request: StdMutex<Option<RegistrationRequest>>,
    }

    impl MockTransport {
        fn with_responses(responses: impl IntoIterator<Item = Response>) -> Self {
            Self {
                responses: StdMutex::new(responses.into_iter().collect()),
                ..Default::default()
            }
        }

        async fn next(&self, request: &RegistrationRequest) -> Response {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);
            *self.last_request.lock().unwrap() = Some(request.clone());

            // give concurrent callers a chance to overlap
            tokio::time::sleep(Duration::from_millis(10)).await;

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::Network("no more responses".into())))
        }
    }

    #[async_trait]
    impl ProvisioningTransport for MockTransport {
        async fn register(&self, request: &RegistrationRequest) -> Response {
            self.register_calls.fetch_add(1, Ordering::SeqCst);
            self.next(request).await
        }

        async fn operation_status(
            &self,
            request: &RegistrationRequest,
            _operation_id: &str,
        ) -> Response {
            self.status_calls.fetch_add(1, Ordering::SeqCst);
            self.next(request).await
        }
    }

    fn assigning() -> Response {
        Ok(OperationStatus {
            operation_id: Some("op-1".into()),
            status: OperationState::Assigning,
            registration_state: None,
            retry_after: None,
        })
    }

    fn assigned(hub: &str) -> Response {
        Ok(OperationStatus {
            operation_id: Some("op-1".into()),
            status: OperationState::Assigned,
            registration_state: Some(Assignment {
                assigned_hub: Some(hub.into()),
                device_id: Some("pytest".into()),
                error_message: None,
            }),
            retry_after: None,
        })
    }

    fn status_error(status: StatusCode) -> Response {
        Err(TransportError::Status {
            status,
            message: String::new(),
            retry_after: None,
        })
    }

    fn identity() -> DeviceIdentity {
        DeviceIdentity::new(
            "pytest",
            "0ne00000000",
            Credential::DeviceKey(DEVICE_KEY.into()),
        )
    }

    fn client(transport: Arc<MockTransport>) -> ProvisioningClient<Arc<MockTransport>> {
        ProvisioningClient::new(transport, ProvisioningConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_polls_until_assigned() {
        let transport = Arc::new(MockTransport::with_responses([
            assigning(),
            assigning(),
            assigned("h.example.net"),
        ]));
        let client = client(transport.clone());

        let start = Instant::now();
        let hub = client.register(&identity(), None).await.unwrap();
        let elapsed = start.elapsed();

        assert_eq!(hub, "h.example.net");
        assert_eq!(
            client.state(),
            RegistrationState::Assigned {
                hub: "h.example.net".into()
            }
        );

        // exactly two poll intervals, plus the simulated request latency
        assert_eq!(
            elapsed,
            Duration::from_secs(6) + Duration::from_millis(30)
        );
        assert_eq!(transport.register_calls.load(Ordering::SeqCst), 1);
        assert_eq!(transport.status_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_signs_with_registration_token() {
        let transport = Arc::new(MockTransport::with_responses([assigned("h.example.net")]));
        let client = client(transport.clone());

        client
            .register(&identity(), Some("dtmi:contoso:sensor;1"))
            .await
            .unwrap();

        let request = transport.last_request.lock().unwrap().clone().unwrap();
        assert_eq!(request.model_id.as_deref(), Some("dtmi:contoso:sensor;1"));
        let Authorization::Sas(token) = request.authorization else {
            panic!("expected a SAS token");
        };
        assert!(token.starts_with(
            "SharedAccessSignature sr=0ne00000000%2Fregistrations%2Fpytest&sig="
        ));
        assert!(token.ends_with("&skn=registration"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_certificate_identity_uses_tls_authorization() {
        let transport = Arc::new(MockTransport::with_responses([assigned("h.example.net")]));
        let client = client(transport.clone());
        let cert = X509Certificate {
            cert_file: "device.pem".into(),
            key_file: "device.key".into(),
            passphrase: None,
        };
        let identity = DeviceIdentity::new("dev1", "0ne00000000", Credential::X509(cert));

        client.register(&identity, None).await.unwrap();

        let request = transport.last_request.lock().unwrap().clone().unwrap();
        assert!(matches!(request.authorization, Authorization::Certificate(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_gives_up_after_max_attempts() {
        let transport = Arc::new(MockTransport::with_responses(
            std::iter::repeat_with(assigning).take(30),
        ));
        let client = client(transport.clone());

        let err = client.register(&identity(), None).await.unwrap_err();

        assert!(matches!(err, ProvisioningError::MaxAttemptsExceeded(20)));
        assert_eq!(
            client.state(),
            RegistrationState::Failed(FailureReason::MaxAttemptsExceeded)
        );
        assert_eq!(transport.register_calls.load(Ordering::SeqCst), 1);
        assert_eq!(transport.status_calls.load(Ordering::SeqCst), 19);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_consume_attempts() {
        let transport = Arc::new(MockTransport::with_responses([
            status_error(StatusCode::SERVICE_UNAVAILABLE),
            Err(TransportError::Network("connection reset".into())),
            assigning(),
            status_error(StatusCode::TOO_MANY_REQUESTS),
            assigned("h.example.net"),
        ]));
        let client = client(transport.clone());

        let hub = client.register(&identity(), None).await.unwrap();

        assert_eq!(hub, "h.example.net");
        assert_eq!(transport.register_calls.load(Ordering::SeqCst), 3);
        assert_eq!(transport.status_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_errors_are_surfaced() {
        let transport = Arc::new(MockTransport::with_responses([status_error(
            StatusCode::UNAUTHORIZED,
        )]));
        let client = client(transport.clone());

        let err = client.register(&identity(), None).await.unwrap_err();

        assert!(matches!(
            err,
            ProvisioningError::Transport(TransportError::Status {
                status: StatusCode::UNAUTHORIZED,
                ..
            })
        ));
        assert!(matches!(
            client.state(),
            RegistrationState::Failed(FailureReason::ProtocolError(_))
        ));
        assert_eq!(transport.register_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_responses_fail_registration() {
        // assigned without a hub
        let transport = Arc::new(MockTransport::with_responses([Ok(OperationStatus {
            operation_id: Some("op-1".into()),
            status: OperationState::Assigned,
            registration_state: None,
            retry_after: None,
        })]));
        let err = client(transport).register(&identity(), None).await.unwrap_err();
        assert!(matches!(err, ProvisioningError::Protocol(_)));

        // assigning without an operation id
        let transport = Arc::new(MockTransport::with_responses([Ok(OperationStatus {
            operation_id: None,
            status: OperationState::Assigning,
            registration_state: None,
            retry_after: None,
        })]));
        let err = client(transport).register(&identity(), None).await.unwrap_err();
        assert!(matches!(err, ProvisioningError::Protocol(_)));

        // not JSON
        let transport = Arc::new(MockTransport::with_responses([Err(
            TransportError::InvalidResponse("expected value".into()),
        )]));
        let client = client(transport);
        let err = client.register(&identity(), None).await.unwrap_err();
        assert!(matches!(err, ProvisioningError::Transport(_)));
        assert!(matches!(
            client.state(),
            RegistrationState::Failed(FailureReason::ProtocolError(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_status_is_rejected() {
        let transport = Arc::new(MockTransport::with_responses([Ok(OperationStatus {
            operation_id: Some("op-1".into()),
            status: OperationState::Failed,
            registration_state: Some(Assignment {
                error_message: Some("Custom allocation failed".into()),
                ..Default::default()
            }),
            retry_after: None,
        })]));
        let client = client(transport);

        let err = client.register(&identity(), None).await.unwrap_err();

        assert!(matches!(err, ProvisioningError::Rejected(ref msg) if msg == "Custom allocation failed"));
        assert_eq!(
            client.state(),
            RegistrationState::Failed(FailureReason::Rejected(
                "Custom allocation failed".into()
            ))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_key_fails_before_any_request() {
        let transport = Arc::new(MockTransport::default());
        let client = client(transport.clone());
        let identity =
            DeviceIdentity::new("pytest", "0ne00000000", Credential::SymmetricKey("###".into()));

        let err = client.register(&identity, None).await.unwrap_err();

        assert!(matches!(err, ProvisioningError::InvalidSecret(_)));
        assert_eq!(transport.register_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registrations_are_serialized() {
        let transport = Arc::new(MockTransport::with_responses([
            assigning(),
            assigned("h1.example.net"),
            assigning(),
            assigned("h2.example.net"),
        ]));
        let client = client(transport.clone());
        let identity = identity();

        let mut states = client.subscribe();
        let (first, second) = tokio::join!(
            client.register(&identity, None),
            client.register(&identity, None)
        );

        assert_eq!(first.unwrap(), "h1.example.net");
        assert_eq!(second.unwrap(), "h2.example.net");
        assert_eq!(transport.max_in_flight.load(Ordering::SeqCst), 1);
        assert!(states.has_changed().unwrap());
        assert_eq!(
            *states.borrow_and_update(),
            RegistrationState::Assigned {
                hub: "h2.example.net".into()
            }
        );
    }

    #[tokio::test]
    async fn test_register_over_https() {
        let mut server = Server::new_async().await;

        let register = server
            .mock("PUT", "/0ne00000000/registrations/pytest/register")
            .match_query(Matcher::UrlEncoded(
                "api-version".into(),
                "2019-03-31".into(),
            ))
            .match_header(
                "authorization",
                Matcher::Regex("^SharedAccessSignature sr=0ne00000000%2Fregistrations%2Fpytest&".into()),
            )
            .match_body(Matcher::Json(json!({"registrationId": "pytest"})))
            .with_status(202)
            .with_header("content-type", "application/json")
            .with_body(r#"{"operationId": "op-1", "status": "assigning"}"#)
            .create_async()
            .await;

        let pending = server
            .mock("GET", "/0ne00000000/registrations/pytest/operations/op-1")
            .match_query(Matcher::Any)
            .with_status(503)
            .expect(1)
            .create_async()
            .await;

        let done = server
            .mock("GET", "/0ne00000000/registrations/pytest/operations/op-1")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "operationId": "op-1",
                    "status": "assigned",
                    "registrationState": {"assignedHub": "h.example.net"}
                })
                .to_string(),
            )
            .create_async()
            .await;

        let config = ProvisioningConfig {
            endpoint: Uri::from_host(&server.url()).unwrap(),
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let client = ProvisioningClient::https(config);

        let hub = client.register(&identity(), None).await.unwrap();
        assert_eq!(hub, "h.example.net");

        register.assert_async().await;
        pending.assert_async().await;
        done.assert_async().await;
    }
}
