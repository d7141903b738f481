use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::credentials::{CredentialCache, CredentialStore};
use crate::dispatch::dispatch;
use crate::error::SessionError;
use crate::events::{ConnectionStatus, Handler, HandlerTable, lock};
use crate::pending::{Outbox, PendingMessage};
use crate::protocol::command::{CommandInvocation, EnqueuedCommand};
use crate::protocol::topic::{self, InboundTopic};
use crate::protocol::twin::{self, TwinEngine};
use crate::provisioning::{HttpsProvisioning, ProvisioningClient, ProvisioningTransport};
use crate::transport::{ConnectParams, MessageId, Transport, TransportError, TransportEvent};
use crate::util::crypto::SasToken;
use crate::util::identity::DeviceIdentity;
use crate::util::json;
use crate::util::types::DeviceId;

/// Lifecycle of a session
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Provisioning,
    Connected,
    /// Reconnecting gave up
    Failed(String),
}

/// Desired state input for the properties worker
#[derive(Debug)]
enum PropertyInput {
    Patch(Value),
    Twin(Value),
}

#[derive(Clone)]
struct Queues {
    properties: mpsc::UnboundedSender<PropertyInput>,
    commands: mpsc::UnboundedSender<CommandInvocation>,
    enqueued: mpsc::UnboundedSender<EnqueuedCommand>,
}

struct Running {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Running {
    /// Cancel the tasks and wait for them, aborting those still running at
    /// the deadline
    async fn stop(self, grace: Duration) {
        self.cancel.cancel();
        let deadline = Instant::now() + grace;
        for mut task in self.tasks {
            if timeout_at(deadline, &mut task).await.is_err() {
                warn!("background task did not stop in time, aborting");
                task.abort();
            }
        }
    }
}

/// Builds a [`DeviceClient`]
pub struct DeviceClientBuilder {
    identity: DeviceIdentity,
    transport: Arc<dyn Transport>,
    config: SessionConfig,
    provisioning: Option<Arc<dyn ProvisioningTransport>>,
    store: Option<Arc<dyn CredentialStore>>,
}

impl DeviceClientBuilder {
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Talk to the provisioning service through `transport` instead of HTTPS
    pub fn provisioning_transport<P: ProvisioningTransport + 'static>(mut self, transport: P) -> Self {
        self.provisioning = Some(Arc::new(transport));
        self
    }

    /// Persist hub assignments in `store`
    pub fn credential_store<S: CredentialStore + 'static>(mut self, store: S) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    pub fn build(self) -> DeviceClient {
        let provisioning: Arc<dyn ProvisioningTransport> = match self.provisioning {
            Some(provisioning) => provisioning,
            None => Arc::new(HttpsProvisioning::new(&self.config.provisioning)),
        };
        let (state, _) = watch::channel(SessionState::Disconnected);
        let inner = Inner {
            outbox: Outbox::new(self.transport.clone(), self.config.qos),
            provisioning: ProvisioningClient::new(provisioning, self.config.provisioning.clone()),
            identity: self.identity,
            transport: self.transport,
            config: self.config,
            store: self.store,
            handlers: HandlerTable::new(),
            twin: Mutex::new(TwinEngine::new()),
            request_id: AtomicU64::new(1),
            credentials: Mutex::new(None),
            state,
            running: AsyncMutex::new(None),
        };
        DeviceClient {
            inner: Arc::new(inner),
        }
    }
}

/// A device connected to its hub
///
/// Connecting resolves the hub (from the cache or by provisioning), opens the
/// transport and starts the background tasks. Events are delivered to the
/// handlers registered with [`DeviceClient::on`], handlers may be registered
/// at any time and events received before are kept until they are.
#[derive(Clone)]
pub struct DeviceClient {
    inner: Arc<Inner>,
}

struct Inner {
    identity: DeviceIdentity,
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    provisioning: ProvisioningClient<Arc<dyn ProvisioningTransport>>,
    store: Option<Arc<dyn CredentialStore>>,
    handlers: HandlerTable,
    outbox: Outbox,
    twin: Mutex<TwinEngine>,
    request_id: AtomicU64,
    credentials: Mutex<Option<CredentialCache>>,
    state: watch::Sender<SessionState>,
    running: AsyncMutex<Option<Running>>,
}

impl DeviceClient {
    pub fn builder<T: Transport + 'static>(
        identity: DeviceIdentity,
        transport: T,
    ) -> DeviceClientBuilder {
        DeviceClientBuilder {
            identity,
            transport: Arc::new(transport),
            config: SessionConfig::default(),
            provisioning: None,
            store: None,
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        self.inner.identity.device_id()
    }

    /// Connect to the hub and start processing events.
    ///
    /// A session that gave up reconnecting may connect again. Calling
    /// [`DeviceClient::disconnect`] while connecting aborts the attempt.
    #[instrument(name = "connect", skip_all, fields(device_id = %self.device_id()), err)]
    pub async fn connect(&self) -> Result<(), SessionError> {
        let cancel = CancellationToken::new();
        {
            let mut running = self.inner.running.lock().await;
            match running.take() {
                Some(current) if !current.cancel.is_cancelled() => {
                    *running = Some(current);
                    return Err(SessionError::AlreadyConnected);
                }
                Some(failed) => failed.stop(self.inner.config.teardown_grace).await,
                None => {}
            }
            *running = Some(Running {
                cancel: cancel.clone(),
                tasks: Vec::new(),
            });
        }

        let established = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SessionError::Cancelled),
            result = self.inner.establish() => result,
        };

        // the slot is still ours unless disconnect cancelled the token
        let mut running = self.inner.running.lock().await;
        let events = match established {
            Ok(_) if cancel.is_cancelled() => {
                if let Err(err) = self.inner.transport.disconnect().await {
                    warn!("failed to close transport: {err}");
                }
                return Err(SessionError::Cancelled);
            }
            Ok(events) => events,
            Err(err) => {
                if !cancel.is_cancelled() {
                    running.take();
                    self.inner.state.send_replace(SessionState::Disconnected);
                }
                return Err(err);
            }
        };

        let tasks = self.inner.clone().start(events, cancel.clone());
        *running = Some(Running { cancel, tasks });

        self.inner.on_connected().await;
        Ok(())
    }

    /// Stop the background tasks and close the transport
    #[instrument(name = "disconnect", skip_all, fields(device_id = %self.device_id()))]
    pub async fn disconnect(&self) {
        let Some(running) = self.inner.running.lock().await.take() else {
            return;
        };

        running.cancel.cancel();
        if let Err(err) = self.inner.transport.disconnect().await {
            warn!("failed to close transport: {err}");
        }
        running.stop(self.inner.config.teardown_grace).await;

        self.inner.forget_unconfirmed("closed by client");

        self.inner.state.send_replace(SessionState::Disconnected);
        self.inner
            .notify(ConnectionStatus::Disconnected {
                reason: "closed by client".into(),
            })
            .await;
        info!("disconnected");
    }

    /// Register a handler, returning the one previously registered for the
    /// same event
    pub fn on(&self, handler: Handler) -> Option<Handler> {
        debug!(kind = ?handler.kind(), "registering handler");
        self.inner.handlers.set(handler)
    }

    /// Send a telemetry message with optional custom properties
    pub async fn send_telemetry<I, K, V>(
        &self,
        payload: &Value,
        properties: I,
    ) -> Result<MessageId, SessionError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        self.ensure_connected()?;

        let config = &self.inner.config;
        let message_id = Uuid::new_v4().to_string();
        let system = [
            (topic::MESSAGE_ID, message_id.as_str()),
            (topic::CONTENT_TYPE, config.content_type.as_str()),
            (topic::CONTENT_ENCODING, config.content_encoding.as_str()),
        ];
        let custom: Vec<(String, String)> = properties
            .into_iter()
            .map(|(k, v)| (k.as_ref().to_owned(), v.as_ref().to_owned()))
            .collect();
        let topic = topic::telemetry_topic(
            self.device_id(),
            system.into_iter().chain(
                custom
                    .iter()
                    .map(|(k, v)| (k.as_str(), v.as_str())),
            ),
        );

        let id = self
            .inner
            .publish(topic, payload.to_string().into_bytes())
            .await?;
        Ok(id)
    }

    /// Send a reported properties patch
    pub async fn send_property(&self, patch: &Value) -> Result<MessageId, SessionError> {
        self.ensure_connected()?;
        Ok(self.inner.publish_reported(patch).await?)
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.state.borrow() == SessionState::Connected
    }

    pub fn state(&self) -> SessionState {
        self.inner.state.borrow().clone()
    }

    /// Watch session state changes
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Credentials of the current hub assignment
    pub fn credentials(&self) -> Option<CredentialCache> {
        lock(&self.inner.credentials).clone()
    }

    fn ensure_connected(&self) -> Result<(), SessionError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(SessionError::NotConnected)
        }
    }
}

impl Inner {
    fn next_request_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn notify(&self, status: ConnectionStatus) {
        if let Some(handler) = self.handlers.connection_status() {
            handler(status).await;
        }
    }

    async fn publish(&self, topic: String, payload: Vec<u8>) -> Result<MessageId, TransportError> {
        let sent = self.outbox.publish(topic, payload).await?;
        if let Some(message) = sent.confirmed {
            self.message_sent(message);
        }
        Ok(sent.message_id)
    }

    async fn publish_reported(&self, patch: &Value) -> Result<MessageId, TransportError> {
        let topic = topic::twin_patch_topic(self.next_request_id());
        self.publish(topic, patch.to_string().into_bytes()).await
    }

    /// Open the transport and subscribe, provisioning if needed
    async fn establish(&self) -> Result<mpsc::Receiver<TransportEvent>, SessionError> {
        self.state.send_replace(SessionState::Connecting);

        // fail early on unusable keys
        self.identity.device_key()?;

        let (cache, fresh) = self.resolve_credentials().await?;
        match self.open(&cache).await {
            Err(SessionError::Transport(TransportError::Unauthorized(reason))) if !fresh => {
                warn!(hub = %cache.hub_name, "cached hub refused the device ({reason}), provisioning again");
                self.forget_credentials().await;
                let cache = self.provision().await?;
                self.open(&cache).await
            }
            result => result,
        }
    }

    /// Find the hub to connect to. The flag tells whether the credentials
    /// come from a provisioning round that just completed
    async fn resolve_credentials(&self) -> Result<(CredentialCache, bool), SessionError> {
        if let Some(cache) = lock(&self.credentials).clone() {
            return Ok((cache, false));
        }

        if let Some(store) = &self.store {
            match store.retrieve().await {
                Ok(Some(cache)) if cache.device_id == *self.identity.device_id() => {
                    debug!(hub = %cache.hub_name, "using cached credentials");
                    *lock(&self.credentials) = Some(cache.clone());
                    return Ok((cache, false));
                }
                Ok(_) => {}
                Err(err) => warn!("failed to read cached credentials: {err}"),
            }
        }

        Ok((self.provision().await?, true))
    }

    async fn forget_credentials(&self) {
        lock(&self.credentials).take();
        if let Some(store) = &self.store {
            if let Err(err) = store.clear().await {
                warn!("failed to clear cached credentials: {err}");
            }
        }
    }

    async fn provision(&self) -> Result<CredentialCache, SessionError> {
        self.state.send_replace(SessionState::Provisioning);
        let hub = self
            .provisioning
            .register(&self.identity, self.config.model_id.as_deref())
            .await?;

        let cache = CredentialCache {
            hub_name: hub,
            device_id: self.identity.device_id().clone(),
            device_key: self.identity.device_key()?.cloned(),
            certificate: self.identity.certificate().cloned(),
        };
        if let Some(store) = &self.store {
            if let Err(err) = store.persist(&cache).await {
                warn!("failed to store credentials: {err}");
            }
        }
        *lock(&self.credentials) = Some(cache.clone());
        Ok(cache)
    }

    fn connect_params(&self, cache: &CredentialCache) -> Result<ConnectParams, SessionError> {
        let username = format!(
            "{}/{}/?api-version={}",
            cache.hub_name, cache.device_id, self.config.hub_api_version
        );
        let password = match &cache.device_key {
            Some(key) => {
                let resource_uri = format!("{}/devices/{}", cache.hub_name, cache.device_id);
                let token = SasToken {
                    resource_uri: &resource_uri,
                    key,
                    ttl: self.config.sas_ttl,
                    key_name: None,
                }
                .build()?;
                Some(token)
            }
            None => None,
        };

        Ok(ConnectParams {
            host: cache.hub_name.clone(),
            client_id: cache.device_id.to_string(),
            username,
            password,
            certificate: cache.certificate.clone(),
        })
    }

    #[instrument(skip_all, fields(hub = %cache.hub_name))]
    async fn open(
        &self,
        cache: &CredentialCache,
    ) -> Result<mpsc::Receiver<TransportEvent>, SessionError> {
        let params = self.connect_params(cache)?;
        let events = self.transport.connect(&params).await?;
        for filter in topic::subscriptions(&cache.device_id) {
            self.transport.subscribe(&filter, self.config.qos).await?;
            trace!(filter = %filter, "subscribed");
        }
        Ok(events)
    }

    async fn on_connected(&self) {
        self.state.send_replace(SessionState::Connected);
        info!("connected");
        self.notify(ConnectionStatus::Connected).await;

        // the response carries the full twin
        let topic = topic::twin_get_topic(self.next_request_id());
        if let Err(err) = self.publish(topic, Vec::new()).await {
            warn!("failed to request twin: {err}");
        }
    }

    fn start(
        self: Arc<Self>,
        events: mpsc::Receiver<TransportEvent>,
        cancel: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let (properties, properties_rx) = mpsc::unbounded_channel();
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (enqueued, enqueued_rx) = mpsc::unbounded_channel();
        let queues = Queues {
            properties,
            commands,
            enqueued,
        };

        vec![
            tokio::spawn(self.clone().properties_worker(properties_rx, cancel.clone())),
            tokio::spawn(self.clone().command_worker(commands_rx, cancel.clone())),
            tokio::spawn(self.clone().enqueued_worker(enqueued_rx, cancel.clone())),
            tokio::spawn(self.monitor(events, queues, cancel)),
        ]
    }

    /// Keep the connection alive, reconnecting when it is lost
    async fn monitor(
        self: Arc<Self>,
        mut events: mpsc::Receiver<TransportEvent>,
        queues: Queues,
        cancel: CancellationToken,
    ) {
        loop {
            let router = tokio::spawn(self.clone().route(events, queues.clone(), cancel.clone()));
            let reason = match router.await {
                Ok(Some(reason)) => reason,
                Ok(None) => return,
                Err(err) => format!("event router failed: {err}"),
            };
            if cancel.is_cancelled() {
                return;
            }

            warn!("connection lost: {reason}");
            self.forget_unconfirmed("connection lost");
            self.state.send_replace(SessionState::Disconnected);
            self.notify(ConnectionStatus::Disconnected { reason }).await;

            match self.reconnect(&cancel).await {
                Some(next) => events = next,
                None => return,
            }
        }
    }

    async fn reconnect(
        &self,
        cancel: &CancellationToken,
    ) -> Option<mpsc::Receiver<TransportEvent>> {
        let mut reason = String::from("no reconnect attempts configured");
        for attempt in 1..=self.config.max_reconnect_attempts {
            let delay = self.config.reconnect_delay(attempt);
            debug!(attempt, ?delay, "reconnecting");
            self.notify(ConnectionStatus::Reconnecting { attempt }).await;

            let result = tokio::select! {
                _ = cancel.cancelled() => return None,
                result = async {
                    sleep(delay).await;
                    self.establish().await
                } => result,
            };

            match result {
                Ok(events) => {
                    if cancel.is_cancelled() {
                        return None;
                    }
                    self.on_connected().await;
                    return Some(events);
                }
                Err(err) if err.is_recoverable() => {
                    warn!(attempt, "reconnect failed: {err}");
                    reason = err.to_string();
                }
                Err(err) => {
                    error!(attempt, "reconnect failed permanently: {err}");
                    reason = err.to_string();
                    break;
                }
            }
        }

        error!("giving up reconnecting: {reason}");
        // stops the workers and lets connect() start over
        cancel.cancel();
        self.state.send_replace(SessionState::Failed(reason.clone()));
        self.notify(ConnectionStatus::Failed { reason }).await;
        None
    }

    /// Read transport events until the connection drops. Returns the reason
    /// or `None` if cancelled
    async fn route(
        self: Arc<Self>,
        mut events: mpsc::Receiver<TransportEvent>,
        queues: Queues,
        cancel: CancellationToken,
    ) -> Option<String> {
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                event = events.recv() => event,
            };

            match event {
                Some(TransportEvent::Message { topic, payload }) => {
                    self.route_message(&topic, payload, &queues)
                }
                Some(TransportEvent::Published { message_id }) => self.confirmed(message_id),
                Some(TransportEvent::Disconnected { reason }) => return Some(reason),
                None => return Some("transport closed the event stream".into()),
            }
        }
    }

    fn route_message(&self, topic: &str, payload: Vec<u8>, queues: &Queues) {
        let inbound = match topic::classify(self.identity.device_id(), topic) {
            Ok(inbound) => inbound,
            Err(err) => {
                warn!("dropping message: {err}");
                return;
            }
        };

        let queued = match inbound {
            InboundTopic::DesiredPatch => match serde_json::from_slice(&payload) {
                Ok(patch) => queues.properties.send(PropertyInput::Patch(patch)).is_ok(),
                Err(err) => {
                    warn!("dropping desired patch that is not JSON: {err}");
                    return;
                }
            },
            InboundTopic::TwinResponse {
                status: 200,
                request_id,
                ..
            } => match serde_json::from_slice(&payload) {
                Ok(twin) => {
                    debug!(request_id = %request_id, "received twin");
                    queues.properties.send(PropertyInput::Twin(twin)).is_ok()
                }
                Err(err) => {
                    warn!("dropping twin that is not JSON: {err}");
                    return;
                }
            },
            InboundTopic::TwinResponse {
                status,
                request_id,
                version,
            } => {
                if status < 300 {
                    trace!(request_id = %request_id, ?version, status, "reported properties accepted");
                } else {
                    warn!(request_id = %request_id, status, "twin request failed");
                }
                return;
            }
            InboundTopic::Command(command) => queues
                .commands
                .send(CommandInvocation::new(command, &payload))
                .is_ok(),
            InboundTopic::CloudToDevice { properties } => {
                match EnqueuedCommand::from_message(&properties, &payload) {
                    Some(command) => queues.enqueued.send(command).is_ok(),
                    None => {
                        debug!("ignoring cloud to device message without a command");
                        return;
                    }
                }
            }
            InboundTopic::Unknown => {
                debug!(topic, "ignoring message on unknown topic");
                return;
            }
        };

        if !queued {
            debug!(topic, "worker stopped, dropping message");
        }
    }

    fn confirmed(&self, message_id: MessageId) {
        match self.outbox.confirm(message_id) {
            Some(message) => self.message_sent(message),
            None => trace!(message_id, "confirmation for an untracked message"),
        }
    }

    fn message_sent(&self, message: PendingMessage) {
        if let Some(handler) = self.handlers.message_sent() {
            tokio::spawn(handler(message));
        }
    }

    /// Log messages the hub will never confirm
    fn forget_unconfirmed(&self, why: &str) {
        let unconfirmed = self.outbox.drain();
        if unconfirmed.is_empty() {
            return;
        }
        warn!(count = unconfirmed.len(), "{why}, messages never confirmed by the hub");
        for message in unconfirmed {
            debug!(message_id = message.message_id, topic = %message.topic, "unconfirmed");
        }
    }

    async fn properties_worker(
        self: Arc<Self>,
        mut inputs: mpsc::UnboundedReceiver<PropertyInput>,
        cancel: CancellationToken,
    ) {
        loop {
            let input = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                input = inputs.recv() => match input {
                    Some(input) => input,
                    None => return,
                },
            };

            let applied = {
                let mut twin = lock(&self.twin);
                match &input {
                    PropertyInput::Patch(patch) => twin.apply_desired_patch(patch),
                    PropertyInput::Twin(full) => twin.sync_twin(full),
                }
            };
            let updates = match applied {
                Ok(updates) => updates,
                Err(err) => {
                    let (PropertyInput::Patch(value) | PropertyInput::Twin(value)) = &input;
                    warn!(input = %json::preview(value, 200), "dropping desired properties: {err}");
                    continue;
                }
            };
            if updates.is_empty() {
                continue;
            }

            let Some(handler) = self
                .handlers
                .wait_for(HandlerTable::properties, &cancel)
                .await
            else {
                return;
            };

            let mut acks = Vec::new();
            for update in updates {
                let accepted = tokio::select! {
                    _ = cancel.cancelled() => return,
                    accepted = handler(update.clone()) => accepted,
                };
                acks.extend(twin::build_ack(&update, accepted));
            }
            if acks.is_empty() {
                continue;
            }

            let patch = twin::merge_patches(acks);
            if let Err(err) = self.publish_reported(&patch).await {
                warn!("failed to acknowledge properties: {err}");
            }
        }
    }

    async fn command_worker(
        self: Arc<Self>,
        mut invocations: mpsc::UnboundedReceiver<CommandInvocation>,
        cancel: CancellationToken,
    ) {
        loop {
            let invocation = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                invocation = invocations.recv() => match invocation {
                    Some(invocation) => invocation,
                    None => return,
                },
            };

            let Some(handler) = self.handlers.wait_for(HandlerTable::command, &cancel).await else {
                return;
            };

            let request_id = invocation.request_id.clone();
            let (topic, payload) = tokio::select! {
                _ = cancel.cancelled() => return,
                response = dispatch(invocation, &handler) => response,
            };
            if let Err(err) = self.publish(topic, payload).await {
                warn!(request_id = %request_id, "failed to send command response: {err}");
            }
        }
    }

    async fn enqueued_worker(
        self: Arc<Self>,
        mut commands: mpsc::UnboundedReceiver<EnqueuedCommand>,
        cancel: CancellationToken,
    ) {
        loop {
            let command = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                command = commands.recv() => match command {
                    Some(command) => command,
                    None => return,
                },
            };

            let Some(handler) = self
                .handlers
                .wait_for(HandlerTable::enqueued_command, &cancel)
                .await
            else {
                return;
            };

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = handler(command) => {}
            }
        }
    }
}
