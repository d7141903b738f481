//! In-memory collaborators for tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::credentials::{CredentialCache, CredentialStore};
use crate::events::lock;
use crate::provisioning::{
    Assignment, OperationState, OperationStatus, ProvisioningTransport, RegistrationRequest,
    TransportError as ProvisioningTransportError,
};
use crate::transport::{ConnectParams, MessageId, Qos, Transport, TransportError, TransportEvent};
use crate::util::store::StoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub message_id: MessageId,
    pub topic: String,
    pub payload: Vec<u8>,
}

impl Published {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).unwrap()
    }
}

#[derive(Default)]
pub struct MockState {
    pub connect_results: VecDeque<TransportError>,
    pub connects: Vec<ConnectParams>,
    pub subscriptions: Vec<(String, Qos)>,
    pub published: Vec<Published>,
    pub disconnects: usize,
    events: Option<mpsc::Sender<TransportEvent>>,
    next_id: MessageId,
}

/// A transport recording everything the session does
pub struct MockTransport {
    state: Mutex<MockState>,
    changed: watch::Sender<u64>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        let (changed, _) = watch::channel(0);
        Arc::new(Self {
            state: Mutex::new(MockState::default()),
            changed,
        })
    }

    fn update<T>(&self, f: impl FnOnce(&mut MockState) -> T) -> T {
        let result = f(&mut lock(&self.state));
        self.changed.send_modify(|generation| *generation += 1);
        result
    }

    /// Fail the next connect attempt with `err`
    pub fn fail_next_connect(&self, err: TransportError) {
        self.update(|state| state.connect_results.push_back(err));
    }

    pub fn connects(&self) -> Vec<ConnectParams> {
        lock(&self.state).connects.clone()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        lock(&self.state)
            .subscriptions
            .iter()
            .map(|(filter, _)| filter.clone())
            .collect()
    }

    pub fn published(&self) -> Vec<Published> {
        lock(&self.state).published.clone()
    }

    pub fn disconnects(&self) -> usize {
        lock(&self.state).disconnects
    }

    /// Wait until `f` returns a value
    pub async fn wait_until<T>(&self, f: impl Fn(&MockState) -> Option<T>) -> T {
        let mut changed = self.changed.subscribe();
        tokio::time::timeout(Duration::from_secs(30), async {
            loop {
                let found = f(&lock(&self.state));
                if let Some(value) = found {
                    return value;
                }
                changed.changed().await.unwrap();
            }
        })
        .await
        .expect("timed out waiting for the transport")
    }

    pub async fn wait_published(&self, count: usize) -> Vec<Published> {
        self.wait_until(|state| {
            (state.published.len() >= count).then(|| state.published.clone())
        })
        .await
    }

    pub async fn wait_connects(&self, count: usize) -> Vec<ConnectParams> {
        self.wait_until(|state| (state.connects.len() >= count).then(|| state.connects.clone()))
            .await
    }

    async fn send(&self, event: TransportEvent) {
        let events = lock(&self.state).events.clone();
        events
            .expect("transport is not connected")
            .send(event)
            .await
            .unwrap();
    }

    /// Deliver an inbound message
    pub async fn inject(&self, topic: &str, payload: impl Into<Vec<u8>>) {
        self.send(TransportEvent::Message {
            topic: topic.to_owned(),
            payload: payload.into(),
        })
        .await
    }

    /// Confirm delivery of a publish
    pub async fn confirm(&self, message_id: MessageId) {
        self.send(TransportEvent::Published { message_id }).await
    }

    /// Lose the connection
    pub async fn drop_connection(&self, reason: &str) {
        self.send(TransportEvent::Disconnected {
            reason: reason.to_owned(),
        })
        .await;
        self.update(|state| state.events = None);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(
        &self,
        params: &ConnectParams,
    ) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        self.update(|state| {
            state.connects.push(params.clone());
            if let Some(err) = state.connect_results.pop_front() {
                return Err(err);
            }
            let (tx, rx) = mpsc::channel(64);
            state.events = Some(tx);
            Ok(rx)
        })
    }

    async fn subscribe(&self, filter: &str, qos: Qos) -> Result<(), TransportError> {
        self.update(|state| state.subscriptions.push((filter.to_owned(), qos)));
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        _qos: Qos,
    ) -> Result<MessageId, TransportError> {
        self.update(|state| {
            if state.events.is_none() {
                return Err(TransportError::Disconnected);
            }
            state.next_id += 1;
            let message_id = state.next_id;
            state.published.push(Published {
                message_id,
                topic: topic.to_owned(),
                payload: payload.to_vec(),
            });
            Ok(message_id)
        })
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.update(|state| {
            state.events = None;
            state.disconnects += 1;
        });
        Ok(())
    }
}

/// A provisioning service assigning every device right away
pub struct MockProvisioning {
    hub: String,
    registrations: AtomicUsize,
    stalled: bool,
}

impl MockProvisioning {
    pub fn new(hub: &str) -> Arc<Self> {
        Arc::new(Self {
            hub: hub.to_owned(),
            registrations: AtomicUsize::new(0),
            stalled: false,
        })
    }

    /// A service that never answers
    pub fn stalled() -> Arc<Self> {
        Arc::new(Self {
            hub: String::new(),
            registrations: AtomicUsize::new(0),
            stalled: true,
        })
    }

    pub fn registrations(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProvisioningTransport for MockProvisioning {
    async fn register(
        &self,
        request: &RegistrationRequest,
    ) -> Result<OperationStatus, ProvisioningTransportError> {
        self.registrations.fetch_add(1, Ordering::SeqCst);
        if self.stalled {
            std::future::pending::<()>().await;
        }
        Ok(OperationStatus {
            operation_id: Some("op-1".into()),
            status: OperationState::Assigned,
            registration_state: Some(Assignment {
                assigned_hub: Some(self.hub.clone()),
                device_id: Some(request.registration_id.to_string()),
                error_message: None,
            }),
            retry_after: None,
        })
    }

    async fn operation_status(
        &self,
        _request: &RegistrationRequest,
        _operation_id: &str,
    ) -> Result<OperationStatus, ProvisioningTransportError> {
        Err(ProvisioningTransportError::InvalidResponse(
            "unexpected status poll".into(),
        ))
    }
}

/// A credential store kept in memory
#[derive(Default)]
pub struct MemoryStore {
    cache: Mutex<Option<CredentialCache>>,
}

impl MemoryStore {
    pub fn with(cache: CredentialCache) -> Arc<Self> {
        Arc::new(Self {
            cache: Mutex::new(Some(cache)),
        })
    }

    pub fn cache(&self) -> Option<CredentialCache> {
        lock(&self.cache).clone()
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn retrieve(&self) -> Result<Option<CredentialCache>, StoreError> {
        Ok(self.cache())
    }

    async fn persist(&self, cache: &CredentialCache) -> Result<(), StoreError> {
        *lock(&self.cache) = Some(cache.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        *lock(&self.cache) = None;
        Ok(())
    }
}
