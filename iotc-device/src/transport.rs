//! The message transport the session runs on.
//!
//! The session never touches the wire, it hands topics and payloads to a
//! [`Transport`] and consumes the [`TransportEvent`]s it produces.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::util::identity::X509Certificate;

/// Identifier the transport assigns to a publish
pub type MessageId = u64;

/// Delivery guarantee
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Qos {
    AtMostOnce,
    #[default]
    AtLeastOnce,
}

/// Everything needed to open a connection to the hub
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectParams {
    /// Hub host name
    pub host: String,
    pub client_id: String,
    pub username: String,
    /// SAS token, absent for certificate authentication
    pub password: Option<String>,
    pub certificate: Option<X509Certificate>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// An inbound message on one of the subscribed filters
    Message { topic: String, payload: Vec<u8> },
    /// A publish was confirmed by the broker
    Published { message_id: MessageId },
    /// The connection was lost
    Disconnected { reason: String },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("not authorized: {0}")]
    Unauthorized(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("transport disconnected")]
    Disconnected,
}

/// A publish/subscribe connection to the hub
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the connection. Events for the connection are delivered on the
    /// returned channel until it is closed or a `Disconnected` event is sent
    async fn connect(
        &self,
        params: &ConnectParams,
    ) -> Result<mpsc::Receiver<TransportEvent>, TransportError>;

    async fn subscribe(&self, filter: &str, qos: Qos) -> Result<(), TransportError>;

    /// Hand a message over for delivery. A `Published` event follows once
    /// the broker confirms it
    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: Qos,
    ) -> Result<MessageId, TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn connect(
        &self,
        params: &ConnectParams,
    ) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        self.as_ref().connect(params).await
    }

    async fn subscribe(&self, filter: &str, qos: Qos) -> Result<(), TransportError> {
        self.as_ref().subscribe(filter, qos).await
    }

    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: Qos,
    ) -> Result<MessageId, TransportError> {
        self.as_ref().publish(topic, payload, qos).await
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.as_ref().disconnect().await
    }
}
