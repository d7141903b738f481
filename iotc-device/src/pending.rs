use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::Mutex as AsyncMutex;
use tracing::trace;

use crate::events::lock;
use crate::transport::{MessageId, Qos, Transport, TransportError};

/// A published message waiting for the transport to confirm delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    pub message_id: MessageId,
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Result of a publish
#[derive(Debug)]
pub(crate) struct Sent {
    pub message_id: MessageId,
    /// Set when the confirmation arrived before publish returned
    pub confirmed: Option<PendingMessage>,
}

#[derive(Default)]
struct Tracked {
    pending: HashMap<MessageId, PendingMessage>,
    /// Publishes waiting on the transport
    in_flight: usize,
    /// Confirmations that arrived while a publish was waiting on the
    /// transport, for ids not inserted yet
    early: HashSet<MessageId>,
}

/// Serializes publishes and tracks them until they are confirmed.
///
/// Publishes queue on their own lock. The pending map is never locked across
/// a transport call, so confirmations keep flowing while a publish is in
/// progress. Messages sent with [`Qos::AtMostOnce`] are never confirmed and
/// not tracked.
pub(crate) struct Outbox {
    transport: Arc<dyn Transport>,
    qos: Qos,
    sending: AsyncMutex<()>,
    tracked: Mutex<Tracked>,
}

/// Counts a publish as in flight until dropped
struct InFlight<'a>(&'a Mutex<Tracked>);

impl<'a> InFlight<'a> {
    fn enter(tracked: &'a Mutex<Tracked>) -> Self {
        lock(tracked).in_flight += 1;
        Self(tracked)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut tracked = lock(self.0);
        tracked.in_flight -= 1;
        if tracked.in_flight == 0 {
            tracked.early.clear();
        }
    }
}

impl Outbox {
    pub fn new(transport: Arc<dyn Transport>, qos: Qos) -> Self {
        Self {
            transport,
            qos,
            sending: AsyncMutex::new(()),
            tracked: Mutex::new(Tracked::default()),
        }
    }

    pub async fn publish(&self, topic: String, payload: Vec<u8>) -> Result<Sent, TransportError> {
        if self.qos == Qos::AtMostOnce {
            let message_id = self.send(&topic, &payload).await?;
            return Ok(Sent {
                message_id,
                confirmed: None,
            });
        }

        let in_flight = InFlight::enter(&self.tracked);
        let message_id = self.send(&topic, &payload).await?;

        let message = PendingMessage {
            message_id,
            topic,
            payload,
        };
        let confirmed = {
            let mut tracked = lock(&self.tracked);
            if tracked.early.remove(&message_id) {
                Some(message)
            } else {
                tracked.pending.insert(message_id, message);
                None
            }
        };
        drop(in_flight);

        Ok(Sent {
            message_id,
            confirmed,
        })
    }

    async fn send(&self, topic: &str, payload: &[u8]) -> Result<MessageId, TransportError> {
        let _sending = self.sending.lock().await;
        let message_id = self.transport.publish(topic, payload, self.qos).await?;
        trace!(message_id, topic, "published");
        Ok(message_id)
    }

    /// Remove a confirmed message. Unknown ids are remembered while a
    /// publish is waiting on the transport, as they may belong to it
    pub fn confirm(&self, message_id: MessageId) -> Option<PendingMessage> {
        let mut tracked = lock(&self.tracked);
        let message = tracked.pending.remove(&message_id);
        if message.is_none() && tracked.in_flight > 0 {
            tracked.early.insert(message_id);
        }
        message
    }

    /// Take every message that was never confirmed, oldest first
    pub fn drain(&self) -> Vec<PendingMessage> {
        let mut messages: Vec<_> = lock(&self.tracked)
            .pending
            .drain()
            .map(|(_, m)| m)
            .collect();
        messages.sort_by_key(|m| m.message_id);
        messages
    }
}
