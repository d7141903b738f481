use std::fmt;
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::CommandError;
use crate::events::{CommandHandler, lock};
use crate::protocol::command::{CommandInvocation, default_response, encode_response};
use crate::protocol::topic::command_response_topic;

#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub status: u16,
    pub payload: Value,
}

/// A command handed to the application
///
/// The command can be answered once through [`Command::reply`]. Dropping it
/// unanswered sends the default response.
pub struct Command {
    invocation: CommandInvocation,
    responder: Mutex<Option<oneshot::Sender<Reply>>>,
}

impl Command {
    fn new(invocation: CommandInvocation) -> (Self, oneshot::Receiver<Reply>) {
        let (tx, rx) = oneshot::channel();
        let command = Self {
            invocation,
            responder: Mutex::new(Some(tx)),
        };
        (command, rx)
    }

    pub fn component(&self) -> Option<&str> {
        self.invocation.component.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.invocation.name
    }

    pub fn request_id(&self) -> &str {
        &self.invocation.request_id
    }

    pub fn payload(&self) -> &Value {
        &self.invocation.payload
    }

    /// Answer the command
    pub fn reply(&self, status: u16, payload: Value) -> Result<(), CommandError> {
        let responder = lock(&self.responder)
            .take()
            .ok_or_else(|| CommandError::DuplicateReply(self.request_id().to_owned()))?;

        // the receiver is gone only when the session is shutting down
        let _ = responder.send(Reply { status, payload });
        Ok(())
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("component", &self.invocation.component)
            .field("name", &self.invocation.name)
            .field("request_id", &self.invocation.request_id)
            .finish()
    }
}

/// Run the handler for a command, returning the response topic and payload
pub(crate) async fn dispatch(
    invocation: CommandInvocation,
    handler: &CommandHandler,
) -> (String, Vec<u8>) {
    let request_id = invocation.request_id.clone();
    let (command, reply) = Command::new(invocation);
    handler(command).await;

    let reply = reply.await.unwrap_or_else(|_| {
        debug!(request_id = %request_id, "command not answered, sending default response");
        let (status, payload) = default_response();
        Reply { status, payload }
    });

    (
        command_response_topic(reply.status, &request_id),
        encode_response(&reply.payload),
    )
}
