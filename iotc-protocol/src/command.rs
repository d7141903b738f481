use serde_json::{Value, json};

use crate::topic::{CommandTopic, METHOD_NAME, split_command_name};

pub const DEFAULT_RESPONSE_STATUS: u16 = 200;

/// Response sent for commands the handler did not answer
pub fn default_response() -> (u16, Value) {
    (
        DEFAULT_RESPONSE_STATUS,
        json!({"result": true, "data": "Command received"}),
    )
}

/// A command request as received from the hub
#[derive(Debug, Clone, PartialEq)]
pub struct CommandInvocation {
    pub component: Option<String>,
    pub name: String,
    pub request_id: String,
    pub payload: Value,
}

impl CommandInvocation {
    pub fn new(topic: CommandTopic, payload: &[u8]) -> Self {
        Self {
            component: topic.component,
            name: topic.name,
            request_id: topic.request_id,
            payload: parse_payload(payload),
        }
    }
}

/// A fire and forget command delivered as a cloud to device message
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueuedCommand {
    pub component: Option<String>,
    pub name: String,
    pub payload: Value,
}

impl EnqueuedCommand {
    /// Build from a cloud to device message. Messages without a
    /// `method-name` property are not commands
    pub fn from_message(properties: &[(String, String)], payload: &[u8]) -> Option<Self> {
        let (_, method_name) = properties.iter().find(|(key, _)| key == METHOD_NAME)?;
        let (component, name) = split_command_name(method_name);
        if name.is_empty() {
            return None;
        }
        Some(Self {
            component,
            name,
            payload: parse_payload(payload),
        })
    }
}

/// Decode a command payload.
///
/// JSON payloads wrapped as `{"commandRequest": {"value": x}}` are unwrapped
/// to `x`. Payloads that are not JSON are passed on as a string.
pub fn parse_payload(payload: &[u8]) -> Value {
    match serde_json::from_slice::<Value>(payload) {
        Ok(mut value) => match value.pointer_mut("/commandRequest/value") {
            Some(inner) => inner.take(),
            None => value,
        },
        Err(_) => Value::String(String::from_utf8_lossy(payload).into_owned()),
    }
}

/// Encode a command response payload
pub fn encode_response(payload: &Value) -> Vec<u8> {
    // serializing a Value cannot fail
    serde_json::to_vec(payload).unwrap_or_default()
}
