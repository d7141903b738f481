use std::fmt::Display;

use thiserror::Error;

use crate::util::encode::{SYSTEM_PROPERTY_SAFE, quote, quote_plain, unquote};

/// Desired property patches pushed by the hub
pub const TWIN_DESIRED_FILTER: &str = "$iothub/twin/PATCH/properties/desired/#";

/// Responses to twin GET and PATCH requests
pub const TWIN_RESPONSE_FILTER: &str = "$iothub/twin/res/#";

/// Direct method (command) requests
pub const METHODS_FILTER: &str = "$iothub/methods/POST/#";

const TWIN_DESIRED_PREFIX: &str = "$iothub/twin/PATCH/properties/desired/";
const TWIN_RESPONSE_PREFIX: &str = "$iothub/twin/res/";
const METHODS_PREFIX: &str = "$iothub/methods/POST/";
const REQUEST_ID: &str = "$rid";

/// Message id system property
pub const MESSAGE_ID: &str = "$.mid";
/// Content type system property
pub const CONTENT_TYPE: &str = "$.ct";
/// Content encoding system property
pub const CONTENT_ENCODING: &str = "$.ce";

/// Custom property carrying the name of an enqueued command
pub const METHOD_NAME: &str = "method-name";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TopicError {
    #[error("unparseable command topic: {0}")]
    UnparseableCommandTopic(String),

    #[error("unparseable twin response topic: {0}")]
    UnparseableTwinResponse(String),
}

/// Cloud to device messages for the given device
pub fn cloud_to_device_filter(device_id: &str) -> String {
    format!("devices/{device_id}/messages/devicebound/#")
}

/// Every filter a connected device subscribes to
pub fn subscriptions(device_id: &str) -> [String; 4] {
    [
        TWIN_DESIRED_FILTER.to_owned(),
        TWIN_RESPONSE_FILTER.to_owned(),
        METHODS_FILTER.to_owned(),
        cloud_to_device_filter(device_id),
    ]
}

/// Build the telemetry topic, appending the given message properties.
///
/// Property names keep the characters used by system properties (`$.ct`),
/// values are fully escaped.
///
/// ```
/// use iotc_protocol::topic::telemetry_topic;
///
/// let topic = telemetry_topic("dev1", [("$.ct", "application/json"), ("$.ce", "utf-8")]);
/// assert_eq!(topic, "devices/dev1/messages/events/$.ct=application%2Fjson&$.ce=utf-8");
/// ```
pub fn telemetry_topic<I, K, V>(device_id: &str, properties: I) -> String
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let properties = properties
        .into_iter()
        .map(|(key, value)| {
            format!(
                "{}={}",
                quote(key.as_ref(), SYSTEM_PROPERTY_SAFE),
                quote_plain(value.as_ref())
            )
        })
        .collect::<Vec<_>>()
        .join("&");
    format!("devices/{device_id}/messages/events/{properties}")
}

pub fn twin_get_topic(request_id: impl Display) -> String {
    format!("$iothub/twin/GET/?$rid={request_id}")
}

pub fn twin_patch_topic(request_id: impl Display) -> String {
    format!("$iothub/twin/PATCH/properties/reported/?$rid={request_id}")
}

/// Topic for a command request, `{component}*{name}` for component commands.
///
/// Component and name are percent-encoded, so the `*` delimiter and the
/// `/?` query separator are never ambiguous.
pub fn command_topic(component: Option<&str>, name: &str, request_id: impl Display) -> String {
    let name = quote_plain(name);
    match component {
        Some(component) => {
            let component = quote_plain(component);
            format!("{METHODS_PREFIX}{component}*{name}/?$rid={request_id}")
        }
        None => format!("{METHODS_PREFIX}{name}/?$rid={request_id}"),
    }
}

pub fn command_response_topic(status: u16, request_id: impl Display) -> String {
    format!("$iothub/methods/res/{status}/?$rid={request_id}")
}

/// A command request topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTopic {
    pub component: Option<String>,
    pub name: String,
    pub request_id: String,
}

/// Split a command name as addressed by the model into component and name.
///
/// Names come as `name` or `component*name`, either may carry an interface
/// qualifier (`prefix:`) that is dropped.
pub fn split_command_name(raw: &str) -> (Option<String>, String) {
    fn unqualified(s: &str) -> &str {
        s.rsplit_once(':').map(|(_, name)| name).unwrap_or(s)
    }

    match raw.split_once('*') {
        Some((component, name)) => (
            Some(unqualified(component).to_owned()),
            unqualified(name).to_owned(),
        ),
        None => (None, unqualified(raw).to_owned()),
    }
}

/// Look up a parameter in a `k=v&k=v` query string
fn query_param<'a>(query: &'a str, key: &str) -> Option<&'a str> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v)
}

/// Split `{path}/?{query}` returning the path and the query
fn split_query(topic: &str) -> Option<(&str, &str)> {
    topic
        .rfind("/?")
        .map(|pos| (&topic[..pos], &topic[pos + 2..]))
}

/// Parse a command request topic
pub fn parse_command_topic(topic: &str) -> Result<CommandTopic, TopicError> {
    let err = || TopicError::UnparseableCommandTopic(topic.to_owned());

    let rest = topic.strip_prefix(METHODS_PREFIX).ok_or_else(err)?;
    let (segment, query) = split_query(rest).ok_or_else(err)?;
    let request_id = query_param(query, REQUEST_ID)
        .filter(|rid| !rid.is_empty())
        .ok_or_else(err)?;

    if segment.is_empty() || segment.contains('/') {
        return Err(err());
    }

    // split before decoding, escaped delimiters belong to the names
    let (component, name) = split_command_name(segment);
    if name.is_empty() || component.as_deref() == Some("") {
        return Err(err());
    }

    Ok(CommandTopic {
        component: component.as_deref().map(unquote),
        name: unquote(&name),
        request_id: request_id.to_owned(),
    })
}

/// Parse a command topic, falling back to the placeholder values
/// `("None", "None", "1")` when the topic cannot be parsed.
///
/// The session does not use this, it drops unparseable commands instead.
pub fn decode_command_topic(topic: &str) -> CommandTopic {
    parse_command_topic(topic).unwrap_or_else(|_| CommandTopic {
        component: Some("None".to_owned()),
        name: "None".to_owned(),
        request_id: "1".to_owned(),
    })
}

/// Decode a message property bag (`k=v&k=v`, percent-encoded)
pub fn parse_property_bag(bag: &str) -> Vec<(String, String)> {
    bag.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (unquote(k), unquote(v)),
            None => (unquote(pair), String::new()),
        })
        .collect()
}

/// What an inbound topic carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundTopic {
    /// A desired properties patch
    DesiredPatch,
    /// Response to a twin request. Status 200 carries the full twin
    TwinResponse {
        status: u16,
        request_id: String,
        version: Option<u64>,
    },
    /// A command expecting a response
    Command(CommandTopic),
    /// A cloud to device message and its properties
    CloudToDevice { properties: Vec<(String, String)> },
    /// Anything else
    Unknown,
}

/// Classify an inbound message by its topic
pub fn classify(device_id: &str, topic: &str) -> Result<InboundTopic, TopicError> {
    if topic.starts_with(TWIN_DESIRED_PREFIX) {
        return Ok(InboundTopic::DesiredPatch);
    }

    if let Some(rest) = topic.strip_prefix(TWIN_RESPONSE_PREFIX) {
        let err = || TopicError::UnparseableTwinResponse(topic.to_owned());
        let (status, query) = split_query(rest).ok_or_else(err)?;
        let status = status.parse::<u16>().map_err(|_| err())?;
        let request_id = query_param(query, REQUEST_ID).ok_or_else(err)?;
        let version = query_param(query, "$version").and_then(|v| v.parse().ok());
        return Ok(InboundTopic::TwinResponse {
            status,
            request_id: request_id.to_owned(),
            version,
        });
    }

    if topic.starts_with(METHODS_PREFIX) {
        return parse_command_topic(topic).map(InboundTopic::Command);
    }

    let c2d_prefix = format!("devices/{device_id}/messages/devicebound/");
    if let Some(bag) = topic.strip_prefix(&c2d_prefix) {
        return Ok(InboundTopic::CloudToDevice {
            properties: parse_property_bag(bag),
        });
    }

    Ok(InboundTopic::Unknown)
}
