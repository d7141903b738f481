use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::{debug, warn};

/// Marker key identifying a component in a twin document
pub const COMPONENT_MARKER: &str = "__t";
const VERSION: &str = "$version";

pub const DEFAULT_ACK_STATUS: u16 = 200;
pub const DEFAULT_ACK_MESSAGE: &str = "Completed";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TwinError {
    #[error("malformed twin patch: {0}")]
    MalformedTwinPatch(&'static str),

    #[error("stale twin version {received}, version {applied} was already applied")]
    StaleTwinVersion { received: u64, applied: u64 },
}

/// A top level entry of a desired properties document
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PropertyContainer<'a> {
    Leaf(&'a Value),
    Component(&'a Map<String, Value>),
}

impl<'a> PropertyContainer<'a> {
    /// Components are objects tagged with `"__t": "c"`
    pub fn detect(value: &'a Value) -> Self {
        match value {
            Value::Object(map)
                if map.get(COMPONENT_MARKER).and_then(Value::as_str) == Some("c") =>
            {
                Self::Component(map)
            }
            other => Self::Leaf(other),
        }
    }
}

/// A desired property change for the application to handle
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyUpdate {
    pub component: Option<String>,
    pub name: String,
    pub value: Value,
    /// Desired version the update belongs to
    pub version: u64,
}

/// Properties may be sent as `{"value": x}` or as `x`
fn leaf_value(value: &Value) -> Value {
    match value {
        Value::Object(map) if map.contains_key("value") => map["value"].clone(),
        other => other.clone(),
    }
}

/// Expand a desired document into updates, keeping the document order.
fn expand(desired: &Map<String, Value>, version: u64) -> Vec<PropertyUpdate> {
    let mut updates = Vec::new();
    // `$version`, `$metadata` and friends are not properties
    for (key, value) in desired.iter().filter(|(k, _)| !k.starts_with('$')) {
        match PropertyContainer::detect(value) {
            PropertyContainer::Component(props) => {
                for (name, value) in props.iter().filter(|(k, _)| *k != COMPONENT_MARKER) {
                    updates.push(PropertyUpdate {
                        component: Some(key.clone()),
                        name: name.clone(),
                        value: leaf_value(value),
                        version,
                    });
                }
            }
            PropertyContainer::Leaf(value) => updates.push(PropertyUpdate {
                component: None,
                name: key.clone(),
                value: leaf_value(value),
                version,
            }),
        }
    }
    updates
}

fn desired_version(desired: &Map<String, Value>) -> Result<u64, TwinError> {
    desired
        .get(VERSION)
        .ok_or(TwinError::MalformedTwinPatch("missing $version"))?
        .as_u64()
        .ok_or(TwinError::MalformedTwinPatch("$version is not a number"))
}

/// Tracks the desired twin version and turns desired documents into
/// property updates
#[derive(Debug, Default, Clone)]
pub struct TwinEngine {
    version: Option<u64>,
}

impl TwinEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last applied desired version
    pub fn version(&self) -> Option<u64> {
        self.version
    }

    fn advance(&mut self, version: u64) -> Result<(), TwinError> {
        if let Some(applied) = self.version {
            if version < applied {
                return Err(TwinError::StaleTwinVersion {
                    received: version,
                    applied,
                });
            }
        }
        self.version = Some(version);
        Ok(())
    }

    /// Apply a desired properties patch
    ///
    /// ```
    /// use iotc_protocol::twin::TwinEngine;
    /// use serde_json::json;
    ///
    /// let mut twin = TwinEngine::new();
    /// let updates = twin.apply_desired_patch(&json!({"prop1": {"value": 40}, "$version": 5})).unwrap();
    /// assert_eq!(updates.len(), 1);
    /// assert_eq!(updates[0].component, None);
    /// assert_eq!(updates[0].name, "prop1");
    /// assert_eq!(updates[0].value, json!(40));
    /// ```
    pub fn apply_desired_patch(&mut self, patch: &Value) -> Result<Vec<PropertyUpdate>, TwinError> {
        let patch = patch
            .as_object()
            .ok_or(TwinError::MalformedTwinPatch("patch is not an object"))?;
        let version = desired_version(patch)?;
        self.advance(version)?;

        debug!(version, "applying desired patch");
        Ok(expand(patch, version))
    }

    /// Compare a full twin (`{"desired": .., "reported": ..}`) and return the
    /// desired properties that were never acknowledged at the current desired
    /// version
    pub fn sync_twin(&mut self, twin: &Value) -> Result<Vec<PropertyUpdate>, TwinError> {
        let desired = twin
            .get("desired")
            .and_then(Value::as_object)
            .ok_or(TwinError::MalformedTwinPatch("twin has no desired properties"))?;
        let version = desired_version(desired)?;
        self.advance(version)?;

        let empty = Map::new();
        let reported = twin
            .get("reported")
            .and_then(Value::as_object)
            .unwrap_or(&empty);

        let pending: Vec<_> = expand(desired, version)
            .into_iter()
            .filter(|update| !is_acknowledged(reported, update))
            .collect();
        debug!(version, pending = pending.len(), "synchronized twin");
        Ok(pending)
    }
}

fn is_acknowledged(reported: &Map<String, Value>, update: &PropertyUpdate) -> bool {
    let entry = match &update.component {
        Some(component) => reported
            .get(component)
            .and_then(|c| c.get(&update.name)),
        None => reported.get(&update.name),
    };
    entry
        .and_then(|e| e.get("av"))
        .and_then(Value::as_u64)
        .is_some_and(|av| av >= update.version)
}

/// Build the reported patch acknowledging `update` with the default status
pub fn build_ack(update: &PropertyUpdate, accepted: bool) -> Option<Value> {
    build_ack_with_status(update, accepted, DEFAULT_ACK_STATUS, DEFAULT_ACK_MESSAGE)
}

/// Build the reported patch acknowledging `update`.
///
/// Rejected updates are not acknowledged and return `None`.
pub fn build_ack_with_status(
    update: &PropertyUpdate,
    accepted: bool,
    status: u16,
    message: &str,
) -> Option<Value> {
    if !accepted {
        warn!(
            component = update.component.as_deref(),
            name = %update.name,
            "property not acknowledged"
        );
        return None;
    }

    let ack = json!({
        update.name.as_str(): {
            "value": update.value,
            "ac": status,
            "ad": message,
            "av": update.version,
        }
    });

    Some(match &update.component {
        Some(component) => {
            let mut nested = Map::new();
            nested.insert(COMPONENT_MARKER.to_owned(), json!("c"));
            if let Value::Object(props) = ack {
                nested.extend(props);
            }
            json!({ component.as_str(): nested })
        }
        None => ack,
    })
}

/// Merge reported patches into a single document
pub fn merge_patches(patches: impl IntoIterator<Item = Value>) -> Value {
    fn merge(target: &mut Map<String, Value>, source: Map<String, Value>) {
        for (key, value) in source {
            match value {
                Value::Object(incoming) if matches!(target.get(&key), Some(Value::Object(_))) => {
                    if let Some(Value::Object(existing)) = target.get_mut(&key) {
                        merge(existing, incoming);
                    }
                }
                value => {
                    target.insert(key, value);
                }
            }
        }
    }

    let mut merged = Map::new();
    for patch in patches {
        if let Value::Object(patch) = patch {
            merge(&mut merged, patch);
        }
    }
    Value::Object(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_property_patch() {
        let mut twin = TwinEngine::new();
        let updates = twin
            .apply_desired_patch(&json!({"prop1": {"value": 40}, "$version": 5}))
            .unwrap();

        assert_eq!(
            updates,
            vec![PropertyUpdate {
                component: None,
                name: "prop1".into(),
                value: json!(40),
                version: 5,
            }]
        );
        assert_eq!(twin.version(), Some(5));
    }

    #[test]
    fn test_component_property_patch() {
        let mut twin = TwinEngine::new();
        let updates = twin
            .apply_desired_patch(&json!({
                "component1": {"__t": "c", "prop1": {"value": "v1"}},
                "$version": 1
            }))
            .unwrap();

        assert_eq!(
            updates,
            vec![PropertyUpdate {
                component: Some("component1".into()),
                name: "prop1".into(),
                value: json!("v1"),
                version: 1,
            }]
        );
    }

    #[test]
    fn test_patch_keeps_key_order() {
        let mut twin = TwinEngine::new();
        let patch: Value = serde_json::from_str(
            r#"{"zeta": 1, "$version": 2, "alpha": {"value": 2}, "comp": {"__t": "c", "b": 3, "a": 4}, "mid": {"nested": true}}"#,
        )
        .unwrap();
        let updates = twin.apply_desired_patch(&patch).unwrap();

        let names: Vec<_> = updates
            .iter()
            .map(|u| (u.component.as_deref(), u.name.as_str()))
            .collect();
        assert_eq!(
            names,
            vec![
                (None, "zeta"),
                (None, "alpha"),
                (Some("comp"), "b"),
                (Some("comp"), "a"),
                (None, "mid"),
            ]
        );
        // raw leaves are passed through as they are
        assert_eq!(updates[0].value, json!(1));
        assert_eq!(updates[4].value, json!({"nested": true}));
    }

    #[test]
    fn test_patch_without_version_is_malformed() {
        let mut twin = TwinEngine::new();
        assert_eq!(
            twin.apply_desired_patch(&json!({"prop1": {"value": 40}})),
            Err(TwinError::MalformedTwinPatch("missing $version"))
        );
        assert!(twin.apply_desired_patch(&json!([1, 2])).is_err());
        assert_eq!(twin.version(), None);
    }

    #[test]
    fn test_stale_patch_is_rejected() {
        let mut twin = TwinEngine::new();
        twin.apply_desired_patch(&json!({"prop1": 1, "$version": 5}))
            .unwrap();

        assert_eq!(
            twin.apply_desired_patch(&json!({"prop1": 0, "$version": 4})),
            Err(TwinError::StaleTwinVersion {
                received: 4,
                applied: 5
            })
        );
        assert_eq!(twin.version(), Some(5));

        // the same version is applied again
        assert!(
            twin.apply_desired_patch(&json!({"prop1": 2, "$version": 5}))
                .is_ok()
        );
    }

    #[test]
    fn test_ack_for_root_property() {
        let update = PropertyUpdate {
            component: None,
            name: "prop1".into(),
            value: json!(40),
            version: 5,
        };
        assert_eq!(
            build_ack(&update, true),
            Some(json!({"prop1": {"value": 40, "ac": 200, "ad": "Completed", "av": 5}}))
        );
    }

    #[test]
    fn test_ack_for_component_property() {
        let update = PropertyUpdate {
            component: Some("component1".into()),
            name: "prop1".into(),
            value: json!("v1"),
            version: 1,
        };
        assert_eq!(
            build_ack_with_status(&update, true, 400, "Out of range"),
            Some(json!({
                "component1": {
                    "__t": "c",
                    "prop1": {"value": "v1", "ac": 400, "ad": "Out of range", "av": 1}
                }
            }))
        );
    }

    #[test]
    fn test_rejected_update_has_no_ack() {
        let update = PropertyUpdate {
            component: None,
            name: "prop1".into(),
            value: json!(40),
            version: 5,
        };
        assert_eq!(build_ack(&update, false), None);
        assert_eq!(build_ack(&update, false), None);
    }

    #[test]
    fn test_sync_twin_returns_unacknowledged_properties() {
        let mut twin = TwinEngine::new();
        let pending = twin
            .sync_twin(&json!({
                "desired": {
                    "acked": {"value": 1},
                    "outdated": {"value": 2},
                    "missing": {"value": 3},
                    "component1": {"__t": "c", "prop1": {"value": "v1"}, "prop2": 4},
                    "$version": 7
                },
                "reported": {
                    "acked": {"value": 1, "ac": 200, "ad": "Completed", "av": 7},
                    "outdated": {"value": 1, "ac": 200, "ad": "Completed", "av": 6},
                    "component1": {
                        "__t": "c",
                        "prop1": {"value": "v1", "ac": 200, "ad": "Completed", "av": 7}
                    },
                    "$version": 3
                }
            }))
            .unwrap();

        let names: Vec<_> = pending
            .iter()
            .map(|u| (u.component.as_deref(), u.name.as_str(), u.version))
            .collect();
        assert_eq!(
            names,
            vec![
                (None, "outdated", 7),
                (None, "missing", 7),
                (Some("component1"), "prop2", 7),
            ]
        );
        assert_eq!(twin.version(), Some(7));
    }

    #[test]
    fn test_sync_twin_without_desired_is_malformed() {
        let mut twin = TwinEngine::new();
        assert!(matches!(
            twin.sync_twin(&json!({"reported": {}})),
            Err(TwinError::MalformedTwinPatch(_))
        ));
        assert!(matches!(
            twin.sync_twin(&json!({"desired": {"a": 1}})),
            Err(TwinError::MalformedTwinPatch(_))
        ));
    }

    #[test]
    fn test_merge_patches() {
        let merged = merge_patches([
            json!({"a": {"value": 1, "av": 2}}),
            json!({"component1": {"__t": "c", "p1": {"value": 1}}}),
            json!({"component1": {"__t": "c", "p2": {"value": 2}}}),
        ]);
        assert_eq!(
            merged,
            json!({
                "a": {"value": 1, "av": 2},
                "component1": {"__t": "c", "p1": {"value": 1}, "p2": {"value": 2}}
            })
        );
    }
}
