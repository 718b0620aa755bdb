//! Propagation status written to a federated object's status subresource.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterState {
    Ok,
    Error,
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub name: String,
    pub state: ClusterState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ClusterStatus {
    pub fn ok(name: &str) -> Self { Self { name: name.to_string(), state: ClusterState::Ok, reason: None, message: None } }

    pub fn error(name: &str, reason: &str, message: impl Into<String>) -> Self {
        Self { name: name.to_string(), state: ClusterState::Error, reason: Some(reason.to_string()), message: Some(message.into()) }
    }

    pub fn pending(name: &str, reason: &str) -> Self {
        Self { name: name.to_string(), state: ClusterState::Pending, reason: Some(reason.to_string()), message: None }
    }
}

/// Aggregate over every cluster the object is placed in or being removed from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropagationStatus {
    pub clusters: Vec<ClusterStatus>,
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl PropagationStatus {
    pub fn from_clusters(mut clusters: Vec<ClusterStatus>) -> Self {
        clusters.sort_by(|a, b| a.name.cmp(&b.name));
        let failed = clusters.iter().filter(|c| c.state == ClusterState::Error).count();
        let cond = if failed == 0 {
            Condition { kind: "Propagation".into(), status: "True".into(), reason: "Ok".into(), message: None }
        } else {
            Condition {
                kind: "Propagation".into(),
                status: "False".into(),
                reason: "CheckClusters".into(),
                message: Some(format!("{} of {} clusters failed", failed, clusters.len())),
            }
        };
        Self { clusters, conditions: vec![cond] }
    }

    /// Whole-object failure, e.g. an invalid placement or override.
    pub fn config_error(message: &str) -> Self {
        Self {
            clusters: Vec::new(),
            conditions: vec![Condition {
                kind: "Propagation".into(),
                status: "False".into(),
                reason: "ConfigError".into(),
                message: Some(message.to_string()),
            }],
        }
    }

    pub fn to_value(&self) -> Value { serde_json::to_value(self).unwrap_or(Value::Null) }

    pub fn cluster(&self, name: &str) -> Option<&ClusterStatus> { self.clusters.iter().find(|c| c.name == name) }

    pub fn from_object(obj: &Value) -> Option<Self> { obj.get("status").and_then(|s| serde_json::from_value(s.clone()).ok()) }
}
