use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::status::ClusterStatusEntity;

/// Stable identity of a managed cluster.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct RuntimeId(pub String);

impl RuntimeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RuntimeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RuntimeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RuntimeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A component declared in a cluster's desired configuration.
///
/// `configuration` holds per-component overrides as dotted keys
/// (e.g. `istio.gateway.replicas`) merged into a nested structure at dispatch
/// time; see the `overrides` module.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Component {
    pub component: String,
    pub namespace: String,
    /// Component version; falls back to the configuration's stack version.
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub configuration: BTreeMap<String, Value>,
}

impl Component {
    pub fn new(component: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            namespace: namespace.into(),
            version: None,
            configuration: BTreeMap::new(),
        }
    }
}

/// Order of component operations for a deletion run.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteStrategy {
    /// Delete in declared order.
    Forward,
    /// Delete in reverse declared order (dependents before dependencies).
    #[default]
    Reverse,
}

impl FromStr for DeleteStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "forward" => Ok(DeleteStrategy::Forward),
            "reverse" => Ok(DeleteStrategy::Reverse),
            other => Err(format!("unknown delete strategy '{other}'")),
        }
    }
}

/// A managed cluster. Re-registration supersedes the previous version rather
/// than mutating it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClusterEntity {
    pub runtime_id: RuntimeId,
    pub version: i64,
    pub kubeconfig: String,
    pub created: DateTime<Utc>,
}

/// A versioned desired state for a cluster. Immutable once created.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClusterConfigurationEntity {
    pub runtime_id: RuntimeId,
    pub version: i64,
    pub cluster_version: i64,
    pub kyma_version: String,
    #[serde(default)]
    pub kyma_profile: Option<String>,
    pub components: Vec<Component>,
    pub created: DateTime<Utc>,
}

impl ClusterConfigurationEntity {
    pub fn get_component(&self, name: &str) -> Option<&Component> {
        self.components.iter().find(|c| c.component == name)
    }

    /// Compute the ordered operation tiers for this configuration.
    ///
    /// Reconcile runs: declared components matching a pre-component name form
    /// tier 0 (they may run concurrently), every remaining component then gets
    /// its own tier in declared order. Delete runs do not group a
    /// pre-component prefix and order tiers by the delete strategy.
    pub fn reconciliation_sequence(
        &self,
        pre_components: &[String],
        delete_strategy: DeleteStrategy,
        deletion: bool,
    ) -> ReconciliationSequence {
        let mut queue: Vec<Vec<Component>> = Vec::new();

        if deletion {
            let mut components: Vec<Component> = self.components.clone();
            if delete_strategy == DeleteStrategy::Reverse {
                components.reverse();
            }
            for component in components {
                queue.push(vec![component]);
            }
            return ReconciliationSequence { queue };
        }

        let is_pre = |c: &Component| pre_components.iter().any(|p| *p == c.component);

        let pre: Vec<Component> = self
            .components
            .iter()
            .filter(|c| is_pre(c))
            .cloned()
            .collect();
        if !pre.is_empty() {
            queue.push(pre);
        }
        for component in self.components.iter().filter(|c| !is_pre(c)) {
            queue.push(vec![component.clone()]);
        }

        ReconciliationSequence { queue }
    }
}

/// Ordered tiers of components; index in `queue` becomes the operation
/// priority.
#[derive(Clone, Debug, PartialEq)]
pub struct ReconciliationSequence {
    pub queue: Vec<Vec<Component>>,
}

impl ReconciliationSequence {
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Snapshot of a cluster with its current configuration and status.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClusterState {
    pub cluster: ClusterEntity,
    pub configuration: ClusterConfigurationEntity,
    pub status: ClusterStatusEntity,
}

impl ClusterState {
    pub fn runtime_id(&self) -> &RuntimeId {
        &self.cluster.runtime_id
    }
}
