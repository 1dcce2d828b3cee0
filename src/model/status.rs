use std::fmt::Display;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::cluster::RuntimeId;

/// Aggregate status of a cluster + configuration pair.
///
/// The status history is append-only; the current status is the most recently
/// created entry for the cluster.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterStatus {
    ReconcilePending,
    Reconciling,
    Ready,
    Error,
    DeletePending,
    Deleting,
    Deleted,
    DeleteError,
}

impl ClusterStatus {
    /// Final statuses: no reconciliation is running and none is requested.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            ClusterStatus::Ready
                | ClusterStatus::Error
                | ClusterStatus::Deleted
                | ClusterStatus::DeleteError
        )
    }

    /// Whether the status belongs to the deletion flow.
    pub fn is_deletion(&self) -> bool {
        matches!(
            self,
            ClusterStatus::DeletePending
                | ClusterStatus::Deleting
                | ClusterStatus::Deleted
                | ClusterStatus::DeleteError
        )
    }

    /// Statuses that make a cluster due for scheduling on the next watch tick.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            ClusterStatus::ReconcilePending | ClusterStatus::DeletePending
        )
    }

    /// The in-progress status a pending cluster moves to when scheduled.
    pub fn in_progress_status(&self) -> ClusterStatus {
        if self.is_deletion() {
            ClusterStatus::Deleting
        } else {
            ClusterStatus::Reconciling
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterStatus::ReconcilePending => "reconcile_pending",
            ClusterStatus::Reconciling => "reconciling",
            ClusterStatus::Ready => "ready",
            ClusterStatus::Error => "error",
            ClusterStatus::DeletePending => "delete_pending",
            ClusterStatus::Deleting => "deleting",
            ClusterStatus::Deleted => "deleted",
            ClusterStatus::DeleteError => "delete_error",
        }
    }
}

impl Display for ClusterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ClusterStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reconcile_pending" => Ok(ClusterStatus::ReconcilePending),
            "reconciling" => Ok(ClusterStatus::Reconciling),
            "ready" => Ok(ClusterStatus::Ready),
            "error" => Ok(ClusterStatus::Error),
            "delete_pending" => Ok(ClusterStatus::DeletePending),
            "deleting" => Ok(ClusterStatus::Deleting),
            "deleted" => Ok(ClusterStatus::Deleted),
            "delete_error" => Ok(ClusterStatus::DeleteError),
            other => Err(format!("unknown cluster status '{other}'")),
        }
    }
}

/// One entry in a cluster's append-only status history.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClusterStatusEntity {
    /// Monotonically increasing identity within the inventory.
    pub id: i64,
    pub runtime_id: RuntimeId,
    pub cluster_version: i64,
    pub config_version: i64,
    pub status: ClusterStatus,
    pub created: DateTime<Utc>,
}

impl Display for ClusterStatusEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ClusterStatus [runtimeID={},configVersion={},status={}]",
            self.runtime_id, self.config_version, self.status
        )
    }
}
