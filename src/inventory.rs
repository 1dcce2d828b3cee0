use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::ReconcilerError;
use crate::model::{
    ClusterConfigurationEntity, ClusterEntity, ClusterState, ClusterStatus, ClusterStatusEntity,
    Component, RuntimeId,
};

/// Desired state of a cluster as submitted through the registration API.
#[derive(Clone, Debug)]
pub struct ClusterRegistration {
    pub runtime_id: RuntimeId,
    pub kubeconfig: String,
    pub kyma_version: String,
    pub kyma_profile: Option<String>,
    pub components: Vec<Component>,
}

/// Trait for the cluster inventory: registered clusters, their versioned
/// desired configurations, and the append-only status history.
///
/// Re-registration supersedes the previous cluster/configuration version
/// rather than mutating it; the current status is the most recently created
/// status entry.
#[async_trait]
pub trait Inventory: Send + Sync {
    /// Register a cluster or record a new desired state for it. The new
    /// configuration starts in `reconcile_pending`.
    async fn create_or_update(&self, registration: ClusterRegistration)
        -> anyhow::Result<ClusterState>;

    /// Flag the cluster for deletion (`delete_pending`); the actual component
    /// removal is performed by a deletion reconciliation.
    async fn mark_for_deletion(&self, runtime_id: &RuntimeId) -> anyhow::Result<ClusterState>;

    /// Drop the cluster from the inventory entirely. Called by the retention
    /// sweep once a deletion run has been `deleted` for longer than the
    /// configured window.
    async fn delete(&self, runtime_id: &RuntimeId) -> anyhow::Result<()>;

    /// Runtime IDs whose latest status is `deleted` and was recorded before
    /// the threshold.
    async fn deleted_clusters_before(
        &self,
        threshold: DateTime<Utc>,
    ) -> anyhow::Result<Vec<RuntimeId>>;

    /// Latest state of a cluster.
    async fn get_latest(&self, runtime_id: &RuntimeId) -> anyhow::Result<ClusterState>;

    /// State of a cluster at a specific configuration version.
    async fn get(&self, runtime_id: &RuntimeId, config_version: i64)
        -> anyhow::Result<ClusterState>;

    /// Append a status entry for the cluster's current configuration.
    async fn update_status(
        &self,
        state: &ClusterState,
        status: ClusterStatus,
    ) -> anyhow::Result<ClusterState>;

    /// Clusters due for scheduling: pending status, or a final status older
    /// than `reconcile_interval` (drift correction).
    async fn clusters_to_reconcile(
        &self,
        reconcile_interval: Duration,
    ) -> anyhow::Result<Vec<ClusterState>>;

    /// Status history of a cluster within the trailing `offset` window,
    /// newest first.
    async fn status_changes(
        &self,
        runtime_id: &RuntimeId,
        offset: Duration,
    ) -> anyhow::Result<Vec<ClusterStatusEntity>>;
}

#[derive(Default)]
struct InventoryState {
    clusters: HashMap<RuntimeId, Vec<ClusterEntity>>,
    configurations: HashMap<RuntimeId, Vec<ClusterConfigurationEntity>>,
    statuses: HashMap<RuntimeId, Vec<ClusterStatusEntity>>,
    next_status_id: i64,
}

impl InventoryState {
    fn latest_state(&self, runtime_id: &RuntimeId) -> anyhow::Result<ClusterState> {
        let cluster = self
            .clusters
            .get(runtime_id)
            .and_then(|versions| versions.last())
            .ok_or_else(|| ReconcilerError::NotFound(format!("cluster '{runtime_id}'")))?;
        let configuration = self
            .configurations
            .get(runtime_id)
            .and_then(|versions| versions.last())
            .ok_or_else(|| {
                ReconcilerError::NotFound(format!("configuration for cluster '{runtime_id}'"))
            })?;
        let status = self
            .statuses
            .get(runtime_id)
            .and_then(|history| history.last())
            .ok_or_else(|| {
                ReconcilerError::NotFound(format!("status for cluster '{runtime_id}'"))
            })?;
        Ok(ClusterState {
            cluster: cluster.clone(),
            configuration: configuration.clone(),
            status: status.clone(),
        })
    }

    fn append_status(
        &mut self,
        runtime_id: &RuntimeId,
        cluster_version: i64,
        config_version: i64,
        status: ClusterStatus,
    ) -> ClusterStatusEntity {
        self.next_status_id += 1;
        let entity = ClusterStatusEntity {
            id: self.next_status_id,
            runtime_id: runtime_id.clone(),
            cluster_version,
            config_version,
            status,
            created: Utc::now(),
        };
        self.statuses
            .entry(runtime_id.clone())
            .or_default()
            .push(entity.clone());
        entity
    }
}

/// In-memory [`Inventory`], the backing store for tests and single-process
/// deployments.
#[derive(Default)]
pub struct InMemoryInventory {
    state: Mutex<InventoryState>,
}

impl InMemoryInventory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Inventory for InMemoryInventory {
    async fn create_or_update(
        &self,
        registration: ClusterRegistration,
    ) -> anyhow::Result<ClusterState> {
        let mut state = self.state.lock();
        let runtime_id = registration.runtime_id.clone();

        let clusters = state.clusters.entry(runtime_id.clone()).or_default();
        let cluster_version = clusters.last().map(|c| c.version + 1).unwrap_or(1);
        clusters.push(ClusterEntity {
            runtime_id: runtime_id.clone(),
            version: cluster_version,
            kubeconfig: registration.kubeconfig,
            created: Utc::now(),
        });

        let configurations = state.configurations.entry(runtime_id.clone()).or_default();
        let config_version = configurations.last().map(|c| c.version + 1).unwrap_or(1);
        configurations.push(ClusterConfigurationEntity {
            runtime_id: runtime_id.clone(),
            version: config_version,
            cluster_version,
            kyma_version: registration.kyma_version,
            kyma_profile: registration.kyma_profile,
            components: registration.components,
            created: Utc::now(),
        });

        state.append_status(
            &runtime_id,
            cluster_version,
            config_version,
            ClusterStatus::ReconcilePending,
        );
        state.latest_state(&runtime_id)
    }

    async fn mark_for_deletion(&self, runtime_id: &RuntimeId) -> anyhow::Result<ClusterState> {
        let mut state = self.state.lock();
        let current = state.latest_state(runtime_id)?;
        state.append_status(
            runtime_id,
            current.cluster.version,
            current.configuration.version,
            ClusterStatus::DeletePending,
        );
        state.latest_state(runtime_id)
    }

    async fn delete(&self, runtime_id: &RuntimeId) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        if state.clusters.remove(runtime_id).is_none() {
            anyhow::bail!(ReconcilerError::NotFound(format!("cluster '{runtime_id}'")));
        }
        state.configurations.remove(runtime_id);
        state.statuses.remove(runtime_id);
        Ok(())
    }

    async fn deleted_clusters_before(
        &self,
        threshold: DateTime<Utc>,
    ) -> anyhow::Result<Vec<RuntimeId>> {
        let state = self.state.lock();
        let mut deleted = Vec::new();
        for runtime_id in state.clusters.keys() {
            let cluster_state = state.latest_state(runtime_id)?;
            if cluster_state.status.status == ClusterStatus::Deleted
                && cluster_state.status.created < threshold
            {
                deleted.push(runtime_id.clone());
            }
        }
        Ok(deleted)
    }

    async fn get_latest(&self, runtime_id: &RuntimeId) -> anyhow::Result<ClusterState> {
        self.state.lock().latest_state(runtime_id)
    }

    async fn get(
        &self,
        runtime_id: &RuntimeId,
        config_version: i64,
    ) -> anyhow::Result<ClusterState> {
        let state = self.state.lock();
        let configuration = state
            .configurations
            .get(runtime_id)
            .and_then(|versions| versions.iter().find(|c| c.version == config_version))
            .ok_or_else(|| {
                ReconcilerError::NotFound(format!(
                    "configuration version {config_version} for cluster '{runtime_id}'"
                ))
            })?
            .clone();
        let cluster = state
            .clusters
            .get(runtime_id)
            .and_then(|versions| {
                versions
                    .iter()
                    .find(|c| c.version == configuration.cluster_version)
            })
            .ok_or_else(|| ReconcilerError::NotFound(format!("cluster '{runtime_id}'")))?
            .clone();
        let status = state
            .statuses
            .get(runtime_id)
            .and_then(|history| {
                history
                    .iter()
                    .rev()
                    .find(|s| s.config_version == config_version)
            })
            .ok_or_else(|| {
                ReconcilerError::NotFound(format!(
                    "status for cluster '{runtime_id}' at configuration version {config_version}"
                ))
            })?
            .clone();
        Ok(ClusterState {
            cluster,
            configuration,
            status,
        })
    }

    async fn update_status(
        &self,
        cluster_state: &ClusterState,
        status: ClusterStatus,
    ) -> anyhow::Result<ClusterState> {
        let mut state = self.state.lock();
        // re-check existence: the cluster may have been deleted meanwhile
        state.latest_state(cluster_state.runtime_id())?;
        state.append_status(
            cluster_state.runtime_id(),
            cluster_state.cluster.version,
            cluster_state.configuration.version,
            status,
        );
        state.latest_state(cluster_state.runtime_id())
    }

    async fn clusters_to_reconcile(
        &self,
        reconcile_interval: Duration,
    ) -> anyhow::Result<Vec<ClusterState>> {
        let state = self.state.lock();
        let threshold = chrono::Duration::from_std(reconcile_interval)
            .ok()
            .and_then(|d| Utc::now().checked_sub_signed(d))
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
        let mut due = Vec::new();
        for runtime_id in state.clusters.keys() {
            let cluster_state = state.latest_state(runtime_id)?;
            let status = &cluster_state.status;
            let qualifies = status.status.is_pending()
                || (matches!(status.status, ClusterStatus::Ready | ClusterStatus::Error)
                    && status.created < threshold);
            if qualifies {
                due.push(cluster_state);
            }
        }
        Ok(due)
    }

    async fn status_changes(
        &self,
        runtime_id: &RuntimeId,
        offset: Duration,
    ) -> anyhow::Result<Vec<ClusterStatusEntity>> {
        let state = self.state.lock();
        let history = state
            .statuses
            .get(runtime_id)
            .ok_or_else(|| ReconcilerError::NotFound(format!("cluster '{runtime_id}'")))?;
        let threshold = chrono::Duration::from_std(offset)
            .ok()
            .and_then(|d| Utc::now().checked_sub_signed(d))
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
        Ok(history
            .iter()
            .rev()
            .filter(|s| s.created >= threshold)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(runtime_id: &str) -> ClusterRegistration {
        ClusterRegistration {
            runtime_id: runtime_id.into(),
            kubeconfig: "kubeconfig".into(),
            kyma_version: "2.0.0".into(),
            kyma_profile: None,
            components: vec![Component::new("istio", "istio-system")],
        }
    }

    #[tokio::test]
    async fn test_registration_starts_reconcile_pending() {
        let inventory = InMemoryInventory::new();
        let state = inventory.create_or_update(registration("rt-1")).await.unwrap();
        assert_eq!(state.status.status, ClusterStatus::ReconcilePending);
        assert_eq!(state.cluster.version, 1);
        assert_eq!(state.configuration.version, 1);
    }

    #[tokio::test]
    async fn test_re_registration_supersedes_versions() {
        let inventory = InMemoryInventory::new();
        inventory.create_or_update(registration("rt-1")).await.unwrap();
        let state = inventory.create_or_update(registration("rt-1")).await.unwrap();
        assert_eq!(state.cluster.version, 2);
        assert_eq!(state.configuration.version, 2);

        // earlier version is still retrievable
        let old = inventory.get(&"rt-1".into(), 1).await.unwrap();
        assert_eq!(old.configuration.version, 1);
    }

    #[tokio::test]
    async fn test_pending_clusters_are_due() {
        let inventory = InMemoryInventory::new();
        inventory.create_or_update(registration("rt-1")).await.unwrap();
        let state = inventory.create_or_update(registration("rt-2")).await.unwrap();
        inventory
            .update_status(&state, ClusterStatus::Ready)
            .await
            .unwrap();

        let due = inventory
            .clusters_to_reconcile(Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].runtime_id().as_str(), "rt-1");
    }

    #[tokio::test]
    async fn test_recently_ready_cluster_is_due_with_zero_interval() {
        let inventory = InMemoryInventory::new();
        let state = inventory.create_or_update(registration("rt-1")).await.unwrap();
        inventory
            .update_status(&state, ClusterStatus::Ready)
            .await
            .unwrap();

        let due = inventory
            .clusters_to_reconcile(Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(due.len(), 1);
    }

    #[tokio::test]
    async fn test_mark_for_deletion() {
        let inventory = InMemoryInventory::new();
        inventory.create_or_update(registration("rt-1")).await.unwrap();
        let state = inventory.mark_for_deletion(&"rt-1".into()).await.unwrap();
        assert_eq!(state.status.status, ClusterStatus::DeletePending);
    }

    #[tokio::test]
    async fn test_deleted_clusters_are_listed_and_removable() {
        let inventory = InMemoryInventory::new();
        let state = inventory.create_or_update(registration("rt-1")).await.unwrap();
        inventory
            .update_status(&state, ClusterStatus::Deleted)
            .await
            .unwrap();
        inventory.create_or_update(registration("rt-2")).await.unwrap();

        let deleted = inventory
            .deleted_clusters_before(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(deleted, vec![RuntimeId::from("rt-1")]);

        inventory.delete(&"rt-1".into()).await.unwrap();
        assert!(inventory.get_latest(&"rt-1".into()).await.is_err());
        assert!(inventory.delete(&"rt-1".into()).await.is_err());
        assert!(inventory.get_latest(&"rt-2".into()).await.is_ok());
    }

    #[tokio::test]
    async fn test_status_changes_newest_first() {
        let inventory = InMemoryInventory::new();
        let state = inventory.create_or_update(registration("rt-1")).await.unwrap();
        let state = inventory
            .update_status(&state, ClusterStatus::Reconciling)
            .await
            .unwrap();
        inventory
            .update_status(&state, ClusterStatus::Ready)
            .await
            .unwrap();

        let changes = inventory
            .status_changes(&"rt-1".into(), Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(changes.len(), 3);
        assert_eq!(changes[0].status, ClusterStatus::Ready);
        assert_eq!(changes[2].status, ClusterStatus::ReconcilePending);
    }

    #[tokio::test]
    async fn test_unknown_cluster_is_not_found() {
        let inventory = InMemoryInventory::new();
        let err = inventory.get_latest(&"missing".into()).await.unwrap_err();
        assert!(ReconcilerError::is_not_found(&err));
    }
}
