use std::sync::Arc;

use crate::config::SchedulerConfig;
use crate::inventory::Inventory;
use crate::model::{ClusterState, ClusterStatus, OperationType, ReconciliationEntity, SchedulingId};
use crate::reconciliation::ReconciliationRepository;
use crate::telemetry;

/// Couples the cluster inventory and the reconciliation store so that status
/// changes and reconciliation bookkeeping stay consistent.
///
/// Starting a run creates the reconciliation first: its exclusivity check is
/// the concurrency gate, so a competing scheduler replica loses there before
/// any status entry is written.
pub struct ClusterStatusTransition {
    inventory: Arc<dyn Inventory>,
    repository: Arc<dyn ReconciliationRepository>,
    config: SchedulerConfig,
}

impl ClusterStatusTransition {
    pub fn new(
        inventory: Arc<dyn Inventory>,
        repository: Arc<dyn ReconciliationRepository>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            inventory,
            repository,
            config,
        }
    }

    pub fn inventory(&self) -> Arc<dyn Inventory> {
        Arc::clone(&self.inventory)
    }

    pub fn repository(&self) -> Arc<dyn ReconciliationRepository> {
        Arc::clone(&self.repository)
    }

    /// Begin a reconciliation for a due cluster: compute the operation tiers,
    /// create the run (rejected if one is already underway) and move the
    /// cluster into its in-progress status.
    pub async fn start_reconciliation(
        &self,
        state: &ClusterState,
    ) -> anyhow::Result<ReconciliationEntity> {
        let deletion = state.status.status.is_deletion();
        let op_type = if deletion {
            OperationType::Delete
        } else {
            OperationType::Reconcile
        };
        let sequence = state.configuration.reconciliation_sequence(
            &self.config.pre_components,
            self.config.delete_strategy,
            deletion,
        );

        let reconciliation = self
            .repository
            .create_reconciliation(state, &sequence, op_type)
            .await?;

        let in_progress = state.status.status.in_progress_status();
        if let Err(err) = self.inventory.update_status(state, in_progress).await {
            tracing::error!(
                runtime_id = %state.runtime_id(),
                error = %err,
                "reconciliation created but cluster status update failed"
            );
            return Err(err);
        }

        tracing::info!(
            runtime_id = %state.runtime_id(),
            scheduling_id = %reconciliation.scheduling_id,
            status = %in_progress,
            "reconciliation started"
        );
        Ok(reconciliation)
    }

    /// Conclude a reconciliation with its aggregate cluster status.
    pub async fn finish_reconciliation(
        &self,
        scheduling_id: &SchedulingId,
        status: ClusterStatus,
    ) -> anyhow::Result<()> {
        let reconciliation = self.repository.get_reconciliation(scheduling_id).await?;
        if reconciliation.finished {
            anyhow::bail!(crate::error::ReconcilerError::AlreadyFinished {
                scheduling_id: scheduling_id.to_string(),
            });
        }

        let state = self
            .inventory
            .get(&reconciliation.runtime_id, reconciliation.config_version)
            .await?;
        let updated = self.inventory.update_status(&state, status).await?;
        self.repository
            .finish_reconciliation(scheduling_id, updated.status.id)
            .await?;

        telemetry::record_reconciliation_finished(
            reconciliation.runtime_id.as_str(),
            status.as_str(),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReconcilerError;
    use crate::inventory::{ClusterRegistration, InMemoryInventory};
    use crate::model::Component;
    use crate::reconciliation::InMemoryReconciliationRepository;

    async fn transition_with_cluster() -> (ClusterStatusTransition, ClusterState) {
        let inventory = Arc::new(InMemoryInventory::new());
        let repository = Arc::new(InMemoryReconciliationRepository::new());
        let state = inventory
            .create_or_update(ClusterRegistration {
                runtime_id: "rt-1".into(),
                kubeconfig: "kubeconfig".into(),
                kyma_version: "2.0.0".into(),
                kyma_profile: None,
                components: vec![
                    Component::new("istio", "istio-system"),
                    Component::new("serverless", "kyma-system"),
                ],
            })
            .await
            .unwrap();
        let transition =
            ClusterStatusTransition::new(inventory, repository, SchedulerConfig::default());
        (transition, state)
    }

    #[tokio::test]
    async fn test_start_moves_cluster_to_reconciling() {
        let (transition, state) = transition_with_cluster().await;
        let reconciliation = transition.start_reconciliation(&state).await.unwrap();

        let current = transition.inventory().get_latest(state.runtime_id()).await.unwrap();
        assert_eq!(current.status.status, ClusterStatus::Reconciling);

        let ops = transition
            .repository()
            .get_operations(&reconciliation.scheduling_id)
            .await
            .unwrap();
        assert_eq!(ops.len(), 2);
        assert!(ops.iter().all(|op| op.op_type == OperationType::Reconcile));
    }

    #[tokio::test]
    async fn test_start_twice_is_duplicate() {
        let (transition, state) = transition_with_cluster().await;
        transition.start_reconciliation(&state).await.unwrap();
        let err = transition.start_reconciliation(&state).await.unwrap_err();
        assert!(ReconcilerError::is_duplicate(&err));
    }

    #[tokio::test]
    async fn test_deletion_creates_delete_operations() {
        let (transition, state) = transition_with_cluster().await;
        let state = transition
            .inventory()
            .mark_for_deletion(state.runtime_id())
            .await
            .unwrap();
        let reconciliation = transition.start_reconciliation(&state).await.unwrap();

        let current = transition.inventory().get_latest(state.runtime_id()).await.unwrap();
        assert_eq!(current.status.status, ClusterStatus::Deleting);

        let ops = transition
            .repository()
            .get_operations(&reconciliation.scheduling_id)
            .await
            .unwrap();
        assert!(ops.iter().all(|op| op.op_type == OperationType::Delete));
        // default strategy reverses the declared order
        let first_tier = ops.iter().find(|op| op.priority == 0).unwrap();
        assert_eq!(first_tier.component, "serverless");
    }

    #[tokio::test]
    async fn test_finish_records_status_and_releases_lock() {
        let (transition, state) = transition_with_cluster().await;
        let reconciliation = transition.start_reconciliation(&state).await.unwrap();

        transition
            .finish_reconciliation(&reconciliation.scheduling_id, ClusterStatus::Ready)
            .await
            .unwrap();

        let current = transition.inventory().get_latest(state.runtime_id()).await.unwrap();
        assert_eq!(current.status.status, ClusterStatus::Ready);

        let finished = transition
            .repository()
            .get_reconciliation(&reconciliation.scheduling_id)
            .await
            .unwrap();
        assert!(finished.finished);
        assert_eq!(finished.cluster_config_status, Some(current.status.id));

        // finishing again is rejected
        assert!(transition
            .finish_reconciliation(&reconciliation.scheduling_id, ClusterStatus::Ready)
            .await
            .is_err());
    }
}
