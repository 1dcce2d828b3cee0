use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::Instrument;

use crate::error::ReconcilerError;
use crate::model::ClusterState;
use crate::runtime::ShutdownToken;
use crate::telemetry;
use crate::transition::ClusterStatusTransition;

/// Consumes due clusters from the watcher queue and turns each into a
/// reconciliation.
///
/// Losing the exclusivity check is expected contention, logged at debug
/// severity: the cluster is already being handled by an earlier run or a
/// competing replica.
pub struct Scheduler {
    transition: Arc<ClusterStatusTransition>,
}

impl Scheduler {
    pub fn new(transition: Arc<ClusterStatusTransition>) -> Self {
        Self { transition }
    }

    pub async fn run(&self, mut queue: mpsc::Receiver<ClusterState>, shutdown: ShutdownToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("scheduler shutting down");
                    break;
                }
                state = queue.recv() => {
                    let Some(state) = state else {
                        tracing::info!("cluster queue closed, scheduler stopping");
                        break;
                    };
                    let span = telemetry::scheduling_span(state.runtime_id().as_str());
                    self.schedule(&state).instrument(span).await;
                }
            }
        }
    }

    pub async fn schedule(&self, state: &ClusterState) {
        match self.transition.start_reconciliation(state).await {
            Ok(reconciliation) => {
                tracing::debug!(
                    scheduling_id = %reconciliation.scheduling_id,
                    "cluster scheduled"
                );
            }
            Err(err) if ReconcilerError::is_duplicate(&err) => {
                tracing::debug!(
                    runtime_id = %state.runtime_id(),
                    "cluster already being reconciled, skipping"
                );
            }
            Err(err) => {
                tracing::error!(
                    runtime_id = %state.runtime_id(),
                    error = %err,
                    "scheduling failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::inventory::{ClusterRegistration, InMemoryInventory, Inventory};
    use crate::model::{ClusterStatus, Component};
    use crate::reconciliation::{
        InMemoryReconciliationRepository, ReconciliationFilter, ReconciliationRepository,
    };

    async fn scheduler_with_cluster() -> (Scheduler, Arc<ClusterStatusTransition>, ClusterState) {
        let inventory = Arc::new(InMemoryInventory::new());
        let repository = Arc::new(InMemoryReconciliationRepository::new());
        let state = inventory
            .create_or_update(ClusterRegistration {
                runtime_id: "rt-1".into(),
                kubeconfig: "kubeconfig".into(),
                kyma_version: "2.0.0".into(),
                kyma_profile: None,
                components: vec![Component::new("istio", "istio-system")],
            })
            .await
            .unwrap();
        let transition = Arc::new(ClusterStatusTransition::new(
            inventory,
            repository,
            SchedulerConfig::default(),
        ));
        (Scheduler::new(Arc::clone(&transition)), transition, state)
    }

    #[tokio::test]
    async fn test_schedule_creates_one_reconciliation() {
        let (scheduler, transition, state) = scheduler_with_cluster().await;
        scheduler.schedule(&state).await;
        // a second attempt for the same cluster is silently skipped
        scheduler.schedule(&state).await;

        let reconciliations = transition
            .repository()
            .get_reconciliations(&ReconciliationFilter::default())
            .await
            .unwrap();
        assert_eq!(reconciliations.len(), 1);

        let current = transition.inventory().get_latest(state.runtime_id()).await.unwrap();
        assert_eq!(current.status.status, ClusterStatus::Reconciling);
    }
}
