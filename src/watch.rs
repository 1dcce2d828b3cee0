use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::inventory::Inventory;
use crate::model::ClusterState;
use crate::runtime::ShutdownToken;

/// Periodically detects clusters due for (re-)reconciliation and hands them
/// to the scheduler through a bounded queue.
///
/// Enqueueing never blocks: a full queue drops the cluster for this tick and
/// the next tick retries it.
pub struct InventoryWatcher {
    inventory: Arc<dyn Inventory>,
    watch_interval: Duration,
    reconcile_interval: Duration,
}

impl InventoryWatcher {
    pub fn new(
        inventory: Arc<dyn Inventory>,
        watch_interval: Duration,
        reconcile_interval: Duration,
    ) -> Self {
        Self {
            inventory,
            watch_interval,
            reconcile_interval,
        }
    }

    /// Scan until shutdown, starting with an immediate pass.
    pub async fn run(&self, queue: mpsc::Sender<ClusterState>, shutdown: ShutdownToken) {
        loop {
            if let Err(err) = self.run_once(&queue).await {
                tracing::warn!(error = %err, "inventory scan failed");
            }
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("inventory watcher shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.watch_interval) => {}
            }
        }
    }

    /// One scan pass. Returns the number of clusters enqueued.
    pub async fn run_once(&self, queue: &mpsc::Sender<ClusterState>) -> anyhow::Result<usize> {
        let due = self
            .inventory
            .clusters_to_reconcile(self.reconcile_interval)
            .await?;
        let mut enqueued = 0;
        for state in due {
            let runtime_id = state.runtime_id().clone();
            match queue.try_send(state) {
                Ok(()) => enqueued += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::debug!(
                        runtime_id = %runtime_id,
                        "cluster queue full, retrying next tick"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    anyhow::bail!("cluster queue closed");
                }
            }
        }
        Ok(enqueued)
    }
}
