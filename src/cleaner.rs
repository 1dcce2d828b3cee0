use std::sync::Arc;

use tracing::Instrument;

use crate::config::CleanerConfig;
use crate::inventory::Inventory;
use crate::reconciliation::ReconciliationRepository;
use crate::runtime::ShutdownToken;
use crate::telemetry;

/// Retention sweep: purges finished reconciliations (with their operations)
/// and clusters that finished deletion, both older than the configured
/// window. Best-effort; a failed tick is logged and retried on the next one.
pub struct Cleaner {
    repository: Arc<dyn ReconciliationRepository>,
    inventory: Arc<dyn Inventory>,
    config: CleanerConfig,
}

impl Cleaner {
    pub fn new(
        repository: Arc<dyn ReconciliationRepository>,
        inventory: Arc<dyn Inventory>,
        config: CleanerConfig,
    ) -> Self {
        Self {
            repository,
            inventory,
            config,
        }
    }

    pub async fn run(&self, shutdown: ShutdownToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("cleaner shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.cleaner_interval) => {
                    let span = telemetry::sweep_span("cleaner");
                    if let Err(err) = self.run_once().instrument(span).await {
                        tracing::warn!(error = %err, "retention purge failed");
                    }
                }
            }
        }
    }

    /// Returns the number of reconciliations purged.
    pub async fn run_once(&self) -> anyhow::Result<usize> {
        let threshold = chrono::Duration::from_std(self.config.purge_entities_older_than)
            .ok()
            .and_then(|window| chrono::Utc::now().checked_sub_signed(window))
            .ok_or_else(|| anyhow::anyhow!("retention window out of range"))?;
        let removed = self.repository.remove_finished_before(threshold).await?;
        if removed > 0 {
            tracing::info!(removed, "purged finished reconciliations");
        }

        let deleted = self.inventory.deleted_clusters_before(threshold).await?;
        for runtime_id in &deleted {
            self.inventory.delete(runtime_id).await?;
        }
        if !deleted.is_empty() {
            tracing::info!(
                clusters = deleted.len(),
                "purged deleted clusters from inventory"
            );
        }
        Ok(removed)
    }
}
