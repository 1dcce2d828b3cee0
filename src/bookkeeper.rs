//! The bookkeeping sweep.
//!
//! On a fixed interval every unfinished reconciliation is evaluated: silent
//! `in_progress` operations past the orphan timeout are forced to `error`
//! (the safety net for remote workers that crash without a final callback),
//! and reconciliations whose operations all reached a terminal state are
//! finished with their aggregate cluster status.

use std::sync::Arc;

use tracing::Instrument;

use crate::config::BookkeeperConfig;
use crate::model::{OperationState, ReconciliationEntity, ReconciliationResult};
use crate::runtime::ShutdownToken;
use crate::telemetry;
use crate::transition::ClusterStatusTransition;

const ORPHAN_REASON: &str = "orphaned: heartbeat timeout exceeded";

pub struct Bookkeeper {
    transition: Arc<ClusterStatusTransition>,
    config: BookkeeperConfig,
}

impl Bookkeeper {
    pub fn new(transition: Arc<ClusterStatusTransition>, config: BookkeeperConfig) -> Self {
        Self { transition, config }
    }

    /// Sweep until shutdown.
    pub async fn run(&self, shutdown: ShutdownToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("bookkeeper shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.operations_watch_interval) => {
                    let span = telemetry::sweep_span("bookkeeper");
                    if let Err(err) = self.run_once().instrument(span).await {
                        tracing::warn!(error = %err, "bookkeeping sweep failed");
                    }
                }
            }
        }
    }

    /// One sweep over all unfinished reconciliations. A failure on one
    /// reconciliation does not stop the others.
    pub async fn run_once(&self) -> anyhow::Result<usize> {
        let repository = self.transition.repository();
        let unfinished = repository.get_unfinished_reconciliations().await?;
        let mut finished = 0;
        for reconciliation in unfinished {
            match self.process(&reconciliation).await {
                Ok(true) => finished += 1,
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(
                        scheduling_id = %reconciliation.scheduling_id,
                        error = %err,
                        "bookkeeping failed for reconciliation"
                    );
                }
            }
        }
        Ok(finished)
    }

    /// Returns whether the reconciliation was finished.
    async fn process(&self, reconciliation: &ReconciliationEntity) -> anyhow::Result<bool> {
        let repository = self.transition.repository();
        let result = self.evaluate(reconciliation).await?;

        let orphans: Vec<_> = result
            .orphans()
            .iter()
            .map(|op| (op.correlation_id, op.component.clone()))
            .collect();
        for (correlation_id, component) in &orphans {
            tracing::warn!(
                scheduling_id = %reconciliation.scheduling_id,
                correlation_id = %correlation_id,
                component = %component,
                "operation orphaned"
            );
            repository
                .update_operation_state(
                    &reconciliation.scheduling_id,
                    correlation_id,
                    OperationState::Error,
                    Some(ORPHAN_REASON.to_string()),
                    None,
                )
                .await?;
        }

        // orphan marking changed operation states; evaluate fresh
        let result = if orphans.is_empty() {
            result
        } else {
            self.evaluate(reconciliation).await?
        };

        let status = result.status();
        if !status.is_final() {
            return Ok(false);
        }
        tracing::debug!(
            scheduling_id = %reconciliation.scheduling_id,
            status = %status,
            summary = %result.summary(),
            "reconciliation complete"
        );
        self.transition
            .finish_reconciliation(&reconciliation.scheduling_id, status)
            .await?;
        Ok(true)
    }

    async fn evaluate(
        &self,
        reconciliation: &ReconciliationEntity,
    ) -> anyhow::Result<ReconciliationResult> {
        let operations = self
            .transition
            .repository()
            .get_operations(&reconciliation.scheduling_id)
            .await?;
        let mut result = ReconciliationResult::new(
            reconciliation.clone(),
            self.config.orphan_operation_timeout,
        );
        result.add_operations(operations)?;
        Ok(result)
    }
}
