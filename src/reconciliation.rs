use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::ReconcilerError;
use crate::model::{
    ClusterState, CorrelationId, OperationEntity, OperationState, OperationType,
    ReconciliationEntity, ReconciliationSequence, RuntimeId, SchedulingId,
};

/// Outcome of an operation state update.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StateUpdate {
    /// The transition was applied.
    Updated,
    /// The operation is already terminal; the update was dropped.
    SkippedTerminal,
    /// The retry ID equals or sorts below the most recently accepted one;
    /// duplicate or out-of-order delivery, dropped.
    SkippedDuplicate,
}

/// Filter for reconciliation listings.
#[derive(Clone, Debug, Default)]
pub struct ReconciliationFilter {
    /// Restrict to these runtimes; empty means all.
    pub runtime_ids: Vec<RuntimeId>,
    /// Restrict by finished flag; `None` means both.
    pub finished: Option<bool>,
}

/// Trait for the reconciliation store: scheduling runs and their operations.
///
/// `create_reconciliation` enforces the exclusivity invariant: at most one
/// unfinished reconciliation may exist per runtime, rejected with a
/// duplicate error otherwise.
#[async_trait]
pub trait ReconciliationRepository: Send + Sync {
    /// Create a reconciliation with one operation per component in the
    /// sequence; tier index becomes the operation priority.
    async fn create_reconciliation(
        &self,
        state: &ClusterState,
        sequence: &ReconciliationSequence,
        op_type: OperationType,
    ) -> anyhow::Result<ReconciliationEntity>;

    /// Fetch one reconciliation by scheduling ID.
    async fn get_reconciliation(
        &self,
        scheduling_id: &SchedulingId,
    ) -> anyhow::Result<ReconciliationEntity>;

    /// List reconciliations matching the filter, newest first.
    async fn get_reconciliations(
        &self,
        filter: &ReconciliationFilter,
    ) -> anyhow::Result<Vec<ReconciliationEntity>>;

    /// Mark a reconciliation finished, releasing its lock and recording the
    /// final cluster status entry it produced.
    async fn finish_reconciliation(
        &self,
        scheduling_id: &SchedulingId,
        cluster_status_id: i64,
    ) -> anyhow::Result<()>;

    /// Unfinished reconciliations, for the bookkeeping sweep.
    async fn get_unfinished_reconciliations(&self)
        -> anyhow::Result<Vec<ReconciliationEntity>>;

    /// All operations of one reconciliation.
    async fn get_operations(
        &self,
        scheduling_id: &SchedulingId,
    ) -> anyhow::Result<Vec<OperationEntity>>;

    /// One operation by its scheduling and correlation IDs.
    async fn get_operation(
        &self,
        scheduling_id: &SchedulingId,
        correlation_id: &CorrelationId,
    ) -> anyhow::Result<OperationEntity>;

    /// Operations ready for dispatch across all unfinished reconciliations,
    /// honoring priority-tier ordering and the per-reconciliation parallelism
    /// bound (`0` = unlimited).
    async fn get_processable_operations(
        &self,
        max_parallel: usize,
    ) -> anyhow::Result<Vec<OperationEntity>>;

    /// Transition an operation to `in_progress` for dispatch, counting one
    /// attempt against its retry budget. Callback-driven transitions go
    /// through [`update_operation_state`](Self::update_operation_state) and
    /// never touch the budget.
    async fn mark_operation_dispatched(
        &self,
        scheduling_id: &SchedulingId,
        correlation_id: &CorrelationId,
    ) -> anyhow::Result<StateUpdate>;

    /// Apply a callback-driven operation state transition.
    ///
    /// Terminal states are final, and a retry ID that is the same as or
    /// older than the stored one is dropped; both are reported as skips,
    /// not errors.
    async fn update_operation_state(
        &self,
        scheduling_id: &SchedulingId,
        correlation_id: &CorrelationId,
        state: OperationState,
        reason: Option<String>,
        retry_id: Option<String>,
    ) -> anyhow::Result<StateUpdate>;

    /// Delete finished reconciliations updated before the threshold. Returns
    /// the number removed.
    async fn remove_finished_before(&self, threshold: DateTime<Utc>) -> anyhow::Result<usize>;
}

/// Select the operations eligible for dispatch.
///
/// Operations are grouped per reconciliation and walked by ascending priority
/// tier. Within the lowest unfinished tier, `new` and `failed` operations are
/// eligible; the walk never advances past a tier until all its operations are
/// `done`, and a tier containing `error`/`client_error` blocks the whole
/// reconciliation. `max_parallel` caps eligible plus already `in_progress`
/// operations per reconciliation (`0` = unlimited).
pub fn find_processable_operations(
    operations: &[OperationEntity],
    max_parallel: usize,
) -> Vec<OperationEntity> {
    let mut by_reconciliation: HashMap<SchedulingId, Vec<&OperationEntity>> = HashMap::new();
    for op in operations {
        by_reconciliation.entry(op.scheduling_id).or_default().push(op);
    }

    let mut processable = Vec::new();
    for ops in by_reconciliation.into_values() {
        let mut tiers: Vec<i64> = ops.iter().map(|op| op.priority).collect();
        tiers.sort_unstable();
        tiers.dedup();

        let in_progress = ops
            .iter()
            .filter(|op| op.state == OperationState::InProgress)
            .count();
        let mut budget = if max_parallel == 0 {
            usize::MAX
        } else {
            max_parallel.saturating_sub(in_progress)
        };

        for tier in tiers {
            let tier_ops: Vec<&&OperationEntity> =
                ops.iter().filter(|op| op.priority == tier).collect();
            let blocked = tier_ops.iter().any(|op| {
                matches!(
                    op.state,
                    OperationState::Error | OperationState::ClientError
                )
            });
            if blocked {
                break;
            }
            let all_done = tier_ops.iter().all(|op| op.state == OperationState::Done);
            if all_done {
                continue;
            }
            for op in tier_ops {
                if op.state.is_dispatchable() && budget > 0 {
                    processable.push((**op).clone());
                    budget -= 1;
                }
            }
            // unfinished tier: higher tiers stay blocked
            break;
        }
    }
    processable
}

struct StoredReconciliation {
    entity: ReconciliationEntity,
    operations: Vec<OperationEntity>,
}

fn operation_mut<'a>(
    reconciliations: &'a mut [StoredReconciliation],
    scheduling_id: &SchedulingId,
    correlation_id: &CorrelationId,
) -> anyhow::Result<&'a mut OperationEntity> {
    reconciliations
        .iter_mut()
        .find(|r| &r.entity.scheduling_id == scheduling_id)
        .and_then(|r| {
            r.operations
                .iter_mut()
                .find(|op| &op.correlation_id == correlation_id)
        })
        .ok_or_else(|| {
            ReconcilerError::NotFound(format!(
                "operation '{correlation_id}' in reconciliation '{scheduling_id}'"
            ))
            .into()
        })
}

/// In-memory [`ReconciliationRepository`], the backing store for tests and
/// single-process deployments.
#[derive(Default)]
pub struct InMemoryReconciliationRepository {
    reconciliations: Mutex<Vec<StoredReconciliation>>,
}

impl InMemoryReconciliationRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReconciliationRepository for InMemoryReconciliationRepository {
    async fn create_reconciliation(
        &self,
        state: &ClusterState,
        sequence: &ReconciliationSequence,
        op_type: OperationType,
    ) -> anyhow::Result<ReconciliationEntity> {
        if sequence.is_empty() {
            anyhow::bail!(ReconcilerError::InvalidRequest(format!(
                "cannot create reconciliation without components for cluster '{}'",
                state.runtime_id()
            )));
        }

        let mut reconciliations = self.reconciliations.lock();
        if let Some(existing) = reconciliations
            .iter()
            .find(|r| &r.entity.runtime_id == state.runtime_id() && !r.entity.finished)
        {
            anyhow::bail!(ReconcilerError::DuplicateReconciliation {
                runtime_id: state.runtime_id().to_string(),
                scheduling_id: existing.entity.scheduling_id.to_string(),
            });
        }

        let now = Utc::now();
        let entity = ReconciliationEntity {
            scheduling_id: SchedulingId::new(),
            runtime_id: state.runtime_id().clone(),
            config_version: state.configuration.version,
            lock: Some(state.runtime_id().to_string()),
            cluster_config_status: None,
            finished: false,
            created: now,
            updated: now,
        };

        let mut operations = Vec::new();
        for (tier, components) in sequence.queue.iter().enumerate() {
            for component in components {
                operations.push(OperationEntity {
                    priority: tier as i64,
                    scheduling_id: entity.scheduling_id,
                    correlation_id: CorrelationId::new(),
                    runtime_id: entity.runtime_id.clone(),
                    config_version: entity.config_version,
                    component: component.component.clone(),
                    op_type,
                    state: OperationState::New,
                    reason: None,
                    retry_id: None,
                    retries: 0,
                    created: now,
                    updated: now,
                });
            }
        }

        reconciliations.push(StoredReconciliation {
            entity: entity.clone(),
            operations,
        });
        Ok(entity)
    }

    async fn get_reconciliation(
        &self,
        scheduling_id: &SchedulingId,
    ) -> anyhow::Result<ReconciliationEntity> {
        self.reconciliations
            .lock()
            .iter()
            .find(|r| &r.entity.scheduling_id == scheduling_id)
            .map(|r| r.entity.clone())
            .ok_or_else(|| {
                ReconcilerError::NotFound(format!("reconciliation '{scheduling_id}'")).into()
            })
    }

    async fn get_reconciliations(
        &self,
        filter: &ReconciliationFilter,
    ) -> anyhow::Result<Vec<ReconciliationEntity>> {
        let reconciliations = self.reconciliations.lock();
        let mut matching: Vec<ReconciliationEntity> = reconciliations
            .iter()
            .filter(|r| {
                (filter.runtime_ids.is_empty()
                    || filter.runtime_ids.contains(&r.entity.runtime_id))
                    && filter
                        .finished
                        .map(|finished| r.entity.finished == finished)
                        .unwrap_or(true)
            })
            .map(|r| r.entity.clone())
            .collect();
        matching.sort_by(|a, b| b.created.cmp(&a.created));
        Ok(matching)
    }

    async fn finish_reconciliation(
        &self,
        scheduling_id: &SchedulingId,
        cluster_status_id: i64,
    ) -> anyhow::Result<()> {
        let mut reconciliations = self.reconciliations.lock();
        let stored = reconciliations
            .iter_mut()
            .find(|r| &r.entity.scheduling_id == scheduling_id)
            .ok_or_else(|| {
                ReconcilerError::NotFound(format!("reconciliation '{scheduling_id}'"))
            })?;
        if stored.entity.finished {
            anyhow::bail!(ReconcilerError::AlreadyFinished {
                scheduling_id: scheduling_id.to_string(),
            });
        }
        stored.entity.finished = true;
        stored.entity.lock = None;
        stored.entity.cluster_config_status = Some(cluster_status_id);
        stored.entity.updated = Utc::now();
        Ok(())
    }

    async fn get_unfinished_reconciliations(
        &self,
    ) -> anyhow::Result<Vec<ReconciliationEntity>> {
        Ok(self
            .reconciliations
            .lock()
            .iter()
            .filter(|r| !r.entity.finished)
            .map(|r| r.entity.clone())
            .collect())
    }

    async fn get_operations(
        &self,
        scheduling_id: &SchedulingId,
    ) -> anyhow::Result<Vec<OperationEntity>> {
        self.reconciliations
            .lock()
            .iter()
            .find(|r| &r.entity.scheduling_id == scheduling_id)
            .map(|r| r.operations.clone())
            .ok_or_else(|| {
                ReconcilerError::NotFound(format!("reconciliation '{scheduling_id}'")).into()
            })
    }

    async fn get_operation(
        &self,
        scheduling_id: &SchedulingId,
        correlation_id: &CorrelationId,
    ) -> anyhow::Result<OperationEntity> {
        self.reconciliations
            .lock()
            .iter()
            .find(|r| &r.entity.scheduling_id == scheduling_id)
            .and_then(|r| {
                r.operations
                    .iter()
                    .find(|op| &op.correlation_id == correlation_id)
            })
            .cloned()
            .ok_or_else(|| {
                ReconcilerError::NotFound(format!(
                    "operation '{correlation_id}' in reconciliation '{scheduling_id}'"
                ))
                .into()
            })
    }

    async fn get_processable_operations(
        &self,
        max_parallel: usize,
    ) -> anyhow::Result<Vec<OperationEntity>> {
        let reconciliations = self.reconciliations.lock();
        let operations: Vec<OperationEntity> = reconciliations
            .iter()
            .filter(|r| !r.entity.finished)
            .flat_map(|r| r.operations.iter().cloned())
            .collect();
        Ok(find_processable_operations(&operations, max_parallel))
    }

    async fn mark_operation_dispatched(
        &self,
        scheduling_id: &SchedulingId,
        correlation_id: &CorrelationId,
    ) -> anyhow::Result<StateUpdate> {
        let mut reconciliations = self.reconciliations.lock();
        let op = operation_mut(&mut reconciliations, scheduling_id, correlation_id)?;
        if op.state.is_terminal() {
            return Ok(StateUpdate::SkippedTerminal);
        }
        op.retries += 1;
        op.state = OperationState::InProgress;
        op.updated = Utc::now();
        Ok(StateUpdate::Updated)
    }

    async fn update_operation_state(
        &self,
        scheduling_id: &SchedulingId,
        correlation_id: &CorrelationId,
        state: OperationState,
        reason: Option<String>,
        retry_id: Option<String>,
    ) -> anyhow::Result<StateUpdate> {
        let mut reconciliations = self.reconciliations.lock();
        let op = operation_mut(&mut reconciliations, scheduling_id, correlation_id)?;

        if op.state.is_terminal() {
            return Ok(StateUpdate::SkippedTerminal);
        }
        // retry IDs are time-ordered (UUIDv7), so an equal or lower incoming
        // ID is a resend of the current status or a delayed delivery of a
        // superseded one
        if let (Some(incoming), Some(stored)) = (retry_id.as_deref(), op.retry_id.as_deref()) {
            if incoming <= stored {
                return Ok(StateUpdate::SkippedDuplicate);
            }
        }

        op.state = state;
        op.reason = reason;
        if retry_id.is_some() {
            op.retry_id = retry_id;
        }
        op.updated = Utc::now();
        Ok(StateUpdate::Updated)
    }

    async fn remove_finished_before(&self, threshold: DateTime<Utc>) -> anyhow::Result<usize> {
        let mut reconciliations = self.reconciliations.lock();
        let before = reconciliations.len();
        reconciliations.retain(|r| !(r.entity.finished && r.entity.updated < threshold));
        Ok(before - reconciliations.len())
    }
}
