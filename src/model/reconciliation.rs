use std::fmt::Display;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::model::cluster::RuntimeId;
use crate::model::operation::{OperationEntity, OperationState, OperationType, SchedulingId};
use crate::model::status::ClusterStatus;

/// One scheduling run driving a cluster toward a desired configuration.
///
/// At most one unfinished reconciliation may exist per runtime at any time;
/// the `lock` token proves exclusive ownership and is released when the run
/// finishes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconciliationEntity {
    pub scheduling_id: SchedulingId,
    pub runtime_id: RuntimeId,
    pub config_version: i64,
    /// Exclusivity token; `None` once the reconciliation is finished.
    pub lock: Option<String>,
    /// ID of the cluster status entry recorded when the run finished.
    pub cluster_config_status: Option<i64>,
    pub finished: bool,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Display for ReconciliationEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Reconciliation [schedulingID={},runtimeID={},configVersion={},finished={}]",
            self.scheduling_id, self.runtime_id, self.config_version, self.finished
        )
    }
}

/// Evaluation of a reconciliation's operations into an aggregate cluster
/// status, with orphan detection.
pub struct ReconciliationResult {
    reconciliation: ReconciliationEntity,
    orphan_timeout: Duration,
    done: Vec<OperationEntity>,
    error: Vec<OperationEntity>,
    other: Vec<OperationEntity>,
}

impl ReconciliationResult {
    pub fn new(
        reconciliation: ReconciliationEntity,
        orphan_timeout: std::time::Duration,
    ) -> Self {
        Self {
            reconciliation,
            orphan_timeout: Duration::from_std(orphan_timeout).unwrap_or(Duration::MAX),
            done: Vec::new(),
            error: Vec::new(),
            other: Vec::new(),
        }
    }

    pub fn reconciliation(&self) -> &ReconciliationEntity {
        &self.reconciliation
    }

    pub fn add_operations(&mut self, ops: Vec<OperationEntity>) -> anyhow::Result<()> {
        for op in ops {
            self.add_operation(op)?;
        }
        Ok(())
    }

    pub fn add_operation(&mut self, op: OperationEntity) -> anyhow::Result<()> {
        if op.scheduling_id != self.reconciliation.scheduling_id {
            anyhow::bail!(
                "cannot add operation with schedulingID '{}' to reconciliation result \
                 with schedulingID '{}'",
                op.scheduling_id,
                self.reconciliation.scheduling_id
            );
        }
        match op.state {
            OperationState::Done => self.done.push(op),
            OperationState::Error | OperationState::ClientError => self.error.push(op),
            _ => self.other.push(op),
        }
        Ok(())
    }

    /// Aggregate cluster status derived from the operation states.
    ///
    /// Operations in `failed` still have retries pending and therefore keep
    /// the cluster in its in-progress status.
    pub fn status(&self) -> ClusterStatus {
        let deletion = self
            .done
            .iter()
            .chain(self.error.iter())
            .chain(self.other.iter())
            .any(|op| op.op_type == OperationType::Delete);

        if !self.error.is_empty() && self.other.is_empty() {
            return if deletion {
                ClusterStatus::DeleteError
            } else {
                ClusterStatus::Error
            };
        }
        if !self.other.is_empty() {
            return if deletion {
                ClusterStatus::Deleting
            } else {
                ClusterStatus::Reconciling
            };
        }
        if deletion {
            ClusterStatus::Deleted
        } else {
            ClusterStatus::Ready
        }
    }

    /// Operations stuck `in_progress` without a heartbeat inside the orphan
    /// timeout window.
    pub fn orphans(&self) -> Vec<&OperationEntity> {
        let now = Utc::now();
        self.other
            .iter()
            .filter(|op| {
                op.state == OperationState::InProgress && now - op.updated >= self.orphan_timeout
            })
            .collect()
    }

    /// Components grouped by bucket, for sweep logging.
    pub fn summary(&self) -> String {
        let names = |ops: &[OperationEntity]| {
            ops.iter()
                .map(|op| op.component.as_str())
                .collect::<Vec<_>>()
                .join(",")
        };
        format!(
            "done=[{}] error=[{}] other=[{}]",
            names(&self.done),
            names(&self.error),
            names(&self.other)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::operation::CorrelationId;

    fn recon() -> ReconciliationEntity {
        ReconciliationEntity {
            scheduling_id: SchedulingId::new(),
            runtime_id: "rt-1".into(),
            config_version: 1,
            lock: Some("rt-1".into()),
            cluster_config_status: None,
            finished: false,
            created: Utc::now(),
            updated: Utc::now(),
        }
    }

    fn op(
        scheduling_id: SchedulingId,
        component: &str,
        state: OperationState,
        op_type: OperationType,
        updated: DateTime<Utc>,
    ) -> OperationEntity {
        OperationEntity {
            priority: 0,
            scheduling_id,
            correlation_id: CorrelationId::new(),
            runtime_id: "rt-1".into(),
            config_version: 1,
            component: component.into(),
            op_type,
            state,
            reason: None,
            retry_id: None,
            retries: 0,
            created: Utc::now(),
            updated,
        }
    }

    #[test]
    fn test_all_done_is_ready() {
        let recon = recon();
        let sid = recon.scheduling_id;
        let mut result = ReconciliationResult::new(recon, std::time::Duration::from_secs(600));
        result
            .add_operations(vec![
                op(sid, "a", OperationState::Done, OperationType::Reconcile, Utc::now()),
                op(sid, "b", OperationState::Done, OperationType::Reconcile, Utc::now()),
            ])
            .unwrap();
        assert_eq!(result.status(), ClusterStatus::Ready);
    }

    #[test]
    fn test_error_with_no_pending_work_is_error() {
        let recon = recon();
        let sid = recon.scheduling_id;
        let mut result = ReconciliationResult::new(recon, std::time::Duration::from_secs(600));
        result
            .add_operations(vec![
                op(sid, "a", OperationState::Done, OperationType::Reconcile, Utc::now()),
                op(sid, "b", OperationState::Error, OperationType::Reconcile, Utc::now()),
            ])
            .unwrap();
        assert_eq!(result.status(), ClusterStatus::Error);
    }

    #[test]
    fn test_failed_operation_keeps_reconciling() {
        // failed has retries pending, so the run is still in progress even if
        // a sibling already errored
        let recon = recon();
        let sid = recon.scheduling_id;
        let mut result = ReconciliationResult::new(recon, std::time::Duration::from_secs(600));
        result
            .add_operations(vec![
                op(sid, "a", OperationState::Error, OperationType::Reconcile, Utc::now()),
                op(sid, "b", OperationState::Failed, OperationType::Reconcile, Utc::now()),
            ])
            .unwrap();
        assert_eq!(result.status(), ClusterStatus::Reconciling);
    }

    #[test]
    fn test_delete_run_statuses() {
        let recon = recon();
        let sid = recon.scheduling_id;
        let mut result = ReconciliationResult::new(recon, std::time::Duration::from_secs(600));
        result
            .add_operation(op(sid, "a", OperationState::Done, OperationType::Delete, Utc::now()))
            .unwrap();
        assert_eq!(result.status(), ClusterStatus::Deleted);

        let recon = self::recon();
        let sid = recon.scheduling_id;
        let mut result = ReconciliationResult::new(recon, std::time::Duration::from_secs(600));
        result
            .add_operation(op(sid, "a", OperationState::Error, OperationType::Delete, Utc::now()))
            .unwrap();
        assert_eq!(result.status(), ClusterStatus::DeleteError);
    }

    #[test]
    fn test_orphan_detection_by_updated_age() {
        let recon = recon();
        let sid = recon.scheduling_id;
        let mut result = ReconciliationResult::new(recon, std::time::Duration::from_secs(60));
        let stale = Utc::now() - Duration::seconds(120);
        result
            .add_operations(vec![
                op(sid, "stale", OperationState::InProgress, OperationType::Reconcile, stale),
                op(sid, "fresh", OperationState::InProgress, OperationType::Reconcile, Utc::now()),
                op(sid, "new", OperationState::New, OperationType::Reconcile, stale),
            ])
            .unwrap();
        let orphans = result.orphans();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].component, "stale");
    }

    #[test]
    fn test_rejects_foreign_scheduling_id() {
        let recon = recon();
        let mut result = ReconciliationResult::new(recon, std::time::Duration::from_secs(60));
        let foreign = op(
            SchedulingId::new(),
            "a",
            OperationState::Done,
            OperationType::Reconcile,
            Utc::now(),
        );
        assert!(result.add_operation(foreign).is_err());
    }
}
