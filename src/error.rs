use thiserror::Error;

/// Errors that callers must be able to distinguish from generic failures.
///
/// Most fallible paths return `anyhow::Result`; these typed variants are
/// wrapped into `anyhow::Error` and recovered via downcasting where the
/// caller's behavior depends on the cause (e.g. lock contention is expected,
/// a closed heartbeat context is not a delivery failure).
#[derive(Debug, Error)]
pub enum ReconcilerError {
    /// A non-terminal reconciliation already exists for the cluster.
    ///
    /// Treated as expected contention, not a failure: the cluster is already
    /// being handled and will be picked up again on a later watch tick.
    #[error(
        "cluster '{runtime_id}' is already enqueued for reconciliation \
         (schedulingID: {scheduling_id})"
    )]
    DuplicateReconciliation {
        runtime_id: String,
        scheduling_id: String,
    },

    /// The referenced entity does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// The heartbeat sender's context was closed (timeout or shutdown);
    /// no further status changes are possible.
    #[error("cannot change status to '{status}': heartbeat sender context is closed")]
    ContextClosed { status: String },

    /// A reconciliation was asked to finish twice.
    #[error("reconciliation '{scheduling_id}' is already finished")]
    AlreadyFinished { scheduling_id: String },

    /// Request validation failed; never retried.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ReconcilerError {
    /// Whether an error chain contains a duplicate-reconciliation conflict.
    pub fn is_duplicate(err: &anyhow::Error) -> bool {
        matches!(
            err.downcast_ref::<ReconcilerError>(),
            Some(ReconcilerError::DuplicateReconciliation { .. })
        )
    }

    /// Whether an error chain reports a closed heartbeat context.
    pub fn is_context_closed(err: &anyhow::Error) -> bool {
        matches!(
            err.downcast_ref::<ReconcilerError>(),
            Some(ReconcilerError::ContextClosed { .. })
        )
    }

    /// Whether an error chain reports a missing entity.
    pub fn is_not_found(err: &anyhow::Error) -> bool {
        matches!(
            err.downcast_ref::<ReconcilerError>(),
            Some(ReconcilerError::NotFound(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_detection_through_anyhow() {
        let err: anyhow::Error = ReconcilerError::DuplicateReconciliation {
            runtime_id: "rt-1".into(),
            scheduling_id: "sched-1".into(),
        }
        .into();
        assert!(ReconcilerError::is_duplicate(&err));
        assert!(!ReconcilerError::is_context_closed(&err));
    }

    #[test]
    fn test_context_closed_detection() {
        let err: anyhow::Error = ReconcilerError::ContextClosed {
            status: "running".into(),
        }
        .into();
        assert!(ReconcilerError::is_context_closed(&err));
        assert!(!ReconcilerError::is_duplicate(&err));
    }

    #[test]
    fn test_not_found_message() {
        let err = ReconcilerError::NotFound("operation 'abc'".into());
        assert_eq!(err.to_string(), "operation 'abc' not found");
    }
}
