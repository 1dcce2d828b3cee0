/// Cluster entities: clusters, versioned configurations, components and the
/// reconciliation sequence (priority-tier assignment).
pub mod cluster;

/// Operations: the per-component unit of work and its state machine, plus the
/// callback status vocabulary shared with remote workers.
pub mod operation;

/// Reconciliations: the per-run entity and the aggregate result evaluation.
pub mod reconciliation;

/// Cluster status vocabulary and the append-only status history entity.
pub mod status;

pub use cluster::*;
pub use operation::*;
pub use reconciliation::*;
pub use status::*;
