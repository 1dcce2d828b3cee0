use std::time::Duration;

use crate::model::DeleteStrategy;

/// Configuration for the inventory watcher and scheduler.
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// How often the inventory is scanned for clusters due for reconciliation.
    pub watch_interval: Duration,
    /// Age after which a `ready`/`error` cluster is re-reconciled to correct
    /// drift.
    pub cluster_reconcile_interval: Duration,
    /// Capacity of the cluster queue between watcher and scheduler. A full
    /// queue drops the cluster for this tick; the next tick retries it.
    pub cluster_queue_size: usize,
    /// Components that always run first, sharing priority tier 0.
    pub pre_components: Vec<String>,
    /// Order of component operations during cluster deletion.
    pub delete_strategy: DeleteStrategy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            watch_interval: Duration::from_secs(30),
            cluster_reconcile_interval: Duration::from_secs(5 * 60 * 60),
            cluster_queue_size: 50,
            pre_components: Vec::new(),
            delete_strategy: DeleteStrategy::default(),
        }
    }
}

/// Configuration for the dispatching worker pool and the invoker it drives.
#[derive(Clone, Debug)]
pub struct WorkerPoolConfig {
    /// Number of concurrent dispatch slots shared across all reconciliations.
    pub pool_size: usize,
    /// How often the pool scans for dispatchable operations.
    pub operation_check_interval: Duration,
    /// Upper bound on concurrently dispatched operations per reconciliation.
    /// Zero means unlimited.
    pub max_parallel_operations: usize,
    /// Dispatch attempts before a permanently failing operation is errored.
    pub max_retries: u32,
    /// Attempts the invoker makes against one remote worker per dispatch.
    pub invoker_max_retries: u32,
    /// Fixed delay between invoker attempts.
    pub invoker_retry_delay: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 50,
            operation_check_interval: Duration::from_secs(30),
            max_parallel_operations: 0,
            max_retries: 5,
            invoker_max_retries: 5,
            invoker_retry_delay: Duration::from_secs(10),
        }
    }
}

/// Configuration for the bookkeeping sweep.
#[derive(Clone, Debug)]
pub struct BookkeeperConfig {
    /// How often in-flight reconciliations are evaluated.
    pub operations_watch_interval: Duration,
    /// Silence window after which an `in_progress` operation is orphaned.
    pub orphan_operation_timeout: Duration,
}

impl Default for BookkeeperConfig {
    fn default() -> Self {
        Self {
            operations_watch_interval: Duration::from_secs(45),
            orphan_operation_timeout: Duration::from_secs(10 * 60),
        }
    }
}

/// Configuration for the retention cleaner.
#[derive(Clone, Debug)]
pub struct CleanerConfig {
    /// How often finished records are purged.
    pub cleaner_interval: Duration,
    /// Retention window for finished reconciliations.
    pub purge_entities_older_than: Duration,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            cleaner_interval: Duration::from_secs(60 * 60),
            purge_entities_older_than: Duration::from_secs(14 * 24 * 60 * 60),
        }
    }
}

/// Configuration for a heartbeat sender.
#[derive(Clone, Debug)]
pub struct HeartbeatConfig {
    /// Cadence at which interim statuses are resent.
    pub interval: Duration,
    /// Overall deadline; once elapsed the sender closes its context and
    /// rejects further status changes.
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(60 * 60),
        }
    }
}

impl SchedulerConfig {
    /// Replace zero values with defaults.
    pub fn validate(mut self) -> anyhow::Result<Self> {
        let defaults = Self::default();
        if self.watch_interval.is_zero() {
            self.watch_interval = defaults.watch_interval;
        }
        if self.cluster_reconcile_interval.is_zero() {
            self.cluster_reconcile_interval = defaults.cluster_reconcile_interval;
        }
        if self.cluster_queue_size == 0 {
            self.cluster_queue_size = defaults.cluster_queue_size;
        }
        Ok(self)
    }
}

impl WorkerPoolConfig {
    /// Replace zero values with defaults. `max_parallel_operations` keeps
    /// zero as "unlimited".
    pub fn validate(mut self) -> anyhow::Result<Self> {
        let defaults = Self::default();
        if self.pool_size == 0 {
            self.pool_size = defaults.pool_size;
        }
        if self.operation_check_interval.is_zero() {
            self.operation_check_interval = defaults.operation_check_interval;
        }
        if self.max_retries == 0 {
            self.max_retries = defaults.max_retries;
        }
        if self.invoker_max_retries == 0 {
            self.invoker_max_retries = defaults.invoker_max_retries;
        }
        Ok(self)
    }
}

impl BookkeeperConfig {
    pub fn validate(mut self) -> anyhow::Result<Self> {
        let defaults = Self::default();
        if self.operations_watch_interval.is_zero() {
            self.operations_watch_interval = defaults.operations_watch_interval;
        }
        if self.orphan_operation_timeout.is_zero() {
            self.orphan_operation_timeout = defaults.orphan_operation_timeout;
        }
        Ok(self)
    }
}

impl CleanerConfig {
    pub fn validate(mut self) -> anyhow::Result<Self> {
        let defaults = Self::default();
        if self.cleaner_interval.is_zero() {
            self.cleaner_interval = defaults.cleaner_interval;
        }
        if self.purge_entities_older_than.is_zero() {
            self.purge_entities_older_than = defaults.purge_entities_older_than;
        }
        Ok(self)
    }
}

impl HeartbeatConfig {
    /// Replace zero values with defaults; the timeout must exceed the resend
    /// interval or the first resend could never fire.
    pub fn validate(mut self) -> anyhow::Result<Self> {
        let defaults = Self::default();
        if self.interval.is_zero() {
            self.interval = defaults.interval;
        }
        if self.timeout.is_zero() {
            self.timeout = defaults.timeout;
        }
        if self.timeout <= self.interval {
            anyhow::bail!(
                "heartbeat timeout ({:?}) must be greater than the interval ({:?})",
                self.timeout,
                self.interval
            );
        }
        Ok(self)
    }
}
