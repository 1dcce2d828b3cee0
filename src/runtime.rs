//! Process wiring.
//!
//! [`ReconcilerRuntime`] owns the long-lived loops (inventory watcher,
//! scheduler, worker pool, bookkeeper, cleaner) and parents them to a single
//! [`ShutdownToken`]. On shutdown, in-flight invoker calls finish or time out
//! naturally so operations are never left `in_progress` with no pending
//! heartbeat.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;

use crate::bookkeeper::Bookkeeper;
use crate::cleaner::Cleaner;
use crate::config::{BookkeeperConfig, CleanerConfig, SchedulerConfig, WorkerPoolConfig};
use crate::inventory::Inventory;
use crate::invoker::Invoker;
use crate::model::{ClusterState, ClusterStatus};
use crate::overrides::ProfileDefaults;
use crate::reconciliation::ReconciliationRepository;
use crate::scheduler::Scheduler;
use crate::transition::ClusterStatusTransition;
use crate::watch::InventoryWatcher;
use crate::worker::WorkerPool;

/// Token for signaling graceful shutdown to the runtime's loops.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    inner: Arc<ShutdownTokenInner>,
}

#[derive(Debug)]
struct ShutdownTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownTokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Check if cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        // the Notified future receives notify_waiters wakeups from the moment
        // it is created, so a cancel landing between the flag check and the
        // await is not lost
        let notified = self.inner.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Aggregate configuration of all runtime loops.
#[derive(Clone, Debug, Default)]
pub struct RuntimeConfig {
    pub scheduler: SchedulerConfig,
    pub workers: WorkerPoolConfig,
    pub bookkeeper: BookkeeperConfig,
    pub cleaner: CleanerConfig,
}

impl RuntimeConfig {
    pub fn validate(self) -> anyhow::Result<Self> {
        Ok(Self {
            scheduler: self.scheduler.validate()?,
            workers: self.workers.validate()?,
            bookkeeper: self.bookkeeper.validate()?,
            cleaner: self.cleaner.validate()?,
        })
    }
}

pub struct ReconcilerRuntime {
    config: RuntimeConfig,
    transition: Arc<ClusterStatusTransition>,
    pool: Arc<WorkerPool>,
    bookkeeper: Arc<Bookkeeper>,
    cleaner: Arc<Cleaner>,
    watcher: Arc<InventoryWatcher>,
    scheduler: Arc<Scheduler>,
    shutdown_token: ShutdownToken,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ReconcilerRuntime {
    pub fn new(
        config: RuntimeConfig,
        inventory: Arc<dyn Inventory>,
        repository: Arc<dyn ReconciliationRepository>,
        invoker: Arc<dyn Invoker>,
        profile_defaults: ProfileDefaults,
        global_overrides: std::collections::BTreeMap<String, serde_json::Value>,
    ) -> anyhow::Result<Self> {
        let config = config.validate()?;
        let transition = Arc::new(ClusterStatusTransition::new(
            Arc::clone(&inventory),
            Arc::clone(&repository),
            config.scheduler.clone(),
        ));
        let pool = Arc::new(WorkerPool::new(
            config.workers.clone(),
            Arc::clone(&inventory),
            Arc::clone(&repository),
            invoker,
            profile_defaults,
            global_overrides,
        ));
        let bookkeeper = Arc::new(Bookkeeper::new(
            Arc::clone(&transition),
            config.bookkeeper.clone(),
        ));
        let cleaner = Arc::new(Cleaner::new(
            repository,
            Arc::clone(&inventory),
            config.cleaner.clone(),
        ));
        let watcher = Arc::new(InventoryWatcher::new(
            inventory,
            config.scheduler.watch_interval,
            config.scheduler.cluster_reconcile_interval,
        ));
        let scheduler = Arc::new(Scheduler::new(Arc::clone(&transition)));

        Ok(Self {
            config,
            transition,
            pool,
            bookkeeper,
            cleaner,
            watcher,
            scheduler,
            shutdown_token: ShutdownToken::new(),
            task_handles: Mutex::new(Vec::new()),
        })
    }

    pub fn transition(&self) -> Arc<ClusterStatusTransition> {
        Arc::clone(&self.transition)
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown_token.clone()
    }

    /// Spawn all long-lived loops.
    pub async fn start(&self) {
        let (queue_tx, queue_rx) =
            mpsc::channel::<ClusterState>(self.config.scheduler.cluster_queue_size);

        let watcher = Arc::clone(&self.watcher);
        let shutdown = self.shutdown_token.clone();
        let watcher_handle = tokio::spawn(async move {
            watcher.run(queue_tx, shutdown).await;
        });

        let scheduler = Arc::clone(&self.scheduler);
        let shutdown = self.shutdown_token.clone();
        let scheduler_handle = tokio::spawn(async move {
            scheduler.run(queue_rx, shutdown).await;
        });

        let pool = Arc::clone(&self.pool);
        let shutdown = self.shutdown_token.clone();
        let pool_handle = tokio::spawn(async move {
            pool.run(shutdown).await;
        });

        let bookkeeper = Arc::clone(&self.bookkeeper);
        let shutdown = self.shutdown_token.clone();
        let bookkeeper_handle = tokio::spawn(async move {
            bookkeeper.run(shutdown).await;
        });

        let cleaner = Arc::clone(&self.cleaner);
        let shutdown = self.shutdown_token.clone();
        let cleaner_handle = tokio::spawn(async move {
            cleaner.run(shutdown).await;
        });

        let mut handles = self.task_handles.lock().await;
        handles.extend([
            watcher_handle,
            scheduler_handle,
            pool_handle,
            bookkeeper_handle,
            cleaner_handle,
        ]);
        tracing::info!("reconciler runtime started");
    }

    /// Gracefully stop all loops.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        tracing::info!("initiating graceful shutdown of reconciler runtime");
        self.shutdown_token.cancel();

        let handles = {
            let mut guard = self.task_handles.lock().await;
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            match tokio::time::timeout(Duration::from_secs(30), handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::warn!("runtime task failed: {err:?}"),
                Err(_) => tracing::warn!("runtime task timed out during shutdown"),
            }
        }
        tracing::info!("reconciler runtime shutdown complete");
        Ok(())
    }

    /// Drive one cluster to a final status without the periodic loops.
    ///
    /// Used by the local runtime mode and tests: schedules the cluster, then
    /// alternates dispatch scans and bookkeeping sweeps until the
    /// reconciliation finishes or the deadline elapses.
    pub async fn reconcile_local(
        &self,
        state: &ClusterState,
        deadline: Duration,
    ) -> anyhow::Result<ClusterStatus> {
        let reconciliation = self.transition.start_reconciliation(state).await?;
        let result = tokio::time::timeout(deadline, async {
            loop {
                self.pool.run_once().await?;
                self.bookkeeper.run_once().await?;
                let current = self
                    .transition
                    .repository()
                    .get_reconciliation(&reconciliation.scheduling_id)
                    .await?;
                if current.finished {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            anyhow::Ok(())
        })
        .await;
        match result {
            Ok(inner) => inner?,
            Err(_) => anyhow::bail!(
                "reconciliation '{}' did not finish within {:?}",
                reconciliation.scheduling_id,
                deadline
            ),
        }

        let current = self
            .transition
            .inventory()
            .get_latest(state.runtime_id())
            .await?;
        Ok(current.status.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_shutdown_token_shared_state() {
        let token = ShutdownToken::new();
        let clone1 = token.clone();
        let clone2 = token.clone();

        token.cancel();

        assert!(clone1.is_cancelled());
        assert!(clone2.is_cancelled());
        timeout(Duration::from_secs(1), clone1.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_token_cancelled_wakes_clones() {
        let token = ShutdownToken::new();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let clone = token.clone();
                tokio::spawn(async move { clone.cancelled().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();

        let results = timeout(Duration::from_secs(5), futures::future::join_all(waiters))
            .await
            .expect("waiters did not observe cancellation within 5 seconds");
        for result in results {
            result.expect("waiter task panicked");
        }
    }

    #[tokio::test]
    async fn test_cancel_racing_with_new_waiters_never_hangs() {
        for _ in 0..50 {
            let token = ShutdownToken::new();
            let waiters: Vec<_> = (0..4)
                .map(|_| {
                    let clone = token.clone();
                    tokio::spawn(async move { clone.cancelled().await })
                })
                .collect();
            // no yield before cancelling: waiters may or may not have
            // started polling yet
            token.cancel();
            timeout(Duration::from_secs(5), futures::future::join_all(waiters))
                .await
                .expect("a waiter missed the cancellation");
        }
    }

    #[tokio::test]
    async fn test_shutdown_token_default_not_cancelled() {
        let token = ShutdownToken::default();
        assert!(!token.is_cancelled());
    }
}
