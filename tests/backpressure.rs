//! Worker pool slot accounting: dispatch concurrency is bounded by the pool
//! size, across clusters.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Barrier;

use fleet_reconciler::invoker::{Invoker, Params};
use fleet_reconciler::overrides::ProfileDefaults;
use fleet_reconciler::reconciliation::InMemoryReconciliationRepository;
use fleet_reconciler::{
    ClusterRegistration, Component, DeleteStrategy, InMemoryInventory, Inventory, OperationType,
    ReconciliationRepository, WorkerPool, WorkerPoolConfig,
};

struct GaugedInvoker {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    hold: Duration,
}

impl GaugedInvoker {
    fn new(hold: Duration) -> Arc<Self> {
        Arc::new(Self {
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            hold,
        })
    }
}

#[async_trait]
impl Invoker for GaugedInvoker {
    async fn invoke(&self, _params: &Params) -> anyhow::Result<()> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        tokio::time::sleep(self.hold).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

async fn pool_with_clusters(
    invoker: Arc<dyn Invoker>,
    pool_size: usize,
    cluster_count: usize,
) -> WorkerPool {
    let inventory = Arc::new(InMemoryInventory::new());
    let repository = Arc::new(InMemoryReconciliationRepository::new());

    for i in 0..cluster_count {
        let state = inventory
            .create_or_update(ClusterRegistration {
                runtime_id: format!("rt-{i}").into(),
                kubeconfig: "kubeconfig".into(),
                kyma_version: "2.0.0".into(),
                kyma_profile: None,
                components: vec![Component::new("app", "kyma-system")],
            })
            .await
            .unwrap();
        let sequence =
            state
                .configuration
                .reconciliation_sequence(&[], DeleteStrategy::default(), false);
        repository
            .create_reconciliation(&state, &sequence, OperationType::Reconcile)
            .await
            .unwrap();
    }

    WorkerPool::new(
        WorkerPoolConfig {
            pool_size,
            operation_check_interval: Duration::from_millis(10),
            max_parallel_operations: 0,
            max_retries: 3,
            invoker_max_retries: 1,
            invoker_retry_delay: Duration::from_millis(1),
        },
        inventory,
        repository as Arc<dyn ReconciliationRepository>,
        invoker,
        ProfileDefaults::new(),
        BTreeMap::new(),
    )
}

#[tokio::test]
async fn test_single_slot_serializes_dispatches() {
    let invoker = GaugedInvoker::new(Duration::from_millis(30));
    let pool = pool_with_clusters(invoker.clone(), 1, 3).await;

    let dispatched = pool.run_once().await.unwrap();
    assert_eq!(dispatched, 3);
    assert_eq!(invoker.max_in_flight.load(Ordering::SeqCst), 1);
}

/// Both dispatches must be in flight at once to pass the barrier; a
/// serialized pool would hang and trip the timeout.
struct BarrierInvoker {
    barrier: Barrier,
}

#[async_trait]
impl Invoker for BarrierInvoker {
    async fn invoke(&self, _params: &Params) -> anyhow::Result<()> {
        self.barrier.wait().await;
        Ok(())
    }
}

#[tokio::test]
async fn test_two_slots_dispatch_concurrently() {
    let invoker = Arc::new(BarrierInvoker {
        barrier: Barrier::new(2),
    });
    let pool = pool_with_clusters(invoker, 2, 2).await;

    let dispatched = tokio::time::timeout(Duration::from_secs(5), pool.run_once())
        .await
        .expect("dispatches did not run concurrently")
        .unwrap();
    assert_eq!(dispatched, 2);
}

#[tokio::test]
async fn test_occupancy_returns_to_zero_after_scan() {
    let invoker = GaugedInvoker::new(Duration::from_millis(5));
    let pool = pool_with_clusters(invoker, 2, 2).await;

    pool.run_once().await.unwrap();
    assert_eq!(pool.occupancy().busy(), 0);
}
