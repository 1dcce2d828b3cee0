//! The dispatching worker pool.
//!
//! A fixed number of dispatch slots is shared across all in-flight
//! reconciliations. The pool periodically scans for dispatchable operations,
//! acquires a slot per operation (blocking when the pool is saturated, the
//! system's primary backpressure mechanism) and invokes the component
//! reconciler asynchronously. A slot is released when the invoker call
//! returns; remote completion arrives later through the callback endpoint.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::WorkerPoolConfig;
use crate::inventory::Inventory;
use crate::invoker::{Invoker, Params};
use crate::model::{ClusterState, OperationEntity, OperationState};
use crate::occupancy::OccupancyTracker;
use crate::overrides::{merge_component_configuration, ProfileDefaults};
use crate::reconciliation::ReconciliationRepository;
use crate::runtime::ShutdownToken;
use crate::telemetry;

pub struct WorkerPool {
    config: WorkerPoolConfig,
    inventory: Arc<dyn Inventory>,
    repository: Arc<dyn ReconciliationRepository>,
    invoker: Arc<dyn Invoker>,
    profile_defaults: ProfileDefaults,
    global_overrides: BTreeMap<String, Value>,
    slots: Arc<Semaphore>,
    occupancy: OccupancyTracker,
}

impl WorkerPool {
    pub fn new(
        config: WorkerPoolConfig,
        inventory: Arc<dyn Inventory>,
        repository: Arc<dyn ReconciliationRepository>,
        invoker: Arc<dyn Invoker>,
        profile_defaults: ProfileDefaults,
        global_overrides: BTreeMap<String, Value>,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(config.pool_size));
        let occupancy = OccupancyTracker::new(config.pool_size);
        Self {
            config,
            inventory,
            repository,
            invoker,
            profile_defaults,
            global_overrides,
            slots,
            occupancy,
        }
    }

    pub fn occupancy(&self) -> &OccupancyTracker {
        &self.occupancy
    }

    /// Scan-and-dispatch until shutdown. The first scan runs immediately.
    pub async fn run(&self, shutdown: ShutdownToken) {
        loop {
            if let Err(err) = self.run_once().await {
                tracing::warn!(error = %err, "worker pool scan failed");
            }
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("worker pool shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.operation_check_interval) => {}
            }
        }
    }

    /// One scan: dispatch every currently eligible operation. Returns the
    /// number of operations handed to the invoker.
    pub async fn run_once(&self) -> anyhow::Result<usize> {
        let processable = self
            .repository
            .get_processable_operations(self.config.max_parallel_operations)
            .await?;
        if processable.is_empty() {
            return Ok(0);
        }

        let mut dispatched = 0;
        let mut calls = JoinSet::new();
        for op in processable {
            if op.state == OperationState::Failed && op.retries >= self.config.max_retries {
                let reason = format!(
                    "giving up after {} dispatch attempts{}",
                    op.retries,
                    op.reason
                        .as_deref()
                        .map(|r| format!(": {r}"))
                        .unwrap_or_default()
                );
                tracing::warn!(operation = %op, "operation retries exhausted");
                self.repository
                    .update_operation_state(
                        &op.scheduling_id,
                        &op.correlation_id,
                        OperationState::Error,
                        Some(reason),
                        None,
                    )
                    .await?;
                continue;
            }

            let params = match self.dispatch_params(&op).await {
                Ok(params) => params,
                Err(err) => {
                    self.repository
                        .update_operation_state(
                            &op.scheduling_id,
                            &op.correlation_id,
                            OperationState::Failed,
                            Some(format!("cannot assemble dispatch parameters: {err}")),
                            None,
                        )
                        .await?;
                    continue;
                }
            };

            // blocks when the pool is saturated
            let permit = Arc::clone(&self.slots)
                .acquire_owned()
                .await
                .map_err(|_| anyhow::anyhow!("worker pool slots closed"))?;

            self.repository
                .mark_operation_dispatched(&op.scheduling_id, &op.correlation_id)
                .await?;
            dispatched += 1;

            let invoker = Arc::clone(&self.invoker);
            let repository = Arc::clone(&self.repository);
            let guard = self.occupancy.acquire();
            calls.spawn(telemetry::instrument_dispatch(
                op.correlation_id.to_string(),
                op.component.clone(),
                async move {
                    let _guard = guard;
                    let started = Instant::now();
                    let outcome = invoker.invoke(&params).await;
                    telemetry::observe_dispatch_duration(
                        &params.component,
                        started.elapsed().as_secs_f64(),
                    );
                    drop(permit);

                    match outcome {
                        Ok(()) => {
                            telemetry::record_operation_dispatched(&params.component, "accepted");
                        }
                        Err(err) => {
                            telemetry::record_operation_dispatched(&params.component, "failed");
                            let update = repository
                                .update_operation_state(
                                    &params.scheduling_id,
                                    &params.correlation_id,
                                    OperationState::Failed,
                                    Some(err.to_string()),
                                    None,
                                )
                                .await;
                            if let Err(err) = update {
                                tracing::error!(
                                    correlation_id = %params.correlation_id,
                                    error = %err,
                                    "cannot mark operation failed"
                                );
                            }
                        }
                    }
                },
            ));
        }

        // wait for dispatch calls, not for remote completion
        while calls.join_next().await.is_some() {}
        Ok(dispatched)
    }

    async fn dispatch_params(&self, op: &OperationEntity) -> anyhow::Result<Params> {
        let state: ClusterState = self
            .inventory
            .get(&op.runtime_id, op.config_version)
            .await?;
        let component = state
            .configuration
            .get_component(&op.component)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "component '{}' missing from configuration version {} of cluster '{}'",
                    op.component,
                    op.config_version,
                    op.runtime_id
                )
            })?;

        let configuration = merge_component_configuration(
            state
                .configuration
                .kyma_profile
                .as_deref()
                .and_then(|_| self.profile_defaults.for_component(&op.component)),
            &component.configuration,
            &self.global_overrides,
        );

        let components_ready = self
            .repository
            .get_operations(&op.scheduling_id)
            .await?
            .into_iter()
            .filter(|other| other.state == OperationState::Done)
            .map(|other| other.component)
            .collect();

        Ok(Params {
            scheduling_id: op.scheduling_id,
            correlation_id: op.correlation_id,
            runtime_id: op.runtime_id.clone(),
            component: component.component.clone(),
            namespace: component.namespace.clone(),
            version: component
                .version
                .clone()
                .unwrap_or_else(|| state.configuration.kyma_version.clone()),
            op_type: op.op_type,
            kubeconfig: state.cluster.kubeconfig.clone(),
            configuration,
            components_ready,
            max_retries: self.config.max_retries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;

    use crate::inventory::{ClusterRegistration, InMemoryInventory};
    use crate::model::{Component, DeleteStrategy, OperationType};
    use crate::reconciliation::InMemoryReconciliationRepository;

    struct ScriptedInvoker {
        calls: Mutex<Vec<Params>>,
        fail_with: Option<String>,
    }

    impl ScriptedInvoker {
        fn accepting() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                fail_with: None,
            })
        }

        fn failing(reason: &str) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                fail_with: Some(reason.to_string()),
            })
        }
    }

    #[async_trait]
    impl Invoker for ScriptedInvoker {
        async fn invoke(&self, params: &Params) -> anyhow::Result<()> {
            self.calls.lock().push(params.clone());
            match &self.fail_with {
                Some(reason) => anyhow::bail!("{reason}"),
                None => Ok(()),
            }
        }
    }

    async fn setup(
        invoker: Arc<ScriptedInvoker>,
        max_retries: u32,
    ) -> (
        WorkerPool,
        Arc<InMemoryReconciliationRepository>,
        crate::model::SchedulingId,
    ) {
        let inventory = Arc::new(InMemoryInventory::new());
        let repository = Arc::new(InMemoryReconciliationRepository::new());

        let mut component = Component::new("istio", "istio-system");
        component
            .configuration
            .insert("gateway.replicas".into(), serde_json::json!(2));
        let state = inventory
            .create_or_update(ClusterRegistration {
                runtime_id: "rt-1".into(),
                kubeconfig: "kubeconfig".into(),
                kyma_version: "2.0.0".into(),
                kyma_profile: None,
                components: vec![component, Component::new("serverless", "kyma-system")],
            })
            .await
            .unwrap();
        let sequence =
            state
                .configuration
                .reconciliation_sequence(&[], DeleteStrategy::default(), false);
        let recon = repository
            .create_reconciliation(&state, &sequence, OperationType::Reconcile)
            .await
            .unwrap();

        let config = WorkerPoolConfig {
            pool_size: 4,
            operation_check_interval: Duration::from_millis(10),
            max_parallel_operations: 0,
            max_retries,
            invoker_max_retries: 1,
            invoker_retry_delay: Duration::from_millis(1),
        };
        let pool = WorkerPool::new(
            config,
            inventory,
            repository.clone() as Arc<dyn ReconciliationRepository>,
            invoker,
            ProfileDefaults::new(),
            BTreeMap::new(),
        );
        (pool, repository, recon.scheduling_id)
    }

    #[tokio::test]
    async fn test_dispatch_marks_in_progress() {
        let invoker = ScriptedInvoker::accepting();
        let (pool, repository, scheduling_id) = setup(invoker.clone(), 3).await;

        let dispatched = pool.run_once().await.unwrap();
        assert_eq!(dispatched, 1);

        let ops = repository.get_operations(&scheduling_id).await.unwrap();
        let istio = ops.iter().find(|op| op.component == "istio").unwrap();
        assert_eq!(istio.state, OperationState::InProgress);
        assert_eq!(istio.retries, 1);

        let calls = invoker.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].namespace, "istio-system");
        assert_eq!(calls[0].version, "2.0.0");
        assert_eq!(
            calls[0].configuration,
            serde_json::json!({"gateway": {"replicas": 2}})
        );
    }

    #[tokio::test]
    async fn test_failed_dispatch_marks_operation_failed() {
        let invoker = ScriptedInvoker::failing("connection refused");
        let (pool, repository, scheduling_id) = setup(invoker, 3).await;

        pool.run_once().await.unwrap();

        let ops = repository.get_operations(&scheduling_id).await.unwrap();
        let istio = ops.iter().find(|op| op.component == "istio").unwrap();
        assert_eq!(istio.state, OperationState::Failed);
        assert!(istio.reason.as_deref().unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_exactly_max_retries_dispatch_attempts() {
        let invoker = ScriptedInvoker::failing("always down");
        let (pool, repository, scheduling_id) = setup(invoker.clone(), 3).await;

        // each scan re-dispatches the failed operation until exhaustion
        for _ in 0..6 {
            pool.run_once().await.unwrap();
        }

        assert_eq!(invoker.calls.lock().len(), 3);
        let ops = repository.get_operations(&scheduling_id).await.unwrap();
        let istio = ops.iter().find(|op| op.component == "istio").unwrap();
        assert_eq!(istio.state, OperationState::Error);
        assert!(istio.reason.as_deref().unwrap().contains("3 dispatch attempts"));
    }

    #[tokio::test]
    async fn test_heartbeats_do_not_consume_retry_budget() {
        let invoker = ScriptedInvoker::failing("worker crashed");
        let (pool, repository, scheduling_id) = setup(invoker.clone(), 3).await;

        pool.run_once().await.unwrap();
        let ops = repository.get_operations(&scheduling_id).await.unwrap();
        let cid = ops
            .iter()
            .find(|op| op.component == "istio")
            .unwrap()
            .correlation_id;

        // remote heartbeats after the first dispatch: progress, a transient
        // failure, progress again
        for (state, retry_id) in [
            (OperationState::InProgress, "hb-1"),
            (OperationState::Failed, "hb-2"),
            (OperationState::InProgress, "hb-3"),
        ] {
            repository
                .update_operation_state(
                    &scheduling_id,
                    &cid,
                    state,
                    None,
                    Some(retry_id.into()),
                )
                .await
                .unwrap();
        }
        let op = repository.get_operation(&scheduling_id, &cid).await.unwrap();
        assert_eq!(op.retries, 1);

        // after another failure the operation is re-dispatched, not given up on
        repository
            .update_operation_state(
                &scheduling_id,
                &cid,
                OperationState::Failed,
                Some("apply failed".into()),
                Some("hb-4".into()),
            )
            .await
            .unwrap();
        pool.run_once().await.unwrap();

        let op = repository.get_operation(&scheduling_id, &cid).await.unwrap();
        assert_eq!(op.retries, 2);
        assert_ne!(op.state, OperationState::Error);
        let istio_dispatches = invoker
            .calls
            .lock()
            .iter()
            .filter(|p| p.component == "istio")
            .count();
        assert_eq!(istio_dispatches, 2);
    }

    #[tokio::test]
    async fn test_second_tier_gets_components_ready() {
        let invoker = ScriptedInvoker::accepting();
        let (pool, repository, scheduling_id) = setup(invoker.clone(), 3).await;

        pool.run_once().await.unwrap();
        let ops = repository.get_operations(&scheduling_id).await.unwrap();
        let istio = ops.iter().find(|op| op.component == "istio").unwrap();
        repository
            .update_operation_state(
                &scheduling_id,
                &istio.correlation_id,
                OperationState::Done,
                None,
                None,
            )
            .await
            .unwrap();

        pool.run_once().await.unwrap();
        let calls = invoker.calls.lock();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].component, "serverless");
        assert_eq!(calls[1].components_ready, vec!["istio".to_string()]);
    }
}
