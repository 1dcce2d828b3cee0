//! Operation dispatch.
//!
//! The invoker sends one run request to a component reconciler and reports
//! whether the work was accepted. Acceptance is not completion: the remote
//! worker reports progress later through the callback endpoint. Connection
//! failures, timeouts and HTTP 429 (remote pool saturated) are retried a
//! bounded number of times with a fixed delay; any other non-2xx response is
//! a definitive failure reported upward without further retry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{CorrelationId, OperationType, RuntimeId, SchedulingId};

/// Dispatch parameters assembled by the worker pool for one operation.
#[derive(Clone, Debug)]
pub struct Params {
    pub scheduling_id: SchedulingId,
    pub correlation_id: CorrelationId,
    pub runtime_id: RuntimeId,
    pub component: String,
    pub namespace: String,
    pub version: String,
    pub op_type: OperationType,
    pub kubeconfig: String,
    /// Merged component configuration; see the `overrides` module.
    pub configuration: Value,
    /// Components of lower tiers that already reached `done`.
    pub components_ready: Vec<String>,
    pub max_retries: u32,
}

impl Params {
    /// The run request sent to the remote worker, with the callback URL the
    /// worker reports back to.
    pub fn to_task(&self, callback_base_url: &str) -> Task {
        Task {
            component: self.component.clone(),
            namespace: self.namespace.clone(),
            version: self.version.clone(),
            op_type: self.op_type,
            kubeconfig: self.kubeconfig.clone(),
            configuration: self.configuration.clone(),
            correlation_id: self.correlation_id,
            callback_url: format!(
                "{}/v1/operations/{}/callback/{}",
                callback_base_url.trim_end_matches('/'),
                self.scheduling_id,
                self.correlation_id
            ),
            components_ready: self.components_ready.clone(),
            max_retries: self.max_retries,
        }
    }
}

/// Wire format of a run request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub component: String,
    pub namespace: String,
    pub version: String,
    #[serde(rename = "type")]
    pub op_type: OperationType,
    pub kubeconfig: String,
    pub configuration: Value,
    #[serde(rename = "correlationID")]
    pub correlation_id: CorrelationId,
    #[serde(rename = "callbackURL")]
    pub callback_url: String,
    #[serde(rename = "componentsReady")]
    pub components_ready: Vec<String>,
    #[serde(rename = "maxRetries")]
    pub max_retries: u32,
}

/// Maps component names to the base URL of the reconciler responsible for
/// them. Unmapped components fall back to the default reconciler, the usual
/// deployment for most components.
#[derive(Clone, Debug, Default)]
pub struct ReconcilerRegistry {
    targets: HashMap<String, String>,
    fallback: Option<String>,
}

impl ReconcilerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fallback(fallback: impl Into<String>) -> Self {
        Self {
            targets: HashMap::new(),
            fallback: Some(fallback.into()),
        }
    }

    pub fn register(&mut self, component: impl Into<String>, url: impl Into<String>) -> &mut Self {
        self.targets.insert(component.into(), url.into());
        self
    }

    pub fn resolve(&self, component: &str) -> Option<&str> {
        self.targets
            .get(component)
            .map(String::as_str)
            .or(self.fallback.as_deref())
    }
}

/// Trait for sending one run request to a component reconciler.
#[async_trait]
pub trait Invoker: Send + Sync {
    async fn invoke(&self, params: &Params) -> anyhow::Result<()>;
}

/// HTTP invoker dispatching to remote component reconcilers.
pub struct RemoteInvoker {
    registry: ReconcilerRegistry,
    client: reqwest::Client,
    callback_base_url: String,
    max_retries: u32,
    retry_delay: Duration,
}

impl RemoteInvoker {
    pub fn new(
        registry: ReconcilerRegistry,
        client: reqwest::Client,
        callback_base_url: impl Into<String>,
        max_retries: u32,
        retry_delay: Duration,
    ) -> Self {
        Self {
            registry,
            client,
            callback_base_url: callback_base_url.into(),
            max_retries: max_retries.max(1),
            retry_delay,
        }
    }
}

#[async_trait]
impl Invoker for RemoteInvoker {
    async fn invoke(&self, params: &Params) -> anyhow::Result<()> {
        let base_url = self.registry.resolve(&params.component).ok_or_else(|| {
            anyhow::anyhow!(
                "no reconciler registered for component '{}'",
                params.component
            )
        })?;
        let url = format!("{}/v1/run", base_url.trim_end_matches('/'));
        let task = params.to_task(&self.callback_base_url);

        for attempt in 1..=self.max_retries {
            match self.client.post(&url).json(&task).send().await {
                Ok(response) if response.status().is_success() => {
                    tracing::debug!(
                        component = %params.component,
                        correlation_id = %params.correlation_id,
                        attempt,
                        "run request accepted"
                    );
                    return Ok(());
                }
                Ok(response) if response.status() == StatusCode::TOO_MANY_REQUESTS => {
                    // remote worker pool saturated; backpressure, not an error
                    tracing::debug!(
                        component = %params.component,
                        url = %url,
                        attempt,
                        "remote reconciler saturated (HTTP 429)"
                    );
                }
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    anyhow::bail!(
                        "reconciler at '{url}' rejected component '{}' with HTTP {status}: {body}",
                        params.component
                    );
                }
                Err(err) if err.is_connect() || err.is_timeout() => {
                    tracing::debug!(
                        component = %params.component,
                        url = %url,
                        attempt,
                        error = %err,
                        "run request not delivered"
                    );
                }
                Err(err) => return Err(err.into()),
            }
            if attempt < self.max_retries {
                // fixed delay keeps dispatch latency bounded under overload
                tokio::time::sleep(self.retry_delay).await;
            }
        }
        anyhow::bail!(
            "reconciler at '{url}' did not accept component '{}' after {} attempts",
            params.component,
            self.max_retries
        )
    }
}

/// Runs a component in-process; used by the local runtime mode and tests.
#[async_trait]
pub trait ComponentRunner: Send + Sync {
    async fn run(&self, task: &Task) -> anyhow::Result<()>;
}

/// Invoker executing components in-process instead of over HTTP.
///
/// The run is spawned so that invocation returns on acceptance, mirroring
/// the remote contract; completion is reported through the callback handler.
pub struct LocalInvoker {
    runner: Arc<dyn ComponentRunner>,
    on_finished: Arc<dyn Fn(&Params, anyhow::Result<()>) + Send + Sync>,
}

impl LocalInvoker {
    pub fn new(
        runner: Arc<dyn ComponentRunner>,
        on_finished: Arc<dyn Fn(&Params, anyhow::Result<()>) + Send + Sync>,
    ) -> Self {
        Self {
            runner,
            on_finished,
        }
    }
}

#[async_trait]
impl Invoker for LocalInvoker {
    async fn invoke(&self, params: &Params) -> anyhow::Result<()> {
        let runner = Arc::clone(&self.runner);
        let on_finished = Arc::clone(&self.on_finished);
        let params = params.clone();
        let task = params.to_task("local://orchestrator");
        tokio::spawn(async move {
            let outcome = runner.run(&task).await;
            on_finished(&params, outcome);
        });
        Ok(())
    }
}
