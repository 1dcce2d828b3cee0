//! The orchestrator-facing HTTP API.
//!
//! Registration and status endpoints are backed by the inventory; the
//! callback endpoint is the receiving side of the heartbeat protocol and
//! feeds operation state transitions into the reconciliation store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::error::ReconcilerError;
use crate::inventory::{ClusterRegistration, Inventory};
use crate::model::{
    CallbackStatus, ClusterState, ClusterStatus, Component, CorrelationId, OperationEntity,
    OperationState, ReconciliationEntity, SchedulingId,
};
use crate::reconciliation::{ReconciliationFilter, ReconciliationRepository, StateUpdate};
use crate::telemetry;

const DEFAULT_STATUS_CHANGES_OFFSET: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Clone)]
pub struct AppState {
    pub inventory: Arc<dyn Inventory>,
    pub repository: Arc<dyn ReconciliationRepository>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/clusters", post(register_cluster).put(register_cluster))
        .route(
            "/v1/clusters/{runtimeID}",
            axum::routing::delete(delete_cluster),
        )
        .route("/v1/clusters/{runtimeID}/status", get(cluster_status))
        .route(
            "/v1/clusters/{runtimeID}/configs/{configVersion}/status",
            get(config_status),
        )
        .route(
            "/v1/clusters/{runtimeID}/statusChanges",
            get(status_changes),
        )
        .route(
            "/v1/operations/{schedulingID}/callback/{correlationID}",
            post(operation_callback),
        )
        .route("/v1/reconciliations", get(list_reconciliations))
        .route(
            "/v1/reconciliations/{schedulingID}/info",
            get(reconciliation_info),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Internal(err) => {
                tracing::error!(error = %err, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        if ReconcilerError::is_not_found(&err) {
            ApiError::NotFound(err.to_string())
        } else if matches!(
            err.downcast_ref::<ReconcilerError>(),
            Some(ReconcilerError::InvalidRequest(_))
        ) {
            ApiError::BadRequest(err.to_string())
        } else {
            ApiError::Internal(err)
        }
    }
}

#[derive(Debug, Deserialize)]
struct RegisterClusterRequest {
    #[serde(rename = "runtimeID")]
    runtime_id: String,
    kubeconfig: String,
    #[serde(rename = "kymaConfig")]
    kyma_config: KymaConfig,
}

#[derive(Debug, Deserialize)]
struct KymaConfig {
    version: String,
    #[serde(default)]
    profile: Option<String>,
    components: Vec<Component>,
}

#[derive(Debug, Serialize)]
struct ClusterResponse {
    #[serde(rename = "runtimeID")]
    runtime_id: String,
    #[serde(rename = "clusterVersion")]
    cluster_version: i64,
    #[serde(rename = "configurationVersion")]
    config_version: i64,
    status: ClusterStatus,
    #[serde(rename = "statusURL")]
    status_url: String,
}

impl ClusterResponse {
    fn from_state(state: &ClusterState) -> Self {
        let runtime_id = state.runtime_id().to_string();
        Self {
            status_url: format!("/v1/clusters/{runtime_id}/status"),
            runtime_id,
            cluster_version: state.cluster.version,
            config_version: state.configuration.version,
            status: state.status.status,
        }
    }
}

async fn register_cluster(
    State(state): State<AppState>,
    Json(request): Json<RegisterClusterRequest>,
) -> Result<Json<ClusterResponse>, ApiError> {
    if request.runtime_id.is_empty() {
        return Err(ApiError::BadRequest("runtimeID must not be empty".into()));
    }
    if request.kyma_config.components.is_empty() {
        return Err(ApiError::BadRequest(
            "kymaConfig.components must not be empty".into(),
        ));
    }
    let cluster_state = state
        .inventory
        .create_or_update(ClusterRegistration {
            runtime_id: request.runtime_id.into(),
            kubeconfig: request.kubeconfig,
            kyma_version: request.kyma_config.version,
            kyma_profile: request.kyma_config.profile,
            components: request.kyma_config.components,
        })
        .await?;
    Ok(Json(ClusterResponse::from_state(&cluster_state)))
}

async fn delete_cluster(
    State(state): State<AppState>,
    Path(runtime_id): Path<String>,
) -> Result<Json<ClusterResponse>, ApiError> {
    let cluster_state = state.inventory.mark_for_deletion(&runtime_id.into()).await?;
    Ok(Json(ClusterResponse::from_state(&cluster_state)))
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    #[serde(rename = "runtimeID")]
    runtime_id: String,
    #[serde(rename = "clusterVersion")]
    cluster_version: i64,
    #[serde(rename = "configurationVersion")]
    config_version: i64,
    status: ClusterStatus,
    failures: Vec<ComponentFailure>,
}

#[derive(Debug, Serialize)]
struct ComponentFailure {
    component: String,
    reason: String,
}

async fn cluster_status(
    State(state): State<AppState>,
    Path(runtime_id): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    let cluster_state = state.inventory.get_latest(&runtime_id.as_str().into()).await?;
    let failures = component_failures(&state, &runtime_id).await?;
    Ok(Json(StatusResponse {
        runtime_id,
        cluster_version: cluster_state.cluster.version,
        config_version: cluster_state.configuration.version,
        status: cluster_state.status.status,
        failures,
    }))
}

async fn config_status(
    State(state): State<AppState>,
    Path((runtime_id, config_version)): Path<(String, i64)>,
) -> Result<Json<StatusResponse>, ApiError> {
    let cluster_state = state
        .inventory
        .get(&runtime_id.as_str().into(), config_version)
        .await?;
    let failures = component_failures(&state, &runtime_id).await?;
    Ok(Json(StatusResponse {
        runtime_id,
        cluster_version: cluster_state.cluster.version,
        config_version: cluster_state.configuration.version,
        status: cluster_state.status.status,
        failures,
    }))
}

/// Failing components of the runtime's most recent reconciliation.
async fn component_failures(
    state: &AppState,
    runtime_id: &str,
) -> anyhow::Result<Vec<ComponentFailure>> {
    let filter = ReconciliationFilter {
        runtime_ids: vec![runtime_id.into()],
        finished: None,
    };
    let Some(latest) = state.repository.get_reconciliations(&filter).await?.into_iter().next()
    else {
        return Ok(Vec::new());
    };
    let operations = state.repository.get_operations(&latest.scheduling_id).await?;
    Ok(operations
        .into_iter()
        .filter(|op| {
            matches!(
                op.state,
                OperationState::Failed | OperationState::Error | OperationState::ClientError
            )
        })
        .map(|op| ComponentFailure {
            component: op.component,
            reason: op.reason.unwrap_or_default(),
        })
        .collect())
}

#[derive(Debug, Deserialize)]
struct StatusChangesQuery {
    offset: Option<String>,
}

#[derive(Debug, Serialize)]
struct StatusChangeEntry {
    status: ClusterStatus,
    started: DateTime<Utc>,
}

async fn status_changes(
    State(state): State<AppState>,
    Path(runtime_id): Path<String>,
    Query(query): Query<StatusChangesQuery>,
) -> Result<Json<Vec<StatusChangeEntry>>, ApiError> {
    let offset = match query.offset.as_deref() {
        Some(raw) => parse_offset(raw)
            .ok_or_else(|| ApiError::BadRequest(format!("invalid offset '{raw}'")))?,
        None => DEFAULT_STATUS_CHANGES_OFFSET,
    };
    let changes = state
        .inventory
        .status_changes(&runtime_id.into(), offset)
        .await?;
    Ok(Json(
        changes
            .into_iter()
            .map(|entry| StatusChangeEntry {
                status: entry.status,
                started: entry.created,
            })
            .collect(),
    ))
}

/// Parse a trailing-unit duration such as `500ms`, `90s`, `15m` or `24h`.
fn parse_offset(raw: &str) -> Option<Duration> {
    let unit_at = raw.find(|c: char| !c.is_ascii_digit())?;
    let value: u64 = raw[..unit_at].parse().ok()?;
    match &raw[unit_at..] {
        "ms" => Some(Duration::from_millis(value)),
        "s" => Some(Duration::from_secs(value)),
        "m" => Some(Duration::from_secs(value * 60)),
        "h" => Some(Duration::from_secs(value * 60 * 60)),
        _ => None,
    }
}

async fn operation_callback(
    State(state): State<AppState>,
    Path((scheduling_id, correlation_id)): Path<(String, String)>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let scheduling_id: SchedulingId = scheduling_id
        .parse()
        .map_err(|_| ApiError::NotFound(format!("reconciliation '{scheduling_id}' not found")))?;
    let correlation_id: CorrelationId = correlation_id
        .parse()
        .map_err(|_| ApiError::NotFound(format!("operation '{correlation_id}' not found")))?;

    let status_value = body
        .get("status")
        .cloned()
        .ok_or_else(|| ApiError::BadRequest("callback is missing 'status'".into()))?;
    let status: CallbackStatus = serde_json::from_value(status_value)
        .map_err(|err| ApiError::BadRequest(format!("invalid callback status: {err}")))?;
    let error = body
        .get("error")
        .and_then(|value| value.as_str())
        .map(str::to_string);
    let retry_id = body
        .get("retryID")
        .and_then(|value| value.as_str())
        .map(str::to_string);

    // existence check drives the 404 before any state is touched
    state
        .repository
        .get_operation(&scheduling_id, &correlation_id)
        .await?;

    telemetry::record_callback_received(status.as_str());
    let reason = match status {
        CallbackStatus::Failed | CallbackStatus::Error => error,
        _ => None,
    };
    let update = state
        .repository
        .update_operation_state(
            &scheduling_id,
            &correlation_id,
            status.operation_state(),
            reason,
            retry_id,
        )
        .await?;
    match update {
        StateUpdate::Updated => {}
        StateUpdate::SkippedTerminal => {
            tracing::debug!(
                correlation_id = %correlation_id,
                status = %status,
                "callback after terminal state ignored"
            );
        }
        StateUpdate::SkippedDuplicate => {
            tracing::debug!(
                correlation_id = %correlation_id,
                "duplicate callback ignored"
            );
        }
    }
    Ok(Json(serde_json::json!({})))
}

#[derive(Debug, Deserialize)]
struct ReconciliationsQuery {
    #[serde(rename = "runtimeIDs")]
    runtime_ids: Option<String>,
    statuses: Option<String>,
}

#[derive(Debug, Serialize)]
struct ReconciliationSummary {
    #[serde(rename = "schedulingID")]
    scheduling_id: SchedulingId,
    #[serde(rename = "runtimeID")]
    runtime_id: String,
    #[serde(rename = "configVersion")]
    config_version: i64,
    finished: bool,
    status: Option<ClusterStatus>,
    created: DateTime<Utc>,
    updated: DateTime<Utc>,
}

async fn list_reconciliations(
    State(state): State<AppState>,
    Query(query): Query<ReconciliationsQuery>,
) -> Result<Json<Vec<ReconciliationSummary>>, ApiError> {
    let filter = ReconciliationFilter {
        runtime_ids: query
            .runtime_ids
            .as_deref()
            .map(|raw| raw.split(',').map(Into::into).collect())
            .unwrap_or_default(),
        finished: None,
    };
    let statuses: Option<Vec<ClusterStatus>> = match query.statuses.as_deref() {
        Some(raw) => Some(
            raw.split(',')
                .map(|s| {
                    s.parse()
                        .map_err(|_| ApiError::BadRequest(format!("unknown status '{s}'")))
                })
                .collect::<Result<_, _>>()?,
        ),
        None => None,
    };

    let reconciliations = state.repository.get_reconciliations(&filter).await?;
    let mut current_status: HashMap<String, Option<ClusterStatus>> = HashMap::new();
    let mut summaries = Vec::new();
    for reconciliation in reconciliations {
        let runtime_id = reconciliation.runtime_id.to_string();
        let status = match current_status.get(&runtime_id) {
            Some(status) => *status,
            None => {
                let status = state
                    .inventory
                    .get_latest(&reconciliation.runtime_id)
                    .await
                    .ok()
                    .map(|cluster_state| cluster_state.status.status);
                current_status.insert(runtime_id.clone(), status);
                status
            }
        };
        if let Some(wanted) = &statuses {
            match status {
                Some(status) if wanted.contains(&status) => {}
                _ => continue,
            }
        }
        summaries.push(ReconciliationSummary {
            scheduling_id: reconciliation.scheduling_id,
            runtime_id,
            config_version: reconciliation.config_version,
            finished: reconciliation.finished,
            status,
            created: reconciliation.created,
            updated: reconciliation.updated,
        });
    }
    Ok(Json(summaries))
}

#[derive(Debug, Serialize)]
struct OperationInfo {
    #[serde(rename = "correlationID")]
    correlation_id: CorrelationId,
    component: String,
    priority: i64,
    #[serde(rename = "type")]
    op_type: crate::model::OperationType,
    state: OperationState,
    reason: Option<String>,
    retries: u32,
    created: DateTime<Utc>,
    updated: DateTime<Utc>,
}

impl From<OperationEntity> for OperationInfo {
    fn from(op: OperationEntity) -> Self {
        Self {
            correlation_id: op.correlation_id,
            component: op.component,
            priority: op.priority,
            op_type: op.op_type,
            state: op.state,
            reason: op.reason,
            retries: op.retries,
            created: op.created,
            updated: op.updated,
        }
    }
}

#[derive(Debug, Serialize)]
struct ReconciliationInfo {
    #[serde(rename = "schedulingID")]
    scheduling_id: SchedulingId,
    #[serde(rename = "runtimeID")]
    runtime_id: String,
    #[serde(rename = "configVersion")]
    config_version: i64,
    finished: bool,
    created: DateTime<Utc>,
    updated: DateTime<Utc>,
    operations: Vec<OperationInfo>,
}

async fn reconciliation_info(
    State(state): State<AppState>,
    Path(scheduling_id): Path<String>,
) -> Result<Json<ReconciliationInfo>, ApiError> {
    let scheduling_id: SchedulingId = scheduling_id
        .parse()
        .map_err(|_| ApiError::NotFound(format!("reconciliation '{scheduling_id}' not found")))?;
    let reconciliation: ReconciliationEntity =
        state.repository.get_reconciliation(&scheduling_id).await?;
    let operations = state.repository.get_operations(&scheduling_id).await?;
    Ok(Json(ReconciliationInfo {
        scheduling_id: reconciliation.scheduling_id,
        runtime_id: reconciliation.runtime_id.to_string(),
        config_version: reconciliation.config_version,
        finished: reconciliation.finished,
        created: reconciliation.created,
        updated: reconciliation.updated,
        operations: operations.into_iter().map(Into::into).collect(),
    }))
}
