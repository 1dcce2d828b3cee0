use std::fmt::Display;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::cluster::RuntimeId;

/// Unique identifier of one scheduling run (a reconciliation).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct SchedulingId(pub Uuid);

impl Default for SchedulingId {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulingId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for SchedulingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SchedulingId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Unique identifier of one operation; used to route inbound callbacks.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(pub Uuid);

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CorrelationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Lifecycle state of an operation.
///
/// `new → in_progress → {done | error | failed | client_error}`. `failed` is a
/// non-terminal retry state: the worker pool may re-dispatch a failed
/// operation until the retry budget is exhausted, after which it is forced to
/// `error`. Transitions into a terminal state are final.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    New,
    InProgress,
    Done,
    Error,
    Failed,
    ClientError,
}

impl OperationState {
    /// Terminal states never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationState::Done | OperationState::Error | OperationState::ClientError
        )
    }

    /// States eligible for (re-)dispatch by the worker pool.
    pub fn is_dispatchable(&self) -> bool {
        matches!(self, OperationState::New | OperationState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationState::New => "new",
            OperationState::InProgress => "in_progress",
            OperationState::Done => "done",
            OperationState::Error => "error",
            OperationState::Failed => "failed",
            OperationState::ClientError => "client_error",
        }
    }
}

impl Display for OperationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Whether an operation applies or removes a component.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Reconcile,
    Delete,
}

impl Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationType::Reconcile => write!(f, "reconcile"),
            OperationType::Delete => write!(f, "delete"),
        }
    }
}

/// One dispatchable unit of work inside a reconciliation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OperationEntity {
    /// Dependency tier; lower tiers must be terminal-success before higher
    /// tiers become dispatchable.
    pub priority: i64,
    pub scheduling_id: SchedulingId,
    pub correlation_id: CorrelationId,
    pub runtime_id: RuntimeId,
    /// Configuration version this operation applies.
    pub config_version: i64,
    pub component: String,
    pub op_type: OperationType,
    pub state: OperationState,
    /// Last error text reported for this operation.
    pub reason: Option<String>,
    /// Deduplication token of the most recently accepted heartbeat.
    pub retry_id: Option<String>,
    /// Number of dispatch attempts made so far.
    pub retries: u32,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Display for OperationEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Operation [schedulingID={},correlationID={},runtimeID={},component={},prio={},state={},type={}]",
            self.scheduling_id,
            self.correlation_id,
            self.runtime_id,
            self.component,
            self.priority,
            self.state,
            self.op_type
        )
    }
}

/// Status vocabulary used by remote workers when calling back.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallbackStatus {
    NotStarted,
    Running,
    Failed,
    Success,
    Error,
}

impl CallbackStatus {
    /// Final statuses end the heartbeat loop; interim statuses keep resending.
    pub fn is_final(&self) -> bool {
        matches!(self, CallbackStatus::Success | CallbackStatus::Error)
    }

    /// The operation state an inbound callback maps to.
    pub fn operation_state(&self) -> OperationState {
        match self {
            CallbackStatus::NotStarted | CallbackStatus::Running => OperationState::InProgress,
            CallbackStatus::Failed => OperationState::Failed,
            CallbackStatus::Success => OperationState::Done,
            CallbackStatus::Error => OperationState::Error,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallbackStatus::NotStarted => "notstarted",
            CallbackStatus::Running => "running",
            CallbackStatus::Failed => "failed",
            CallbackStatus::Success => "success",
            CallbackStatus::Error => "error",
        }
    }
}

impl Display for CallbackStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(OperationState::Done.is_terminal());
        assert!(OperationState::Error.is_terminal());
        assert!(OperationState::ClientError.is_terminal());
        assert!(!OperationState::New.is_terminal());
        assert!(!OperationState::InProgress.is_terminal());
        assert!(!OperationState::Failed.is_terminal());
    }

    #[test]
    fn test_dispatchable_states() {
        assert!(OperationState::New.is_dispatchable());
        assert!(OperationState::Failed.is_dispatchable());
        assert!(!OperationState::InProgress.is_dispatchable());
        assert!(!OperationState::Done.is_dispatchable());
    }

    #[test]
    fn test_callback_status_mapping() {
        assert_eq!(
            CallbackStatus::NotStarted.operation_state(),
            OperationState::InProgress
        );
        assert_eq!(
            CallbackStatus::Running.operation_state(),
            OperationState::InProgress
        );
        assert_eq!(
            CallbackStatus::Failed.operation_state(),
            OperationState::Failed
        );
        assert_eq!(
            CallbackStatus::Success.operation_state(),
            OperationState::Done
        );
        assert_eq!(
            CallbackStatus::Error.operation_state(),
            OperationState::Error
        );
    }

    #[test]
    fn test_callback_status_wire_names() {
        let status: CallbackStatus = serde_json::from_str("\"notstarted\"").unwrap();
        assert_eq!(status, CallbackStatus::NotStarted);
        assert_eq!(
            serde_json::to_string(&CallbackStatus::Success).unwrap(),
            "\"success\""
        );
    }

    #[test]
    fn test_scheduling_id_round_trip() {
        let id = SchedulingId::new();
        let parsed: SchedulingId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }
}
