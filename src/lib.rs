//! Fleet reconciler - orchestration core for reconciling remote Kubernetes
//! clusters via component reconciler workers.
//!
//! The crate tracks desired cluster configurations in an inventory, turns each
//! pending cluster into a reconciliation made of per-component operations, and
//! drives those operations through remote component reconcilers that report
//! progress back over HTTP callbacks.
//!
//! # Core Concepts
//!
//! - **Inventory**: The [`Inventory`] trait stores versioned cluster
//!   configurations and their status history. Registering a changed
//!   configuration marks the cluster `reconcile_pending`.
//!
//! - **Reconciliation**: The [`ReconciliationRepository`] trait owns
//!   reconciliations and their operations. At most one unfinished
//!   reconciliation exists per cluster; operations advance tier by tier in
//!   priority order.
//!
//! - **Worker pool**: The [`WorkerPool`] picks up processable operations and
//!   dispatches them to component reconcilers through an [`Invoker`], bounded
//!   by a fixed number of slots.
//!
//! - **Bookkeeper**: The [`Bookkeeper`] sweep orphans silent operations and
//!   finishes reconciliations once every operation reached a terminal state.
//!
//! - **Runtime**: The [`ReconcilerRuntime`] ties watcher, scheduler, worker
//!   pool, bookkeeper and cleaner together under one [`ShutdownToken`].
//!
//! # Feature Flags
//!
//! - `metrics` - Prometheus metrics support

/// HTTP surface: cluster registration, status queries and operation callbacks.
pub mod api;

/// Bookkeeping sweep: orphan detection and reconciliation finishing.
pub mod bookkeeper;

/// Retention sweep purging old finished reconciliations.
pub mod cleaner;

/// Configuration structures for the runtime loops.
///
/// The `config` module defines [`SchedulerConfig`], [`WorkerPoolConfig`],
/// [`BookkeeperConfig`], [`CleanerConfig`] and [`HeartbeatConfig`], each with
/// defaults and validation.
pub mod config;

/// Typed error conditions layered on top of `anyhow`.
pub mod error;

/// Heartbeat sender used by locally hosted component reconcilers.
///
/// The `heartbeat` module provides [`HeartbeatSender`], which periodically
/// resends the current operation status to the orchestrator until a final
/// status is reached or the heartbeat context times out.
pub mod heartbeat;

/// Cluster inventory: versioned configurations and status history.
pub mod inventory;

/// Dispatch of operations to component reconcilers.
///
/// The `invoker` module defines the [`Invoker`] trait with a
/// [`RemoteInvoker`] for HTTP workers and a [`LocalInvoker`] for in-process
/// component runners.
pub mod invoker;

#[cfg(feature = "metrics")]
/// Prometheus metrics, enabled with the `metrics` feature.
pub mod metrics;

/// Domain model: clusters, components, operations, statuses and
/// reconciliations.
pub mod model;

/// Worker slot occupancy tracking.
pub mod occupancy;

/// Layered component configuration merging.
pub mod overrides;

/// Reconciliation and operation persistence, including the processable
/// operation selection.
pub mod reconciliation;

/// Runtime orchestration: loop wiring and graceful shutdown.
pub mod runtime;

/// Scheduler consuming the cluster queue and starting reconciliations.
pub mod scheduler;

/// Tracing spans and metric bridges.
pub mod telemetry;

/// Cluster status transitions coupling inventory and reconciliation state.
pub mod transition;

/// Inventory watcher feeding pending clusters into the scheduler queue.
pub mod watch;

/// Worker pool dispatching processable operations.
pub mod worker;

pub use bookkeeper::Bookkeeper;
pub use cleaner::Cleaner;
pub use config::{
    BookkeeperConfig, CleanerConfig, HeartbeatConfig, SchedulerConfig, WorkerPoolConfig,
};
pub use error::ReconcilerError;
pub use heartbeat::{
    CallbackHandler, CallbackMessage, FnCallbackHandler, HeartbeatSender, RemoteCallbackHandler,
};
pub use inventory::{ClusterRegistration, InMemoryInventory, Inventory};
pub use invoker::{ComponentRunner, Invoker, LocalInvoker, ReconcilerRegistry, RemoteInvoker};
pub use model::{
    CallbackStatus, ClusterState, ClusterStatus, Component, CorrelationId, DeleteStrategy,
    OperationEntity, OperationState, OperationType, ReconciliationEntity, ReconciliationResult,
    RuntimeId, SchedulingId,
};
pub use reconciliation::{
    InMemoryReconciliationRepository, ReconciliationFilter, ReconciliationRepository, StateUpdate,
};
pub use runtime::{ReconcilerRuntime, RuntimeConfig, ShutdownToken};
pub use scheduler::Scheduler;
pub use transition::ClusterStatusTransition;
pub use watch::InventoryWatcher;
pub use worker::WorkerPool;
