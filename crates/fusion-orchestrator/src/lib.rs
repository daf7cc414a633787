//! Multi-agent coordination engine: agent registry, dependency-aware task
//! queue, delegation daemon and workflow orchestration.
//!
//! Every state change is announced on the shared
//! [`MessageRouter`](fusion_messaging::MessageRouter) as
//! `<entity>.<id>.<kind>`, and executors report back on the same topics.
//!
//! # Main types
//!
//! - [`Coordinator`] — Owns one coordination domain and runs its background loops.
//! - [`AgentRegistry`] — Agent records and their lifecycle state machine.
//! - [`TaskQueue`] — Dependency-aware queue with retry and cancellation propagation.
//! - [`DelegationDaemon`] — Matches ready tasks to idle agents.
//! - [`WorkflowEngine`] — Validates workflow DAGs and materializes them into tasks.
//! - [`AgentMonitor`] — Read-only snapshots for dashboards.
//! - [`Store`] — Durable write-through records and the event log.

/// Collaborator seams: workspace provisioning and task execution.
pub mod collaborators;
/// Engine configuration.
pub mod config;
/// Coordination facade and background loops.
pub mod coordinator;
/// Scheduling passes and the scheduler lease.
pub mod daemon;
/// Agent health and queue snapshots.
pub mod monitor;
/// Agent registry.
pub mod registry;
/// Priority-aware topological ordering.
pub mod resolver;
/// Durable stores.
pub mod store;
/// Dependency-aware task queue.
pub mod task_queue;
/// Shared coordination types (Agent, Task, Workflow, etc.).
pub mod types;
/// Workflow lifecycle.
pub mod workflow;

pub use collaborators::{
    DirectoryProvisioner, ExecutionFailure, Executor, NoopProvisioner, WorkspaceProvisioner,
};
pub use config::OrchestratorConfig;
pub use coordinator::{Coordinator, RestoreReport};
pub use daemon::{Assignment, DelegationDaemon, PassReport, SchedulerLease};
pub use monitor::{AgentMonitor, AgentStatus, MonitorSnapshot};
pub use registry::AgentRegistry;
pub use resolver::{resolve, CycleError};
pub use store::{FileStore, InMemoryStore, Store, StoreSnapshot};
pub use task_queue::{CancelOutcome, FailureOutcome, TaskCounts, TaskQueue};
pub use types::{
    capabilities, Agent, AgentState, Capabilities, Task, TaskState, Workflow, WorkflowDefinition,
    WorkflowEdge, WorkflowNode, WorkflowState,
};
pub use workflow::WorkflowEngine;
