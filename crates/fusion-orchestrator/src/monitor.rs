use crate::registry::AgentRegistry;
use crate::task_queue::{TaskCounts, TaskQueue};
use crate::types::{AgentState, WorkflowState};
use crate::workflow::WorkflowEngine;
use chrono::{DateTime, Duration, Utc};
use fusion_core::{AgentId, TaskId};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Per-agent row of a monitor snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    pub id: AgentId,
    pub name: String,
    pub state: AgentState,
    pub current_task: Option<TaskId>,
    pub tasks_completed: u64,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub unresponsive: bool,
    pub stale: bool,
}

/// Point-in-time view of the coordination domain for dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorSnapshot {
    pub taken_at: DateTime<Utc>,
    pub agents: Vec<AgentStatus>,
    pub agents_by_state: BTreeMap<AgentState, usize>,
    /// Live agents silent for longer than the heartbeat timeout.
    pub stale_agents: Vec<AgentId>,
    pub tasks: TaskCounts,
    /// Queued tasks whose dependencies are satisfied.
    pub ready_tasks: usize,
    pub workflows_by_state: BTreeMap<WorkflowState, usize>,
}

/// Read-only aggregation over the registry, queue and workflow engine.
///
/// Staleness is reported here but never acted upon; flagging agents
/// unresponsive is left to an external health policy.
pub struct AgentMonitor {
    registry: Arc<AgentRegistry>,
    queue: Arc<TaskQueue>,
    workflows: Arc<WorkflowEngine>,
    heartbeat_timeout: Duration,
}

impl AgentMonitor {
    pub fn new(
        registry: Arc<AgentRegistry>,
        queue: Arc<TaskQueue>,
        workflows: Arc<WorkflowEngine>,
        heartbeat_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            queue,
            workflows,
            heartbeat_timeout,
        }
    }

    /// Take a snapshot as of now.
    pub fn snapshot(&self) -> MonitorSnapshot {
        self.snapshot_at(Utc::now())
    }

    /// Take a snapshot, judging staleness as of `now`.
    pub fn snapshot_at(&self, now: DateTime<Utc>) -> MonitorSnapshot {
        let stale_agents = self.registry.stale_agents(self.heartbeat_timeout, now);
        let mut agents_by_state = BTreeMap::new();
        let agents = self
            .registry
            .list()
            .into_iter()
            .map(|agent| {
                *agents_by_state.entry(agent.state).or_insert(0) += 1;
                AgentStatus {
                    stale: stale_agents.contains(&agent.id),
                    id: agent.id,
                    name: agent.name,
                    state: agent.state,
                    current_task: agent.current_task,
                    tasks_completed: agent.tasks_completed,
                    last_heartbeat: agent.last_heartbeat,
                    unresponsive: agent.unresponsive,
                }
            })
            .collect();

        let mut workflows_by_state = BTreeMap::new();
        for workflow in self.workflows.list() {
            *workflows_by_state.entry(workflow.state).or_insert(0) += 1;
        }

        MonitorSnapshot {
            taken_at: now,
            agents,
            agents_by_state,
            stale_agents,
            tasks: self.queue.counts(),
            ready_tasks: self.queue.ready_tasks().len(),
            workflows_by_state,
        }
    }

    /// Serialize the current snapshot as JSON (dashboard feed).
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self.snapshot()).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Monitor snapshot not serializable");
            serde_json::Value::Null
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::{Capabilities, Task};
    use fusion_messaging::MessageRouter;

    fn monitor() -> (AgentMonitor, Arc<AgentRegistry>, Arc<TaskQueue>) {
        let router = MessageRouter::new();
        let registry = Arc::new(AgentRegistry::new(router.clone()));
        let queue = Arc::new(TaskQueue::new(router.clone()));
        let workflows = Arc::new(WorkflowEngine::new(queue.clone(), router));
        let monitor = AgentMonitor::new(
            registry.clone(),
            queue.clone(),
            workflows,
            Duration::seconds(30),
        );
        (monitor, registry, queue)
    }

    #[test]
    fn test_empty_snapshot() {
        let (monitor, _, _) = monitor();
        let snapshot = monitor.snapshot();
        assert!(snapshot.agents.is_empty());
        assert_eq!(snapshot.tasks.total(), 0);
        assert_eq!(snapshot.ready_tasks, 0);
    }

    #[test]
    fn test_counts_and_staleness() {
        let (monitor, registry, queue) = monitor();
        let a = registry.register("a", Capabilities::new());
        let b = registry.register("b", Capabilities::new());
        registry.transition(a, AgentState::Idle).unwrap();
        let beat = registry.heartbeat(b).unwrap();
        queue.enqueue(Task::new("t")).unwrap();

        let snapshot = monitor.snapshot_at(beat + Duration::seconds(10));
        assert_eq!(snapshot.agents_by_state[&AgentState::Idle], 1);
        assert_eq!(snapshot.agents_by_state[&AgentState::Spawning], 1);
        assert_eq!(snapshot.tasks.queued, 1);
        assert_eq!(snapshot.ready_tasks, 1);
        assert!(snapshot.stale_agents.is_empty());

        let later = monitor.snapshot_at(beat + Duration::seconds(120));
        assert_eq!(later.stale_agents.len(), 2);
        assert!(later.agents.iter().all(|a| a.stale));
    }

    #[test]
    fn test_to_json_shape() {
        let (monitor, registry, _) = monitor();
        registry.register("a", Capabilities::new());
        let json = monitor.to_json();
        assert_eq!(json["agents"].as_array().unwrap().len(), 1);
        assert_eq!(json["agents_by_state"]["spawning"], 1);
        assert!(json["tasks"]["queued"].is_number());
    }
}
