use chrono::{DateTime, Utc};
use fusion_core::{AgentId, TaskId, WorkflowId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use uuid::Uuid;

/// A set of capability tags.
pub type Capabilities = BTreeSet<String>;

/// Build a capability set from string-like tags.
pub fn capabilities<I, S>(tags: I) -> Capabilities
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    tags.into_iter().map(Into::into).collect()
}

/// True when every required tag is offered (subset containment).
pub fn capabilities_satisfy(required: &Capabilities, offered: &Capabilities) -> bool {
    required.is_subset(offered)
}

/// Lifecycle state of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Spawning,
    Idle,
    Working,
    Paused,
    Error,
    Terminated,
}

impl AgentState {
    /// Every state, in declaration order.
    pub const ALL: [AgentState; 6] = [
        AgentState::Spawning,
        AgentState::Idle,
        AgentState::Working,
        AgentState::Paused,
        AgentState::Error,
        AgentState::Terminated,
    ];

    /// States reachable in one step from `self`.
    pub fn allowed_targets(self) -> &'static [AgentState] {
        match self {
            AgentState::Spawning => &[AgentState::Idle, AgentState::Error],
            AgentState::Idle => &[
                AgentState::Working,
                AgentState::Paused,
                AgentState::Terminated,
            ],
            AgentState::Working => &[AgentState::Idle, AgentState::Paused, AgentState::Error],
            AgentState::Paused => &[AgentState::Idle, AgentState::Terminated],
            AgentState::Error => &[AgentState::Terminated],
            AgentState::Terminated => &[],
        }
    }

    pub fn can_transition_to(self, target: AgentState) -> bool {
        self.allowed_targets().contains(&target)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AgentState::Spawning => "spawning",
            AgentState::Idle => "idle",
            AgentState::Working => "working",
            AgentState::Paused => "paused",
            AgentState::Error => "error",
            AgentState::Terminated => "terminated",
        }
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A schedulable worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    pub capabilities: Capabilities,
    pub state: AgentState,
    /// The task this agent is working on. At most one at a time.
    pub current_task: Option<TaskId>,
    /// Lifetime count of completed tasks.
    #[serde(default)]
    pub tasks_completed: u64,
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Set by an external health monitor; flagged agents are not matched.
    #[serde(default)]
    pub unresponsive: bool,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Completion timestamps inside the load-balancing window.
    #[serde(default)]
    pub recent_completions: VecDeque<DateTime<Utc>>,
}

impl Agent {
    pub fn new(name: impl Into<String>, capabilities: Capabilities) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            capabilities,
            state: AgentState::Spawning,
            current_task: None,
            tasks_completed: 0,
            last_heartbeat: None,
            unresponsive: false,
            metadata: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            recent_completions: VecDeque::new(),
        }
    }

    /// Current assigned task count (0 or 1).
    pub fn assigned_task_count(&self) -> usize {
        usize::from(self.current_task.is_some())
    }

    pub fn can_perform(&self, required: &Capabilities) -> bool {
        capabilities_satisfy(required, &self.capabilities)
    }

    /// Idle, responsive agents are the only ones the scheduler may claim.
    pub fn is_schedulable(&self) -> bool {
        self.state == AgentState::Idle && !self.unresponsive
    }
}

/// Status of a task in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Queued,
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub const ALL: [TaskState; 6] = [
        TaskState::Queued,
        TaskState::Assigned,
        TaskState::Running,
        TaskState::Completed,
        TaskState::Failed,
        TaskState::Cancelled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Queued => "queued",
            TaskState::Assigned => "assigned",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub description: String,
    /// Higher is scheduled sooner.
    pub priority: i32,
    pub required_capabilities: Capabilities,
    /// Every task that must reach a terminal state first.
    pub dependencies: BTreeSet<TaskId>,
    /// Subset of `dependencies` whose failure or cancellation does not
    /// cancel this task. They only need to be terminal.
    #[serde(default)]
    pub optional_dependencies: BTreeSet<TaskId>,
    pub state: TaskState,
    pub workflow_id: Option<WorkflowId>,
    #[serde(default)]
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub assigned_agent: Option<AgentId>,
    /// Retryable tasks re-enter the queue on failure up to their ceiling.
    #[serde(default)]
    pub retryable: bool,
    /// Per-task retry ceiling; the queue default applies when unset.
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Times this task has been re-queued after a failure.
    #[serde(default)]
    pub retries: u32,
    /// Last failure or cancellation reason, kept for audit.
    pub error: Option<String>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Queue insertion counter; FIFO tie-break when timestamps collide.
    #[serde(default)]
    pub sequence: u64,
}

impl Task {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: String::new(),
            priority: 0,
            required_capabilities: Capabilities::new(),
            dependencies: BTreeSet::new(),
            optional_dependencies: BTreeSet::new(),
            state: TaskState::Queued,
            workflow_id: None,
            input: serde_json::Value::Null,
            output: None,
            assigned_agent: None,
            retryable: false,
            max_retries: None,
            retries: 0,
            error: None,
            queued_at: Utc::now(),
            started_at: None,
            completed_at: None,
            sequence: 0,
        }
    }

    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = id;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_capabilities<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_capabilities = capabilities(tags);
        self
    }

    pub fn with_dependencies(mut self, deps: impl IntoIterator<Item = TaskId>) -> Self {
        self.dependencies.extend(deps);
        self
    }

    /// Add a dependency whose failure does not cancel this task.
    pub fn with_optional_dependency(mut self, dep: TaskId) -> Self {
        self.dependencies.insert(dep);
        self.optional_dependencies.insert(dep);
        self
    }

    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = input;
        self
    }

    /// Mark the task retryable. `max_retries` overrides the queue default.
    pub fn retryable(mut self, max_retries: Option<u32>) -> Self {
        self.retryable = true;
        self.max_retries = max_retries;
        self
    }

    pub fn in_workflow(mut self, workflow_id: WorkflowId) -> Self {
        self.workflow_id = Some(workflow_id);
        self
    }

    pub fn is_optional_dependency(&self, dep: &TaskId) -> bool {
        self.optional_dependencies.contains(dep)
    }

    /// One-based number of the current attempt.
    pub fn attempt(&self) -> u32 {
        self.retries + 1
    }
}

/// Lifecycle state of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowState {
    Draft,
    Validating,
    Ready,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowState {
    pub const ALL: [WorkflowState; 7] = [
        WorkflowState::Draft,
        WorkflowState::Validating,
        WorkflowState::Ready,
        WorkflowState::Running,
        WorkflowState::Completed,
        WorkflowState::Failed,
        WorkflowState::Cancelled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowState::Completed | WorkflowState::Failed | WorkflowState::Cancelled
        )
    }

    pub fn can_transition_to(self, target: WorkflowState) -> bool {
        use WorkflowState::*;
        match (self, target) {
            (Draft, Validating) => true,
            (Validating, Ready) | (Validating, Draft) => true,
            (Ready, Running) => true,
            (Running, Completed) | (Running, Failed) => true,
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowState::Draft => "draft",
            WorkflowState::Validating => "validating",
            WorkflowState::Ready => "ready",
            WorkflowState::Running => "running",
            WorkflowState::Completed => "completed",
            WorkflowState::Failed => "failed",
            WorkflowState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One node of a workflow DAG; becomes one task when the workflow starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNode {
    /// Key unique within the definition; edges refer to it.
    pub key: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default)]
    pub retryable: bool,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl WorkflowNode {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            description: String::new(),
            priority: 0,
            capabilities: Capabilities::new(),
            input: serde_json::Value::Null,
            retryable: false,
            max_retries: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_capabilities<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities(tags);
        self
    }
}

/// `from` must complete before `to` starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowEdge {
    pub from: String,
    pub to: String,
    /// When set, failure of `from` does not cancel `to`.
    #[serde(default)]
    pub optional: bool,
}

impl WorkflowEdge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            optional: false,
        }
    }
}

/// Node list plus edge list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub nodes: Vec<WorkflowNode>,
    #[serde(default)]
    pub edges: Vec<WorkflowEdge>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub fn node(mut self, node: WorkflowNode) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.push(WorkflowEdge::new(from, to));
        self
    }
}

/// A named collection of tasks related by a dependency graph.
///
/// Holds task identifiers only; the task queue owns the task records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub definition: WorkflowDefinition,
    pub state: WorkflowState,
    /// Node keys in resolved topological order, set by validation.
    #[serde(default)]
    pub resolved_order: Vec<String>,
    /// Materialized task ids in enqueue order.
    #[serde(default)]
    pub task_ids: Vec<TaskId>,
    #[serde(default)]
    pub node_tasks: BTreeMap<String, TaskId>,
    #[serde(default)]
    pub completed_tasks: BTreeSet<TaskId>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Workflow {
    pub fn new(definition: WorkflowDefinition) -> Self {
        Self {
            id: Uuid::new_v4(),
            definition,
            state: WorkflowState::Draft,
            resolved_order: Vec::new(),
            task_ids: Vec::new(),
            node_tasks: BTreeMap::new(),
            completed_tasks: BTreeSet::new(),
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Fraction of member tasks completed, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        if self.task_ids.is_empty() {
            return 0.0;
        }
        self.completed_tasks.len() as f64 / self.task_ids.len() as f64
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_transition_table() {
        use AgentState::*;
        assert!(Spawning.can_transition_to(Idle));
        assert!(Spawning.can_transition_to(Error));
        assert!(!Spawning.can_transition_to(Working));
        assert!(Idle.can_transition_to(Working));
        assert!(!Idle.can_transition_to(Error));
        assert!(Working.can_transition_to(Error));
        assert!(!Working.can_transition_to(Terminated));
        assert!(Paused.can_transition_to(Idle));
        assert!(Error.can_transition_to(Terminated));
        assert!(!Error.can_transition_to(Idle));
        assert!(Terminated.allowed_targets().is_empty());
    }

    #[test]
    fn test_no_self_transitions() {
        for state in AgentState::ALL {
            assert!(!state.can_transition_to(state), "{state} -> {state}");
        }
    }

    #[test]
    fn test_capability_subset() {
        let agent = Agent::new("worker", capabilities(["rust", "review", "test"]));
        assert!(agent.can_perform(&capabilities(["rust", "test"])));
        assert!(agent.can_perform(&Capabilities::new()));
        assert!(!agent.can_perform(&capabilities(["python"])));
    }

    #[test]
    fn test_agent_starts_spawning() {
        let agent = Agent::new("a", Capabilities::new());
        assert_eq!(agent.state, AgentState::Spawning);
        assert_eq!(agent.assigned_task_count(), 0);
        assert!(!agent.is_schedulable());
    }

    #[test]
    fn test_task_builder() {
        let dep = Uuid::new_v4();
        let opt = Uuid::new_v4();
        let task = Task::new("build")
            .with_priority(5)
            .with_capabilities(["rust"])
            .with_dependencies([dep])
            .with_optional_dependency(opt)
            .retryable(Some(2));
        assert_eq!(task.state, TaskState::Queued);
        assert_eq!(task.dependencies.len(), 2);
        assert!(task.is_optional_dependency(&opt));
        assert!(!task.is_optional_dependency(&dep));
        assert!(task.retryable);
        assert_eq!(task.max_retries, Some(2));
        assert_eq!(task.attempt(), 1);
    }

    #[test]
    fn test_task_state_terminal() {
        assert!(!TaskState::Queued.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Cancelled.is_terminal());
    }

    #[test]
    fn test_workflow_state_machine() {
        use WorkflowState::*;
        assert!(Draft.can_transition_to(Validating));
        assert!(Validating.can_transition_to(Draft));
        assert!(!Draft.can_transition_to(Ready));
        assert!(!Ready.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(Ready.can_transition_to(Cancelled));
        assert!(!Completed.can_transition_to(Cancelled));
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_string(&AgentState::Working).unwrap();
        assert_eq!(json, "\"working\"");
        let parsed: TaskState = serde_json::from_str("\"cancelled\"").unwrap();
        assert_eq!(parsed, TaskState::Cancelled);
        assert_eq!(WorkflowState::Validating.to_string(), "validating");
    }

    #[test]
    fn test_definition_deserializes_with_defaults() {
        let def: WorkflowDefinition = serde_json::from_value(serde_json::json!({
            "name": "pipeline",
            "nodes": [{"key": "a"}, {"key": "b", "capabilities": ["rust"]}],
            "edges": [{"from": "a", "to": "b"}]
        }))
        .unwrap();
        assert_eq!(def.nodes.len(), 2);
        assert!(def.nodes[1].capabilities.contains("rust"));
        assert!(!def.edges[0].optional);
    }
}
