use crate::resolver;
use crate::task_queue::{CancelOutcome, TaskQueue};
use crate::types::{Task, TaskState, Workflow, WorkflowDefinition, WorkflowState};
use chrono::Utc;
use fusion_core::{topics, FusionError, FusionResult, TaskId, WorkflowId};
use fusion_messaging::MessageRouter;
use parking_lot::RwLock;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

const KIND: &str = "workflow";

/// Owns workflow lifecycle: validation, materialization into tasks and
/// aggregate completion tracking.
///
/// The workflow lock is always taken before the task queue's lock, never the
/// other way round.
pub struct WorkflowEngine {
    workflows: RwLock<HashMap<WorkflowId, Workflow>>,
    queue: Arc<TaskQueue>,
    router: MessageRouter,
}

impl WorkflowEngine {
    pub fn new(queue: Arc<TaskQueue>, router: MessageRouter) -> Self {
        Self {
            workflows: RwLock::new(HashMap::new()),
            queue,
            router,
        }
    }

    /// Store a definition as a new `draft` workflow.
    pub fn create(&self, definition: WorkflowDefinition) -> WorkflowId {
        let workflow = Workflow::new(definition);
        let id = workflow.id;
        info!(workflow_id = %id, name = %workflow.definition.name, nodes = workflow.definition.nodes.len(), "Workflow created");
        let mut workflows = self.workflows.write();
        self.notify(
            id,
            WorkflowState::Draft,
            json!({ "name": workflow.definition.name }),
        );
        workflows.insert(id, workflow);
        id
    }

    /// Check the definition and compute its execution order.
    ///
    /// On success the workflow is `ready` and the resolved node order is
    /// returned. A structural problem or a cycle sends it back to `draft`;
    /// cycles are reported with every member node and never repaired.
    pub fn validate(&self, id: WorkflowId) -> FusionResult<Vec<String>> {
        let mut workflows = self.workflows.write();
        let workflow = get_mut(&mut workflows, id)?;
        self.transition(workflow, WorkflowState::Validating)?;

        let result = check_structure(&workflow.definition).and_then(|()| {
            let (nodes, edges) = graph_of(&workflow.definition);
            resolver::resolve(&nodes, &edges).map_err(FusionError::from)
        });

        match result {
            Ok(order) => {
                workflow.resolved_order = order.clone();
                workflow.error = None;
                self.transition(workflow, WorkflowState::Ready)?;
                Ok(order)
            }
            Err(e) => {
                warn!(workflow_id = %id, error = %e, "Workflow rejected");
                workflow.error = Some(e.to_string());
                self.transition(workflow, WorkflowState::Draft)?;
                Err(e)
            }
        }
    }

    /// Materialize one task per node, enqueue them in resolved order and
    /// move the workflow to `running`. Returns the task ids in enqueue order.
    pub fn start(&self, id: WorkflowId) -> FusionResult<Vec<TaskId>> {
        let mut workflows = self.workflows.write();
        let workflow = get_mut(&mut workflows, id)?;
        if workflow.state != WorkflowState::Ready {
            return Err(FusionError::InvalidState {
                kind: KIND,
                id: id.to_string(),
                state: workflow.state.to_string(),
                operation: "start",
            });
        }

        let node_tasks: BTreeMap<String, TaskId> = workflow
            .definition
            .nodes
            .iter()
            .map(|node| (node.key.clone(), Uuid::new_v4()))
            .collect();
        let tasks = materialize(id, &workflow.definition, &workflow.resolved_order, &node_tasks)?;

        let mut enqueued = Vec::with_capacity(tasks.len());
        for task in tasks {
            match self.queue.enqueue(task) {
                Ok(task_id) => enqueued.push(task_id),
                Err(e) => {
                    warn!(workflow_id = %id, error = %e, "Workflow materialization failed");
                    for task_id in &enqueued {
                        if let Err(e) = self.queue.cancel(*task_id) {
                            debug!(task_id = %task_id, error = %e, "Materialized task not cancelled");
                        }
                    }
                    workflow.error = Some(e.to_string());
                    self.force_state(workflow, WorkflowState::Failed);
                    return Err(e);
                }
            }
        }

        workflow.node_tasks = node_tasks;
        workflow.task_ids = enqueued.clone();
        workflow.started_at = Some(Utc::now());
        self.transition(workflow, WorkflowState::Running)?;
        info!(workflow_id = %id, tasks = enqueued.len(), "Workflow started");
        Ok(enqueued)
    }

    /// Fold a member task's current state into its workflow.
    ///
    /// Completion is counted once per task, so repeated notices are harmless.
    /// A terminal failure or a cancellation fails a running workflow; sibling
    /// tasks already running are left to finish.
    pub fn on_task_update(&self, task: &Task) -> Option<WorkflowState> {
        let workflow_id = task.workflow_id?;
        let mut workflows = self.workflows.write();
        let workflow = workflows.get_mut(&workflow_id)?;
        if workflow.state != WorkflowState::Running || !workflow.task_ids.contains(&task.id) {
            return None;
        }

        match task.state {
            TaskState::Completed => {
                if !workflow.completed_tasks.insert(task.id) {
                    return None;
                }
                debug!(workflow_id = %workflow_id, task_id = %task.id, done = workflow.completed_tasks.len(), total = workflow.task_ids.len(), "Workflow progress");
                if workflow.completed_tasks.len() == workflow.task_ids.len() {
                    self.force_state(workflow, WorkflowState::Completed);
                    return Some(WorkflowState::Completed);
                }
                None
            }
            TaskState::Failed | TaskState::Cancelled => {
                let reason = format!(
                    "task {} ({}) {}: {}",
                    task.name,
                    task.id,
                    task.state,
                    task.error.as_deref().unwrap_or("no reason given")
                );
                warn!(workflow_id = %workflow_id, reason = %reason, "Workflow failed");
                workflow.error = Some(reason);
                self.force_state(workflow, WorkflowState::Failed);
                Some(WorkflowState::Failed)
            }
            _ => None,
        }
    }

    /// Cancel a workflow that has not finished, together with its
    /// non-terminal member tasks.
    pub fn cancel(&self, id: WorkflowId) -> FusionResult<Vec<(TaskId, CancelOutcome)>> {
        let mut workflows = self.workflows.write();
        let workflow = get_mut(&mut workflows, id)?;
        self.transition(workflow, WorkflowState::Cancelled)?;

        let mut cancelled = Vec::new();
        for task_id in workflow.task_ids.clone() {
            match self.queue.get(task_id) {
                Ok(task) if !task.state.is_terminal() => {}
                _ => continue,
            }
            match self.queue.cancel(task_id) {
                Ok(outcome) => cancelled.push((task_id, outcome)),
                Err(e) => debug!(task_id = %task_id, error = %e, "Member task not cancelled"),
            }
        }
        info!(workflow_id = %id, tasks = cancelled.len(), "Workflow cancelled");
        Ok(cancelled)
    }

    pub fn get(&self, id: WorkflowId) -> FusionResult<Workflow> {
        self.workflows
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| FusionError::not_found(KIND, id))
    }

    /// Every workflow, oldest first.
    pub fn list(&self) -> Vec<Workflow> {
        let mut workflows: Vec<Workflow> = self.workflows.read().values().cloned().collect();
        workflows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        workflows
    }

    /// Insert a record loaded from the durable store as-is.
    pub fn restore(&self, workflow: Workflow) -> FusionResult<()> {
        let mut workflows = self.workflows.write();
        if workflows.contains_key(&workflow.id) {
            return Err(FusionError::DuplicateId {
                kind: KIND,
                id: workflow.id.to_string(),
            });
        }
        workflows.insert(workflow.id, workflow);
        Ok(())
    }

    fn transition(&self, workflow: &mut Workflow, target: WorkflowState) -> FusionResult<()> {
        if !workflow.state.can_transition_to(target) {
            return Err(FusionError::InvalidTransition {
                kind: KIND,
                id: workflow.id.to_string(),
                from: workflow.state.to_string(),
                to: target.to_string(),
            });
        }
        self.force_state(workflow, target);
        Ok(())
    }

    fn force_state(&self, workflow: &mut Workflow, target: WorkflowState) {
        let from = workflow.state;
        workflow.state = target;
        if target.is_terminal() && workflow.completed_at.is_none() {
            workflow.completed_at = Some(Utc::now());
        }
        info!(workflow_id = %workflow.id, %from, to = %target, "Workflow transitioned");
        self.notify(
            workflow.id,
            target,
            json!({ "from": from, "to": target, "error": workflow.error }),
        );
    }

    fn notify(&self, id: WorkflowId, state: WorkflowState, payload: serde_json::Value) {
        let topic = topics::workflow(id, state.as_str());
        if let Err(e) = self.router.publish(&topic, payload) {
            debug!(topic = %topic, error = %e, "Workflow notice not published");
        }
    }
}

fn get_mut(
    workflows: &mut HashMap<WorkflowId, Workflow>,
    id: WorkflowId,
) -> FusionResult<&mut Workflow> {
    workflows
        .get_mut(&id)
        .ok_or_else(|| FusionError::not_found(KIND, id))
}

/// Reject definitions with no nodes, blank or duplicate keys, or edges that
/// name unknown nodes.
pub fn check_structure(definition: &WorkflowDefinition) -> FusionResult<()> {
    if definition.nodes.is_empty() {
        return Err(FusionError::InvalidDefinition(format!(
            "workflow '{}' has no nodes",
            definition.name
        )));
    }
    let mut keys = BTreeSet::new();
    for node in &definition.nodes {
        if node.key.trim().is_empty() {
            return Err(FusionError::InvalidDefinition("node with empty key".into()));
        }
        if !keys.insert(node.key.as_str()) {
            return Err(FusionError::InvalidDefinition(format!(
                "duplicate node key '{}'",
                node.key
            )));
        }
    }
    for edge in &definition.edges {
        for endpoint in [&edge.from, &edge.to] {
            if !keys.contains(endpoint.as_str()) {
                return Err(FusionError::InvalidDefinition(format!(
                    "edge {} -> {} references unknown node '{endpoint}'",
                    edge.from, edge.to
                )));
            }
        }
    }
    Ok(())
}

fn graph_of(definition: &WorkflowDefinition) -> (Vec<(String, i32)>, Vec<(String, String)>) {
    let nodes = definition
        .nodes
        .iter()
        .map(|n| (n.key.clone(), n.priority))
        .collect();
    let edges = definition
        .edges
        .iter()
        .map(|e| (e.from.clone(), e.to.clone()))
        .collect();
    (nodes, edges)
}

/// Build one task per node in `order`, translating edges into task
/// dependencies.
fn materialize(
    workflow_id: WorkflowId,
    definition: &WorkflowDefinition,
    order: &[String],
    node_tasks: &BTreeMap<String, TaskId>,
) -> FusionResult<Vec<Task>> {
    let by_key: HashMap<&str, _> = definition
        .nodes
        .iter()
        .map(|n| (n.key.as_str(), n))
        .collect();
    let lookup = |key: &str| {
        node_tasks.get(key).copied().ok_or_else(|| {
            FusionError::InvalidDefinition(format!("node '{key}' missing from resolved order"))
        })
    };

    let mut tasks = Vec::with_capacity(order.len());
    for key in order {
        let node = by_key.get(key.as_str()).ok_or_else(|| {
            FusionError::InvalidDefinition(format!("unknown node '{key}' in resolved order"))
        })?;
        let mut task = Task::new(node.key.clone())
            .with_id(lookup(key.as_str())?)
            .with_description(node.description.clone())
            .with_priority(node.priority)
            .with_capabilities(node.capabilities.iter().cloned())
            .with_input(node.input.clone())
            .in_workflow(workflow_id);
        if node.retryable {
            task = task.retryable(node.max_retries);
        }
        for edge in definition.edges.iter().filter(|e| &e.to == key) {
            let dep = lookup(edge.from.as_str())?;
            task = if edge.optional {
                task.with_optional_dependency(dep)
            } else {
                task.with_dependencies([dep])
            };
        }
        tasks.push(task);
    }
    Ok(tasks)
}
