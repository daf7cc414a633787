use crate::types::{Task, TaskState};
use chrono::Utc;
use fusion_core::{topics, AgentId, FusionError, FusionResult, TaskId, WorkflowId};
use fusion_messaging::MessageRouter;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeSet, HashMap, VecDeque};
use tracing::{debug, info, warn};

const KIND: &str = "task";

/// What `mark_failed` did with the task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Retryable task went back to `queued`; `attempt` is the next attempt number.
    Requeued { attempt: u32 },
    /// Terminal failure; `cancelled` lists dependents cancelled by propagation.
    Failed { cancelled: Vec<TaskId> },
    /// The task had already reached a terminal state; the report was discarded.
    Ignored,
}

/// Result of a cancel request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelOutcome {
    pub previous: TaskState,
    /// Agent bound at the time of cancellation, if any. It is only advised.
    pub agent: Option<AgentId>,
    pub cascaded: Vec<TaskId>,
}

/// Number of tasks per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub queued: usize,
    pub assigned: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl TaskCounts {
    pub fn total(&self) -> usize {
        self.queued + self.assigned + self.running + self.completed + self.failed + self.cancelled
    }

    /// Tasks not yet in a terminal state.
    pub fn active(&self) -> usize {
        self.queued + self.assigned + self.running
    }
}

struct QueueState {
    tasks: HashMap<TaskId, Task>,
    /// Reverse edges: dependency -> tasks that depend on it.
    dependents: HashMap<TaskId, BTreeSet<TaskId>>,
    next_sequence: u64,
}

impl QueueState {
    fn is_ready(&self, task: &Task) -> bool {
        task.state == TaskState::Queued
            && task.dependencies.iter().all(|dep| {
                let state = self.tasks.get(dep).map(|d| d.state);
                if task.is_optional_dependency(dep) {
                    state.is_some_and(TaskState::is_terminal)
                } else {
                    state == Some(TaskState::Completed)
                }
            })
    }

    fn ready_dependents(&self, id: TaskId) -> Vec<TaskId> {
        self.dependents
            .get(&id)
            .into_iter()
            .flatten()
            .filter(|dep| self.tasks.get(*dep).is_some_and(|t| self.is_ready(t)))
            .copied()
            .collect()
    }

    fn get_mut(&mut self, id: TaskId) -> FusionResult<&mut Task> {
        self.tasks
            .get_mut(&id)
            .ok_or_else(|| FusionError::not_found(KIND, id))
    }
}

/// Holds every submitted task and owns its transitions up to `running`.
///
/// Terminal tasks are retained for history. All operations are synchronous
/// and serialize on one lock, so two callers racing on the same task see a
/// clean winner and a state error for the loser.
pub struct TaskQueue {
    state: RwLock<QueueState>,
    router: MessageRouter,
    default_max_retries: u32,
}

impl TaskQueue {
    pub fn new(router: MessageRouter) -> Self {
        Self {
            state: RwLock::new(QueueState {
                tasks: HashMap::new(),
                dependents: HashMap::new(),
                next_sequence: 1,
            }),
            router,
            default_max_retries: 3,
        }
    }

    /// Retry ceiling for retryable tasks without their own override.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.default_max_retries = max_retries;
        self
    }

    /// Add a task in `queued` state.
    ///
    /// Every dependency must already be known. A task whose required
    /// dependency already failed or was cancelled is stored as `cancelled`
    /// straight away.
    pub fn enqueue(&self, mut task: Task) -> FusionResult<TaskId> {
        let mut state = self.state.write();
        let id = task.id;
        if state.tasks.contains_key(&id) {
            return Err(FusionError::DuplicateId {
                kind: KIND,
                id: id.to_string(),
            });
        }
        if task.dependencies.contains(&id) {
            return Err(FusionError::Cycle {
                members: vec![id.to_string()],
            });
        }
        if let Some(missing) = task
            .dependencies
            .iter()
            .find(|dep| !state.tasks.contains_key(*dep))
        {
            return Err(FusionError::DanglingDependency {
                task: id.to_string(),
                dependency: missing.to_string(),
            });
        }
        task.optional_dependencies
            .retain(|dep| task.dependencies.contains(dep));

        let blocked_by = task.dependencies.iter().copied().find(|dep| {
            !task.is_optional_dependency(dep)
                && state
                    .tasks
                    .get(dep)
                    .is_some_and(|d| matches!(d.state, TaskState::Failed | TaskState::Cancelled))
        });

        task.state = TaskState::Queued;
        task.assigned_agent = None;
        task.queued_at = Utc::now();
        task.sequence = state.next_sequence;
        state.next_sequence += 1;
        for dep in &task.dependencies {
            state.dependents.entry(*dep).or_default().insert(id);
        }

        info!(task_id = %id, name = %task.name, priority = task.priority, "Task queued");
        self.notify(
            topics::task(id, topics::QUEUED),
            json!({ "name": task.name, "priority": task.priority, "workflow_id": task.workflow_id }),
        );

        let cancelled_by = blocked_by.map(|dep| {
            task.state = TaskState::Cancelled;
            task.completed_at = Some(Utc::now());
            let reason = format!("dependency {dep} did not complete");
            task.error = Some(reason.clone());
            reason
        });
        state.tasks.insert(id, task);
        if let Some(reason) = cancelled_by {
            warn!(task_id = %id, reason = %reason, "Task cancelled at submission");
            self.notify(topics::task(id, topics::CANCELLED), json!(reason));
        }
        Ok(id)
    }

    /// Queued tasks whose dependencies are satisfied, highest priority first,
    /// then oldest first.
    pub fn ready_tasks(&self) -> Vec<Task> {
        let state = self.state.read();
        let mut ready: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| state.is_ready(t))
            .cloned()
            .collect();
        ready.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.queued_at.cmp(&b.queued_at))
                .then(a.sequence.cmp(&b.sequence))
        });
        ready
    }

    /// `queued -> assigned`.
    ///
    /// A caller that lost the race to another assigner sees `AlreadyAssigned`.
    pub fn mark_assigned(&self, id: TaskId, agent: AgentId) -> FusionResult<()> {
        let mut state = self.state.write();
        let task = state.get_mut(id)?;
        match task.state {
            TaskState::Queued => {}
            TaskState::Assigned | TaskState::Running => {
                return Err(FusionError::AlreadyAssigned {
                    task: id.to_string(),
                    agent: task
                        .assigned_agent
                        .map(|a| a.to_string())
                        .unwrap_or_default(),
                })
            }
            other => return Err(invalid_state(id, other, "assign")),
        }
        task.state = TaskState::Assigned;
        task.assigned_agent = Some(agent);
        debug!(task_id = %id, agent_id = %agent, "Task assigned");
        Ok(())
    }

    /// `assigned -> running`.
    pub fn mark_running(&self, id: TaskId) -> FusionResult<()> {
        let mut state = self.state.write();
        let task = state.get_mut(id)?;
        if task.state != TaskState::Assigned {
            return Err(invalid_state(id, task.state, "start"));
        }
        task.state = TaskState::Running;
        task.started_at = Some(Utc::now());
        debug!(task_id = %id, "Task running");
        Ok(())
    }

    /// Record a successful finish.
    ///
    /// Returns `Ok(false)` without changing anything when the task is already
    /// terminal: a duplicate completion, or a late report for a cancelled task.
    pub fn mark_completed(&self, id: TaskId, output: serde_json::Value) -> FusionResult<bool> {
        let mut state = self.state.write();
        let task = state.get_mut(id)?;
        match task.state {
            TaskState::Assigned | TaskState::Running => {}
            s if s.is_terminal() => {
                debug!(task_id = %id, state = %s, "Completion discarded");
                return Ok(false);
            }
            other => return Err(invalid_state(id, other, "complete")),
        }
        task.state = TaskState::Completed;
        task.output = Some(output);
        task.completed_at = Some(Utc::now());
        info!(task_id = %id, "Task completed");

        for dep in state.ready_dependents(id) {
            self.notify(topics::task(dep, topics::READY), json!({ "after": id }));
        }
        Ok(true)
    }

    /// Record a failed attempt.
    ///
    /// Retryable tasks under their ceiling re-enter `queued`; anything else
    /// fails terminally and cancels its required dependents transitively.
    pub fn mark_failed(&self, id: TaskId, reason: impl Into<String>) -> FusionResult<FailureOutcome> {
        let reason = reason.into();
        let mut state = self.state.write();
        let sequence = state.next_sequence;
        let task = state.get_mut(id)?;
        match task.state {
            TaskState::Assigned | TaskState::Running => {}
            s if s.is_terminal() => {
                debug!(task_id = %id, state = %s, "Failure report discarded");
                return Ok(FailureOutcome::Ignored);
            }
            other => return Err(invalid_state(id, other, "fail")),
        }

        task.error = Some(reason.clone());
        let ceiling = task.max_retries.unwrap_or(self.default_max_retries);
        if task.retryable && task.retries < ceiling {
            task.retries += 1;
            task.state = TaskState::Queued;
            task.assigned_agent = None;
            task.started_at = None;
            task.queued_at = Utc::now();
            task.sequence = sequence;
            let attempt = task.attempt();
            state.next_sequence += 1;
            warn!(task_id = %id, attempt, ceiling, reason = %reason, "Task failed, requeued");
            self.notify(
                topics::task(id, topics::REQUEUED),
                json!({ "attempt": attempt, "reason": reason }),
            );
            return Ok(FailureOutcome::Requeued { attempt });
        }

        task.state = TaskState::Failed;
        task.completed_at = Some(Utc::now());
        warn!(task_id = %id, reason = %reason, "Task failed");
        let cancelled = self.propagate(&mut state, id, "failed");
        Ok(FailureOutcome::Failed { cancelled })
    }

    /// Cancel a task that has not finished.
    ///
    /// Queued tasks leave the ready set at once. For assigned or running
    /// tasks the record flips to `cancelled` immediately and the agent is
    /// only advised; its eventual report is discarded. Cancelling an
    /// already-cancelled task is a no-op.
    pub fn cancel(&self, id: TaskId) -> FusionResult<CancelOutcome> {
        let mut state = self.state.write();
        let task = state.get_mut(id)?;
        let previous = task.state;
        match previous {
            TaskState::Cancelled => {
                return Ok(CancelOutcome {
                    previous,
                    agent: None,
                    cascaded: Vec::new(),
                })
            }
            TaskState::Completed | TaskState::Failed => {
                return Err(invalid_state(id, previous, "cancel"))
            }
            _ => {}
        }
        let agent = task.assigned_agent;
        task.state = TaskState::Cancelled;
        task.completed_at = Some(Utc::now());
        task.error = Some("cancelled by request".into());
        info!(task_id = %id, previous = %previous, "Task cancelled");
        self.notify(
            topics::task(id, topics::CANCELLED),
            json!("cancelled by request"),
        );
        let cascaded = self.propagate(&mut state, id, "was cancelled");
        Ok(CancelOutcome {
            previous,
            agent,
            cascaded,
        })
    }

    /// Cancel every non-terminal task that requires `root`, transitively, and
    /// announce optional dependents that became ready.
    fn propagate(&self, state: &mut QueueState, root: TaskId, verb: &str) -> Vec<TaskId> {
        let mut cancelled = Vec::new();
        let mut frontier = VecDeque::from([root]);
        while let Some(current) = frontier.pop_front() {
            let dependents: Vec<TaskId> = state
                .dependents
                .get(&current)
                .into_iter()
                .flatten()
                .copied()
                .collect();
            for dep_id in dependents {
                let Some(dependent) = state.tasks.get_mut(&dep_id) else {
                    continue;
                };
                if dependent.state.is_terminal() || dependent.is_optional_dependency(&current) {
                    continue;
                }
                let reason = format!("dependency {current} {verb}");
                dependent.state = TaskState::Cancelled;
                dependent.completed_at = Some(Utc::now());
                dependent.error = Some(reason.clone());
                info!(task_id = %dep_id, reason = %reason, "Dependent task cancelled");
                self.notify(topics::task(dep_id, topics::CANCELLED), json!(reason));
                cancelled.push(dep_id);
                frontier.push_back(dep_id);
            }
        }

        let mut announced = BTreeSet::new();
        for id in std::iter::once(root).chain(cancelled.iter().copied()) {
            for ready in state.ready_dependents(id) {
                if announced.insert(ready) {
                    self.notify(topics::task(ready, topics::READY), json!({ "after": id }));
                }
            }
        }
        cancelled
    }

    pub fn get(&self, id: TaskId) -> FusionResult<Task> {
        self.state
            .read()
            .tasks
            .get(&id)
            .cloned()
            .ok_or_else(|| FusionError::not_found(KIND, id))
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.state.read().tasks.contains_key(&id)
    }

    /// Every task in submission order.
    pub fn list(&self) -> Vec<Task> {
        let state = self.state.read();
        let mut tasks: Vec<Task> = state.tasks.values().cloned().collect();
        tasks.sort_by_key(|t| (t.queued_at, t.sequence));
        tasks
    }

    pub fn by_state(&self, wanted: TaskState) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .state
            .read()
            .tasks
            .values()
            .filter(|t| t.state == wanted)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.sequence);
        tasks
    }

    pub fn by_workflow(&self, workflow: WorkflowId) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .state
            .read()
            .tasks
            .values()
            .filter(|t| t.workflow_id == Some(workflow))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.sequence);
        tasks
    }

    /// Dependents of `id` that are ready right now.
    pub fn dependents_ready_after(&self, id: TaskId) -> Vec<TaskId> {
        self.state.read().ready_dependents(id)
    }

    pub fn counts(&self) -> TaskCounts {
        let state = self.state.read();
        let mut counts = TaskCounts::default();
        for task in state.tasks.values() {
            match task.state {
                TaskState::Queued => counts.queued += 1,
                TaskState::Assigned => counts.assigned += 1,
                TaskState::Running => counts.running += 1,
                TaskState::Completed => counts.completed += 1,
                TaskState::Failed => counts.failed += 1,
                TaskState::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }

    /// Insert a record loaded from the durable store as-is. Dependencies are
    /// not checked, since records arrive in arbitrary order.
    pub fn restore(&self, task: Task) -> FusionResult<()> {
        let mut state = self.state.write();
        if state.tasks.contains_key(&task.id) {
            return Err(FusionError::DuplicateId {
                kind: KIND,
                id: task.id.to_string(),
            });
        }
        for dep in &task.dependencies {
            state.dependents.entry(*dep).or_default().insert(task.id);
        }
        state.next_sequence = state.next_sequence.max(task.sequence + 1);
        state.tasks.insert(task.id, task);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.state.read().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().tasks.is_empty()
    }

    fn notify(&self, topic: String, payload: serde_json::Value) {
        if let Err(e) = self.router.publish(&topic, payload) {
            debug!(topic = %topic, error = %e, "Task notice not published");
        }
    }
}

fn invalid_state(id: TaskId, state: TaskState, operation: &'static str) -> FusionError {
    FusionError::InvalidState {
        kind: KIND,
        id: id.to_string(),
        state: state.to_string(),
        operation,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn queue() -> TaskQueue {
        TaskQueue::new(MessageRouter::new())
    }

    fn ids(tasks: &[Task]) -> Vec<TaskId> {
        tasks.iter().map(|t| t.id).collect()
    }

    fn run(queue: &TaskQueue, id: TaskId) {
        queue.mark_assigned(id, Uuid::new_v4()).unwrap();
        queue.mark_running(id).unwrap();
    }

    #[test]
    fn test_empty_queue() {
        let queue = queue();
        assert!(queue.is_empty());
        assert!(queue.ready_tasks().is_empty());
        assert_eq!(queue.counts().total(), 0);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let queue = queue();
        let task = Task::new("a");
        queue.enqueue(task.clone()).unwrap();
        assert!(matches!(
            queue.enqueue(task),
            Err(FusionError::DuplicateId { .. })
        ));
    }

    #[test]
    fn test_dangling_dependency_rejected() {
        let queue = queue();
        let err = queue
            .enqueue(Task::new("b").with_dependencies([Uuid::new_v4()]))
            .unwrap_err();
        assert!(matches!(err, FusionError::DanglingDependency { .. }));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let queue = queue();
        let task = Task::new("a");
        let id = task.id;
        let err = queue.enqueue(task.with_dependencies([id])).unwrap_err();
        assert!(matches!(err, FusionError::Cycle { .. }));
    }

    #[test]
    fn test_ready_order_priority_then_fifo() {
        let queue = queue();
        let low = queue.enqueue(Task::new("low").with_priority(1)).unwrap();
        let first = queue.enqueue(Task::new("first").with_priority(5)).unwrap();
        let second = queue.enqueue(Task::new("second").with_priority(5)).unwrap();
        assert_eq!(ids(&queue.ready_tasks()), vec![first, second, low]);
    }

    #[test]
    fn test_dependencies_gate_readiness() {
        let queue = queue();
        let a = queue.enqueue(Task::new("a")).unwrap();
        let b = queue.enqueue(Task::new("b").with_dependencies([a])).unwrap();
        assert_eq!(ids(&queue.ready_tasks()), vec![a]);

        run(&queue, a);
        assert!(queue.ready_tasks().is_empty());
        assert!(queue.mark_completed(a, json!("ok")).unwrap());
        assert_eq!(ids(&queue.ready_tasks()), vec![b]);
    }

    #[test]
    fn test_assignment_race() {
        let queue = queue();
        let id = queue.enqueue(Task::new("a")).unwrap();
        queue.mark_assigned(id, Uuid::new_v4()).unwrap();
        let err = queue.mark_assigned(id, Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, FusionError::AlreadyAssigned { .. }));

        queue.mark_running(id).unwrap();
        queue.mark_completed(id, json!(null)).unwrap();
        let err = queue.mark_assigned(id, Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, FusionError::InvalidState { .. }));
    }

    #[test]
    fn test_running_requires_assignment() {
        let queue = queue();
        let id = queue.enqueue(Task::new("a")).unwrap();
        assert!(matches!(
            queue.mark_running(id),
            Err(FusionError::InvalidState { .. })
        ));
        assert!(matches!(
            queue.mark_running(Uuid::new_v4()),
            Err(FusionError::NotFound { .. })
        ));
    }

    #[test]
    fn test_completion_is_idempotent() {
        let queue = queue();
        let id = queue.enqueue(Task::new("a")).unwrap();
        run(&queue, id);
        assert!(queue.mark_completed(id, json!({"n": 1})).unwrap());
        assert!(!queue.mark_completed(id, json!({"n": 2})).unwrap());
        let task = queue.get(id).unwrap();
        assert_eq!(task.output, Some(json!({"n": 1})));
        assert_eq!(queue.counts().completed, 1);
    }

    #[test]
    fn test_failure_cascades_to_required_dependents() {
        let queue = queue();
        let a = queue.enqueue(Task::new("a")).unwrap();
        let b = queue.enqueue(Task::new("b").with_dependencies([a])).unwrap();
        let c = queue.enqueue(Task::new("c").with_dependencies([b])).unwrap();
        let opt = queue
            .enqueue(Task::new("report").with_optional_dependency(a))
            .unwrap();

        run(&queue, a);
        let outcome = queue.mark_failed(a, "boom").unwrap();
        assert_eq!(outcome, FailureOutcome::Failed { cancelled: vec![b, c] });
        assert_eq!(queue.get(c).unwrap().state, TaskState::Cancelled);
        assert_eq!(queue.get(a).unwrap().error.as_deref(), Some("boom"));
        // The optional dependent only needed `a` to finish.
        assert_eq!(ids(&queue.ready_tasks()), vec![opt]);
    }

    #[test]
    fn test_retry_ceiling() {
        let queue = queue();
        let a = queue.enqueue(Task::new("a").retryable(Some(2))).unwrap();
        let b = queue.enqueue(Task::new("b").with_dependencies([a])).unwrap();

        for expected_attempt in [2, 3] {
            run(&queue, a);
            assert_eq!(
                queue.mark_failed(a, "flaky").unwrap(),
                FailureOutcome::Requeued { attempt: expected_attempt }
            );
            let task = queue.get(a).unwrap();
            assert_eq!(task.state, TaskState::Queued);
            assert!(task.assigned_agent.is_none());
        }

        run(&queue, a);
        assert_eq!(
            queue.mark_failed(a, "flaky").unwrap(),
            FailureOutcome::Failed { cancelled: vec![b] }
        );
        assert_eq!(queue.get(a).unwrap().retries, 2);
    }

    #[test]
    fn test_default_retry_ceiling_from_queue() {
        let queue = TaskQueue::new(MessageRouter::new()).with_max_retries(1);
        let a = queue.enqueue(Task::new("a").retryable(None)).unwrap();
        run(&queue, a);
        assert!(matches!(
            queue.mark_failed(a, "x").unwrap(),
            FailureOutcome::Requeued { .. }
        ));
        run(&queue, a);
        assert!(matches!(
            queue.mark_failed(a, "x").unwrap(),
            FailureOutcome::Failed { .. }
        ));
    }

    #[test]
    fn test_cancel_running_discards_late_report() {
        let queue = queue();
        let agent = Uuid::new_v4();
        let id = queue.enqueue(Task::new("a")).unwrap();
        queue.mark_assigned(id, agent).unwrap();
        queue.mark_running(id).unwrap();

        let outcome = queue.cancel(id).unwrap();
        assert_eq!(outcome.previous, TaskState::Running);
        assert_eq!(outcome.agent, Some(agent));
        assert!(!queue.mark_completed(id, json!("late")).unwrap());
        assert_eq!(queue.mark_failed(id, "late").unwrap(), FailureOutcome::Ignored);
        assert_eq!(queue.get(id).unwrap().state, TaskState::Cancelled);

        // Second cancel is a no-op.
        assert!(queue.cancel(id).unwrap().cascaded.is_empty());
    }

    #[test]
    fn test_cancel_completed_rejected() {
        let queue = queue();
        let id = queue.enqueue(Task::new("a")).unwrap();
        run(&queue, id);
        queue.mark_completed(id, json!(null)).unwrap();
        assert!(matches!(
            queue.cancel(id),
            Err(FusionError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_submission_after_failed_dependency() {
        let queue = queue();
        let a = queue.enqueue(Task::new("a")).unwrap();
        queue.cancel(a).unwrap();
        let b = queue.enqueue(Task::new("b").with_dependencies([a])).unwrap();
        assert_eq!(queue.get(b).unwrap().state, TaskState::Cancelled);
        assert!(queue.ready_tasks().is_empty());
    }

    #[test]
    fn test_ready_notice_on_completion() {
        let router = MessageRouter::new();
        let queue = TaskQueue::new(router.clone());
        let a = queue.enqueue(Task::new("a")).unwrap();
        let b = queue.enqueue(Task::new("b").with_dependencies([a])).unwrap();
        let mut sub = router.subscribe("task.*.ready").unwrap();
        run(&queue, a);
        queue.mark_completed(a, json!(null)).unwrap();
        let events = sub.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].entity_uuid(), Some(b));
        assert_eq!(queue.dependents_ready_after(a), vec![b]);
    }

    #[test]
    fn test_queries() {
        let queue = queue();
        let wf = Uuid::new_v4();
        let a = queue.enqueue(Task::new("a").in_workflow(wf)).unwrap();
        queue.enqueue(Task::new("loose")).unwrap();
        run(&queue, a);

        assert_eq!(ids(&queue.by_workflow(wf)), vec![a]);
        assert_eq!(queue.by_state(TaskState::Running).len(), 1);
        let counts = queue.counts();
        assert_eq!(counts.running, 1);
        assert_eq!(counts.queued, 1);
        assert_eq!(counts.active(), 2);
        assert_eq!(queue.list().len(), 2);
    }

    #[test]
    fn test_restore_keeps_sequence_monotonic() {
        let queue = queue();
        let mut task = Task::new("restored");
        task.sequence = 41;
        queue.restore(task.clone()).unwrap();
        assert!(queue.restore(task).is_err());
        let next = queue.enqueue(Task::new("fresh")).unwrap();
        assert_eq!(queue.get(next).unwrap().sequence, 42);
    }
}
