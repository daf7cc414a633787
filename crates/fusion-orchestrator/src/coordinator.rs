//! The coordination facade: explicit construction, background loops,
//! restart recovery and the operations exposed to API/CLI layers.

use crate::collaborators::{ExecutionFailure, Executor, WorkspaceProvisioner};
use crate::config::OrchestratorConfig;
use crate::daemon::{DelegationDaemon, PassReport, SchedulerLease};
use crate::monitor::{AgentMonitor, MonitorSnapshot};
use crate::registry::AgentRegistry;
use crate::store::Store;
use crate::task_queue::{CancelOutcome, FailureOutcome, TaskQueue};
use crate::types::{
    Agent, AgentState, Capabilities, Task, TaskState, Workflow, WorkflowDefinition,
};
use crate::workflow::WorkflowEngine;
use fusion_core::{
    topics, AgentId, Event, FusionError, FusionResult, TaskId, WorkflowId, HEADER_AGENT_ID,
    HEADER_ATTEMPT,
};
use fusion_messaging::{MessageRouter, Subscription};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// What `restore_from_store` rebuilt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub agents: usize,
    pub tasks: usize,
    pub workflows: usize,
    /// Tasks that were assigned or running at shutdown and went back to `queued`.
    pub requeued_tasks: Vec<TaskId>,
    /// Agents that were bound to a task at shutdown and lost the binding.
    pub reset_agents: Vec<AgentId>,
}

struct Inner {
    router: MessageRouter,
    registry: Arc<AgentRegistry>,
    queue: Arc<TaskQueue>,
    workflows: Arc<WorkflowEngine>,
    store: Arc<dyn Store>,
    executor: Arc<dyn Executor>,
}

#[derive(Default)]
struct Loops {
    /// Daemon and dispatcher; stopped first.
    producers: Vec<JoinHandle<()>>,
    /// Report consumer and recorder; drained last.
    consumer: Option<JoinHandle<()>>,
}

/// Owns every component of one coordination domain.
///
/// Build it with [`Coordinator::new`], optionally call
/// [`restore_from_store`](Self::restore_from_store), then [`start`](Self::start)
/// the background loops. [`shutdown`](Self::shutdown) stops scheduling, waits
/// for in-flight executions and applies their reports before returning.
pub struct Coordinator {
    config: OrchestratorConfig,
    inner: Arc<Inner>,
    daemon: Arc<DelegationDaemon>,
    monitor: AgentMonitor,
    provisioner: Arc<dyn WorkspaceProvisioner>,
    stop_tx: watch::Sender<bool>,
    drain_tx: watch::Sender<bool>,
    loops: Mutex<Option<Loops>>,
}

impl Coordinator {
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn Store>,
        provisioner: Arc<dyn WorkspaceProvisioner>,
        executor: Arc<dyn Executor>,
    ) -> FusionResult<Self> {
        config.validate()?;
        let router = MessageRouter::with_history_limit(config.router.history_limit);
        let registry =
            Arc::new(AgentRegistry::new(router.clone()).with_load_window(config.load_window()));
        let queue = Arc::new(TaskQueue::new(router.clone()).with_max_retries(config.retry.max_retries));
        let workflows = Arc::new(WorkflowEngine::new(queue.clone(), router.clone()));
        let daemon = Arc::new(Self::build_daemon(
            &config,
            &registry,
            &queue,
            &router,
            Arc::new(SchedulerLease::new(config.tick_interval() * 4)),
        ));
        let monitor = AgentMonitor::new(
            registry.clone(),
            queue.clone(),
            workflows.clone(),
            config.heartbeat_timeout(),
        );
        let (stop_tx, _) = watch::channel(false);
        let (drain_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            inner: Arc::new(Inner {
                router,
                registry,
                queue,
                workflows,
                store,
                executor,
            }),
            daemon,
            monitor,
            provisioner,
            stop_tx,
            drain_tx,
            loops: Mutex::new(None),
        })
    }

    /// Share a scheduler lease with other coordinators over the same domain;
    /// only the lease holder schedules, the rest stand by.
    pub fn with_scheduler_lease(mut self, lease: Arc<SchedulerLease>) -> Self {
        self.daemon = Arc::new(Self::build_daemon(
            &self.config,
            &self.inner.registry,
            &self.inner.queue,
            &self.inner.router,
            lease,
        ));
        self
    }

    fn build_daemon(
        config: &OrchestratorConfig,
        registry: &Arc<AgentRegistry>,
        queue: &Arc<TaskQueue>,
        router: &MessageRouter,
        lease: Arc<SchedulerLease>,
    ) -> DelegationDaemon {
        DelegationDaemon::new(registry.clone(), queue.clone(), router.clone())
            .with_tick_interval(config.tick_interval())
            .with_lease(lease)
    }

    // ----- lifecycle ---------------------------------------------------------

    /// Spawn the daemon, dispatcher and report consumer loops.
    pub fn start(&self) -> FusionResult<()> {
        let mut loops = self.loops.lock();
        if loops.is_some() {
            return Err(FusionError::InvalidState {
                kind: "coordinator",
                id: self.daemon.id().to_string(),
                state: "started".into(),
                operation: "start",
            });
        }

        // Subscribe before spawning so nothing published after `start`
        // returns can be missed.
        let events = self.inner.router.subscribe("#")?;
        let assignments = self
            .inner
            .router
            .subscribe(&topics::any(topics::TASK, topics::ASSIGNED))?;

        let consumer = tokio::spawn(event_loop(
            self.inner.clone(),
            events,
            self.drain_tx.subscribe(),
        ));
        let dispatcher = tokio::spawn(dispatch_loop(
            self.inner.clone(),
            assignments,
            self.stop_tx.subscribe(),
        ));
        let daemon = {
            let daemon = self.daemon.clone();
            let stop = self.stop_tx.subscribe();
            tokio::spawn(async move {
                if let Err(e) = daemon.run(stop).await {
                    error!(error = %e, "Delegation daemon exited with error");
                }
            })
        };

        *loops = Some(Loops {
            producers: vec![daemon, dispatcher],
            consumer: Some(consumer),
        });
        info!(daemon = %self.daemon.id(), "Coordinator started");
        Ok(())
    }

    /// Stop scheduling, wait for in-flight executions, apply their reports
    /// and stop the consumer. Safe to call more than once.
    pub async fn shutdown(&self) {
        let Some(mut loops) = self.loops.lock().take() else {
            return;
        };
        info!("Coordinator shutting down");
        let _ = self.stop_tx.send(true);
        for handle in loops.producers.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background loop ended abnormally");
            }
        }
        let _ = self.drain_tx.send(true);
        if let Some(handle) = loops.consumer.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Report consumer ended abnormally");
            }
        }
        info!("Coordinator stopped");
    }

    /// Rebuild in-memory indices from the durable store.
    ///
    /// Must run before [`start`](Self::start) on an empty coordinator. Tasks
    /// that were assigned or running are re-queued, working agents return to
    /// idle and paused agents lose their binding: the executions are presumed
    /// lost and will be redelivered.
    pub async fn restore_from_store(&self) -> FusionResult<RestoreReport> {
        if self.loops.lock().is_some() {
            return Err(FusionError::InvalidState {
                kind: "coordinator",
                id: self.daemon.id().to_string(),
                state: "started".into(),
                operation: "restore",
            });
        }
        let snapshot = self.inner.store.load().await?;
        let mut report = RestoreReport::default();

        for mut agent in snapshot.agents {
            if agent.state == AgentState::Working || agent.current_task.is_some() {
                if agent.state == AgentState::Working {
                    agent.state = AgentState::Idle;
                }
                agent.current_task = None;
                report.reset_agents.push(agent.id);
                self.inner.store.save_agent(&agent).await?;
            }
            self.inner.registry.restore(agent)?;
            report.agents += 1;
        }

        let mut tasks = snapshot.tasks;
        tasks.sort_by_key(|t| t.sequence);
        for mut task in tasks {
            if matches!(task.state, TaskState::Assigned | TaskState::Running) {
                task.state = TaskState::Queued;
                task.assigned_agent = None;
                task.started_at = None;
                report.requeued_tasks.push(task.id);
                self.inner.store.save_task(&task).await?;
            }
            self.inner.queue.restore(task)?;
            report.tasks += 1;
        }

        for workflow in snapshot.workflows {
            self.inner.workflows.restore(workflow)?;
            report.workflows += 1;
        }

        info!(
            agents = report.agents,
            tasks = report.tasks,
            workflows = report.workflows,
            requeued = report.requeued_tasks.len(),
            "Coordinator restored from store"
        );
        Ok(report)
    }

    // ----- agents ------------------------------------------------------------

    /// Register an agent and provision its workspace.
    ///
    /// On provisioning failure the agent is kept in `error` for audit and the
    /// provisioner's error is returned.
    pub async fn spawn_agent(
        &self,
        name: impl Into<String>,
        capabilities: Capabilities,
    ) -> FusionResult<AgentId> {
        let id = self.inner.registry.register(name, capabilities);
        match self.provisioner.provision(id).await {
            Ok(()) => {
                self.inner.registry.transition(id, AgentState::Idle)?;
                Ok(id)
            }
            Err(e) => {
                warn!(agent_id = %id, error = %e, "Provisioning failed");
                self.inner.registry.transition(id, AgentState::Error)?;
                Err(e)
            }
        }
    }

    pub fn pause_agent(&self, id: AgentId) -> FusionResult<()> {
        self.inner.registry.transition(id, AgentState::Paused)?;
        Ok(())
    }

    /// `paused -> idle`.
    pub fn resume_agent(&self, id: AgentId) -> FusionResult<()> {
        let agent = self.inner.registry.get(id)?;
        if agent.state != AgentState::Paused {
            return Err(FusionError::InvalidState {
                kind: "agent",
                id: id.to_string(),
                state: agent.state.to_string(),
                operation: "resume",
            });
        }
        self.inner.registry.transition(id, AgentState::Idle)?;
        Ok(())
    }

    /// Terminate an agent and tear down its workspace. The record is kept.
    pub async fn terminate_agent(&self, id: AgentId) -> FusionResult<()> {
        self.inner.registry.transition(id, AgentState::Terminated)?;
        if let Err(e) = self.provisioner.teardown(id).await {
            warn!(agent_id = %id, error = %e, "Workspace teardown failed");
        }
        Ok(())
    }

    pub fn heartbeat(&self, id: AgentId) -> FusionResult<()> {
        self.inner.registry.heartbeat(id).map(|_| ())
    }

    pub fn set_unresponsive(&self, id: AgentId, unresponsive: bool) -> FusionResult<()> {
        self.inner.registry.set_unresponsive(id, unresponsive)
    }

    /// Report that an agent broke. Its current task fails with "agent error".
    pub fn report_fault(&self, id: AgentId, reason: impl Into<String>) -> FusionResult<()> {
        self.inner.registry.get(id)?;
        self.inner
            .router
            .publish(&topics::agent(id, topics::FAULT), json!(reason.into()))?;
        Ok(())
    }

    // ----- tasks -------------------------------------------------------------

    pub fn submit_task(&self, task: Task) -> FusionResult<TaskId> {
        self.inner.queue.enqueue(task)
    }

    /// Cancel a task. An assigned agent is released at once; a running
    /// agent is advised through `agent.<id>.cancel` and released when its
    /// late report arrives.
    pub fn cancel_task(&self, id: TaskId) -> FusionResult<CancelOutcome> {
        let outcome = self.inner.queue.cancel(id)?;
        self.inner.advise_cancelled(id, &outcome);
        Ok(outcome)
    }

    // ----- workflows ---------------------------------------------------------

    pub fn create_workflow(&self, definition: WorkflowDefinition) -> WorkflowId {
        self.inner.workflows.create(definition)
    }

    pub fn validate_workflow(&self, id: WorkflowId) -> FusionResult<Vec<String>> {
        self.inner.workflows.validate(id)
    }

    pub fn start_workflow(&self, id: WorkflowId) -> FusionResult<Vec<TaskId>> {
        self.inner.workflows.start(id)
    }

    pub fn cancel_workflow(&self, id: WorkflowId) -> FusionResult<Vec<TaskId>> {
        let cancelled = self.inner.workflows.cancel(id)?;
        for (task_id, outcome) in &cancelled {
            self.inner.advise_cancelled(*task_id, outcome);
        }
        Ok(cancelled.into_iter().map(|(id, _)| id).collect())
    }

    /// Wait until the workflow reaches a terminal state and return it.
    pub async fn wait_for_workflow(&self, id: WorkflowId) -> FusionResult<Workflow> {
        let mut sub = self.inner.router.subscribe(&topics::workflow_all(id))?;
        loop {
            let workflow = self.inner.workflows.get(id)?;
            if workflow.state.is_terminal() {
                return Ok(workflow);
            }
            if sub.recv().await.is_none() {
                return Err(FusionError::Router("router closed".into()));
            }
        }
    }

    // ----- queries -----------------------------------------------------------

    pub fn agent(&self, id: AgentId) -> FusionResult<Agent> {
        self.inner.registry.get(id)
    }

    pub fn agents(&self) -> Vec<Agent> {
        self.inner.registry.list()
    }

    pub fn task(&self, id: TaskId) -> FusionResult<Task> {
        self.inner.queue.get(id)
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.inner.queue.list()
    }

    pub fn workflow(&self, id: WorkflowId) -> FusionResult<Workflow> {
        self.inner.workflows.get(id)
    }

    pub fn workflows(&self) -> Vec<Workflow> {
        self.inner.workflows.list()
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        self.monitor.snapshot()
    }

    /// Subscribe to lifecycle events (`agent.<id>.*`, `task.<id>.*`,
    /// `workflow.<id>.*` or any wildcard pattern).
    pub fn subscribe(&self, pattern: &str) -> FusionResult<Subscription> {
        self.inner.router.subscribe(pattern)
    }

    /// Run one scheduling pass outside the background loop.
    pub fn run_scheduling_pass(&self) -> PassReport {
        self.daemon.run_pass()
    }

    // ----- components --------------------------------------------------------

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn router(&self) -> &MessageRouter {
        &self.inner.router
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.inner.registry
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.inner.queue
    }

    pub fn workflow_engine(&self) -> &Arc<WorkflowEngine> {
        &self.inner.workflows
    }

    pub fn daemon(&self) -> &Arc<DelegationDaemon> {
        &self.daemon
    }

    pub fn monitor(&self) -> &AgentMonitor {
        &self.monitor
    }
}

impl Inner {
    fn advise_cancelled(&self, task_id: TaskId, outcome: &CancelOutcome) {
        let Some(agent_id) = outcome.agent else {
            return;
        };
        match outcome.previous {
            TaskState::Assigned => {
                if let Err(e) = self.registry.release(agent_id, task_id, false) {
                    warn!(agent_id = %agent_id, error = %e, "Release after cancel failed");
                }
            }
            TaskState::Running => {
                if let Err(e) = self.router.publish(
                    &topics::agent(agent_id, topics::CANCEL),
                    json!({ "task_id": task_id }),
                ) {
                    debug!(error = %e, "Cancel advice not published");
                }
            }
            _ => {}
        }
    }

    /// Record an event, apply it if it is an executor report, and write the
    /// touched records through to the store.
    async fn handle_event(&self, event: Event) {
        if let Err(e) = self.store.append_event(&event).await {
            warn!(topic = %event.topic, error = %e, "Event not recorded");
        }
        let Some((entity, _, kind)) = topics::split(&event.topic) else {
            return;
        };
        let Some(id) = event.entity_uuid() else {
            return;
        };

        match (entity, kind) {
            (topics::TASK, topics::COMPLETED) => self.apply_completed(id, &event).await,
            (topics::TASK, topics::FAILED) => self.apply_failed(id, &event).await,
            (topics::TASK, topics::CANCELLED) => {
                if let Ok(task) = self.queue.get(id) {
                    self.workflows.on_task_update(&task);
                    self.persist_task(id).await;
                    if let Some(wf) = task.workflow_id {
                        self.persist_workflow(wf).await;
                    }
                }
            }
            (topics::AGENT, topics::FAULT) => self.apply_fault(id, &event).await,
            (topics::AGENT, _) => self.persist_agent(id).await,
            (topics::TASK, _) => self.persist_task(id).await,
            (topics::WORKFLOW, _) => self.persist_workflow(id).await,
            _ => {}
        }
    }

    async fn apply_completed(&self, task_id: TaskId, event: &Event) {
        let Ok(task) = self.queue.get(task_id) else {
            debug!(task_id = %task_id, "Completion for unknown task");
            return;
        };
        if is_stale(&task, event) {
            debug!(task_id = %task_id, "Stale completion discarded");
            return;
        }
        let agent = reporting_agent(&task, event);
        let applied = match self.queue.mark_completed(task_id, event.payload.clone()) {
            Ok(applied) => applied,
            Err(e) => {
                debug!(task_id = %task_id, error = %e, "Completion rejected");
                return;
            }
        };
        self.release(agent, task_id, applied);
        if applied {
            if let Ok(task) = self.queue.get(task_id) {
                self.workflows.on_task_update(&task);
            }
        }
        self.persist_after_report(&task, agent).await;
    }

    async fn apply_failed(&self, task_id: TaskId, event: &Event) {
        let Ok(task) = self.queue.get(task_id) else {
            debug!(task_id = %task_id, "Failure for unknown task");
            return;
        };
        if is_stale(&task, event) {
            debug!(task_id = %task_id, "Stale failure discarded");
            return;
        }
        let agent = reporting_agent(&task, event);
        let outcome = match self.queue.mark_failed(task_id, event.payload_text()) {
            Ok(outcome) => outcome,
            Err(e) => {
                debug!(task_id = %task_id, error = %e, "Failure rejected");
                return;
            }
        };
        self.release(agent, task_id, false);
        if let FailureOutcome::Failed { .. } = outcome {
            if let Ok(task) = self.queue.get(task_id) {
                self.workflows.on_task_update(&task);
            }
        }
        self.persist_after_report(&task, agent).await;
    }

    /// An agent broke: move it to `error` and fail its current task.
    async fn apply_fault(&self, agent_id: AgentId, event: &Event) {
        let Ok(agent) = self.registry.get(agent_id) else {
            return;
        };
        let reason = event.payload_text();
        match self.registry.transition(agent_id, AgentState::Error) {
            Ok(_) => warn!(agent_id = %agent_id, reason = %reason, "Agent fault"),
            Err(e) => warn!(agent_id = %agent_id, error = %e, "Agent fault not applied"),
        }
        if let Some(task_id) = agent.current_task {
            let attempt = self.queue.get(task_id).map(|t| t.attempt()).unwrap_or(1);
            let failure = Event::new(topics::task(task_id, topics::FAILED), json!("agent error"))
                .with_header(HEADER_AGENT_ID, agent_id)
                .with_header(HEADER_ATTEMPT, attempt);
            if let Err(e) = self.router.publish_event(failure) {
                warn!(task_id = %task_id, error = %e, "Agent error not propagated");
            }
        }
        self.persist_agent(agent_id).await;
    }

    fn release(&self, agent: Option<AgentId>, task_id: TaskId, completed: bool) {
        if let Some(agent_id) = agent {
            if let Err(e) = self.registry.release(agent_id, task_id, completed) {
                debug!(agent_id = %agent_id, error = %e, "Agent not released");
            }
        }
    }

    async fn persist_after_report(&self, task: &Task, agent: Option<AgentId>) {
        self.persist_task(task.id).await;
        if let Some(agent_id) = agent {
            self.persist_agent(agent_id).await;
        }
        if let Some(wf) = task.workflow_id {
            self.persist_workflow(wf).await;
        }
    }

    async fn persist_agent(&self, id: AgentId) {
        if let Ok(agent) = self.registry.get(id) {
            if let Err(e) = self.store.save_agent(&agent).await {
                warn!(agent_id = %id, error = %e, "Agent record not saved");
            }
        }
    }

    async fn persist_task(&self, id: TaskId) {
        if let Ok(task) = self.queue.get(id) {
            if let Err(e) = self.store.save_task(&task).await {
                warn!(task_id = %id, error = %e, "Task record not saved");
            }
        }
    }

    async fn persist_workflow(&self, id: WorkflowId) {
        if let Ok(workflow) = self.workflows.get(id) {
            if let Err(e) = self.store.save_workflow(&workflow).await {
                warn!(workflow_id = %id, error = %e, "Workflow record not saved");
            }
        }
    }
}

/// A report from a superseded attempt or a different agent. Reports on
/// terminal tasks are not stale; the queue discards them idempotently.
fn is_stale(task: &Task, event: &Event) -> bool {
    if task.state.is_terminal() {
        return false;
    }
    let agent_matches = event.header(HEADER_AGENT_ID).map_or(true, |reported| {
        task.assigned_agent
            .is_some_and(|assigned| assigned.to_string() == reported)
    });
    let attempt_matches = event
        .header(HEADER_ATTEMPT)
        .map_or(true, |reported| reported == task.attempt().to_string());
    !(agent_matches && attempt_matches)
}

fn reporting_agent(task: &Task, event: &Event) -> Option<AgentId> {
    event
        .header(HEADER_AGENT_ID)
        .and_then(|id| Uuid::parse_str(id).ok())
        .or(task.assigned_agent)
}

fn report_headers(agent_id: AgentId, attempt: u32) -> BTreeMap<String, String> {
    BTreeMap::from([
        (HEADER_AGENT_ID.to_string(), agent_id.to_string()),
        (HEADER_ATTEMPT.to_string(), attempt.to_string()),
    ])
}

/// Single applier of executor reports and recorder of every event.
async fn event_loop(inner: Arc<Inner>, mut events: Subscription, mut drain: watch::Receiver<bool>) {
    debug!("Report consumer started");
    loop {
        tokio::select! {
            biased;
            event = events.recv() => match event {
                Some(event) => inner.handle_event(event).await,
                None => break,
            },
            changed = drain.changed() => {
                if changed.is_err() || *drain.borrow() {
                    while let Some(event) = events.try_recv() {
                        inner.handle_event(event).await;
                    }
                    break;
                }
            }
        }
    }
    inner.router.unsubscribe(events.id());
    debug!("Report consumer stopped");
}

/// Hands assigned tasks to the executor and turns outcomes into reports.
async fn dispatch_loop(inner: Arc<Inner>, mut assignments: Subscription, mut stop: watch::Receiver<bool>) {
    let mut inflight = JoinSet::new();
    debug!("Dispatcher started");
    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            Some(joined) = inflight.join_next(), if !inflight.is_empty() => {
                if let Err(e) = joined {
                    warn!(error = %e, "Execution task ended abnormally");
                }
            }
            event = assignments.recv() => match event {
                Some(event) => {
                    if let Some((task, agent_id)) = start_execution(&inner, &event) {
                        inflight.spawn(execute(inner.clone(), task, agent_id));
                    }
                }
                None => break,
            },
        }
    }
    inner.router.unsubscribe(assignments.id());
    let pending = inflight.len();
    if pending > 0 {
        info!(pending, "Waiting for in-flight executions");
    }
    while let Some(joined) = inflight.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "Execution task ended abnormally");
        }
    }
    debug!("Dispatcher stopped");
}

/// `assigned -> running` and announce it. `None` when the assignment is no
/// longer current (e.g. cancelled in between).
fn start_execution(inner: &Inner, event: &Event) -> Option<(Task, AgentId)> {
    let task_id = event.entity_uuid()?;
    let agent_id = event
        .header(HEADER_AGENT_ID)
        .and_then(|id| Uuid::parse_str(id).ok())?;
    let task = inner.queue.get(task_id).ok()?;
    if task.assigned_agent != Some(agent_id) {
        debug!(task_id = %task_id, "Assignment superseded");
        return None;
    }
    if let Err(e) = inner.queue.mark_running(task_id) {
        debug!(task_id = %task_id, error = %e, "Task not started");
        return None;
    }
    let headers = report_headers(agent_id, task.attempt());
    if let Err(e) = inner.router.publish_with_headers(
        &topics::task(task_id, topics::RUNNING),
        json!({ "agent_id": agent_id }),
        headers,
    ) {
        debug!(error = %e, "Running notice not published");
    }
    Some((task, agent_id))
}

async fn execute(inner: Arc<Inner>, task: Task, agent_id: AgentId) {
    let executor = inner.executor.clone();
    let attempt = task.attempt();
    let task_id = task.id;
    debug!(task_id = %task_id, agent_id = %agent_id, attempt, "Executing task");

    // A panicking executor becomes a task failure instead of a stuck task.
    let result = tokio::spawn(async move { executor.execute(agent_id, &task).await })
        .await
        .unwrap_or_else(|e| Err(ExecutionFailure::Task(format!("executor panicked: {e}"))));

    let headers = report_headers(agent_id, attempt);
    let published = match result {
        Ok(output) => inner.router.publish_with_headers(
            &topics::task(task_id, topics::COMPLETED),
            output,
            headers,
        ),
        Err(ExecutionFailure::Task(reason)) => inner.router.publish_with_headers(
            &topics::task(task_id, topics::FAILED),
            json!(reason),
            headers,
        ),
        Err(ExecutionFailure::Agent(reason)) => inner.router.publish_with_headers(
            &topics::agent(agent_id, topics::FAULT),
            json!(reason),
            headers,
        ),
    };
    if let Err(e) = published {
        warn!(task_id = %task_id, error = %e, "Execution report not published");
    }
}
