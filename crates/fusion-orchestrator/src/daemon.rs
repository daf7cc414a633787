use crate::registry::AgentRegistry;
use crate::task_queue::TaskQueue;
use crate::types::{Agent, Task};
use chrono::Utc;
use fusion_core::{
    topics, AgentId, Event, FusionError, FusionResult, TaskId, HEADER_AGENT_ID, HEADER_ATTEMPT,
};
use fusion_messaging::MessageRouter;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One committed delegation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Assignment {
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub attempt: u32,
}

/// Outcome of one scheduling pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PassReport {
    pub assignments: Vec<Assignment>,
    /// Ready tasks no idle agent could take. They stay queued.
    pub unmatched: Vec<TaskId>,
    /// Claims lost to a concurrent pass or rolled back.
    pub conflicts: usize,
}

impl PassReport {
    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty() && self.unmatched.is_empty() && self.conflicts == 0
    }
}

/// Exclusive right to run scheduling passes within one coordination domain.
///
/// The active daemon renews the lease every tick. A standby takes over once
/// the holder releases it or fails to renew within `ttl`.
pub struct SchedulerLease {
    holder: Mutex<Option<(Uuid, Instant)>>,
    ttl: Duration,
}

impl SchedulerLease {
    pub fn new(ttl: Duration) -> Self {
        Self {
            holder: Mutex::new(None),
            ttl,
        }
    }

    /// Acquire or renew the lease for `id`. Returns false while another live
    /// holder has it.
    pub fn try_acquire(&self, id: Uuid) -> bool {
        let mut holder = self.holder.lock();
        let now = Instant::now();
        match *holder {
            Some((current, renewed)) if current != id && now.duration_since(renewed) < self.ttl => {
                false
            }
            Some((current, _)) if current == id => {
                *holder = Some((id, now));
                true
            }
            _ => {
                info!(daemon = %id, "Scheduler lease acquired");
                *holder = Some((id, now));
                true
            }
        }
    }

    /// Give the lease up if `id` holds it.
    pub fn release(&self, id: Uuid) {
        let mut holder = self.holder.lock();
        if holder.is_some_and(|(current, _)| current == id) {
            *holder = None;
            info!(daemon = %id, "Scheduler lease released");
        }
    }

    pub fn holder(&self) -> Option<Uuid> {
        self.holder.lock().map(|(id, _)| id)
    }
}

/// The scheduler: matches ready tasks to idle, capable agents.
pub struct DelegationDaemon {
    id: Uuid,
    registry: Arc<AgentRegistry>,
    queue: Arc<TaskQueue>,
    router: MessageRouter,
    lease: Arc<SchedulerLease>,
    tick: Duration,
}

impl DelegationDaemon {
    pub fn new(registry: Arc<AgentRegistry>, queue: Arc<TaskQueue>, router: MessageRouter) -> Self {
        let tick = Duration::from_millis(500);
        Self {
            id: Uuid::new_v4(),
            registry,
            queue,
            router,
            lease: Arc::new(SchedulerLease::new(tick * 4)),
            tick,
        }
    }

    /// Share a lease with other daemons; only its holder runs passes.
    pub fn with_lease(mut self, lease: Arc<SchedulerLease>) -> Self {
        self.lease = lease;
        self
    }

    /// Coarse timer fallback between event-triggered passes.
    pub fn with_tick_interval(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn lease(&self) -> &Arc<SchedulerLease> {
        &self.lease
    }

    /// Run one scheduling pass.
    ///
    /// A task that cannot be matched, or whose claim races with another
    /// pass, is left queued and the pass moves on to the next ready task.
    pub fn run_pass(&self) -> PassReport {
        let mut report = PassReport::default();
        let ready = self.queue.ready_tasks();
        if ready.is_empty() {
            return report;
        }
        let now = Utc::now();
        let mut candidates: Vec<(Agent, usize)> = self
            .registry
            .idle_agents()
            .into_iter()
            .map(|agent| {
                let load = self.registry.completed_in_window(&agent, now);
                (agent, load)
            })
            .collect();

        for task in ready {
            if candidates.is_empty() {
                report.unmatched.push(task.id);
                continue;
            }
            match self.delegate(&task, &mut candidates, &mut report) {
                Ok(assignment) => report.assignments.push(assignment),
                Err(e) if e.is_capacity_exhausted() => {
                    debug!(task_id = %task.id, "{e}");
                    report.unmatched.push(task.id);
                }
                Err(e) => {
                    debug!(task_id = %task.id, error = %e, "Delegation deferred to next pass");
                    report.conflicts += 1;
                }
            }
        }

        if !report.is_empty() {
            debug!(
                assigned = report.assignments.len(),
                unmatched = report.unmatched.len(),
                conflicts = report.conflicts,
                "Scheduling pass finished"
            );
        }
        report
    }

    /// Try qualifying agents best-first until one claim sticks.
    fn delegate(
        &self,
        task: &Task,
        candidates: &mut Vec<(Agent, usize)>,
        report: &mut PassReport,
    ) -> FusionResult<Assignment> {
        loop {
            let Some(index) = best_candidate(task, candidates) else {
                return Err(FusionError::CapacityExhausted {
                    task: task.id.to_string(),
                });
            };
            let agent_id = candidates[index].0.id;

            if let Err(e) = self.registry.claim(agent_id, task.id) {
                // Someone else took the agent; it is gone for this pass.
                debug!(agent_id = %agent_id, error = %e, "Agent claim lost");
                candidates.swap_remove(index);
                if e.is_race_loss() {
                    report.conflicts += 1;
                    continue;
                }
                return Err(e);
            }

            if let Err(e) = self.queue.mark_assigned(task.id, agent_id) {
                if let Err(rollback) = self.registry.release(agent_id, task.id, false) {
                    warn!(agent_id = %agent_id, error = %rollback, "Rollback of agent claim failed");
                }
                return Err(e);
            }

            candidates.swap_remove(index);
            let attempt = task.attempt();
            info!(task_id = %task.id, agent_id = %agent_id, attempt, "Task delegated");
            let event = Event::new(
                topics::task(task.id, topics::ASSIGNED),
                json!({ "agent_id": agent_id, "attempt": attempt }),
            )
            .with_header(HEADER_AGENT_ID, agent_id)
            .with_header(HEADER_ATTEMPT, attempt);
            if let Err(e) = self.router.publish_event(event) {
                warn!(task_id = %task.id, error = %e, "Assignment notice not published");
            }
            return Ok(Assignment {
                task_id: task.id,
                agent_id,
                attempt,
            });
        }
    }

    /// Event-triggered scheduling loop with a coarse timer fallback.
    ///
    /// Bursts of trigger events are coalesced into a single pass. Passes run
    /// only while this daemon holds the lease, so a standby sharing the lease
    /// idles until the active daemon releases it or stops renewing.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> FusionResult<()> {
        let patterns = [
            topics::any(topics::TASK, topics::QUEUED),
            topics::any(topics::TASK, topics::READY),
            topics::any(topics::TASK, topics::REQUEUED),
            topics::any(topics::AGENT, "idle"),
        ];
        let patterns: Vec<&str> = patterns.iter().map(String::as_str).collect();
        let mut triggers = self.router.subscribe_many(&patterns)?;
        let mut timer = tokio::time::interval(self.tick);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(daemon = %self.id, tick_ms = self.tick.as_millis() as u64, "Delegation daemon started");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                _ = timer.tick() => {}
                event = triggers.recv() => {
                    if event.is_none() {
                        break;
                    }
                    triggers.drain();
                }
            }

            if !self.lease.try_acquire(self.id) {
                continue;
            }
            self.run_pass();
        }

        self.lease.release(self.id);
        self.router.unsubscribe(triggers.id());
        info!(daemon = %self.id, "Delegation daemon stopped");
        Ok(())
    }
}

/// Index of the qualifying candidate with the lowest windowed load, ties
/// broken by agent id.
fn best_candidate(task: &Task, candidates: &[(Agent, usize)]) -> Option<usize> {
    candidates
        .iter()
        .enumerate()
        .filter(|(_, (agent, _))| agent.can_perform(&task.required_capabilities))
        .min_by(|(_, (a, a_load)), (_, (b, b_load))| a_load.cmp(b_load).then(a.id.cmp(&b.id)))
        .map(|(i, _)| i)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::{capabilities, AgentState, TaskState};

    struct Fixture {
        router: MessageRouter,
        registry: Arc<AgentRegistry>,
        queue: Arc<TaskQueue>,
        daemon: DelegationDaemon,
    }

    fn fixture() -> Fixture {
        let router = MessageRouter::new();
        let registry = Arc::new(AgentRegistry::new(router.clone()));
        let queue = Arc::new(TaskQueue::new(router.clone()));
        let daemon = DelegationDaemon::new(registry.clone(), queue.clone(), router.clone());
        Fixture {
            router,
            registry,
            queue,
            daemon,
        }
    }

    fn spawn_idle(registry: &AgentRegistry, caps: &[&str]) -> AgentId {
        let id = registry.register("agent", capabilities(caps.iter().copied()));
        registry.transition(id, AgentState::Idle).unwrap();
        id
    }

    #[test]
    fn test_pass_assigns_capable_agent() {
        let f = fixture();
        let rust = spawn_idle(&f.registry, &["rust"]);
        let _py = spawn_idle(&f.registry, &["python"]);
        let task = f
            .queue
            .enqueue(Task::new("compile").with_capabilities(["rust"]))
            .unwrap();

        let report = f.daemon.run_pass();
        assert_eq!(report.assignments.len(), 1);
        assert_eq!(report.assignments[0].agent_id, rust);
        assert_eq!(f.queue.get(task).unwrap().state, TaskState::Assigned);
        assert_eq!(f.registry.get(rust).unwrap().current_task, Some(task));
    }

    #[test]
    fn test_unmatched_task_does_not_block_others() {
        let f = fixture();
        let agent = spawn_idle(&f.registry, &["rust"]);
        let demanding = f
            .queue
            .enqueue(Task::new("gpu").with_priority(10).with_capabilities(["cuda"]))
            .unwrap();
        let easy = f
            .queue
            .enqueue(Task::new("lint").with_capabilities(["rust"]))
            .unwrap();

        let report = f.daemon.run_pass();
        assert_eq!(report.unmatched, vec![demanding]);
        assert_eq!(report.assignments[0].task_id, easy);
        assert_eq!(report.assignments[0].agent_id, agent);
        assert_eq!(f.queue.get(demanding).unwrap().state, TaskState::Queued);
    }

    #[test]
    fn test_fifo_within_priority() {
        let f = fixture();
        spawn_idle(&f.registry, &[]);
        let a = f.queue.enqueue(Task::new("a")).unwrap();
        let b = f.queue.enqueue(Task::new("b")).unwrap();

        let report = f.daemon.run_pass();
        assert_eq!(report.assignments.len(), 1);
        assert_eq!(report.assignments[0].task_id, a);
        assert_eq!(report.unmatched, vec![b]);
    }

    #[test]
    fn test_least_loaded_agent_preferred() {
        let f = fixture();
        let busy = spawn_idle(&f.registry, &[]);
        let fresh = spawn_idle(&f.registry, &[]);
        // Give `busy` one completion inside the window.
        let warmup = f.queue.enqueue(Task::new("warmup")).unwrap();
        f.registry.claim(busy, warmup).unwrap();
        f.queue.mark_assigned(warmup, busy).unwrap();
        f.queue.mark_running(warmup).unwrap();
        f.queue.mark_completed(warmup, json!(null)).unwrap();
        f.registry.release(busy, warmup, true).unwrap();

        f.queue.enqueue(Task::new("next")).unwrap();
        let report = f.daemon.run_pass();
        assert_eq!(report.assignments[0].agent_id, fresh);
    }

    #[test]
    fn test_agent_id_breaks_load_ties() {
        let f = fixture();
        let a = spawn_idle(&f.registry, &[]);
        let b = spawn_idle(&f.registry, &[]);
        f.queue.enqueue(Task::new("t")).unwrap();
        let report = f.daemon.run_pass();
        assert_eq!(report.assignments[0].agent_id, a.min(b));
    }

    #[test]
    fn test_assignment_event_carries_headers() {
        let f = fixture();
        let agent = spawn_idle(&f.registry, &[]);
        let task = f.queue.enqueue(Task::new("t")).unwrap();
        let mut sub = f.router.subscribe("task.*.assigned").unwrap();
        f.daemon.run_pass();

        let event = sub.try_recv().unwrap();
        assert_eq!(event.entity_uuid(), Some(task));
        assert_eq!(event.header(HEADER_AGENT_ID), Some(agent.to_string().as_str()));
        assert_eq!(event.header(HEADER_ATTEMPT), Some("1"));
    }

    #[test]
    fn test_rollback_when_task_half_fails() {
        let f = fixture();
        let agent = spawn_idle(&f.registry, &[]);
        let task = f.queue.enqueue(Task::new("t")).unwrap();
        let snapshot = f.queue.get(task).unwrap();
        // Another assigner wins the task after our snapshot.
        f.queue.mark_assigned(task, Uuid::new_v4()).unwrap();

        let mut candidates = vec![(f.registry.get(agent).unwrap(), 0)];
        let mut report = PassReport::default();
        let err = f
            .daemon
            .delegate(&snapshot, &mut candidates, &mut report)
            .unwrap_err();
        assert!(matches!(err, FusionError::AlreadyAssigned { .. }));
        let agent = f.registry.get(agent).unwrap();
        assert_eq!(agent.state, AgentState::Idle);
        assert!(agent.current_task.is_none());
    }

    #[test]
    fn test_lease_exclusive_until_released() {
        let lease = SchedulerLease::new(Duration::from_secs(60));
        let active = Uuid::new_v4();
        let standby = Uuid::new_v4();
        assert!(lease.try_acquire(active));
        assert!(!lease.try_acquire(standby));
        assert!(lease.try_acquire(active));
        lease.release(standby);
        assert_eq!(lease.holder(), Some(active));
        lease.release(active);
        assert!(lease.try_acquire(standby));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expires_without_renewal() {
        let lease = SchedulerLease::new(Duration::from_millis(100));
        let crashed = Uuid::new_v4();
        let standby = Uuid::new_v4();
        assert!(lease.try_acquire(crashed));
        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(lease.try_acquire(standby));
        assert_eq!(lease.holder(), Some(standby));
    }

    #[tokio::test]
    async fn test_run_loop_reacts_to_events() {
        let f = fixture();
        let daemon = Arc::new(f.daemon.with_tick_interval(Duration::from_secs(3600)));
        let (tx, rx) = watch::channel(false);
        let mut assigned = f.router.subscribe("task.*.assigned").unwrap();
        let handle = tokio::spawn(daemon.clone().run(rx));
        tokio::task::yield_now().await;

        spawn_idle(&f.registry, &[]);
        let task = f.queue.enqueue(Task::new("t")).unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), assigned.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.entity_uuid(), Some(task));

        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
        assert!(daemon.lease().holder().is_none());
    }
}
