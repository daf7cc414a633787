use crate::types::{Agent, AgentState, Capabilities};
use chrono::{DateTime, Duration, Utc};
use fusion_core::{topics, AgentId, FusionError, FusionResult, TaskId};
use fusion_messaging::MessageRouter;
use parking_lot::RwLock;
use serde_json::json;
use std::collections::HashMap;
use tracing::{debug, info, warn};

const KIND: &str = "agent";

/// Owns every agent record and its lifecycle state.
///
/// Each operation takes the write lock for its whole read-check-write, so
/// concurrent transitions on one agent serialize and the loser sees a state
/// error rather than a torn record. Lifecycle notices are published while
/// the lock is held, which keeps `agent.<id>.*` topic order identical to the
/// order in which transitions were applied.
pub struct AgentRegistry {
    agents: RwLock<HashMap<AgentId, Agent>>,
    router: MessageRouter,
    load_window: Duration,
}

impl AgentRegistry {
    pub fn new(router: MessageRouter) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            router,
            load_window: Duration::seconds(300),
        }
    }

    /// Set the window over which completions count toward load.
    pub fn with_load_window(mut self, window: Duration) -> Self {
        self.load_window = window;
        self
    }

    pub fn load_window(&self) -> Duration {
        self.load_window
    }

    /// Create an agent in `spawning` and return its identifier.
    pub fn register(&self, name: impl Into<String>, capabilities: Capabilities) -> AgentId {
        let agent = Agent::new(name, capabilities);
        let id = agent.id;
        let mut agents = self.agents.write();
        info!(agent_id = %id, name = %agent.name, capabilities = ?agent.capabilities, "Agent registered");
        self.notify(
            topics::agent(id, topics::REGISTERED),
            json!({ "name": agent.name, "capabilities": agent.capabilities }),
        );
        agents.insert(id, agent);
        id
    }

    /// Move an agent to `target`. Returns the state it left.
    ///
    /// An agent still bound to a task cannot enter `idle`; only [`release`]
    /// returns it. Entering `terminated` unbinds any current task.
    ///
    /// [`release`]: AgentRegistry::release
    pub fn transition(&self, id: AgentId, target: AgentState) -> FusionResult<AgentState> {
        let mut agents = self.agents.write();
        let agent = agents
            .get_mut(&id)
            .ok_or_else(|| FusionError::not_found(KIND, id))?;
        let from = agent.state;
        if !from.can_transition_to(target) {
            debug!(agent_id = %id, %from, to = %target, "Agent transition rejected");
            return Err(invalid_transition(id, from, target));
        }
        if let (AgentState::Idle, Some(task_id)) = (target, agent.current_task) {
            debug!(agent_id = %id, %from, task_id = %task_id, "Agent still bound, not idling");
            return Err(FusionError::InvalidState {
                kind: KIND,
                id: id.to_string(),
                state: format!("{from} on task {task_id}"),
                operation: "go idle",
            });
        }
        agent.state = target;
        agent.updated_at = Utc::now();
        if target == AgentState::Terminated {
            agent.current_task = None;
        }
        info!(agent_id = %id, %from, to = %target, "Agent transitioned");
        self.notify(
            topics::agent(id, target.as_str()),
            json!({ "from": from, "to": target }),
        );
        Ok(from)
    }

    /// Bind an idle, responsive agent to a task (`idle -> working`).
    ///
    /// This is the agent half of delegation. A second caller racing for the
    /// same agent observes `InvalidTransition` from `working`.
    pub fn claim(&self, id: AgentId, task_id: TaskId) -> FusionResult<()> {
        let mut agents = self.agents.write();
        let agent = agents
            .get_mut(&id)
            .ok_or_else(|| FusionError::not_found(KIND, id))?;
        if agent.state != AgentState::Idle {
            return Err(invalid_transition(id, agent.state, AgentState::Working));
        }
        if agent.unresponsive {
            return Err(FusionError::InvalidState {
                kind: KIND,
                id: id.to_string(),
                state: "unresponsive".into(),
                operation: "claim",
            });
        }
        agent.state = AgentState::Working;
        agent.current_task = Some(task_id);
        agent.updated_at = Utc::now();
        debug!(agent_id = %id, task_id = %task_id, "Agent claimed");
        self.notify(
            topics::agent(id, AgentState::Working.as_str()),
            json!({ "from": AgentState::Idle, "to": AgentState::Working, "task_id": task_id }),
        );
        Ok(())
    }

    /// Unbind an agent from `task_id`, returning a working agent to `idle`.
    ///
    /// Returns `Ok(false)` when the agent is no longer bound to that task (a
    /// stale or duplicate report). A paused or errored agent keeps its state
    /// and only loses the binding. `completed` records the finish in the load
    /// window.
    pub fn release(&self, id: AgentId, task_id: TaskId, completed: bool) -> FusionResult<bool> {
        let mut agents = self.agents.write();
        let agent = agents
            .get_mut(&id)
            .ok_or_else(|| FusionError::not_found(KIND, id))?;
        if agent.current_task != Some(task_id) {
            return Ok(false);
        }
        let now = Utc::now();
        agent.current_task = None;
        agent.updated_at = now;
        if completed {
            agent.tasks_completed += 1;
            agent.recent_completions.push_back(now);
            let cutoff = now - self.load_window;
            while agent
                .recent_completions
                .front()
                .is_some_and(|t| *t < cutoff)
            {
                agent.recent_completions.pop_front();
            }
        }
        if agent.state == AgentState::Working {
            agent.state = AgentState::Idle;
            debug!(agent_id = %id, task_id = %task_id, completed, "Agent released");
            self.notify(
                topics::agent(id, AgentState::Idle.as_str()),
                json!({ "from": AgentState::Working, "to": AgentState::Idle, "task_id": task_id }),
            );
        }
        Ok(true)
    }

    /// Refresh the last-heartbeat timestamp. No state change.
    pub fn heartbeat(&self, id: AgentId) -> FusionResult<DateTime<Utc>> {
        let mut agents = self.agents.write();
        let agent = agents
            .get_mut(&id)
            .ok_or_else(|| FusionError::not_found(KIND, id))?;
        if agent.state == AgentState::Terminated {
            return Err(FusionError::InvalidState {
                kind: KIND,
                id: id.to_string(),
                state: agent.state.to_string(),
                operation: "heartbeat",
            });
        }
        let now = Utc::now();
        agent.last_heartbeat = Some(now);
        self.notify(topics::agent(id, topics::HEARTBEAT), json!(now));
        Ok(now)
    }

    /// Set or clear the externally managed unresponsive flag.
    ///
    /// Clearing it on an idle agent republishes `idle` so the scheduler
    /// reconsiders the agent.
    pub fn set_unresponsive(&self, id: AgentId, unresponsive: bool) -> FusionResult<()> {
        let mut agents = self.agents.write();
        let agent = agents
            .get_mut(&id)
            .ok_or_else(|| FusionError::not_found(KIND, id))?;
        if agent.unresponsive == unresponsive {
            return Ok(());
        }
        agent.unresponsive = unresponsive;
        agent.updated_at = Utc::now();
        if unresponsive {
            warn!(agent_id = %id, "Agent flagged unresponsive");
        } else {
            info!(agent_id = %id, "Agent responsive again");
            if agent.state == AgentState::Idle {
                self.notify(
                    topics::agent(id, AgentState::Idle.as_str()),
                    json!({ "from": AgentState::Idle, "to": AgentState::Idle }),
                );
            }
        }
        Ok(())
    }

    pub fn get(&self, id: AgentId) -> FusionResult<Agent> {
        self.agents
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| FusionError::not_found(KIND, id))
    }

    /// Every agent, oldest first.
    pub fn list(&self) -> Vec<Agent> {
        let mut agents: Vec<Agent> = self.agents.read().values().cloned().collect();
        agents.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        agents
    }

    pub fn by_state(&self, state: AgentState) -> Vec<Agent> {
        let mut agents: Vec<Agent> = self
            .agents
            .read()
            .values()
            .filter(|a| a.state == state)
            .cloned()
            .collect();
        agents.sort_by_key(|a| a.id);
        agents
    }

    /// Idle agents not flagged unresponsive, sorted by identifier.
    pub fn idle_agents(&self) -> Vec<Agent> {
        let mut agents: Vec<Agent> = self
            .agents
            .read()
            .values()
            .filter(|a| a.is_schedulable())
            .cloned()
            .collect();
        agents.sort_by_key(|a| a.id);
        agents
    }

    /// Completions recorded for `agent` inside the load window ending at `now`.
    pub fn completed_in_window(&self, agent: &Agent, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.load_window;
        agent
            .recent_completions
            .iter()
            .filter(|t| **t >= cutoff)
            .count()
    }

    /// Live agents whose last heartbeat (or creation, if none) is older than
    /// `timeout` at `now`.
    pub fn stale_agents(&self, timeout: Duration, now: DateTime<Utc>) -> Vec<AgentId> {
        let mut stale: Vec<AgentId> = self
            .agents
            .read()
            .values()
            .filter(|a| a.state != AgentState::Terminated)
            .filter(|a| now - a.last_heartbeat.unwrap_or(a.created_at) > timeout)
            .map(|a| a.id)
            .collect();
        stale.sort();
        stale
    }

    /// Insert a record loaded from the durable store as-is.
    pub fn restore(&self, agent: Agent) -> FusionResult<()> {
        let mut agents = self.agents.write();
        if agents.contains_key(&agent.id) {
            return Err(FusionError::DuplicateId {
                kind: KIND,
                id: agent.id.to_string(),
            });
        }
        agents.insert(agent.id, agent);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.read().is_empty()
    }

    fn notify(&self, topic: String, payload: serde_json::Value) {
        if let Err(e) = self.router.publish(&topic, payload) {
            debug!(topic = %topic, error = %e, "Agent notice not published");
        }
    }
}

fn invalid_transition(id: AgentId, from: AgentState, to: AgentState) -> FusionError {
    FusionError::InvalidTransition {
        kind: KIND,
        id: id.to_string(),
        from: from.to_string(),
        to: to.to_string(),
    }
}
