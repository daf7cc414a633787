use async_trait::async_trait;
use fusion_core::AgentId;
use fusion_orchestrator::{ExecutionFailure, Executor, Task};
use serde_json::json;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::info;

/// Stand-in executor for dry runs: waits a fixed delay per task and fails
/// the tasks named in `failing`.
pub struct SimulatedExecutor {
    delay: Duration,
    failing: BTreeSet<String>,
}

impl SimulatedExecutor {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            failing: BTreeSet::new(),
        }
    }

    pub fn failing(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.failing.extend(names);
        self
    }
}

#[async_trait]
impl Executor for SimulatedExecutor {
    async fn execute(
        &self,
        agent_id: AgentId,
        task: &Task,
    ) -> Result<serde_json::Value, ExecutionFailure> {
        info!(task = %task.name, agent_id = %agent_id, attempt = task.attempt(), "Simulating task");
        tokio::time::sleep(self.delay).await;
        if self.failing.contains(&task.name) {
            return Err(ExecutionFailure::Task(format!(
                "simulated failure of {}",
                task.name
            )));
        }
        Ok(json!({
            "task": task.name,
            "agent_id": agent_id,
            "attempt": task.attempt(),
            "input": task.input,
        }))
    }
}
