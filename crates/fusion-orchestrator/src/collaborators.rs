use crate::types::Task;
use async_trait::async_trait;
use fusion_core::{AgentId, FusionError, FusionResult};
use std::path::PathBuf;

/// Why an execution did not produce output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionFailure {
    /// The task itself failed; the agent is fine and goes back to idle.
    Task(String),
    /// The agent broke while working; it moves to `error` and the task fails
    /// with reason "agent error".
    Agent(String),
}

impl std::fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionFailure::Task(reason) => write!(f, "task failure: {reason}"),
            ExecutionFailure::Agent(reason) => write!(f, "agent failure: {reason}"),
        }
    }
}

/// Prepares an isolated workspace for a freshly registered agent.
#[async_trait]
pub trait WorkspaceProvisioner: Send + Sync {
    async fn provision(&self, agent_id: AgentId) -> FusionResult<()>;

    /// Release the workspace of a terminated agent.
    async fn teardown(&self, _agent_id: AgentId) -> FusionResult<()> {
        Ok(())
    }
}

/// Runs one task on behalf of one agent.
///
/// The engine only relies on the outcome; how the work is done is opaque.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self,
        agent_id: AgentId,
        task: &Task,
    ) -> Result<serde_json::Value, ExecutionFailure>;
}

/// Provisioner that needs no setup.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProvisioner;

#[async_trait]
impl WorkspaceProvisioner for NoopProvisioner {
    async fn provision(&self, _agent_id: AgentId) -> FusionResult<()> {
        Ok(())
    }
}

/// Gives each agent a private directory `<root>/<agent_id>`.
#[derive(Debug, Clone)]
pub struct DirectoryProvisioner {
    root: PathBuf,
}

impl DirectoryProvisioner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn workspace(&self, agent_id: AgentId) -> PathBuf {
        self.root.join(agent_id.to_string())
    }
}

#[async_trait]
impl WorkspaceProvisioner for DirectoryProvisioner {
    async fn provision(&self, agent_id: AgentId) -> FusionResult<()> {
        let dir = self.workspace(agent_id);
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            FusionError::Provisioner(format!("cannot create {}: {e}", dir.display()))
        })?;
        tracing::debug!(agent_id = %agent_id, path = %dir.display(), "Workspace provisioned");
        Ok(())
    }

    async fn teardown(&self, agent_id: AgentId) -> FusionResult<()> {
        let dir = self.workspace(agent_id);
        if tokio::fs::try_exists(&dir).await? {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        Ok(())
    }
}
