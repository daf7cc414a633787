use crate::types::{Agent, Task, Workflow};
use async_trait::async_trait;
use fusion_core::{AgentId, Event, FusionError, FusionResult, TaskId, WorkflowId};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Every record held by a store, as loaded on restart.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    pub agents: Vec<Agent>,
    pub tasks: Vec<Task>,
    pub workflows: Vec<Workflow>,
}

/// Durable record keeping: upserts for agents, tasks and workflows plus an
/// append-only event log. The engine treats it as a write-through cache.
#[async_trait]
pub trait Store: Send + Sync {
    async fn save_agent(&self, agent: &Agent) -> FusionResult<()>;
    async fn save_task(&self, task: &Task) -> FusionResult<()>;
    async fn save_workflow(&self, workflow: &Workflow) -> FusionResult<()>;
    async fn get_agent(&self, id: AgentId) -> FusionResult<Option<Agent>>;
    async fn get_task(&self, id: TaskId) -> FusionResult<Option<Task>>;
    async fn get_workflow(&self, id: WorkflowId) -> FusionResult<Option<Workflow>>;
    async fn append_event(&self, event: &Event) -> FusionResult<()>;
    /// The event log in append order.
    async fn events(&self) -> FusionResult<Vec<Event>>;
    async fn load(&self) -> FusionResult<StoreSnapshot>;
}

/// Store kept in process memory; nothing survives a restart.
#[derive(Default)]
pub struct InMemoryStore {
    agents: RwLock<HashMap<AgentId, Agent>>,
    tasks: RwLock<HashMap<TaskId, Task>>,
    workflows: RwLock<HashMap<WorkflowId, Workflow>>,
    events: RwLock<Vec<Event>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn save_agent(&self, agent: &Agent) -> FusionResult<()> {
        self.agents.write().insert(agent.id, agent.clone());
        Ok(())
    }

    async fn save_task(&self, task: &Task) -> FusionResult<()> {
        self.tasks.write().insert(task.id, task.clone());
        Ok(())
    }

    async fn save_workflow(&self, workflow: &Workflow) -> FusionResult<()> {
        self.workflows.write().insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn get_agent(&self, id: AgentId) -> FusionResult<Option<Agent>> {
        Ok(self.agents.read().get(&id).cloned())
    }

    async fn get_task(&self, id: TaskId) -> FusionResult<Option<Task>> {
        Ok(self.tasks.read().get(&id).cloned())
    }

    async fn get_workflow(&self, id: WorkflowId) -> FusionResult<Option<Workflow>> {
        Ok(self.workflows.read().get(&id).cloned())
    }

    async fn append_event(&self, event: &Event) -> FusionResult<()> {
        self.events.write().push(event.clone());
        Ok(())
    }

    async fn events(&self) -> FusionResult<Vec<Event>> {
        Ok(self.events.read().clone())
    }

    async fn load(&self) -> FusionResult<StoreSnapshot> {
        Ok(StoreSnapshot {
            agents: self.agents.read().values().cloned().collect(),
            tasks: self.tasks.read().values().cloned().collect(),
            workflows: self.workflows.read().values().cloned().collect(),
        })
    }
}

/// Store backed by a directory: one pretty-printed JSON file per record under
/// `agents/`, `tasks/` and `workflows/`, and an `events.jsonl` append log.
pub struct FileStore {
    dir: PathBuf,
    /// Serializes appends so lines never interleave.
    log_lock: tokio::sync::Mutex<()>,
}

const AGENTS: &str = "agents";
const TASKS: &str = "tasks";
const WORKFLOWS: &str = "workflows";
const EVENT_LOG: &str = "events.jsonl";

impl FileStore {
    pub async fn new(dir: impl Into<PathBuf>) -> FusionResult<Self> {
        let dir = dir.into();
        for sub in [AGENTS, TASKS, WORKFLOWS] {
            tokio::fs::create_dir_all(dir.join(sub)).await?;
        }
        Ok(Self {
            dir,
            log_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, kind: &str, id: Uuid) -> PathBuf {
        self.dir.join(kind).join(format!("{id}.json"))
    }

    /// Write through a temporary file and rename, so a crash never leaves a
    /// half-written record.
    async fn write_record<T: Serialize + Sync>(&self, kind: &str, id: Uuid, record: &T) -> FusionResult<()> {
        let path = self.record_path(kind, id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(record)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn read_record<T: DeserializeOwned>(&self, kind: &str, id: Uuid) -> FusionResult<Option<T>> {
        let path = self.record_path(kind, id);
        if !tokio::fs::try_exists(&path).await? {
            return Ok(None);
        }
        let data = tokio::fs::read_to_string(&path).await?;
        let record = serde_json::from_str(&data).map_err(|e| {
            FusionError::Store(format!("failed to parse {}: {e}", path.display()))
        })?;
        Ok(Some(record))
    }

    async fn read_all<T: DeserializeOwned>(&self, kind: &str) -> FusionResult<Vec<T>> {
        let mut entries = tokio::fs::read_dir(self.dir.join(kind)).await?;
        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let Some(id) = name
                .strip_suffix(".json")
                .and_then(|stem| Uuid::parse_str(stem).ok())
            else {
                continue;
            };
            if let Some(record) = self.read_record(kind, id).await? {
                records.push(record);
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl Store for FileStore {
    async fn save_agent(&self, agent: &Agent) -> FusionResult<()> {
        self.write_record(AGENTS, agent.id, agent).await
    }

    async fn save_task(&self, task: &Task) -> FusionResult<()> {
        self.write_record(TASKS, task.id, task).await
    }

    async fn save_workflow(&self, workflow: &Workflow) -> FusionResult<()> {
        self.write_record(WORKFLOWS, workflow.id, workflow).await
    }

    async fn get_agent(&self, id: AgentId) -> FusionResult<Option<Agent>> {
        self.read_record(AGENTS, id).await
    }

    async fn get_task(&self, id: TaskId) -> FusionResult<Option<Task>> {
        self.read_record(TASKS, id).await
    }

    async fn get_workflow(&self, id: WorkflowId) -> FusionResult<Option<Workflow>> {
        self.read_record(WORKFLOWS, id).await
    }

    async fn append_event(&self, event: &Event) -> FusionResult<()> {
        let line = format!("{}\n", serde_json::to_string(event)?);
        let _guard = self.log_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(EVENT_LOG))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn events(&self) -> FusionResult<Vec<Event>> {
        let path = self.dir.join(EVENT_LOG);
        if !tokio::fs::try_exists(&path).await? {
            return Ok(Vec::new());
        }
        let data = tokio::fs::read_to_string(&path).await?;
        data.lines()
            .filter(|line| !line.trim().is_empty())
            .enumerate()
            .map(|(n, line)| {
                serde_json::from_str(line).map_err(|e| {
                    FusionError::Store(format!("{EVENT_LOG} line {}: {e}", n + 1))
                })
            })
            .collect()
    }

    async fn load(&self) -> FusionResult<StoreSnapshot> {
        Ok(StoreSnapshot {
            agents: self.read_all(AGENTS).await?,
            tasks: self.read_all(TASKS).await?,
            workflows: self.read_all(WORKFLOWS).await?,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::{capabilities, TaskState, WorkflowDefinition, WorkflowNode};

    async fn exercise(store: &dyn Store) {
        let agent = Agent::new("worker", capabilities(["rust"]));
        let task = Task::new("build").with_priority(3);
        let workflow = Workflow::new(WorkflowDefinition::new("wf").node(WorkflowNode::new("a")));

        store.save_agent(&agent).await.unwrap();
        store.save_task(&task).await.unwrap();
        store.save_workflow(&workflow).await.unwrap();

        let mut updated = task.clone();
        updated.state = TaskState::Completed;
        store.save_task(&updated).await.unwrap();

        assert_eq!(
            store.get_task(task.id).await.unwrap().unwrap().state,
            TaskState::Completed
        );
        assert_eq!(store.get_agent(agent.id).await.unwrap().unwrap().name, "worker");
        assert!(store.get_workflow(Uuid::new_v4()).await.unwrap().is_none());

        let snapshot = store.load().await.unwrap();
        assert_eq!(snapshot.agents.len(), 1);
        assert_eq!(snapshot.tasks.len(), 1);
        assert_eq!(snapshot.workflows.len(), 1);

        store
            .append_event(&Event::new("task.t1.queued", serde_json::json!(1)))
            .await
            .unwrap();
        store
            .append_event(&Event::new("task.t1.assigned", serde_json::json!(2)))
            .await
            .unwrap();
        let events = store.events().await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].topic, "task.t1.assigned");
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        exercise(&InMemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_file_store() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStore::new(tmp.path().join("data")).await.unwrap();
        exercise(&store).await;
        assert!(store.dir().join("events.jsonl").exists());
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let task = Task::new("persisted");
        {
            let store = FileStore::new(tmp.path()).await.unwrap();
            store.save_task(&task).await.unwrap();
        }
        let store = FileStore::new(tmp.path()).await.unwrap();
        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.tasks.len(), 1);
        assert_eq!(loaded.tasks[0].id, task.id);
    }

    #[tokio::test]
    async fn test_file_store_rejects_corrupt_record() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStore::new(tmp.path()).await.unwrap();
        let id = Uuid::new_v4();
        std::fs::write(tmp.path().join("tasks").join(format!("{id}.json")), "{oops").unwrap();
        assert!(matches!(
            store.get_task(id).await,
            Err(FusionError::Store(_))
        ));
    }
}
