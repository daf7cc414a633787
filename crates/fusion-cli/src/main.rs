mod simulator;

use clap::{Parser, Subcommand};
use fusion_orchestrator::{
    capabilities, AgentState, Coordinator, DirectoryProvisioner, FileStore, InMemoryStore,
    NoopProvisioner, OrchestratorConfig, Store, TaskState, WorkflowDefinition, WorkflowState,
};
use serde::{Deserialize, Serialize};
use simulator::SimulatedExecutor;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fusion", about = "Fusion: multi-agent task coordination engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "fusion.toml")]
    config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a workflow file and print its execution order
    Validate {
        /// Workflow definition (TOML)
        workflow: PathBuf,
    },
    /// Run a workflow against the configured agents with a simulated executor
    Run {
        /// Workflow definition (TOML)
        workflow: PathBuf,
        /// Simulated execution time per task
        #[arg(long, default_value_t = 100)]
        delay_ms: u64,
        /// Node keys whose execution should fail
        #[arg(long = "fail")]
        fail: Vec<String>,
        /// Give up if the workflow has not finished by then
        #[arg(long, default_value_t = 300)]
        timeout_secs: u64,
    },
    /// Print the persisted agents, tasks and workflows
    Status,
}

#[derive(Deserialize, Default)]
struct FusionConfig {
    #[serde(default)]
    orchestrator: OrchestratorConfig,
    #[serde(default = "default_data_dir")]
    data_dir: PathBuf,
    #[serde(default)]
    agents: Vec<AgentConfig>,
}

#[derive(Deserialize)]
struct AgentConfig {
    name: String,
    #[serde(default)]
    capabilities: Vec<String>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

impl FusionConfig {
    fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.orchestrator.validate()?;
        Ok(config)
    }

    /// A missing file means defaults; an unreadable or invalid one is an error.
    async fn load(path: &Path) -> anyhow::Result<Self> {
        if !tokio::fs::try_exists(path).await? {
            warn!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self {
                data_dir: default_data_dir(),
                ..Self::default()
            });
        }
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e)
        })?;
        Self::parse(&content)
    }
}

async fn load_workflow(path: &Path) -> anyhow::Result<WorkflowDefinition> {
    let content = tokio::fs::read_to_string(path).await.map_err(|e| {
        anyhow::anyhow!("Failed to read workflow file '{}': {}", path.display(), e)
    })?;
    Ok(toml::from_str(&content)?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = FusionConfig::load(&cli.config).await?;

    match cli.command {
        Commands::Validate { workflow } => validate(&config, &workflow).await,
        Commands::Run {
            workflow,
            delay_ms,
            fail,
            timeout_secs,
        } => {
            let executor = SimulatedExecutor::new(Duration::from_millis(delay_ms)).failing(fail);
            run(
                &config,
                &workflow,
                executor,
                Duration::from_secs(timeout_secs),
            )
            .await
        }
        Commands::Status => status(&config).await,
    }
}

async fn validate(config: &FusionConfig, path: &Path) -> anyhow::Result<()> {
    let definition = load_workflow(path).await?;
    let coord = Coordinator::new(
        config.orchestrator.clone(),
        Arc::new(InMemoryStore::new()),
        Arc::new(NoopProvisioner),
        Arc::new(SimulatedExecutor::new(Duration::ZERO)),
    )?;
    let name = definition.name.clone();
    let id = coord.create_workflow(definition);
    let order = coord.validate_workflow(id)?;
    println!("Workflow '{name}' is valid. Execution order:");
    for (n, key) in order.iter().enumerate() {
        println!("  {}. {key}", n + 1);
    }
    Ok(())
}

async fn run(
    config: &FusionConfig,
    path: &Path,
    executor: SimulatedExecutor,
    timeout: Duration,
) -> anyhow::Result<()> {
    let definition = load_workflow(path).await?;
    let store = Arc::new(FileStore::new(config.data_dir.join("store")).await?);
    let provisioner = Arc::new(DirectoryProvisioner::new(config.data_dir.join("workspaces")));
    let coord = Arc::new(Coordinator::new(
        config.orchestrator.clone(),
        store,
        provisioner,
        Arc::new(executor),
    )?);

    let restored = coord.restore_from_store().await?;
    if !restored.requeued_tasks.is_empty() {
        info!(count = restored.requeued_tasks.len(), "Resuming interrupted tasks");
    }
    coord.start()?;
    spawn_agents(&coord, &config.agents).await?;
    if coord.registry().idle_agents().is_empty() {
        warn!("No idle agents; tasks will stay queued until one is spawned");
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    let heartbeats = tokio::spawn(heartbeat_loop(
        coord.clone(),
        config.orchestrator.heartbeat_timeout().to_std().unwrap_or(Duration::from_secs(30)) / 3,
        stop_rx,
    ));

    let id = coord.create_workflow(definition);
    let order = coord.validate_workflow(id)?;
    info!(workflow_id = %id, order = ?order, "Workflow validated");
    coord.start_workflow(id)?;

    let outcome = tokio::time::timeout(timeout, coord.wait_for_workflow(id)).await;
    let _ = stop_tx.send(true);
    if let Err(e) = heartbeats.await {
        warn!(error = %e, "Heartbeat loop ended abnormally");
    }
    coord.shutdown().await;

    let workflow = match outcome {
        Ok(workflow) => workflow?,
        Err(_) => anyhow::bail!("workflow {id} did not finish within {}s", timeout.as_secs()),
    };

    println!("Workflow '{}' {}", workflow.definition.name, workflow.state);
    for key in &workflow.resolved_order {
        let Some(task_id) = workflow.node_tasks.get(key) else {
            continue;
        };
        let task = coord.task(*task_id)?;
        match &task.error {
            Some(error) if task.state != TaskState::Completed => {
                println!("  {key:<20} {:<10} {error}", task.state.as_str());
            }
            _ => println!("  {key:<20} {}", task.state.as_str()),
        }
    }
    if let Some(error) = &workflow.error {
        println!("Reason: {error}");
    }
    if workflow.state != WorkflowState::Completed {
        anyhow::bail!("workflow {id} ended {}", workflow.state);
    }
    Ok(())
}

/// Spawn configured agents that are not already alive from a previous run.
///
/// An agent restored in `error` can never be matched again, so it is
/// replaced like a terminated one.
async fn spawn_agents(coord: &Coordinator, agents: &[AgentConfig]) -> anyhow::Result<()> {
    let existing = coord.agents();
    for agent in agents {
        let alive = existing.iter().any(|a| {
            a.name == agent.name
                && !matches!(a.state, AgentState::Terminated | AgentState::Error)
        });
        if alive {
            info!(name = %agent.name, "Agent restored, not respawning");
            continue;
        }
        let id = coord
            .spawn_agent(agent.name.clone(), capabilities(agent.capabilities.iter().cloned()))
            .await?;
        info!(name = %agent.name, agent_id = %id, "Agent spawned");
    }
    Ok(())
}

/// Keep simulated agents fresh in the monitor.
async fn heartbeat_loop(
    coord: Arc<Coordinator>,
    every: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut timer = tokio::time::interval(every.max(Duration::from_millis(100)));
    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            _ = timer.tick() => {
                for agent in coord.agents() {
                    if agent.state != AgentState::Terminated {
                        if let Err(e) = coord.heartbeat(agent.id) {
                            debug!(agent_id = %agent.id, error = %e, "Heartbeat skipped");
                        }
                    }
                }
            }
        }
    }
}

#[derive(Serialize)]
struct StatusReport {
    data_dir: PathBuf,
    agents: Vec<AgentRow>,
    tasks_by_state: BTreeMap<String, usize>,
    workflows: Vec<WorkflowRow>,
    events: usize,
}

#[derive(Serialize)]
struct AgentRow {
    name: String,
    id: String,
    state: AgentState,
    tasks_completed: u64,
}

#[derive(Serialize)]
struct WorkflowRow {
    name: String,
    id: String,
    state: WorkflowState,
    progress: f64,
    error: Option<String>,
}

async fn status(config: &FusionConfig) -> anyhow::Result<()> {
    let store = FileStore::new(config.data_dir.join("store")).await?;
    let snapshot = store.load().await?;

    let mut tasks_by_state = BTreeMap::new();
    for task in &snapshot.tasks {
        *tasks_by_state.entry(task.state.as_str().to_string()).or_insert(0) += 1;
    }
    let mut agents: Vec<AgentRow> = snapshot
        .agents
        .into_iter()
        .map(|a| AgentRow {
            name: a.name,
            id: a.id.to_string(),
            state: a.state,
            tasks_completed: a.tasks_completed,
        })
        .collect();
    agents.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
    let mut workflows: Vec<WorkflowRow> = snapshot
        .workflows
        .into_iter()
        .map(|w| WorkflowRow {
            progress: w.progress(),
            name: w.definition.name,
            id: w.id.to_string(),
            state: w.state,
            error: w.error,
        })
        .collect();
    workflows.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));

    let report = StatusReport {
        data_dir: config.data_dir.clone(),
        agents,
        tasks_by_state,
        workflows,
        events: store.events().await?.len(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
