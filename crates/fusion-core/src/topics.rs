//! Topic naming scheme shared by every component.
//!
//! Topics are `<entity>.<id>.<kind>`. State-change notices use the state's
//! name as the kind; the remaining kinds are listed as constants here.

use std::fmt::Display;

/// Entity segment for agent topics.
pub const AGENT: &str = "agent";
/// Entity segment for task topics.
pub const TASK: &str = "task";
/// Entity segment for workflow topics.
pub const WORKFLOW: &str = "workflow";

/// Agent record created.
pub const REGISTERED: &str = "registered";
/// Agent liveness refresh.
pub const HEARTBEAT: &str = "heartbeat";
/// Executor-side report that the agent itself broke (payload = reason).
pub const FAULT: &str = "fault";
/// Advisory notice to an agent that its running task was cancelled.
pub const CANCEL: &str = "cancel";

/// Task entered the queue (submission or materialization).
pub const QUEUED: &str = "queued";
/// Task dependencies became satisfied.
pub const READY: &str = "ready";
/// Task bound to an agent.
pub const ASSIGNED: &str = "assigned";
/// Task handed to the executor.
pub const RUNNING: &str = "running";
/// Executor report: task finished (payload = output).
pub const COMPLETED: &str = "completed";
/// Executor report: task failed (payload = reason).
pub const FAILED: &str = "failed";
/// Failed task re-entered the queue under its retry ceiling.
pub const REQUEUED: &str = "requeued";
/// Task cancelled, directly or by dependency propagation.
pub const CANCELLED: &str = "cancelled";

/// Builds `agent.<id>.<kind>`.
pub fn agent(id: impl Display, kind: &str) -> String {
    format!("{AGENT}.{id}.{kind}")
}

/// Builds `task.<id>.<kind>`.
pub fn task(id: impl Display, kind: &str) -> String {
    format!("{TASK}.{id}.{kind}")
}

/// Builds `workflow.<id>.<kind>`.
pub fn workflow(id: impl Display, kind: &str) -> String {
    format!("{WORKFLOW}.{id}.{kind}")
}

/// Pattern matching every event about one agent.
pub fn agent_all(id: impl Display) -> String {
    format!("{AGENT}.{id}.*")
}

/// Pattern matching every event about one task.
pub fn task_all(id: impl Display) -> String {
    format!("{TASK}.{id}.*")
}

/// Pattern matching every event about one workflow.
pub fn workflow_all(id: impl Display) -> String {
    format!("{WORKFLOW}.{id}.*")
}

/// Pattern matching one kind across all entities of a type, e.g. `task.*.completed`.
pub fn any(entity: &str, kind: &str) -> String {
    format!("{entity}.*.{kind}")
}

/// Splits a three-segment topic into `(entity, id, kind)`.
pub fn split(topic: &str) -> Option<(&str, &str, &str)> {
    let mut parts = topic.splitn(3, '.');
    let entity = parts.next()?;
    let id = parts.next()?;
    let kind = parts.next()?;
    if entity.is_empty() || id.is_empty() || kind.is_empty() || kind.contains('.') {
        return None;
    }
    Some((entity, id, kind))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builders() {
        assert_eq!(agent("a1", REGISTERED), "agent.a1.registered");
        assert_eq!(task("t1", COMPLETED), "task.t1.completed");
        assert_eq!(workflow("w1", "running"), "workflow.w1.running");
        assert_eq!(agent_all("a1"), "agent.a1.*");
        assert_eq!(any(TASK, FAILED), "task.*.failed");
    }

    #[test]
    fn test_split() {
        assert_eq!(split("task.t1.completed"), Some(("task", "t1", "completed")));
        assert_eq!(split("task.t1"), None);
        assert_eq!(split("task.t1.a.b"), None);
        assert_eq!(split("task..completed"), None);
    }
}
