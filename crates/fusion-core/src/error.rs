use thiserror::Error;

/// A convenience `Result` alias using [`FusionError`].
pub type FusionResult<T> = Result<T, FusionError>;

/// Top-level error type for the coordination engine.
///
/// State-machine and lookup failures carry the entity kind and identifier so
/// callers can report them without re-fetching the record.
#[derive(Error, Debug)]
pub enum FusionError {
    /// No entity of the given kind exists with this identifier.
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    /// The requested lifecycle transition is not allowed from the current state.
    #[error("{kind} {id}: invalid transition {from} -> {to}")]
    InvalidTransition {
        kind: &'static str,
        id: String,
        from: String,
        to: String,
    },

    /// The operation is not valid for the entity's current state.
    #[error("{kind} {id}: cannot {operation} while {state}")]
    InvalidState {
        kind: &'static str,
        id: String,
        state: String,
        operation: &'static str,
    },

    /// An entity with this identifier already exists.
    #[error("duplicate {kind} id {id}")]
    DuplicateId { kind: &'static str, id: String },

    /// A task references a dependency the queue has never seen.
    #[error("task {task} depends on unknown task {dependency}")]
    DanglingDependency { task: String, dependency: String },

    /// The dependency graph contains at least one cycle. Every node that
    /// could not be ordered is listed.
    #[error("dependency cycle among: {}", members.join(", "))]
    Cycle { members: Vec<String> },

    /// Another caller assigned the task first.
    #[error("task {task} already assigned to agent {agent}")]
    AlreadyAssigned { task: String, agent: String },

    /// No registered agent can currently take the task. The task stays queued.
    #[error("no capable idle agent for task {task}")]
    CapacityExhausted { task: String },

    /// A workflow definition is structurally malformed.
    #[error("Invalid definition: {0}")]
    InvalidDefinition(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// The durable store failed to read or write a record.
    #[error("Store error: {0}")]
    Store(String),

    /// The executor backend could not accept work.
    #[error("Executor error: {0}")]
    Executor(String),

    /// The workspace provisioner failed.
    #[error("Provisioner error: {0}")]
    Provisioner(String),

    /// Malformed topic or pattern, or a closed router.
    #[error("Router error: {0}")]
    Router(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FusionError {
    /// Shorthand for [`FusionError::NotFound`].
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// True for errors a losing caller sees when another caller mutated the
    /// same entity first. The scheduler retries these on the next pass.
    pub fn is_race_loss(&self) -> bool {
        matches!(
            self,
            Self::AlreadyAssigned { .. } | Self::InvalidTransition { .. } | Self::InvalidState { .. }
        )
    }

    /// True when the error only reports that nothing could be matched.
    pub fn is_capacity_exhausted(&self) -> bool {
        matches!(self, Self::CapacityExhausted { .. })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_display_lists_members() {
        let err = FusionError::Cycle {
            members: vec!["a".into(), "b".into(), "c".into()],
        };
        assert_eq!(err.to_string(), "dependency cycle among: a, b, c");
    }

    #[test]
    fn test_race_loss_classification() {
        let lost = FusionError::AlreadyAssigned {
            task: "t".into(),
            agent: "a".into(),
        };
        assert!(lost.is_race_loss());
        assert!(!FusionError::not_found("task", "t").is_race_loss());
        assert!(FusionError::CapacityExhausted { task: "t".into() }.is_capacity_exhausted());
    }

    #[test]
    fn test_not_found_display() {
        let err = FusionError::not_found("agent", "42");
        assert_eq!(err.to_string(), "agent 42 not found");
    }
}
