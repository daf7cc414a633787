//! Core types and error definitions for the fusion coordination engine.
//!
//! This crate provides the foundational types shared across all fusion crates:
//! the error taxonomy, entity identifiers, and the immutable event envelope
//! exchanged through the message router.
//!
//! # Main types
//!
//! - [`FusionError`] — Unified error enum for every coordination subsystem.
//! - [`FusionResult`] — Convenience alias for `Result<T, FusionError>`.
//! - [`Event`] — A timestamped notification with a topic and a payload.
//! - [`topics`] — The `<entity>.<id>.<kind>` topic naming scheme.

/// Error taxonomy.
pub mod error;
/// Event envelope.
pub mod event;
/// Topic naming scheme.
pub mod topics;

pub use error::{FusionError, FusionResult};
pub use event::{Event, HEADER_AGENT_ID, HEADER_ATTEMPT};

use uuid::Uuid;

/// Identifier of an agent.
pub type AgentId = Uuid;
/// Identifier of a task.
pub type TaskId = Uuid;
/// Identifier of a workflow.
pub type WorkflowId = Uuid;
