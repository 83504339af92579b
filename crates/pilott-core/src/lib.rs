//! Core types and error definitions for the Pilott orchestration framework.
//!
//! This crate provides the foundational types shared across all Pilott crates:
//! the task model and its state machine, the error taxonomy, conversation
//! messages, and tool call abstractions.
//!
//! # Main types
//!
//! - [`Task`] — A unit of work with priority, context and a terminal result.
//! - [`TaskResult`] — Output or typed error produced by executing a task.
//! - [`TaskError`] — Typed failure carried inside a [`TaskResult`].
//! - [`PilottError`] — Unified infrastructure error enum.
//! - [`Message`] — One conversation turn, including step requests and step output.
//! - [`ToolCall`] / [`ToolResult`] — A step requested by the backend and what the skill reported.

/// Error taxonomy.
pub mod error;
/// Conversation messages exchanged with LLM backends.
pub mod message;
/// Task model and state machine.
pub mod task;
/// Tool call abstractions.
pub mod tool;

pub use error::{PilottError, PilottResult, TaskError};
pub use message::{Message, Role};
pub use task::{StepRecord, Task, TaskPriority, TaskResult, TaskStatus};
pub use tool::{ToolCall, ToolResult};
