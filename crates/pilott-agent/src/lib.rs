//! Autonomous worker agents for the Pilott orchestrator.
//!
//! An [`Agent`] executes one task at a time: it formats the task with
//! context recalled from memory, runs a bounded plan/act loop against an
//! [`LlmBackend`], invokes tools through the shared skill registry, asks for
//! a summary and records the outcome.
//!
//! # Main types
//!
//! - [`Agent`] — A worker with status, load, health counters and metrics.
//! - [`AgentConfig`] — Role, capabilities and execution bounds.
//! - [`LlmBackend`] — Boundary to a language-model provider.
//! - [`RetryingBackend`] — Backoff wrapper for transient backend failures.
//! - [`Suitability`] — An agent's fitness for a task.

pub mod agent;
pub mod config;
pub mod context;
pub mod llm;
pub mod load;
pub mod prompt;
pub mod retry;
pub mod suitability;

pub use agent::{Agent, AgentMetrics, AgentSnapshot, AgentStatus, AssignedTask, CurrentTask};
pub use config::AgentConfig;
pub use context::ContextWindow;
pub use llm::{LlmBackend, LlmResponse};
pub use load::LoadTracker;
pub use retry::{RetryPolicy, RetryingBackend};
pub use suitability::Suitability;
