use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Convenience alias for `Result<T, PilottError>`.
pub type PilottResult<T> = Result<T, PilottError>;

/// Infrastructure-level error for every Pilott subsystem.
#[derive(Error, Debug)]
pub enum PilottError {
    /// Invalid or unreadable configuration.
    #[error("Config error: {0}")]
    Config(String),

    /// Non-retryable failure reported by an LLM backend.
    #[error("LLM error: {0}")]
    Llm(String),

    /// The LLM backend rejected the request because of rate limits.
    #[error("LLM rate limited: {0}")]
    RateLimited(String),

    /// The LLM backend did not answer in time.
    #[error("LLM request timed out: {0}")]
    LlmTimeout(String),

    /// The LLM answered with output that could not be interpreted.
    #[error("Malformed LLM response: {0}")]
    MalformedResponse(String),

    /// A tool (skill) failed or does not exist.
    #[error("Skill error: {0}")]
    Skill(String),

    /// The memory store is unavailable or rejected the operation.
    #[error("Memory error: {0}")]
    Memory(String),

    /// Pool or orchestrator level failure.
    #[error("Orchestrator error: {0}")]
    Orchestrator(String),

    /// A typed task failure.
    #[error(transparent)]
    Task(#[from] TaskError),

    /// JSON serialization or deserialization failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Standard I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PilottError {
    /// Whether the failure is transient and the same request may succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PilottError::RateLimited(_)
                | PilottError::LlmTimeout(_)
                | PilottError::MalformedResponse(_)
        )
    }
}

/// Typed failure of a task, carried inside a `TaskResult`.
///
/// Unlike [`PilottError`] this type is `Clone` and serializable so it can be
/// stored in task records and memory entries.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskError {
    /// No agent scored above the acceptance threshold.
    #[error("No suitable agent: {reason}")]
    NoSuitableAgent { reason: String },

    /// The agent is already executing a task.
    #[error("Agent {agent_id} is busy")]
    AgentBusy { agent_id: Uuid },

    /// The agent cannot take work (stopped, draining, in error or faulted).
    #[error("Agent {agent_id} is unavailable: {reason}")]
    AgentUnavailable { agent_id: Uuid, reason: String },

    /// A timeout bound was exceeded.
    #[error("{operation} timed out after {after_ms}ms")]
    Timeout { operation: String, after_ms: u64 },

    /// The planning loop hit its iteration bound.
    #[error("Iteration limit of {limit} exceeded")]
    IterationLimitExceeded { limit: u32 },

    /// A tool invocation failed after its retries.
    #[error("Tool '{tool}' failed: {message}")]
    ToolExecution { tool: String, message: String },

    /// The task was cancelled by shutdown, agent stop or a drain deadline.
    #[error("Cancelled: {reason}")]
    Cancelled { reason: String },

    /// The owning agent exhausted its recovery attempts and was retired.
    #[error("Agent {agent_id} retired after {attempts} recovery attempts")]
    RecoveryExhausted { agent_id: Uuid, attempts: u32 },

    /// The task failed submission-time validation.
    #[error("Invalid task: {reason}")]
    InvalidTask { reason: String },

    /// The external capability failed in a non-retryable way.
    #[error("Capability failure: {message}")]
    Capability { message: String },

    /// A status transition not allowed by the task state machine.
    #[error("Invalid task transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },
}

impl TaskError {
    /// Whether the failure was caused by the agent rather than the task.
    ///
    /// Only these failures qualify for the single automatic redelivery.
    pub fn is_agent_fault(&self) -> bool {
        matches!(
            self,
            TaskError::AgentUnavailable { .. } | TaskError::RecoveryExhausted { .. }
        )
    }

    /// Shorthand for a [`TaskError::Cancelled`].
    pub fn cancelled(reason: impl Into<String>) -> Self {
        TaskError::Cancelled {
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`TaskError::Timeout`].
    pub fn timeout(operation: impl Into<String>, after: std::time::Duration) -> Self {
        TaskError::Timeout {
            operation: operation.into(),
            after_ms: after.as_millis() as u64,
        }
    }
}
