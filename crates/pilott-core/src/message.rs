use crate::tool::ToolCall;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who authored a [`Message`] in a task conversation.
///
/// System instructions travel separately as the backend's system prompt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The agent pipeline speaking on behalf of the task.
    User,
    /// The LLM backend.
    Assistant,
    /// Output of a step executed by a skill.
    Tool,
}

/// One turn of the conversation an agent holds with its backend for a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message id.
    pub id: Uuid,
    /// Author of the turn.
    pub role: Role,
    /// Text of the turn.
    pub content: String,
    /// Task the conversation belongs to.
    pub task_id: Uuid,
    /// Creation time (UTC).
    pub timestamp: DateTime<Utc>,
    /// Steps the backend asked for in this turn (assistant turns only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// The call a tool turn answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    fn new(role: Role, content: impl Into<String>, task_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: content.into(),
            task_id,
            timestamp: Utc::now(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// A turn written by the agent pipeline.
    pub fn user(content: impl Into<String>, task_id: Uuid) -> Self {
        Self::new(Role::User, content, task_id)
    }

    /// A plain backend reply.
    pub fn assistant(content: impl Into<String>, task_id: Uuid) -> Self {
        Self::new(Role::Assistant, content, task_id)
    }

    /// An assistant turn that requests one or more steps.
    pub fn step_request(content: impl Into<String>, calls: Vec<ToolCall>, task_id: Uuid) -> Self {
        Self {
            tool_calls: calls,
            ..Self::assistant(content, task_id)
        }
    }

    /// The output of a finished step, linked to the call that asked for it.
    pub fn step_output(call: &ToolCall, output: impl Into<String>, task_id: Uuid) -> Self {
        Self {
            tool_call_id: Some(call.id.clone()),
            ..Self::new(Role::Tool, output, task_id)
        }
    }

    /// Whether this turn asks for steps to be executed.
    pub fn requests_steps(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}
