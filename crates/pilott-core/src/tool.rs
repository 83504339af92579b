use serde::{Deserialize, Serialize};

/// A step requested by the backend: run skill `name` with `arguments`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Backend-assigned id, echoed back in the step output.
    pub id: String,
    /// Skill to run.
    pub name: String,
    /// JSON arguments for the skill.
    pub arguments: serde_json::Value,
}

impl ToolCall {
    /// String argument `key`, if present.
    pub fn str_arg(&self, key: &str) -> Option<&str> {
        self.arguments.get(key).and_then(|v| v.as_str())
    }
}

/// What a skill reports back for one [`ToolCall`].
///
/// A result with `is_error` set is a failed step, same as a skill returning `Err`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// Id of the call this answers.
    pub call_id: String,
    /// Skill output, or the failure message.
    pub content: String,
    /// Whether the skill reported a failure.
    pub is_error: bool,
}

impl ToolResult {
    /// A successful step.
    pub fn success(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: content.into(),
            is_error: false,
        }
    }

    /// A failed step.
    pub fn error(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: content.into(),
            is_error: true,
        }
    }

    /// Output on success, failure message otherwise.
    pub fn into_outcome(self) -> Result<String, String> {
        if self.is_error {
            Err(self.content)
        } else {
            Ok(self.content)
        }
    }
}
