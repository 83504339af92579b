use async_trait::async_trait;
use pilott_core::{Message, PilottResult, ToolCall};
use pilott_skills::SkillDescriptor;
use uuid::Uuid;

/// Response from the LLM: free text, a tool call request, or a final answer.
#[derive(Debug, Clone)]
pub enum LlmResponse {
    /// Unstructured text. During planning this counts as a malformed reply.
    Text(String),
    ToolUse {
        content: Option<String>,
        tool_calls: Vec<ToolCall>,
    },
    /// The plan is complete; carries the final answer.
    Done(String),
}

/// Trait for language-model provider backends.
///
/// Transient failures must be reported as `PilottError::RateLimited`,
/// `PilottError::LlmTimeout` or `PilottError::MalformedResponse`; anything
/// else is treated as a non-retryable capability failure.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Non-streaming chat completion.
    async fn chat(
        &self,
        system_prompt: Option<&str>,
        messages: &[Message],
        tools: &[SkillDescriptor],
    ) -> PilottResult<LlmResponse>;

    /// Cheap liveness round trip used by the fault monitor.
    async fn health_check(&self) -> PilottResult<()> {
        let ping = Message::user("ping", Uuid::nil());
        self.chat(None, std::slice::from_ref(&ping), &[])
            .await
            .map(|_| ())
    }
}
