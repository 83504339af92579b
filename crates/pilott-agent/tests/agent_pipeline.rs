#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Pipeline tests for pilott-agent: plan/act loop, tool retries, bounds,
//! memory integration and suitability.

use async_trait::async_trait;
use parking_lot::Mutex;
use pilott_agent::{Agent, AgentConfig, LlmBackend, LlmResponse, RetryPolicy};
use pilott_core::{
    Message, PilottError, PilottResult, Role, Task, TaskError, TaskResult, TaskStatus, ToolCall,
    ToolResult,
};
use pilott_memory::{
    InMemoryStore, MemoryStore, ScoredOutcome, SearchResult, TaskOutcome,
};
use pilott_skills::{Skill, SkillDescriptor, SkillRegistry};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Replays a scripted sequence of replies, then answers `Done` forever.
struct ScriptedBackend {
    script: Mutex<VecDeque<PilottResult<LlmResponse>>>,
    delay: Duration,
    calls: AtomicU32,
    /// Last turn of each conversation the backend was shown.
    last_turns: Mutex<Vec<Message>>,
}

impl ScriptedBackend {
    fn new(script: Vec<PilottResult<LlmResponse>>) -> Arc<Self> {
        Self::with_delay(script, Duration::ZERO)
    }

    fn with_delay(script: Vec<PilottResult<LlmResponse>>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            delay,
            calls: AtomicU32::new(0),
            last_turns: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl LlmBackend for ScriptedBackend {
    async fn chat(
        &self,
        _system_prompt: Option<&str>,
        messages: &[Message],
        _tools: &[SkillDescriptor],
    ) -> PilottResult<LlmResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(last) = messages.last() {
            self.last_turns.lock().push(last.clone());
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self.script.lock().pop_front();
        next.unwrap_or_else(|| Ok(LlmResponse::Done("done".into())))
    }
}

/// Fails its first `failures` calls, then succeeds.
struct FlakySkill {
    descriptor: SkillDescriptor,
    failures: u32,
    calls: AtomicU32,
}

impl FlakySkill {
    fn new(name: &str, idempotent: bool, failures: u32) -> Arc<Self> {
        let mut descriptor = SkillDescriptor::new(name, "flaky test tool", json!({}));
        descriptor.idempotent = idempotent;
        Arc::new(Self {
            descriptor,
            failures,
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl Skill for FlakySkill {
    fn descriptor(&self) -> &SkillDescriptor {
        &self.descriptor
    }

    async fn execute(&self, call: ToolCall) -> PilottResult<ToolResult> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            Ok(ToolResult::error(&call.id, format!("attempt {} failed", n + 1)))
        } else {
            Ok(ToolResult::success(&call.id, "tool ok"))
        }
    }
}

/// A memory store that rejects everything.
struct BrokenMemory;

#[async_trait]
impl MemoryStore for BrokenMemory {
    async fn store_task_start(&self, _task: &Task, _agent_id: Uuid) -> PilottResult<()> {
        Err(PilottError::Memory("unavailable".into()))
    }
    async fn store_task_result(&self, _task: &Task, _result: &TaskResult) -> PilottResult<()> {
        Err(PilottError::Memory("unavailable".into()))
    }
    async fn store_context(
        &self,
        _text: &str,
        _metadata: HashMap<String, serde_json::Value>,
        _tags: &[String],
    ) -> PilottResult<Uuid> {
        Err(PilottError::Memory("unavailable".into()))
    }
    async fn get_history(
        &self,
        _agent_id: Option<Uuid>,
        _limit: usize,
    ) -> PilottResult<Vec<TaskOutcome>> {
        Err(PilottError::Memory("unavailable".into()))
    }
    async fn similar_outcomes(
        &self,
        _agent_id: Uuid,
        _query: &str,
        _limit: usize,
    ) -> PilottResult<Vec<ScoredOutcome>> {
        Err(PilottError::Memory("unavailable".into()))
    }
    async fn search(
        &self,
        _query: &str,
        _tags: &[String],
        _limit: usize,
    ) -> PilottResult<Vec<SearchResult>> {
        Err(PilottError::Memory("unavailable".into()))
    }
    async fn prune_before(&self, _cutoff: chrono::DateTime<chrono::Utc>) -> PilottResult<usize> {
        Err(PilottError::Memory("unavailable".into()))
    }
    async fn count(&self) -> PilottResult<usize> {
        Err(PilottError::Memory("unavailable".into()))
    }
}

fn tool_use(name: &str) -> PilottResult<LlmResponse> {
    Ok(LlmResponse::ToolUse {
        content: Some(format!("calling {name}")),
        tool_calls: vec![ToolCall {
            id: format!("call_{name}"),
            name: name.into(),
            arguments: json!({"to": "ops@example.com"}),
        }],
    })
}

fn started(
    config: AgentConfig,
    backend: Arc<ScriptedBackend>,
    skills: SkillRegistry,
    memory: Option<Arc<dyn MemoryStore>>,
) -> Arc<Agent> {
    let agent = Arc::new(Agent::new(config, backend, Arc::new(skills), memory));
    agent.start();
    agent
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ---------------------------------------------------------------------------
// 1. Plan, act, summarize
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_tool_step_then_answer_then_summary() {
    init_tracing();
    let backend = ScriptedBackend::new(vec![
        tool_use("send_email"),
        Ok(LlmResponse::Done("email sent".into())),
        Ok(LlmResponse::Text("Sent the weekly email to ops.".into())),
    ]);
    let mut skills = SkillRegistry::new();
    skills.register(FlakySkill::new("send_email", false, 0));
    let memory = Arc::new(InMemoryStore::new());

    let agent = started(
        AgentConfig::new("email").with_capabilities(["email"]),
        backend.clone(),
        skills,
        Some(memory.clone()),
    );
    let mut task = Task::new("Send the weekly email").with_type("email");
    let result = agent.execute(&mut task).await;

    assert!(result.success, "unexpected failure: {:?}", result.error);
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(result.steps.len(), 1);
    assert_eq!(result.steps[0].tool, "send_email");
    assert_eq!(result.steps[0].attempts, 1);
    assert_eq!(result.output["answer"], "email sent");
    assert_eq!(result.output["summary"], "Sent the weekly email to ops.");
    assert_eq!(backend.calls.load(Ordering::SeqCst), 3);

    // The second planning call sees the step output, linked to its call.
    let turns = backend.last_turns.lock().clone();
    assert_eq!(turns[1].role, Role::Tool);
    assert_eq!(turns[1].tool_call_id.as_deref(), Some("call_send_email"));
    assert_eq!(turns[1].content, "tool ok");

    // start + outcome
    assert_eq!(memory.count().await.unwrap(), 2);
    let history = memory.get_history(Some(agent.id()), 5).await.unwrap();
    assert!(history[0].success);
}

// ---------------------------------------------------------------------------
// 2. Tool failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_idempotent_tool_is_retried_within_limit() {
    let backend = ScriptedBackend::new(vec![tool_use("lookup")]);
    let skill = FlakySkill::new("lookup", true, 2);
    let mut skills = SkillRegistry::new();
    skills.register(skill.clone());

    let agent = started(
        AgentConfig::new("research").with_step_retry_limit(2),
        backend,
        skills,
        None,
    );
    let mut task = Task::new("Look something up");
    let result = agent.execute(&mut task).await;

    assert!(result.success);
    assert_eq!(result.steps[0].attempts, 3);
    assert!(!result.steps[0].is_error);
    assert_eq!(skill.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_idempotent_tool_exhausting_retries_fails_task() {
    let backend = ScriptedBackend::new(vec![tool_use("lookup")]);
    let mut skills = SkillRegistry::new();
    skills.register(FlakySkill::new("lookup", true, 10));

    let agent = started(
        AgentConfig::new("research").with_step_retry_limit(2),
        backend,
        skills,
        None,
    );
    let mut task = Task::new("Look something up");
    let result = agent.execute(&mut task).await;

    assert!(!result.success);
    assert!(matches!(
        result.error,
        Some(TaskError::ToolExecution { ref tool, .. }) if tool == "lookup"
    ));
    assert_eq!(result.steps[0].attempts, 3);
    assert!(result.steps[0].is_error);
    assert_eq!(task.status, TaskStatus::Failed);
}

#[tokio::test]
async fn test_non_idempotent_tool_is_not_retried() {
    let backend = ScriptedBackend::new(vec![tool_use("send_email")]);
    let skill = FlakySkill::new("send_email", false, 1);
    let mut skills = SkillRegistry::new();
    skills.register(skill.clone());

    let agent = started(AgentConfig::new("email"), backend, skills, None);
    let mut task = Task::new("Send once");
    let result = agent.execute(&mut task).await;

    assert!(matches!(result.error, Some(TaskError::ToolExecution { .. })));
    assert_eq!(skill.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unknown_tool_fails_the_step() {
    let backend = ScriptedBackend::new(vec![tool_use("missing")]);
    let agent = started(AgentConfig::new("worker"), backend, SkillRegistry::new(), None);
    let mut task = Task::new("Use a tool that does not exist");
    let result = agent.execute(&mut task).await;
    assert!(matches!(
        result.error,
        Some(TaskError::ToolExecution { ref message, .. }) if message.contains("Unknown skill")
    ));
}

// ---------------------------------------------------------------------------
// 3. Loop bounds
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_unstructured_replies_hit_iteration_limit() {
    let script = (0..5)
        .map(|i| Ok(LlmResponse::Text(format!("musing {i}"))))
        .collect();
    let backend = ScriptedBackend::new(script);
    let agent = started(
        AgentConfig::new("worker").with_max_iterations(3),
        backend.clone(),
        SkillRegistry::new(),
        None,
    );
    let mut task = Task::new("Ramble");
    let result = agent.execute(&mut task).await;

    assert_eq!(
        result.error,
        Some(TaskError::IterationLimitExceeded { limit: 3 })
    );
    assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_transient_backend_errors_consume_iterations() {
    let backend = ScriptedBackend::new(vec![
        Err(PilottError::RateLimited("429".into())),
        Err(PilottError::MalformedResponse("bad json".into())),
        Ok(LlmResponse::Done("recovered".into())),
    ]);
    let agent = started(
        AgentConfig::new("worker").with_max_iterations(3),
        backend,
        SkillRegistry::new(),
        None,
    );
    let mut task = Task::new("Eventually answer");
    let result = agent.execute(&mut task).await;
    assert!(result.success);
    assert_eq!(result.output["answer"], "recovered");
}

#[tokio::test]
async fn test_non_retryable_backend_error_is_capability_failure() {
    let backend = ScriptedBackend::new(vec![Err(PilottError::Llm("401 unauthorized".into()))]);
    let agent = started(AgentConfig::new("worker"), backend, SkillRegistry::new(), None);
    let mut task = Task::new("Fail fast");
    let result = agent.execute(&mut task).await;
    assert!(matches!(result.error, Some(TaskError::Capability { .. })));
}

#[tokio::test]
async fn test_execution_timeout_fails_with_timeout() {
    let backend = ScriptedBackend::with_delay(vec![], Duration::from_secs(5));
    let agent = started(
        AgentConfig::new("worker").with_execution_timeout(Duration::from_millis(50)),
        backend,
        SkillRegistry::new(),
        None,
    );
    let mut task = Task::new("Too slow");
    let result = agent.execute(&mut task).await;

    assert!(matches!(result.error, Some(TaskError::Timeout { after_ms: 50, .. })));
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(agent.current_task().is_none());
}

#[tokio::test]
async fn test_retry_policy_wraps_backend() {
    let backend = ScriptedBackend::new(vec![
        Err(PilottError::RateLimited("429".into())),
        Ok(LlmResponse::Done("after backoff".into())),
    ]);
    let mut config = AgentConfig::new("worker").with_max_iterations(1);
    config.retry_policy = Some(RetryPolicy {
        max_retries: 2,
        backoff_base_ms: 1,
        backoff_max_ms: 2,
    });
    let agent = started(config, backend, SkillRegistry::new(), None);
    let mut task = Task::new("Survive a rate limit");
    let result = agent.execute(&mut task).await;
    assert!(result.success);
}

// ---------------------------------------------------------------------------
// 4. Memory
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_unavailable_memory_does_not_block_completion() {
    let backend = ScriptedBackend::new(vec![]);
    let agent = started(
        AgentConfig::new("worker"),
        backend,
        SkillRegistry::new(),
        Some(Arc::new(BrokenMemory)),
    );
    let mut task = Task::new("Work without memory");
    let result = agent.execute(&mut task).await;
    assert!(result.success);

    let suitability = agent.evaluate_suitability(&task).await;
    assert!(suitability.history.is_none());
}

#[tokio::test]
async fn test_disabled_memory_records_nothing() {
    let memory = Arc::new(InMemoryStore::new());
    let agent = started(
        AgentConfig::new("worker").with_memory(false),
        ScriptedBackend::new(vec![]),
        SkillRegistry::new(),
        Some(memory.clone()),
    );
    let mut task = Task::new("Forgettable");
    assert!(agent.execute(&mut task).await.success);
    assert_eq!(memory.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_history_feeds_suitability() {
    let memory = Arc::new(InMemoryStore::new());
    let agent = started(
        AgentConfig::new("email").with_capabilities(["email"]),
        ScriptedBackend::new(vec![]),
        SkillRegistry::new(),
        Some(memory.clone()),
    );

    let fresh = Task::new("send status email").with_capabilities(["email"]);
    let before = agent.evaluate_suitability(&fresh).await;
    assert!(before.history.is_none());

    let mut done = Task::new("send weekly status email to the team");
    assert!(agent.execute(&mut done).await.success);

    let after = agent.evaluate_suitability(&fresh).await;
    assert_eq!(after.history, Some(1.0));
    assert_eq!(after.capability, 1.0);
    assert!(after.history_score() > before.history_score());
}

#[tokio::test]
async fn test_recalled_knowledge_reaches_the_prompt() {
    struct CapturingBackend {
        first_prompt: Mutex<Option<String>>,
    }

    #[async_trait]
    impl LlmBackend for CapturingBackend {
        async fn chat(
            &self,
            _system_prompt: Option<&str>,
            messages: &[Message],
            _tools: &[SkillDescriptor],
        ) -> PilottResult<LlmResponse> {
            let mut first = self.first_prompt.lock();
            if first.is_none() {
                *first = messages.first().map(|m| m.content.clone());
            }
            Ok(LlmResponse::Done("ok".into()))
        }
    }

    let memory = Arc::new(InMemoryStore::new());
    memory
        .store_context("The invoice export runs monthly", HashMap::new(), &[])
        .await
        .unwrap();
    let backend = Arc::new(CapturingBackend {
        first_prompt: Mutex::new(None),
    });
    let agent = Arc::new(Agent::new(
        AgentConfig::new("finance"),
        backend.clone(),
        Arc::new(SkillRegistry::new()),
        Some(memory),
    ));
    agent.start();

    let mut task = Task::new("Check the monthly invoice export");
    assert!(agent.execute(&mut task).await.success);
    let prompt = backend.first_prompt.lock().clone().unwrap();
    assert!(prompt.contains("The invoice export runs monthly"));
}
