#![allow(clippy::unwrap_used, clippy::expect_used)]

//! End-to-end orchestration tests.
//!
//! Drives a full `Orchestrator` with mock LLM backends: batch ordering,
//! capability routing with a real skill, rejection paths, redelivery after
//! an agent fault, shutdown cancellation and pool replenishment.

use async_trait::async_trait;
use pilott_agent::{AgentConfig, AgentStatus, LlmBackend, LlmResponse};
use pilott_core::{
    Message, PilottError, PilottResult, Role, Task, TaskError, TaskStatus, ToolCall, ToolResult,
};
use pilott_memory::{InMemoryStore, MemoryStore};
use pilott_orchestrator::*;
use pilott_skills::{Skill, SkillDescriptor, SkillRegistry};
use rand::Rng;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Mock LLM backend
// ---------------------------------------------------------------------------

/// Answers every task after a short delay. The `email` role first asks for
/// the `send_email` tool, then finishes once it has seen the tool result.
struct MockBackend {
    role: String,
    delay: Duration,
    healthy: Arc<AtomicBool>,
}

#[async_trait]
impl LlmBackend for MockBackend {
    async fn chat(
        &self,
        _system_prompt: Option<&str>,
        messages: &[Message],
        tools: &[SkillDescriptor],
    ) -> PilottResult<LlmResponse> {
        let jitter = rand::thread_rng().gen_range(0..5u64);
        tokio::time::sleep(self.delay + Duration::from_millis(jitter)).await;

        if tools.is_empty() {
            return Ok(LlmResponse::Done(format!("{} summary", self.role)));
        }
        let saw_tool_result = messages.last().is_some_and(|m| m.role == Role::Tool);
        if self.role == "email" && !saw_tool_result {
            return Ok(LlmResponse::ToolUse {
                content: Some("sending the message".into()),
                tool_calls: vec![ToolCall {
                    id: "call_1".into(),
                    name: "send_email".into(),
                    arguments: json!({"to": "ops@example.com", "body": "weekly report"}),
                }],
            });
        }
        Ok(LlmResponse::Done(format!("{} finished", self.role)))
    }

    async fn health_check(&self) -> PilottResult<()> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(PilottError::Llm("backend unreachable".into()))
        }
    }
}

/// Every agent shares `delay`; agents with role `flaky` report the health
/// of `flaky_health`.
fn mock_factory(delay: Duration, flaky_health: Arc<AtomicBool>) -> BackendFactory {
    Arc::new(move |config: &AgentConfig| -> Arc<dyn LlmBackend> {
        let healthy = if config.role == "flaky" {
            Arc::clone(&flaky_health)
        } else {
            Arc::new(AtomicBool::new(true))
        };
        Arc::new(MockBackend {
            role: config.role.clone(),
            delay,
            healthy,
        })
    })
}

struct SendEmail {
    descriptor: SkillDescriptor,
    sent: AtomicU32,
}

#[async_trait]
impl Skill for SendEmail {
    fn descriptor(&self) -> &SkillDescriptor {
        &self.descriptor
    }

    async fn execute(&self, call: ToolCall) -> PilottResult<ToolResult> {
        self.sent.fetch_add(1, Ordering::SeqCst);
        let to = call.str_arg("to").unwrap_or("nobody");
        Ok(ToolResult::success(&call.id, format!("queued mail to {to}")))
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn wait_for_status(orchestrator: &Orchestrator, agent_id: Uuid, status: AgentStatus) {
    for _ in 0..200 {
        if let Some(agent) = orchestrator.pool().get(agent_id).await {
            if agent.status() == status {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("agent {agent_id} never reached {status:?}");
}

fn agent_id_by_role(agents: &[pilott_agent::AgentSnapshot], role: &str) -> Uuid {
    agents.iter().find(|a| a.role == role).unwrap().id
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_batch_results_follow_submission_order() {
    init_tracing();
    let config = OrchestratorConfig {
        max_concurrent_tasks: 4,
        agents: (0..3)
            .map(|i| AgentConfig::new(format!("worker-{i}")).with_capabilities(["general"]))
            .collect(),
        ..OrchestratorConfig::default()
    };
    let factory = mock_factory(Duration::from_millis(10), Arc::new(AtomicBool::new(true)));
    let orchestrator = Orchestrator::new(config, factory).unwrap();
    orchestrator.start().await.unwrap();

    let tasks: Vec<Task> = (0..12)
        .map(|i| Task::new(format!("batch item {i}")))
        .collect();
    let ids: Vec<Uuid> = tasks.iter().map(|t| t.id).collect();

    let results = orchestrator.submit_batch(tasks).await;

    assert_eq!(results.len(), ids.len());
    for (result, id) in results.iter().zip(&ids) {
        assert_eq!(result.task_id, *id);
        assert!(result.success, "task {id} failed: {:?}", result.error);
        assert!(result.agent_id.is_some());
    }
    for id in &ids {
        let task = orchestrator.task(*id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    }

    let metrics = orchestrator.metrics();
    assert_eq!(metrics.submitted, 12);
    assert_eq!(metrics.completed, 12);
    assert_eq!(metrics.running, 0);

    orchestrator.stop().await;
}

#[tokio::test]
async fn test_email_task_routes_to_email_agent_and_uses_skill() {
    init_tracing();
    let skill = Arc::new(SendEmail {
        descriptor: SkillDescriptor::new("send_email", "Send an email", json!({})),
        sent: AtomicU32::new(0),
    });
    let mut skills = SkillRegistry::new();
    skills.register(skill.clone());
    let memory: Arc<dyn MemoryStore> = Arc::new(InMemoryStore::new());

    let config = OrchestratorConfig::from_toml_str(
        r#"
[task_types.email]
required_keys = ["recipient"]

[[agents]]
role = "email"
capabilities = ["email", "smtp"]

[[agents]]
role = "research"
capabilities = ["search"]
"#,
    )
    .unwrap();
    let orchestrator = Orchestrator::with_parts(
        config,
        mock_factory(Duration::from_millis(2), Arc::new(AtomicBool::new(true))),
        Arc::new(skills),
        Some(Arc::clone(&memory)),
    )
    .unwrap();
    orchestrator.start().await.unwrap();
    let email_agent = agent_id_by_role(&orchestrator.agents().await, "email");

    let email_task = |description: &str| {
        Task::new(description)
            .with_type("email")
            .with_capabilities(["email"])
            .with_context("recipient", json!("ops@example.com"))
    };
    let result = orchestrator
        .submit(email_task("Send the weekly report to operations"))
        .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.agent_id, Some(email_agent));
    assert_eq!(result.output["answer"], "email finished");
    assert_eq!(result.output["summary"], "email summary");
    assert_eq!(skill.sent.load(Ordering::SeqCst), 1);
    assert!(memory.count().await.unwrap() > 0);

    // Two at once: the second waits for the busy email agent instead of
    // being dropped or handed to the research agent.
    let (first, second) = tokio::join!(
        orchestrator.submit(email_task("Send the invoice reminder")),
        orchestrator.submit(email_task("Send the outage notice")),
    );
    for result in [&first, &second] {
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.agent_id, Some(email_agent));
    }
    assert_eq!(skill.sent.load(Ordering::SeqCst), 3);
    assert_eq!(orchestrator.metrics().completed, 3);

    orchestrator.stop().await;
}

#[tokio::test]
async fn test_unmatched_capability_is_rejected_without_touching_agents() {
    init_tracing();
    let config = OrchestratorConfig {
        agents: vec![
            AgentConfig::new("email").with_capabilities(["email"]),
            AgentConfig::new("research").with_capabilities(["search"]),
        ],
        ..OrchestratorConfig::default()
    };
    let orchestrator = Orchestrator::new(
        config,
        mock_factory(Duration::ZERO, Arc::new(AtomicBool::new(true))),
    )
    .unwrap();
    orchestrator.start().await.unwrap();

    let task = Task::new("Simulate a molecule").with_capabilities(["quantum"]);
    let id = task.id;
    let result = orchestrator.submit(task).await;

    assert!(!result.success);
    assert!(matches!(result.error, Some(TaskError::NoSuitableAgent { .. })));
    assert!(result.agent_id.is_none());

    let tracked = orchestrator.task(id).await.unwrap();
    assert_eq!(tracked.status, TaskStatus::Failed);
    assert!(tracked.assigned_agent.is_none());
    for agent in orchestrator.agents().await {
        assert_eq!(agent.status, AgentStatus::Idle);
        assert_eq!(agent.metrics.tasks_completed + agent.metrics.tasks_failed, 0);
    }
    assert_eq!(orchestrator.metrics().rejected, 1);

    orchestrator.stop().await;
}

#[tokio::test]
async fn test_task_missing_required_context_is_invalid() {
    init_tracing();
    let config = OrchestratorConfig::from_toml_str(
        r#"
[task_types.email]
required_keys = ["recipient", "subject"]

[[agents]]
role = "email"
capabilities = ["email"]
"#,
    )
    .unwrap();
    let orchestrator = Orchestrator::new(
        config,
        mock_factory(Duration::ZERO, Arc::new(AtomicBool::new(true))),
    )
    .unwrap();
    orchestrator.start().await.unwrap();

    let task = Task::new("Email without an address")
        .with_type("email")
        .with_context("subject", json!("hello"));
    let result = orchestrator.submit(task).await;

    match result.error {
        Some(TaskError::InvalidTask { reason }) => assert!(reason.contains("recipient")),
        other => panic!("expected InvalidTask, got {other:?}"),
    }
    assert_eq!(orchestrator.metrics().rejected, 1);

    orchestrator.stop().await;
}

#[tokio::test]
async fn test_faulted_agent_task_is_redelivered_once() {
    init_tracing();
    let flaky_health = Arc::new(AtomicBool::new(true));
    let config = OrchestratorConfig {
        pool: PoolConfig {
            min_agents: 1,
            max_agents: 3,
            drain_grace_period_ms: 50,
        },
        agents: vec![AgentConfig::new("flaky").with_capabilities(["general"])],
        ..OrchestratorConfig::default()
    };
    let orchestrator = Orchestrator::new(
        config,
        mock_factory(Duration::from_millis(300), Arc::clone(&flaky_health)),
    )
    .unwrap();
    orchestrator.start().await.unwrap();
    let flaky = orchestrator.agents().await[0].id;

    let task = Task::new("Compile the incident timeline");
    let task_id = task.id;

    let (result, helper) = tokio::join!(orchestrator.submit(task), async {
        wait_for_status(&orchestrator, flaky, AgentStatus::Busy).await;
        let helper = orchestrator
            .add_agent(AgentConfig::new("helper").with_capabilities(["general"]))
            .await
            .unwrap();
        flaky_health.store(false, Ordering::SeqCst);
        orchestrator
            .enable_fault_tolerance(FaultToleranceConfig {
                health_check_interval_ms: 20,
                failure_threshold: 1,
                max_recovery_attempts: 0,
                ..FaultToleranceConfig::default()
            })
            .await
            .unwrap();
        helper
    });

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.agent_id, Some(helper));

    let tracked = orchestrator.task(task_id).await.unwrap();
    assert_eq!(tracked.redeliveries, 1);
    assert_eq!(tracked.status, TaskStatus::Completed);
    assert!(orchestrator.pool().get(flaky).await.is_none());

    let metrics = orchestrator.metrics();
    assert_eq!(metrics.redelivered, 1);
    assert_eq!(metrics.retirements, 1);
    assert_eq!(metrics.completed, 1);

    orchestrator.stop().await;
}

#[tokio::test]
async fn test_stop_cancels_running_task_after_grace() {
    init_tracing();
    let config = OrchestratorConfig {
        shutdown_timeout_ms: 100,
        agents: vec![AgentConfig::new("slow")],
        ..OrchestratorConfig::default()
    };
    let orchestrator = Orchestrator::new(
        config,
        mock_factory(Duration::from_secs(5), Arc::new(AtomicBool::new(true))),
    )
    .unwrap();
    orchestrator.start().await.unwrap();
    let slow = orchestrator.agents().await[0].id;

    let task = Task::new("Index the whole archive");
    let task_id = task.id;
    let (result, ()) = tokio::join!(orchestrator.submit(task), async {
        wait_for_status(&orchestrator, slow, AgentStatus::Busy).await;
        orchestrator.stop().await;
    });

    assert!(matches!(result.error, Some(TaskError::Cancelled { .. })));
    assert_eq!(
        orchestrator.task(task_id).await.unwrap().status,
        TaskStatus::Failed
    );
    assert!(!orchestrator.is_running());
    assert_eq!(orchestrator.pool().active_count().await, 0);

    let late = orchestrator.submit(Task::new("too late")).await;
    assert!(matches!(late.error, Some(TaskError::Cancelled { .. })));
}

#[tokio::test]
async fn test_scaling_replenishes_pool_to_minimum() {
    init_tracing();
    let config = OrchestratorConfig {
        agents: vec![AgentConfig::new("worker").with_capabilities(["general"])],
        ..OrchestratorConfig::default()
    };
    let orchestrator = Orchestrator::new(
        config,
        mock_factory(Duration::ZERO, Arc::new(AtomicBool::new(true))),
    )
    .unwrap();
    orchestrator.start().await.unwrap();
    assert_eq!(orchestrator.pool().active_count().await, 1);

    orchestrator
        .enable_scaling(ScalingConfig {
            min_agents: Some(3),
            max_agents: Some(5),
            check_interval_ms: 20,
            ..ScalingConfig::default()
        })
        .await
        .unwrap();

    for _ in 0..100 {
        if orchestrator.pool().active_count().await >= 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let agents = orchestrator.agents().await;
    assert_eq!(agents.len(), 3);
    assert!(agents.iter().all(|a| a.role == "worker"));
    assert!(orchestrator.metrics().scale_ups >= 2);

    let status = orchestrator.status_json().await;
    assert_eq!(status["running"], true);
    assert_eq!(status["pool"]["agents"], 3);

    orchestrator.stop().await;
}
