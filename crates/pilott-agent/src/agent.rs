use crate::config::AgentConfig;
use crate::context::ContextWindow;
use crate::llm::{LlmBackend, LlmResponse};
use crate::load::LoadTracker;
use crate::prompt;
use crate::retry::RetryingBackend;
use crate::suitability::{self, Suitability};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use pilott_core::{Message, StepRecord, Task, TaskError, TaskResult, ToolCall};
use pilott_memory::{MemoryStore, SearchResult};
use pilott_skills::SkillRegistry;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bound on any single memory call made by an agent.
const MEMORY_TIMEOUT: Duration = Duration::from_secs(5);
/// Knowledge entries recalled into a task prompt.
const KNOWLEDGE_LIMIT: usize = 3;
/// Past outcomes considered when scoring history.
const HISTORY_LIMIT: usize = 20;

/// Externally visible agent status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Idle,
    /// Holding a task. An agent is `Busy` exactly when it has a current task.
    Busy,
    Error,
    Stopped,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Idle => write!(f, "idle"),
            AgentStatus::Busy => write!(f, "busy"),
            AgentStatus::Error => write!(f, "error"),
            AgentStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// Counters accumulated over an agent's lifetime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub total_execution_ms: u64,
}

impl AgentMetrics {
    pub fn average_execution_ms(&self) -> f64 {
        let total = self.tasks_completed + self.tasks_failed;
        if total == 0 {
            0.0
        } else {
            self.total_execution_ms as f64 / total as f64
        }
    }
}

/// The task an agent is currently executing, as seen from outside.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentTask {
    pub task_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub redeliveries: u32,
}

/// Point-in-time view of an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub id: Uuid,
    pub role: String,
    pub capabilities: Vec<String>,
    pub status: AgentStatus,
    /// Busy fraction over the agent's load window.
    pub load: f64,
    pub draining: bool,
    pub current: Option<CurrentTask>,
    pub last_used: DateTime<Utc>,
    pub heartbeat_age_ms: u64,
    pub consecutive_failures: u32,
    pub recovery_attempts: u32,
    pub metrics: AgentMetrics,
}

struct Assignment {
    task_id: Uuid,
    redeliveries: u32,
    started: Instant,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
    reason: Option<TaskError>,
}

impl Assignment {
    fn cancel_with(&mut self, reason: TaskError) {
        if self.reason.is_none() {
            self.reason = Some(reason);
        }
        self.cancel.cancel();
    }
}

struct AgentState {
    current: Option<Assignment>,
    stopped: bool,
    faulted: bool,
    draining: bool,
    load: LoadTracker,
    last_used: DateTime<Utc>,
    last_heartbeat: Instant,
    consecutive_failures: u32,
    recovery_attempts: u32,
    metrics: AgentMetrics,
}

impl AgentState {
    fn status(&self) -> AgentStatus {
        if self.current.is_some() {
            AgentStatus::Busy
        } else if self.stopped {
            AgentStatus::Stopped
        } else if self.faulted {
            AgentStatus::Error
        } else {
            AgentStatus::Idle
        }
    }
}

/// A worker that executes one task at a time.
///
/// All mutable state sits behind a single `parking_lot::Mutex` that is never
/// held across an await point. Status changes are published on a watch
/// channel so callers can wait for the agent to become idle.
pub struct Agent {
    id: Uuid,
    config: AgentConfig,
    backend: Arc<dyn LlmBackend>,
    skills: Arc<SkillRegistry>,
    memory: Option<Arc<dyn MemoryStore>>,
    state: Mutex<AgentState>,
    status_tx: watch::Sender<AgentStatus>,
}

impl Agent {
    /// Create a stopped agent. Call [`Agent::start`] before assigning work.
    pub fn new(
        config: AgentConfig,
        backend: Arc<dyn LlmBackend>,
        skills: Arc<SkillRegistry>,
        memory: Option<Arc<dyn MemoryStore>>,
    ) -> Self {
        let backend: Arc<dyn LlmBackend> = match &config.retry_policy {
            Some(policy) => Arc::new(RetryingBackend::new(backend, policy.clone())),
            None => backend,
        };
        let (status_tx, _) = watch::channel(AgentStatus::Stopped);
        let state = AgentState {
            current: None,
            stopped: true,
            faulted: false,
            draining: false,
            load: LoadTracker::new(config.load_window()),
            last_used: Utc::now(),
            last_heartbeat: Instant::now(),
            consecutive_failures: 0,
            recovery_attempts: 0,
            metrics: AgentMetrics::default(),
        };
        Self {
            id: Uuid::new_v4(),
            config,
            backend,
            skills,
            memory,
            state: Mutex::new(state),
            status_tx,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn role(&self) -> &str {
        &self.config.role
    }

    pub fn status(&self) -> AgentStatus {
        self.state.lock().status()
    }

    /// Receiver that observes every status change.
    pub fn subscribe_status(&self) -> watch::Receiver<AgentStatus> {
        self.status_tx.subscribe()
    }

    pub fn current_task(&self) -> Option<Uuid> {
        self.state.lock().current.as_ref().map(|a| a.task_id)
    }

    pub fn is_draining(&self) -> bool {
        self.state.lock().draining
    }

    pub fn load(&self) -> f64 {
        self.state.lock().load.busy_fraction(Instant::now())
    }

    pub fn last_used(&self) -> DateTime<Utc> {
        self.state.lock().last_used
    }

    pub fn metrics(&self) -> AgentMetrics {
        self.state.lock().metrics.clone()
    }

    pub fn snapshot(&self) -> AgentSnapshot {
        let now = Instant::now();
        let s = self.state.lock();
        AgentSnapshot {
            id: self.id,
            role: self.config.role.clone(),
            capabilities: self.config.capabilities.clone(),
            status: s.status(),
            load: s.load.busy_fraction(now),
            draining: s.draining,
            current: s.current.as_ref().map(|a| CurrentTask {
                task_id: a.task_id,
                started_at: a.started_at,
                elapsed_ms: now.saturating_duration_since(a.started).as_millis() as u64,
                redeliveries: a.redeliveries,
            }),
            last_used: s.last_used,
            heartbeat_age_ms: now.saturating_duration_since(s.last_heartbeat).as_millis() as u64,
            consecutive_failures: s.consecutive_failures,
            recovery_attempts: s.recovery_attempts,
            metrics: s.metrics.clone(),
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Make the agent available for work. Idempotent.
    pub fn start(&self) {
        let mut s = self.state.lock();
        if s.stopped || s.faulted {
            s.stopped = false;
            s.faulted = false;
            s.last_heartbeat = Instant::now();
            info!(agent_id = %self.id, role = %self.config.role, "Agent started");
        }
        self.publish(&s);
    }

    /// Stop the agent; an in-flight task fails with `Cancelled`. Idempotent.
    pub fn stop(&self) {
        self.stop_with(TaskError::cancelled("agent stopped"));
    }

    /// Stop the agent, failing any in-flight task with `reason`.
    pub fn stop_with(&self, reason: TaskError) {
        let mut s = self.state.lock();
        if !s.stopped {
            info!(agent_id = %self.id, reason = %reason, "Agent stopping");
        }
        s.stopped = true;
        if let Some(assignment) = s.current.as_mut() {
            assignment.cancel_with(reason);
        }
        self.publish(&s);
    }

    /// Stop and start again, counting a recovery attempt.
    ///
    /// An in-flight task fails with `AgentUnavailable` and is eligible for
    /// redelivery. Returns the number of recovery attempts so far.
    pub fn restart(&self) -> u32 {
        let mut s = self.state.lock();
        s.recovery_attempts += 1;
        if let Some(assignment) = s.current.as_mut() {
            assignment.cancel_with(TaskError::AgentUnavailable {
                agent_id: self.id,
                reason: "agent restarted".into(),
            });
        }
        s.stopped = false;
        s.faulted = false;
        s.last_heartbeat = Instant::now();
        info!(agent_id = %self.id, attempt = s.recovery_attempts, "Agent restarted");
        self.publish(&s);
        s.recovery_attempts
    }

    /// Put the agent into the `Error` state. An in-flight task fails with
    /// `AgentUnavailable`; the status reads `Error` once it is released.
    pub fn mark_error(&self) {
        let mut s = self.state.lock();
        s.faulted = true;
        if let Some(assignment) = s.current.as_mut() {
            assignment.cancel_with(TaskError::AgentUnavailable {
                agent_id: self.id,
                reason: "agent entered error state".into(),
            });
        }
        warn!(agent_id = %self.id, "Agent marked as error");
        self.publish(&s);
    }

    /// Refuse new assignments; the current task keeps running.
    pub fn begin_drain(&self) {
        let mut s = self.state.lock();
        s.draining = true;
        self.publish(&s);
    }

    /// Stop the agent if, and only if, it holds no task.
    pub fn stop_if_idle(&self) -> bool {
        let mut s = self.state.lock();
        if s.current.is_some() {
            return false;
        }
        s.draining = true;
        s.stopped = true;
        info!(agent_id = %self.id, "Idle agent stopped");
        self.publish(&s);
        true
    }

    /// Fail the current task with `reason` if it is `task_id`.
    pub fn abort_current(&self, task_id: Uuid, reason: TaskError) -> bool {
        let mut s = self.state.lock();
        match s.current.as_mut() {
            Some(assignment) if assignment.task_id == task_id => {
                info!(agent_id = %self.id, task_id = %task_id, reason = %reason, "Aborting current task");
                assignment.cancel_with(reason);
                true
            }
            _ => false,
        }
    }

    /// Wait until the agent holds no task, up to `grace`.
    pub async fn wait_until_idle(&self, grace: Duration) -> bool {
        let mut rx = self.status_tx.subscribe();
        let waited = tokio::time::timeout(grace, rx.wait_for(|s| *s != AgentStatus::Busy)).await;
        matches!(waited, Ok(Ok(_)))
    }

    // -----------------------------------------------------------------------
    // Health
    // -----------------------------------------------------------------------

    /// Liveness check: a bounded backend round trip, plus heartbeat
    /// staleness while busy.
    pub async fn health_check(&self, timeout: Duration, stale_after: Duration) -> Result<(), String> {
        let stale = {
            let s = self.state.lock();
            s.current.is_some() && s.last_heartbeat.elapsed() > stale_after
        };
        if stale {
            return Err(format!(
                "no heartbeat for more than {}ms while busy",
                stale_after.as_millis()
            ));
        }

        match tokio::time::timeout(timeout, self.backend.health_check()).await {
            Ok(Ok(())) => {
                let mut s = self.state.lock();
                if s.current.is_none() {
                    s.last_heartbeat = Instant::now();
                }
                Ok(())
            }
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("health check timed out after {}ms", timeout.as_millis())),
        }
    }

    /// Count a failed check and return the consecutive failure count.
    pub fn record_check_failure(&self) -> u32 {
        let mut s = self.state.lock();
        s.consecutive_failures += 1;
        s.consecutive_failures
    }

    /// A healthy check clears the failure and recovery counters.
    pub fn record_check_success(&self) {
        let mut s = self.state.lock();
        s.consecutive_failures = 0;
        s.recovery_attempts = 0;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().consecutive_failures
    }

    pub fn recovery_attempts(&self) -> u32 {
        self.state.lock().recovery_attempts
    }

    fn beat(&self) {
        self.state.lock().last_heartbeat = Instant::now();
    }

    /// Await `work`, beating every `heartbeat_interval` until it resolves.
    async fn beating<F: std::future::Future>(&self, work: F) -> F::Output {
        tokio::pin!(work);
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                output = &mut work => return output,
                _ = ticker.tick() => self.beat(),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Work
    // -----------------------------------------------------------------------

    /// How well this agent fits `task`, using memory for history.
    pub async fn evaluate_suitability(&self, task: &Task) -> Suitability {
        let history = match self.memory() {
            Some(memory) => {
                let lookup = memory.similar_outcomes(self.id, &task.description, HISTORY_LIMIT);
                match tokio::time::timeout(MEMORY_TIMEOUT, lookup).await {
                    Ok(Ok(outcomes)) => suitability::history_from(&outcomes),
                    Ok(Err(e)) => {
                        debug!(agent_id = %self.id, error = %e, "History lookup failed");
                        None
                    }
                    Err(_) => {
                        debug!(agent_id = %self.id, "History lookup timed out");
                        None
                    }
                }
            }
            None => None,
        };
        Suitability::assess(task, &self.config, history)
    }

    /// Claim the agent for `task`.
    ///
    /// Fails with `AgentUnavailable` when stopped, faulted or draining and
    /// with `AgentBusy` when another task is in flight.
    pub fn try_assign(self: &Arc<Self>, task: &Task) -> Result<AssignedTask, TaskError> {
        let mut s = self.state.lock();
        let unavailable = if s.stopped {
            Some("stopped")
        } else if s.faulted {
            Some("in error state")
        } else if s.draining {
            Some("draining")
        } else {
            None
        };
        if let Some(reason) = unavailable {
            return Err(TaskError::AgentUnavailable {
                agent_id: self.id,
                reason: reason.into(),
            });
        }
        if s.current.is_some() {
            return Err(TaskError::AgentBusy { agent_id: self.id });
        }

        let now = Instant::now();
        let cancel = CancellationToken::new();
        s.current = Some(Assignment {
            task_id: task.id,
            redeliveries: task.redeliveries,
            started: now,
            started_at: Utc::now(),
            cancel: cancel.clone(),
            reason: None,
        });
        s.load.mark_busy(now);
        s.last_heartbeat = now;
        self.publish(&s);
        debug!(agent_id = %self.id, task_id = %task.id, "Task assigned");

        Ok(AssignedTask {
            agent: Arc::clone(self),
            task_id: task.id,
            cancel,
        })
    }

    /// Assign and run `task` in one call. A rejected assignment yields a
    /// failed result and leaves the task `Pending`.
    pub async fn execute(self: &Arc<Self>, task: &mut Task) -> TaskResult {
        match self.try_assign(task) {
            Ok(assigned) => assigned.run(task).await,
            Err(e) => TaskResult::failure(task.id, Some(self.id), e),
        }
    }

    fn memory(&self) -> Option<&Arc<dyn MemoryStore>> {
        if self.config.memory_enabled {
            self.memory.as_ref()
        } else {
            None
        }
    }

    fn publish(&self, s: &AgentState) {
        self.status_tx.send_replace(s.status());
    }

    fn cancel_reason(&self, task_id: Uuid) -> TaskError {
        let s = self.state.lock();
        s.current
            .as_ref()
            .filter(|a| a.task_id == task_id)
            .and_then(|a| a.reason.clone())
            .unwrap_or_else(|| TaskError::cancelled("agent stopped"))
    }

    fn release(&self, task_id: Uuid) {
        let mut s = self.state.lock();
        if s.current.as_ref().is_some_and(|a| a.task_id == task_id) {
            s.current = None;
            s.load.mark_idle(Instant::now());
            s.last_used = Utc::now();
        }
        self.publish(&s);
    }

    fn record_outcome(&self, result: &TaskResult) {
        let mut s = self.state.lock();
        if result.success {
            s.metrics.tasks_completed += 1;
        } else {
            s.metrics.tasks_failed += 1;
        }
        s.metrics.total_execution_ms += result.execution_time_ms;
    }

    async fn recall(&self, task: &Task) -> Vec<SearchResult> {
        let Some(memory) = self.memory() else {
            return Vec::new();
        };
        match tokio::time::timeout(
            MEMORY_TIMEOUT,
            memory.search(&task.description, &[], KNOWLEDGE_LIMIT),
        )
        .await
        {
            Ok(Ok(found)) => found,
            Ok(Err(e)) => {
                warn!(agent_id = %self.id, task_id = %task.id, error = %e, "Knowledge recall failed");
                Vec::new()
            }
            Err(_) => {
                warn!(agent_id = %self.id, task_id = %task.id, "Knowledge recall timed out");
                Vec::new()
            }
        }
    }

    async fn remember_start(&self, task: &Task) {
        let Some(memory) = self.memory() else {
            return;
        };
        match tokio::time::timeout(MEMORY_TIMEOUT, memory.store_task_start(task, self.id)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(agent_id = %self.id, task_id = %task.id, error = %e, "Failed to store task start");
            }
            Err(_) => warn!(agent_id = %self.id, task_id = %task.id, "Storing task start timed out"),
        }
    }

    async fn remember_result(&self, task: &Task, result: &TaskResult) {
        let Some(memory) = self.memory() else {
            return;
        };
        match tokio::time::timeout(MEMORY_TIMEOUT, memory.store_task_result(task, result)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(agent_id = %self.id, task_id = %task.id, error = %e, "Failed to store task result");
            }
            Err(_) => warn!(agent_id = %self.id, task_id = %task.id, "Storing task result timed out"),
        }
    }

    /// Plan/act loop followed by a summary request.
    async fn run_pipeline(
        &self,
        task: &Task,
        steps: &mut Vec<StepRecord>,
    ) -> Result<serde_json::Value, TaskError> {
        self.remember_start(task).await;
        let knowledge = self.recall(task).await;

        let mut ctx = ContextWindow::new(self.config.context_window);
        ctx.set_system_prompt(prompt::system_prompt(&self.config));
        ctx.pin(Message::user(prompt::task_prompt(task, &knowledge), task.id));
        let tools = self.skills.list_descriptors();

        let mut answer: Option<String> = None;
        for iteration in 1..=self.config.max_iterations {
            self.beat();
            debug!(agent_id = %self.id, task_id = %task.id, iteration, "Planning iteration");

            let response = match self
                .beating(self.backend.chat(ctx.system_prompt(), ctx.messages(), &tools))
                .await
            {
                Ok(response) => response,
                Err(e) if e.is_retryable() => {
                    warn!(agent_id = %self.id, task_id = %task.id, iteration, error = %e, "Transient backend failure");
                    continue;
                }
                Err(e) => {
                    return Err(TaskError::Capability {
                        message: e.to_string(),
                    })
                }
            };

            match response {
                LlmResponse::Done(text) => {
                    ctx.push(Message::assistant(&text, task.id));
                    answer = Some(text);
                    break;
                }
                LlmResponse::Text(text) => {
                    warn!(agent_id = %self.id, task_id = %task.id, iteration, "Unstructured reply during planning");
                    ctx.push(Message::assistant(text, task.id));
                    ctx.push(Message::user(prompt::FORMAT_CORRECTION, task.id));
                }
                LlmResponse::ToolUse {
                    content,
                    tool_calls,
                } => {
                    if tool_calls.is_empty() {
                        warn!(agent_id = %self.id, task_id = %task.id, iteration, "Tool use reply without tool calls");
                        ctx.push(Message::user(prompt::FORMAT_CORRECTION, task.id));
                        continue;
                    }
                    ctx.push(Message::step_request(
                        content.unwrap_or_default(),
                        tool_calls.clone(),
                        task.id,
                    ));
                    for call in tool_calls {
                        self.run_step(task.id, iteration, call, &mut ctx, steps)
                            .await?;
                    }
                }
            }
        }

        let Some(answer) = answer else {
            warn!(agent_id = %self.id, task_id = %task.id, limit = self.config.max_iterations, "Iteration limit reached");
            return Err(TaskError::IterationLimitExceeded {
                limit: self.config.max_iterations,
            });
        };

        self.beat();
        ctx.push(Message::user(prompt::summary_prompt(steps), task.id));
        let summary = match self
            .beating(self.backend.chat(ctx.system_prompt(), ctx.messages(), &[]))
            .await
        {
            Ok(LlmResponse::Done(text)) | Ok(LlmResponse::Text(text)) => text,
            Ok(LlmResponse::ToolUse { content, .. }) => content.unwrap_or_else(|| answer.clone()),
            Err(e) => {
                warn!(agent_id = %self.id, task_id = %task.id, error = %e, "Summary request failed");
                answer.clone()
            }
        };

        Ok(json!({ "answer": answer, "summary": summary }))
    }

    /// Execute one tool call, retrying idempotent tools.
    async fn run_step(
        &self,
        task_id: Uuid,
        iteration: u32,
        call: ToolCall,
        ctx: &mut ContextWindow,
        steps: &mut Vec<StepRecord>,
    ) -> Result<(), TaskError> {
        let max_attempts = if self.skills.is_idempotent(&call.name) {
            self.config.step_retry_limit + 1
        } else {
            1
        };
        let started = Instant::now();
        let mut attempts = 0;

        let (output, is_error) = loop {
            attempts += 1;
            self.beat();
            info!(agent_id = %self.id, task_id = %task_id, tool = %call.name, attempt = attempts, "Executing step");

            let outcome = match self.beating(self.skills.execute(call.clone())).await {
                Ok(result) => result.into_outcome(),
                Err(e) => Err(e.to_string()),
            };
            match outcome {
                Ok(output) => break (output, false),
                Err(message) if attempts < max_attempts => {
                    warn!(agent_id = %self.id, task_id = %task_id, tool = %call.name, attempt = attempts, error = %message, "Step failed, retrying");
                }
                Err(message) => break (message, true),
            }
        };

        steps.push(StepRecord {
            iteration,
            tool: call.name.clone(),
            arguments: call.arguments.clone(),
            output: output.clone(),
            is_error,
            attempts,
            duration_ms: started.elapsed().as_millis() as u64,
        });

        if is_error {
            warn!(agent_id = %self.id, task_id = %task_id, tool = %call.name, attempts, "Step failed");
            return Err(TaskError::ToolExecution {
                tool: call.name,
                message: output,
            });
        }

        ctx.push(Message::step_output(&call, output, task_id));
        Ok(())
    }
}

/// An agent claimed for one task. Dropping it releases the agent.
pub struct AssignedTask {
    agent: Arc<Agent>,
    task_id: Uuid,
    cancel: CancellationToken,
}

impl AssignedTask {
    pub fn agent_id(&self) -> Uuid {
        self.agent.id
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    /// Execute the task, bounded by the agent's timeout and cancellation.
    ///
    /// Moves the task to `InProgress`, then to `Completed` or `Failed`, and
    /// always returns a result.
    pub async fn run(self, task: &mut Task) -> TaskResult {
        let agent = Arc::clone(&self.agent);
        if task.id != self.task_id {
            return TaskResult::failure(
                task.id,
                Some(agent.id),
                TaskError::InvalidTask {
                    reason: "task does not match the assignment".into(),
                },
            );
        }
        if let Err(e) = task.start(agent.id) {
            return TaskResult::failure(task.id, Some(agent.id), e);
        }
        info!(agent_id = %agent.id, task_id = %task.id, priority = ?task.priority, "Executing task");

        let started = Instant::now();
        let timeout = agent.config.execution_timeout();
        let mut steps = Vec::new();
        let outcome = {
            let snapshot: &Task = task;
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(agent.cancel_reason(self.task_id)),
                run = tokio::time::timeout(timeout, agent.run_pipeline(snapshot, &mut steps)) => {
                    run.unwrap_or_else(|_| Err(TaskError::timeout("task execution", timeout)))
                }
            }
        };
        let elapsed = started.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok(output) => TaskResult::success(task.id, agent.id, output, elapsed, steps),
            Err(e) => TaskResult::failure(task.id, Some(agent.id), e)
                .with_execution_time(elapsed)
                .with_steps(steps),
        };
        match &result.error {
            None => info!(agent_id = %agent.id, task_id = %task.id, elapsed_ms = elapsed, "Task completed"),
            Some(e) => warn!(agent_id = %agent.id, task_id = %task.id, elapsed_ms = elapsed, error = %e, "Task failed"),
        }

        agent.record_outcome(&result);
        if let Err(e) = task.finish(result.clone()) {
            warn!(task_id = %task.id, error = %e, "Could not record task result");
        }
        agent.remember_result(task, &result).await;
        result
    }
}

impl Drop for AssignedTask {
    fn drop(&mut self) {
        self.agent.release(self.task_id);
    }
}
