use crate::error::TaskError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Context key holding the task type.
pub const TYPE_KEY: &str = "type";
/// Context key holding the list of required capability tags.
pub const REQUIRED_CAPABILITIES_KEY: &str = "required_capabilities";

/// Scheduling priority. Ordered `Low < Medium < High < Critical`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    /// Background work.
    Low,
    /// Default priority.
    #[default]
    Medium,
    /// Served before medium and low work.
    High,
    /// Served first.
    Critical,
}

/// Status of a task in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Submitted, not yet assigned to an agent.
    Pending,
    /// Assigned to an agent and executing.
    InProgress,
    /// Finished successfully.
    Completed,
    /// Finished with an error (see the task result).
    Failed,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One executed plan step (a tool invocation) in a task's trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    /// Planning iteration that produced the step.
    pub iteration: u32,
    /// Tool that was invoked.
    pub tool: String,
    /// Arguments passed to the tool.
    pub arguments: serde_json::Value,
    /// Output of the final attempt.
    pub output: String,
    /// Whether the final attempt failed.
    pub is_error: bool,
    /// Number of attempts made (1 when no retry happened).
    pub attempts: u32,
    /// Wall-clock time spent on the step, retries included.
    pub duration_ms: u64,
}

/// Outcome of executing a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: Uuid,
    /// Agent that produced the result; `None` when the task was never assigned.
    pub agent_id: Option<Uuid>,
    pub success: bool,
    /// Opaque output, typically the summary produced by the agent.
    pub output: serde_json::Value,
    pub error: Option<TaskError>,
    pub execution_time_ms: u64,
    #[serde(default)]
    pub steps: Vec<StepRecord>,
    pub completed_at: DateTime<Utc>,
}

impl TaskResult {
    /// A successful result.
    pub fn success(
        task_id: Uuid,
        agent_id: Uuid,
        output: serde_json::Value,
        execution_time_ms: u64,
        steps: Vec<StepRecord>,
    ) -> Self {
        Self {
            task_id,
            agent_id: Some(agent_id),
            success: true,
            output,
            error: None,
            execution_time_ms,
            steps,
            completed_at: Utc::now(),
        }
    }

    /// A failed result carrying a typed error.
    pub fn failure(task_id: Uuid, agent_id: Option<Uuid>, error: TaskError) -> Self {
        Self {
            task_id,
            agent_id,
            success: false,
            output: serde_json::Value::Null,
            error: Some(error),
            execution_time_ms: 0,
            steps: Vec::new(),
            completed_at: Utc::now(),
        }
    }

    /// Attach timing to a failure.
    pub fn with_execution_time(mut self, ms: u64) -> Self {
        self.execution_time_ms = ms;
        self
    }

    /// Attach the step trace collected before the failure.
    pub fn with_steps(mut self, steps: Vec<StepRecord>) -> Self {
        self.steps = steps;
        self
    }
}

/// A unit of work submitted to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub description: String,
    #[serde(default)]
    pub priority: TaskPriority,
    /// Open key-value context. `type` and `required_capabilities` are reserved.
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
    pub status: TaskStatus,
    pub assigned_agent: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<TaskResult>,
    /// How many times the task went back to `Pending` after an agent fault.
    #[serde(default)]
    pub redeliveries: u32,
}

impl Task {
    /// Maximum number of agent-fault redeliveries.
    pub const MAX_REDELIVERIES: u32 = 1;

    pub fn new(description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            description: description.into(),
            priority: TaskPriority::default(),
            context: HashMap::new(),
            status: TaskStatus::Pending,
            assigned_agent: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            redeliveries: 0,
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the reserved `type` context key.
    pub fn with_type(mut self, task_type: impl Into<String>) -> Self {
        self.context
            .insert(TYPE_KEY.to_string(), serde_json::Value::String(task_type.into()));
        self
    }

    /// Set the reserved `required_capabilities` context key.
    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let caps: Vec<serde_json::Value> = capabilities
            .into_iter()
            .map(|c| serde_json::Value::String(c.into()))
            .collect();
        self.context.insert(
            REQUIRED_CAPABILITIES_KEY.to_string(),
            serde_json::Value::Array(caps),
        );
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Task type from the reserved `type` key, if it is a string.
    pub fn task_type(&self) -> Option<&str> {
        self.context.get(TYPE_KEY).and_then(|v| v.as_str())
    }

    /// Required capability tags. Non-string entries are ignored.
    pub fn required_capabilities(&self) -> Vec<String> {
        self.context
            .get(REQUIRED_CAPABILITIES_KEY)
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|c| c.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// `Pending -> InProgress`, on actual assignment only.
    pub fn start(&mut self, agent_id: Uuid) -> Result<(), TaskError> {
        self.expect_status(TaskStatus::Pending, TaskStatus::InProgress)?;
        self.status = TaskStatus::InProgress;
        self.assigned_agent = Some(agent_id);
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// `InProgress -> Completed | Failed`, depending on the result.
    pub fn finish(&mut self, result: TaskResult) -> Result<(), TaskError> {
        let target = if result.success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        self.expect_status(TaskStatus::InProgress, target)?;
        self.status = target;
        self.completed_at = Some(result.completed_at);
        self.result = Some(result);
        Ok(())
    }

    /// `Pending -> Failed` for a task rejected before assignment.
    pub fn reject(&mut self, error: TaskError) -> Result<(), TaskError> {
        self.expect_status(TaskStatus::Pending, TaskStatus::Failed)?;
        let result = TaskResult::failure(self.id, None, error);
        self.status = TaskStatus::Failed;
        self.completed_at = Some(result.completed_at);
        self.result = Some(result);
        Ok(())
    }

    /// Whether a failed task may go back to `Pending` for redelivery.
    pub fn can_requeue(&self) -> bool {
        self.status == TaskStatus::Failed
            && self.redeliveries < Self::MAX_REDELIVERIES
            && self
                .result
                .as_ref()
                .and_then(|r| r.error.as_ref())
                .is_some_and(TaskError::is_agent_fault)
    }

    /// `Failed -> Pending`, once, after an agent fault.
    pub fn requeue(&mut self) -> Result<(), TaskError> {
        if !self.can_requeue() {
            return Err(self.invalid(TaskStatus::Pending));
        }
        self.status = TaskStatus::Pending;
        self.redeliveries += 1;
        self.assigned_agent = None;
        self.started_at = None;
        self.completed_at = None;
        self.result = None;
        Ok(())
    }

    /// Completed, or failed without a remaining redelivery.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            TaskStatus::Completed => true,
            TaskStatus::Failed => !self.can_requeue(),
            TaskStatus::Pending | TaskStatus::InProgress => false,
        }
    }

    fn expect_status(&self, from: TaskStatus, to: TaskStatus) -> Result<(), TaskError> {
        if self.status == from {
            Ok(())
        } else {
            Err(self.invalid(to))
        }
    }

    fn invalid(&self, to: TaskStatus) -> TaskError {
        TaskError::InvalidTransition {
            from: self.status.to_string(),
            to: to.to_string(),
        }
    }
}
