use crate::retry::RetryPolicy;
use pilott_core::{PilottError, PilottResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration of a single agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Role name, matched against the task `type`.
    pub role: String,
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub backstory: Option<String>,
    /// Capability tags matched against a task's `required_capabilities`.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Additional task types this agent handles besides its role.
    #[serde(default)]
    pub task_types: Vec<String>,
    /// Upper bound on planning iterations per task.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Wall-clock bound on a whole task execution.
    #[serde(default = "default_execution_timeout_ms")]
    pub execution_timeout_ms: u64,
    /// Retries of a failed idempotent tool step.
    #[serde(default = "default_step_retry_limit")]
    pub step_retry_limit: u32,
    #[serde(default = "default_true")]
    pub memory_enabled: bool,
    /// Maximum messages kept in the LLM context, the task statement excluded.
    #[serde(default = "default_context_window")]
    pub context_window: usize,
    /// Trailing window for the busy-fraction load metric.
    #[serde(default = "default_load_window_ms")]
    pub load_window_ms: u64,
    /// Heartbeat period while a task waits on the backend or a tool.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// When set, the backend is wrapped in a `RetryingBackend`.
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
}

fn default_max_iterations() -> u32 {
    20
}

fn default_execution_timeout_ms() -> u64 {
    300_000
}

fn default_step_retry_limit() -> u32 {
    2
}

fn default_true() -> bool {
    true
}

fn default_context_window() -> usize {
    50
}

fn default_load_window_ms() -> u64 {
    60_000
}

fn default_heartbeat_interval_ms() -> u64 {
    5_000
}

impl AgentConfig {
    pub fn new(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            goal: String::new(),
            backstory: None,
            capabilities: Vec::new(),
            task_types: Vec::new(),
            max_iterations: default_max_iterations(),
            execution_timeout_ms: default_execution_timeout_ms(),
            step_retry_limit: default_step_retry_limit(),
            memory_enabled: true,
            context_window: default_context_window(),
            load_window_ms: default_load_window_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            retry_policy: None,
        }
    }

    pub fn with_goal(mut self, goal: impl Into<String>) -> Self {
        self.goal = goal.into();
        self
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_task_types<I, S>(mut self, task_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.task_types = task_types.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_step_retry_limit(mut self, limit: u32) -> Self {
        self.step_retry_limit = limit;
        self
    }

    pub fn with_memory(mut self, enabled: bool) -> Self {
        self.memory_enabled = enabled;
        self
    }

    pub fn with_load_window(mut self, window: Duration) -> Self {
        self.load_window_ms = window.as_millis() as u64;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }

    pub fn load_window(&self) -> Duration {
        Duration::from_millis(self.load_window_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    /// Whether this agent's role or declared task types cover `task_type`.
    pub fn handles_type(&self, task_type: &str) -> bool {
        self.role.eq_ignore_ascii_case(task_type)
            || self
                .task_types
                .iter()
                .any(|t| t.eq_ignore_ascii_case(task_type))
    }

    pub fn validate(&self) -> PilottResult<()> {
        if self.role.trim().is_empty() {
            return Err(PilottError::Config("agent role must not be empty".into()));
        }
        if self.max_iterations == 0 {
            return Err(PilottError::Config(format!(
                "agent '{}': max_iterations must be at least 1",
                self.role
            )));
        }
        if self.execution_timeout_ms == 0 {
            return Err(PilottError::Config(format!(
                "agent '{}': execution_timeout_ms must be positive",
                self.role
            )));
        }
        if self.load_window_ms == 0 {
            return Err(PilottError::Config(format!(
                "agent '{}': load_window_ms must be positive",
                self.role
            )));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(PilottError::Config(format!(
                "agent '{}': heartbeat_interval_ms must be positive",
                self.role
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_toml() {
        let config: AgentConfig = toml::from_str(
            r#"
            role = "researcher"
            capabilities = ["search", "summarize"]
            "#,
        )
        .unwrap();
        assert_eq!(config.max_iterations, 20);
        assert_eq!(config.step_retry_limit, 2);
        assert_eq!(config.execution_timeout(), Duration::from_secs(300));
        assert!(config.memory_enabled);
        assert!(config.retry_policy.is_none());
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(5));
        assert_eq!(config.capabilities, vec!["search", "summarize"]);
    }

    #[test]
    fn test_retry_policy_section() {
        let config: AgentConfig = toml::from_str(
            r#"
            role = "mailer"
            [retry_policy]
            max_retries = 5
            "#,
        )
        .unwrap();
        let policy = config.retry_policy.unwrap();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.backoff_base_ms, 500);
    }

    #[test]
    fn test_handles_type() {
        let config = AgentConfig::new("Email").with_task_types(["notification"]);
        assert!(config.handles_type("email"));
        assert!(config.handles_type("Notification"));
        assert!(!config.handles_type("search"));
    }

    #[test]
    fn test_validate() {
        assert!(AgentConfig::new("worker").validate().is_ok());
        assert!(AgentConfig::new(" ").validate().is_err());
        assert!(AgentConfig::new("worker")
            .with_max_iterations(0)
            .validate()
            .is_err());
        assert!(AgentConfig::new("worker")
            .with_heartbeat_interval(Duration::ZERO)
            .validate()
            .is_err());
    }
}
