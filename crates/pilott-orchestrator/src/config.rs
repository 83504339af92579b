use crate::balancer::LoadBalancingConfig;
use crate::fault::FaultToleranceConfig;
use crate::pool::PoolConfig;
use crate::router::RouterConfig;
use crate::scaler::ScalingConfig;
use crate::validation::TaskTypeRule;
use pilott_agent::AgentConfig;
use pilott_core::{PilottError, PilottResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Orchestrator configuration, usually loaded from TOML.
///
/// ```toml
/// name = "support-desk"
/// max_concurrent_tasks = 8
///
/// [pool]
/// min_agents = 1
/// max_agents = 6
///
/// [scaling]
/// scale_up_threshold = 0.75
///
/// [task_types.email]
/// required_keys = ["recipient"]
///
/// [[agents]]
/// role = "email"
/// capabilities = ["email", "smtp"]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_name")]
    pub name: String,
    /// Tasks admitted at once; further submissions wait for a slot.
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// How long a submission may wait for an admission slot.
    #[serde(default = "default_admission_timeout_ms")]
    pub admission_timeout_ms: u64,
    /// How long an admitted task may wait for an agent.
    #[serde(default = "default_dispatch_timeout_ms")]
    pub dispatch_timeout_ms: u64,
    /// Grace period for in-flight tasks when the orchestrator stops.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    /// Finished tasks are forgotten after this long.
    #[serde(default = "default_task_retention_secs")]
    pub task_retention_secs: u64,
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,

    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub router: RouterConfig,
    /// Present to enable dynamic scaling at start.
    #[serde(default)]
    pub scaling: Option<ScalingConfig>,
    /// Present to enable load balancing at start.
    #[serde(default)]
    pub load_balancing: Option<LoadBalancingConfig>,
    /// Present to enable health checks at start.
    #[serde(default)]
    pub fault_tolerance: Option<FaultToleranceConfig>,

    #[serde(default)]
    pub task_types: HashMap<String, TaskTypeRule>,
    /// Agents created when the orchestrator starts.
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
}

fn default_name() -> String {
    "pilott".to_string()
}

fn default_max_concurrent_tasks() -> usize {
    5
}

fn default_admission_timeout_ms() -> u64 {
    30_000
}

fn default_dispatch_timeout_ms() -> u64 {
    60_000
}

fn default_shutdown_timeout_ms() -> u64 {
    30_000
}

fn default_task_retention_secs() -> u64 {
    3_600
}

fn default_cleanup_interval_ms() -> u64 {
    60_000
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            admission_timeout_ms: default_admission_timeout_ms(),
            dispatch_timeout_ms: default_dispatch_timeout_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            task_retention_secs: default_task_retention_secs(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
            pool: PoolConfig::default(),
            router: RouterConfig::default(),
            scaling: None,
            load_balancing: None,
            fault_tolerance: None,
            task_types: HashMap::new(),
            agents: Vec::new(),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_toml_str(s: &str) -> PilottResult<Self> {
        let config: Self = toml::from_str(s)
            .map_err(|e| PilottError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> PilottResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            PilottError::Config(format!("Failed to read config {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> PilottResult<()> {
        if self.max_concurrent_tasks == 0 {
            return Err(PilottError::Config(
                "max_concurrent_tasks must be at least 1".into(),
            ));
        }
        self.pool.validate()?;
        self.router.validate()?;
        if let Some(scaling) = &self.scaling {
            scaling.validate()?;
        }
        if let Some(lb) = &self.load_balancing {
            lb.validate()?;
        }
        if let Some(ft) = &self.fault_tolerance {
            ft.validate()?;
        }
        if self.agents.len() > self.pool.max_agents {
            return Err(PilottError::Config(format!(
                "{} agents configured but pool.max_agents is {}",
                self.agents.len(),
                self.pool.max_agents
            )));
        }
        for agent in &self.agents {
            agent.validate()?;
        }
        if let Some(ft) = &self.fault_tolerance {
            let template = self.scaling.as_ref().and_then(|s| s.template.as_ref());
            for agent in self.agents.iter().chain(template) {
                if agent.heartbeat_interval_ms >= ft.heartbeat_timeout_ms {
                    return Err(PilottError::Config(format!(
                        "agent '{}': heartbeat_interval_ms ({}) must be below fault_tolerance.heartbeat_timeout_ms ({})",
                        agent.role, agent.heartbeat_interval_ms, ft.heartbeat_timeout_ms
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn admission_timeout(&self) -> Duration {
        Duration::from_millis(self.admission_timeout_ms)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn task_retention(&self) -> Duration {
        Duration::from_secs(self.task_retention_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms.max(1))
    }
}
