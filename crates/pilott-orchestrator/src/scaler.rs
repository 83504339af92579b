use crate::metrics::OrchestratorMetrics;
use crate::pool::AgentPool;
use parking_lot::Mutex;
use pilott_agent::{AgentConfig, AgentStatus};
use pilott_core::{PilottError, PilottResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Dynamic scaling policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingConfig {
    /// Overrides the pool minimum while scaling is enabled.
    #[serde(default)]
    pub min_agents: Option<usize>,
    /// Overrides the pool maximum while scaling is enabled.
    #[serde(default)]
    pub max_agents: Option<usize>,
    /// Scale up when the busy fraction exceeds this.
    #[serde(default = "default_scale_up_threshold")]
    pub scale_up_threshold: f64,
    /// Scale down when the busy fraction drops below this.
    #[serde(default = "default_scale_down_threshold")]
    pub scale_down_threshold: f64,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
    /// Agents added or removed per scaling action.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Configuration for new agents. Without one, a busy agent's
    /// configuration is cloned.
    #[serde(default)]
    pub template: Option<AgentConfig>,
}

fn default_scale_up_threshold() -> f64 {
    0.8
}

fn default_scale_down_threshold() -> f64 {
    0.3
}

fn default_cooldown_ms() -> u64 {
    60_000
}

fn default_check_interval_ms() -> u64 {
    30_000
}

fn default_batch_size() -> usize {
    1
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            min_agents: None,
            max_agents: None,
            scale_up_threshold: default_scale_up_threshold(),
            scale_down_threshold: default_scale_down_threshold(),
            cooldown_ms: default_cooldown_ms(),
            check_interval_ms: default_check_interval_ms(),
            batch_size: default_batch_size(),
            template: None,
        }
    }
}

impl ScalingConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms.max(1))
    }

    pub fn validate(&self) -> PilottResult<()> {
        if !(0.0..=1.0).contains(&self.scale_up_threshold)
            || !(0.0..=1.0).contains(&self.scale_down_threshold)
        {
            return Err(PilottError::Config(
                "scaling thresholds must be within [0, 1]".into(),
            ));
        }
        if self.scale_down_threshold >= self.scale_up_threshold {
            return Err(PilottError::Config(
                "scale_down_threshold must be below scale_up_threshold".into(),
            ));
        }
        if self.batch_size == 0 {
            return Err(PilottError::Config("scaling batch_size must be at least 1".into()));
        }
        if let (Some(min), Some(max)) = (self.min_agents, self.max_agents) {
            if min > max {
                return Err(PilottError::Config(
                    "scaling min_agents exceeds max_agents".into(),
                ));
            }
        }
        if let Some(template) = &self.template {
            template.validate()?;
        }
        Ok(())
    }
}

/// What a scaling check did.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalingAction {
    Unchanged,
    /// The pool was below its minimum and was topped up.
    Replenished(Vec<Uuid>),
    ScaledUp(Vec<Uuid>),
    ScaledDown(Vec<Uuid>),
    /// A change was due but the cooldown has not elapsed.
    CoolingDown,
}

#[derive(Default)]
struct History {
    last_up: Option<Instant>,
    last_down: Option<Instant>,
}

/// Grows and shrinks the pool with the busy fraction of its agents.
pub struct DynamicScaler {
    pool: Arc<AgentPool>,
    config: ScalingConfig,
    metrics: Arc<OrchestratorMetrics>,
    history: Mutex<History>,
}

impl DynamicScaler {
    pub fn new(pool: Arc<AgentPool>, config: ScalingConfig, metrics: Arc<OrchestratorMetrics>) -> Self {
        Self {
            pool,
            config,
            metrics,
            history: Mutex::new(History::default()),
        }
    }

    pub fn config(&self) -> &ScalingConfig {
        &self.config
    }

    fn cooling(&self, since: Option<Instant>) -> bool {
        since.is_some_and(|at| at.elapsed() < self.config.cooldown())
    }

    /// One scaling check.
    pub async fn tick(&self) -> PilottResult<ScalingAction> {
        let (min, max) = self.pool.bounds();
        let snapshots = self.pool.snapshots().await;
        let active: Vec<_> = snapshots
            .iter()
            .filter(|s| !s.draining && s.status != AgentStatus::Stopped)
            .collect();
        let total = active.len();
        let busy = active.iter().filter(|s| s.status == AgentStatus::Busy).count();
        let load = if total == 0 { 0.0 } else { busy as f64 / total as f64 };
        debug!(total, busy, load, "Scaling check");

        if total < min {
            let added = self.add_agents(min - total).await?;
            self.history.lock().last_up = Some(Instant::now());
            info!(added = added.len(), min, "Pool replenished to its minimum");
            self.metrics.scaled_up(added.len());
            return Ok(ScalingAction::Replenished(added));
        }

        if load > self.config.scale_up_threshold && total < max {
            if self.cooling(self.history.lock().last_up) {
                return Ok(ScalingAction::CoolingDown);
            }
            let count = self.config.batch_size.min(max - total);
            let added = self.add_agents(count).await?;
            self.history.lock().last_up = Some(Instant::now());
            info!(added = added.len(), load, "Scaled up");
            self.metrics.scaled_up(added.len());
            return Ok(ScalingAction::ScaledUp(added));
        }

        if load < self.config.scale_down_threshold && total > min {
            {
                let history = self.history.lock();
                if self.cooling(history.last_down) || self.cooling(history.last_up) {
                    return Ok(ScalingAction::CoolingDown);
                }
            }
            let mut idle: Vec<_> = active
                .iter()
                .filter(|s| s.status == AgentStatus::Idle)
                .collect();
            idle.sort_by_key(|s| s.last_used);

            let wanted = self.config.batch_size.min(total - min);
            let mut removed = Vec::new();
            for snapshot in idle {
                if removed.len() == wanted {
                    break;
                }
                if self.pool.remove_if_idle(snapshot.id).await {
                    removed.push(snapshot.id);
                }
            }
            if removed.is_empty() {
                return Ok(ScalingAction::Unchanged);
            }
            self.history.lock().last_down = Some(Instant::now());
            info!(removed = removed.len(), load, "Scaled down");
            self.metrics.scaled_down(removed.len());
            return Ok(ScalingAction::ScaledDown(removed));
        }

        Ok(ScalingAction::Unchanged)
    }

    async fn add_agents(&self, count: usize) -> PilottResult<Vec<Uuid>> {
        let template = self.template().await?;
        let mut added = Vec::with_capacity(count);
        for _ in 0..count {
            match self.pool.add(template.clone()).await {
                Ok(id) => added.push(id),
                Err(e) => {
                    warn!(error = %e, "Could not add agent");
                    break;
                }
            }
        }
        Ok(added)
    }

    /// The configured template, else the busiest agent's configuration,
    /// else any agent's.
    async fn template(&self) -> PilottResult<AgentConfig> {
        if let Some(template) = &self.config.template {
            return Ok(template.clone());
        }
        let agents = self.pool.agents().await;
        let busiest = agents
            .iter()
            .filter(|a| a.status() == AgentStatus::Busy)
            .max_by(|a, b| a.load().total_cmp(&b.load()))
            .or_else(|| agents.first());
        busiest
            .map(|a| a.config().clone())
            .ok_or_else(|| PilottError::Config("scaling needs a template to create agents".into()))
    }

    /// Run checks every `check_interval` until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.check_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_ms = self.config.check_interval_ms, "Dynamic scaler started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!(error = %e, "Scaling check failed");
                    }
                }
            }
        }
        info!("Dynamic scaler stopped");
    }
}
