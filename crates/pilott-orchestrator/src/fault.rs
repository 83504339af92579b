use crate::metrics::OrchestratorMetrics;
use crate::pool::AgentPool;
use futures_util::future::join_all;
use pilott_agent::{Agent, AgentStatus};
use pilott_core::{PilottError, PilottResult, TaskError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Health checking and recovery policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultToleranceConfig {
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    /// Consecutive failed checks before an agent is put into `Error`.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Restarts allowed before the agent is retired.
    #[serde(default = "default_max_recovery_attempts")]
    pub max_recovery_attempts: u32,
    #[serde(default = "default_health_check_timeout_ms")]
    pub health_check_timeout_ms: u64,
    /// A busy agent without a heartbeat for this long fails its check.
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
}

fn default_health_check_interval_ms() -> u64 {
    30_000
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_max_recovery_attempts() -> u32 {
    3
}

fn default_health_check_timeout_ms() -> u64 {
    5_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    60_000
}

impl Default for FaultToleranceConfig {
    fn default() -> Self {
        Self {
            health_check_interval_ms: default_health_check_interval_ms(),
            failure_threshold: default_failure_threshold(),
            max_recovery_attempts: default_max_recovery_attempts(),
            health_check_timeout_ms: default_health_check_timeout_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
        }
    }
}

impl FaultToleranceConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms.max(1))
    }

    pub fn validate(&self) -> PilottResult<()> {
        if self.failure_threshold == 0 {
            return Err(PilottError::Config(
                "fault_tolerance.failure_threshold must be at least 1".into(),
            ));
        }
        if self.health_check_timeout_ms == 0 {
            return Err(PilottError::Config(
                "fault_tolerance.health_check_timeout_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Outcome of checking one agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthAction {
    Healthy,
    /// Failed, still below the threshold.
    Failed { failures: u32 },
    Restarted { attempt: u32 },
    Retired,
    /// Stopped or draining agents are not checked.
    Skipped,
}

/// Periodically checks agents; restarts failing ones and retires those
/// that keep failing.
///
/// With threshold `N` and `M` recovery attempts, the `N`th consecutive
/// failure restarts the agent, each later failure restarts it again until
/// `M` restarts have been spent, and the next failure retires it.
pub struct FaultMonitor {
    pool: Arc<AgentPool>,
    config: FaultToleranceConfig,
    metrics: Arc<OrchestratorMetrics>,
}

impl FaultMonitor {
    pub fn new(
        pool: Arc<AgentPool>,
        config: FaultToleranceConfig,
        metrics: Arc<OrchestratorMetrics>,
    ) -> Self {
        Self {
            pool,
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &FaultToleranceConfig {
        &self.config
    }

    /// Check every agent concurrently.
    pub async fn tick(&self) -> Vec<(Uuid, HealthAction)> {
        let agents = self.pool.agents().await;
        join_all(agents.iter().map(|agent| async move {
            (agent.id(), self.check_agent(agent).await)
        }))
        .await
    }

    pub async fn check_agent(&self, agent: &Arc<Agent>) -> HealthAction {
        if agent.status() == AgentStatus::Stopped || agent.is_draining() {
            return HealthAction::Skipped;
        }
        if agent.status() == AgentStatus::Error {
            return self.recover_or_retire(agent).await;
        }

        let timeout = Duration::from_millis(self.config.health_check_timeout_ms);
        let stale_after = Duration::from_millis(self.config.heartbeat_timeout_ms);
        match agent.health_check(timeout, stale_after).await {
            Ok(()) => {
                agent.record_check_success();
                HealthAction::Healthy
            }
            Err(reason) => {
                let failures = agent.record_check_failure();
                warn!(agent_id = %agent.id(), failures, reason = %reason, "Health check failed");
                if failures < self.config.failure_threshold {
                    return HealthAction::Failed { failures };
                }
                agent.mark_error();
                self.recover_or_retire(agent).await
            }
        }
    }

    async fn recover_or_retire(&self, agent: &Arc<Agent>) -> HealthAction {
        let attempts = agent.recovery_attempts();
        if attempts < self.config.max_recovery_attempts {
            let attempt = agent.restart();
            self.metrics.agent_recovered();
            info!(agent_id = %agent.id(), attempt, max = self.config.max_recovery_attempts, "Agent recovery attempted");
            return HealthAction::Restarted { attempt };
        }

        error!(agent_id = %agent.id(), attempts, "Recovery attempts exhausted");
        let reason = TaskError::RecoveryExhausted {
            agent_id: agent.id(),
            attempts,
        };
        if self.pool.retire(agent.id(), reason).await {
            self.metrics.agent_retired();
        }
        HealthAction::Retired
    }

    /// Run checks every `health_check_interval` until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.check_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            interval_ms = self.config.health_check_interval_ms,
            threshold = self.config.failure_threshold,
            "Fault monitor started"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let actions = self.tick().await;
                    let unhealthy = actions
                        .iter()
                        .filter(|(_, a)| !matches!(a, HealthAction::Healthy | HealthAction::Skipped))
                        .count();
                    debug!(agents = actions.len(), unhealthy, "Health pass");
                }
            }
        }
        info!("Fault monitor stopped");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::pool::{BackendFactory, PoolConfig};
    use async_trait::async_trait;
    use pilott_agent::{AgentConfig, LlmBackend, LlmResponse};
    use pilott_core::{Message, Task};
    use pilott_skills::{SkillDescriptor, SkillRegistry};
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Switchable {
        healthy: Arc<AtomicBool>,
    }

    #[async_trait]
    impl LlmBackend for Switchable {
        async fn chat(
            &self,
            _system_prompt: Option<&str>,
            _messages: &[Message],
            _tools: &[SkillDescriptor],
        ) -> PilottResult<LlmResponse> {
            if self.healthy.load(Ordering::SeqCst) {
                Ok(LlmResponse::Done("pong".into()))
            } else {
                Err(PilottError::Llm("connection refused".into()))
            }
        }
    }

    async fn setup(config: FaultToleranceConfig) -> (FaultMonitor, Arc<Agent>, Arc<AtomicBool>) {
        let healthy = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&healthy);
        let factory: BackendFactory = Arc::new(move |_| {
            Arc::new(Switchable {
                healthy: Arc::clone(&flag),
            })
        });
        let pool = Arc::new(AgentPool::new(
            &PoolConfig {
                min_agents: 1,
                max_agents: 2,
                drain_grace_period_ms: 50,
            },
            factory,
            Arc::new(SkillRegistry::new()),
            None,
        ));
        let id = pool.add(AgentConfig::new("worker")).await.unwrap();
        let agent = pool.get(id).await.unwrap();
        let monitor = FaultMonitor::new(pool, config, Arc::new(OrchestratorMetrics::new()));
        (monitor, agent, healthy)
    }

    #[tokio::test]
    async fn test_healthy_agent_resets_counters() {
        let (monitor, agent, healthy) = setup(FaultToleranceConfig::default()).await;
        healthy.store(false, Ordering::SeqCst);
        assert_eq!(
            monitor.check_agent(&agent).await,
            HealthAction::Failed { failures: 1 }
        );
        healthy.store(true, Ordering::SeqCst);
        assert_eq!(monitor.check_agent(&agent).await, HealthAction::Healthy);
        assert_eq!(agent.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_three_failures_two_recoveries_retires_on_fifth() {
        let (monitor, agent, healthy) = setup(FaultToleranceConfig {
            failure_threshold: 3,
            max_recovery_attempts: 2,
            ..FaultToleranceConfig::default()
        })
        .await;
        healthy.store(false, Ordering::SeqCst);

        let mut actions = Vec::new();
        for _ in 0..5 {
            actions.push(monitor.check_agent(&agent).await);
        }
        assert_eq!(
            actions,
            vec![
                HealthAction::Failed { failures: 1 },
                HealthAction::Failed { failures: 2 },
                HealthAction::Restarted { attempt: 1 },
                HealthAction::Restarted { attempt: 2 },
                HealthAction::Retired,
            ]
        );
        assert_eq!(agent.status(), AgentStatus::Stopped);
        assert!(monitor.pool.get(agent.id()).await.is_none());
        // Below the pool minimum is allowed for retirement.
        assert_eq!(monitor.pool.active_count().await, 0);
        assert_eq!(monitor.metrics.snapshot().retirements, 1);
        assert_eq!(monitor.metrics.snapshot().recoveries, 2);
    }

    #[tokio::test]
    async fn test_error_agent_is_restarted_without_check() {
        let (monitor, agent, _healthy) = setup(FaultToleranceConfig::default()).await;
        agent.mark_error();
        assert_eq!(agent.status(), AgentStatus::Error);
        assert_eq!(
            monitor.check_agent(&agent).await,
            HealthAction::Restarted { attempt: 1 }
        );
        assert_eq!(agent.status(), AgentStatus::Idle);
    }

    #[tokio::test]
    async fn test_restart_fails_in_flight_task_as_agent_fault() {
        let (monitor, agent, healthy) = setup(FaultToleranceConfig {
            failure_threshold: 1,
            ..FaultToleranceConfig::default()
        })
        .await;
        let mut task = Task::new("in flight");
        let guard = agent.try_assign(&task).unwrap();
        healthy.store(false, Ordering::SeqCst);

        assert_eq!(
            monitor.check_agent(&agent).await,
            HealthAction::Restarted { attempt: 1 }
        );
        let result = guard.run(&mut task).await;
        assert!(result.error.as_ref().is_some_and(TaskError::is_agent_fault));
        assert!(task.can_requeue());
    }

    struct Patient;

    #[async_trait]
    impl LlmBackend for Patient {
        async fn chat(
            &self,
            _system_prompt: Option<&str>,
            _messages: &[Message],
            _tools: &[SkillDescriptor],
        ) -> PilottResult<LlmResponse> {
            tokio::time::sleep(Duration::from_millis(400)).await;
            Ok(LlmResponse::Done("done".into()))
        }

        async fn health_check(&self) -> PilottResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_agent_waiting_on_slow_call_stays_healthy() {
        let factory: BackendFactory = Arc::new(|_| Arc::new(Patient));
        let pool = Arc::new(AgentPool::new(
            &PoolConfig::default(),
            factory,
            Arc::new(SkillRegistry::new()),
            None,
        ));
        let id = pool
            .add(AgentConfig::new("worker").with_heartbeat_interval(Duration::from_millis(20)))
            .await
            .unwrap();
        let agent = pool.get(id).await.unwrap();
        let monitor = FaultMonitor::new(
            Arc::clone(&pool),
            FaultToleranceConfig {
                failure_threshold: 1,
                heartbeat_timeout_ms: 100,
                ..FaultToleranceConfig::default()
            },
            Arc::new(OrchestratorMetrics::new()),
        );

        let runner = Arc::clone(&agent);
        let handle = tokio::spawn(async move {
            let mut task = Task::new("one long planning call");
            runner.execute(&mut task).await
        });
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(agent.status(), AgentStatus::Busy);
        assert_eq!(monitor.check_agent(&agent).await, HealthAction::Healthy);
        let result = handle.await.unwrap();
        assert!(result.success, "{:?}", result.error);
        assert_eq!(agent.recovery_attempts(), 0);
    }

    #[tokio::test]
    async fn test_stopped_agents_are_skipped() {
        let (monitor, agent, _healthy) = setup(FaultToleranceConfig::default()).await;
        agent.stop();
        assert_eq!(monitor.check_agent(&agent).await, HealthAction::Skipped);
        let actions = monitor.tick().await;
        assert_eq!(actions, vec![(agent.id(), HealthAction::Skipped)]);
    }
}
