use crate::dispatch::gather_candidates;
use crate::metrics::OrchestratorMetrics;
use crate::pool::AgentPool;
use crate::reservation::ReservationBoard;
use crate::router::{RouteDecision, TaskRouter};
use crate::tracker::TaskTracker;
use pilott_agent::{Agent, AgentStatus};
use pilott_core::{PilottError, PilottResult, TaskError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// Load balancing policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancingConfig {
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
    /// Agents whose effective load exceeds this shed work.
    #[serde(default = "default_overload_threshold")]
    pub overload_threshold: f64,
    /// In-flight tasks younger than this may be handed to an idle agent.
    #[serde(default = "default_inflight_grace_period_ms")]
    pub inflight_grace_period_ms: u64,
}

fn default_check_interval_ms() -> u64 {
    30_000
}

fn default_overload_threshold() -> f64 {
    0.8
}

fn default_inflight_grace_period_ms() -> u64 {
    5_000
}

impl Default for LoadBalancingConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: default_check_interval_ms(),
            overload_threshold: default_overload_threshold(),
            inflight_grace_period_ms: default_inflight_grace_period_ms(),
        }
    }
}

impl LoadBalancingConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms.max(1))
    }

    pub fn validate(&self) -> PilottResult<()> {
        if !(0.0..=1.0).contains(&self.overload_threshold) {
            return Err(PilottError::Config(
                "load_balancing.overload_threshold must be within [0, 1]".into(),
            ));
        }
        Ok(())
    }
}

/// A queued task moved from one agent's line to another's.
#[derive(Debug, Clone, PartialEq)]
pub struct Reroute {
    pub task_id: Uuid,
    pub from: Uuid,
    pub to: Uuid,
}

/// What one balancing pass changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RebalanceReport {
    pub rerouted: Vec<Reroute>,
    /// In-flight tasks handed back for redelivery, with the agent they left.
    pub preempted: Vec<(Uuid, Uuid)>,
}

impl RebalanceReport {
    pub fn is_empty(&self) -> bool {
        self.rerouted.is_empty() && self.preempted.is_empty()
    }
}

/// Moves work off overloaded agents.
///
/// Queued reservations are rerouted through the task router. An in-flight
/// task is only taken back while it is young, has never been redelivered and
/// an idle agent would accept it; the dispatcher then redelivers it.
pub struct LoadBalancer {
    pool: Arc<AgentPool>,
    board: Arc<ReservationBoard>,
    tracker: Arc<RwLock<TaskTracker>>,
    router: TaskRouter,
    config: LoadBalancingConfig,
    metrics: Arc<OrchestratorMetrics>,
}

impl LoadBalancer {
    pub fn new(
        pool: Arc<AgentPool>,
        board: Arc<ReservationBoard>,
        tracker: Arc<RwLock<TaskTracker>>,
        router: TaskRouter,
        config: LoadBalancingConfig,
        metrics: Arc<OrchestratorMetrics>,
    ) -> Self {
        Self {
            pool,
            board,
            tracker,
            router,
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &LoadBalancingConfig {
        &self.config
    }

    /// One balancing pass.
    pub async fn tick(&self) -> RebalanceReport {
        let agents = self.pool.agents().await;
        let mut report = RebalanceReport::default();

        for agent in &agents {
            let snapshot = agent.snapshot();
            let queued = self.board.queued(agent.id());
            let load = self.router.effective_load(&snapshot, queued);
            if load <= self.config.overload_threshold {
                continue;
            }
            debug!(agent_id = %agent.id(), load, queued, "Agent overloaded");

            let others: Vec<Arc<Agent>> = agents
                .iter()
                .filter(|a| a.id() != agent.id())
                .cloned()
                .collect();
            if others.is_empty() {
                continue;
            }

            for waiting in self.board.waiting_on(agent.id()) {
                let counts = self.board.queued_counts();
                let candidates = gather_candidates(&others, &counts, &waiting.task).await;
                if let Ok(target) = self.router.route(&waiting.task, &candidates) {
                    if self.board.move_to(waiting.reservation, target) {
                        info!(task_id = %waiting.task.id, from = %agent.id(), to = %target, "Rerouted queued task");
                        self.metrics.reservation_rerouted();
                        report.rerouted.push(Reroute {
                            task_id: waiting.task.id,
                            from: agent.id(),
                            to: target,
                        });
                    }
                }
            }

            if let Some(task_id) = self.preempt_candidate(agent, &others).await {
                let reason = TaskError::AgentUnavailable {
                    agent_id: agent.id(),
                    reason: "preempted by load balancer".into(),
                };
                if agent.abort_current(task_id, reason) {
                    info!(task_id = %task_id, agent_id = %agent.id(), "Preempted in-flight task");
                    self.metrics.task_preempted();
                    report.preempted.push((task_id, agent.id()));
                }
            }
        }
        report
    }

    /// The agent's current task, if it may be handed to an idle agent.
    async fn preempt_candidate(&self, agent: &Arc<Agent>, others: &[Arc<Agent>]) -> Option<Uuid> {
        let current = agent.snapshot().current?;
        if current.elapsed_ms >= self.config.inflight_grace_period_ms || current.redeliveries > 0 {
            return None;
        }
        let task = self.tracker.read().await.get(current.task_id).cloned()?;

        let idle: Vec<Arc<Agent>> = others
            .iter()
            .filter(|a| a.status() == AgentStatus::Idle && !a.is_draining())
            .cloned()
            .collect();
        if idle.is_empty() {
            return None;
        }
        let candidates = gather_candidates(&idle, &self.board.queued_counts(), &task).await;
        match self.router.decide(&task, &candidates) {
            RouteDecision::Selected { .. } => Some(current.task_id),
            _ => None,
        }
    }

    /// Run passes every `check_interval` until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.check_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_ms = self.config.check_interval_ms, "Load balancer started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let report = self.tick().await;
                    if !report.is_empty() {
                        debug!(
                            rerouted = report.rerouted.len(),
                            preempted = report.preempted.len(),
                            "Rebalance pass"
                        );
                    }
                }
            }
        }
        info!("Load balancer stopped");
    }
}
