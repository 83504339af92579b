use pilott_agent::{AgentSnapshot, AgentStatus, Suitability};
use pilott_core::{PilottError, PilottResult, Task, TaskError};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::debug;
use uuid::Uuid;

/// Scores within this distance are treated as equal.
const SCORE_EPSILON: f64 = 1e-9;

/// Relative weights of the routing score components.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterWeights {
    #[serde(default = "default_capability_weight")]
    pub capability: f64,
    #[serde(default = "default_load_weight")]
    pub load: f64,
    #[serde(default = "default_role_weight")]
    pub role: f64,
    #[serde(default = "default_history_weight")]
    pub history: f64,
}

fn default_capability_weight() -> f64 {
    0.5
}

fn default_load_weight() -> f64 {
    0.2
}

fn default_role_weight() -> f64 {
    0.15
}

fn default_history_weight() -> f64 {
    0.15
}

impl Default for RouterWeights {
    fn default() -> Self {
        Self {
            capability: default_capability_weight(),
            load: default_load_weight(),
            role: default_role_weight(),
            history: default_history_weight(),
        }
    }
}

impl RouterWeights {
    fn total(&self) -> f64 {
        self.capability + self.load + self.role + self.history
    }
}

/// Router tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Minimum score a candidate needs to be selected.
    #[serde(default = "default_acceptance_threshold")]
    pub acceptance_threshold: f64,
    /// Busy agents at or above this effective load are not considered.
    #[serde(default = "default_busy_ceiling")]
    pub busy_ceiling: f64,
    /// Load added per in-flight or queued task.
    #[serde(default = "default_queue_load_step")]
    pub queue_load_step: f64,
    #[serde(default)]
    pub weights: RouterWeights,
}

fn default_acceptance_threshold() -> f64 {
    0.5
}

fn default_busy_ceiling() -> f64 {
    0.8
}

fn default_queue_load_step() -> f64 {
    0.3
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            acceptance_threshold: default_acceptance_threshold(),
            busy_ceiling: default_busy_ceiling(),
            queue_load_step: default_queue_load_step(),
            weights: RouterWeights::default(),
        }
    }
}

impl RouterConfig {
    pub fn validate(&self) -> PilottResult<()> {
        let unit = 0.0..=1.0;
        if !unit.contains(&self.acceptance_threshold) {
            return Err(PilottError::Config(
                "router.acceptance_threshold must be within [0, 1]".into(),
            ));
        }
        if !unit.contains(&self.busy_ceiling) {
            return Err(PilottError::Config(
                "router.busy_ceiling must be within [0, 1]".into(),
            ));
        }
        if self.queue_load_step < 0.0 {
            return Err(PilottError::Config(
                "router.queue_load_step must not be negative".into(),
            ));
        }
        let w = &self.weights;
        if [w.capability, w.load, w.role, w.history]
            .iter()
            .any(|x| *x < 0.0)
            || w.total() <= 0.0
        {
            return Err(PilottError::Config(
                "router.weights must be non-negative with a positive sum".into(),
            ));
        }
        Ok(())
    }
}

/// One agent as seen by the router.
#[derive(Debug, Clone)]
pub struct RoutingCandidate {
    pub snapshot: AgentSnapshot,
    /// Reservations waiting on this agent.
    pub queued: usize,
    pub suitability: Suitability,
}

/// Outcome of a routing decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RouteDecision {
    Selected { agent_id: Uuid, score: f64 },
    /// Eligible candidates exist but none reaches the acceptance threshold.
    BelowThreshold { best: f64 },
    /// Agents exist but all are busy past the ceiling, draining or down.
    Saturated,
    /// No agents at all.
    Empty,
}

/// Picks the best agent for a task from a snapshot of candidates.
///
/// Routing is a pure computation; it never touches agent state.
#[derive(Debug, Clone, Default)]
pub struct TaskRouter {
    config: RouterConfig,
}

impl TaskRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Busy fraction plus a step per in-flight and queued task, capped at 1.
    pub fn effective_load(&self, snapshot: &AgentSnapshot, queued: usize) -> f64 {
        let in_flight = usize::from(snapshot.current.is_some());
        let pending = (queued + in_flight) as f64;
        (snapshot.load + self.config.queue_load_step * pending).min(1.0)
    }

    pub fn is_eligible(&self, candidate: &RoutingCandidate) -> bool {
        if candidate.snapshot.draining {
            return false;
        }
        match candidate.snapshot.status {
            AgentStatus::Idle => true,
            AgentStatus::Busy => {
                self.effective_load(&candidate.snapshot, candidate.queued) < self.config.busy_ceiling
            }
            AgentStatus::Error | AgentStatus::Stopped => false,
        }
    }

    /// Normalized weighted score in `[0, 1]`.
    pub fn score(&self, candidate: &RoutingCandidate) -> f64 {
        let w = &self.config.weights;
        let s = &candidate.suitability;
        let load = self.effective_load(&candidate.snapshot, candidate.queued);
        let raw = w.capability * s.capability
            + w.load * (1.0 - load)
            + w.role * s.role_match
            + w.history * s.history_score();
        (raw / w.total()).clamp(0.0, 1.0)
    }

    pub fn decide(&self, task: &Task, candidates: &[RoutingCandidate]) -> RouteDecision {
        if candidates.is_empty() {
            return RouteDecision::Empty;
        }

        let mut scored: Vec<(f64, f64, Uuid)> = candidates
            .iter()
            .filter(|c| self.is_eligible(c))
            .map(|c| {
                (
                    self.score(c),
                    self.effective_load(&c.snapshot, c.queued),
                    c.snapshot.id,
                )
            })
            .collect();

        if scored.is_empty() {
            return RouteDecision::Saturated;
        }

        scored.sort_by(|a, b| {
            if (a.0 - b.0).abs() > SCORE_EPSILON {
                b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal)
            } else {
                a.1.partial_cmp(&b.1)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| a.2.cmp(&b.2))
            }
        });

        let (score, load, agent_id) = scored[0];
        debug!(task_id = %task.id, agent_id = %agent_id, score, load, "Routing decision");
        if score + SCORE_EPSILON < self.config.acceptance_threshold {
            RouteDecision::BelowThreshold { best: score }
        } else {
            RouteDecision::Selected { agent_id, score }
        }
    }

    /// Select an agent or fail with `NoSuitableAgent`.
    pub fn route(&self, task: &Task, candidates: &[RoutingCandidate]) -> Result<Uuid, TaskError> {
        match self.decide(task, candidates) {
            RouteDecision::Selected { agent_id, .. } => Ok(agent_id),
            other => Err(self.rejection(&other)),
        }
    }

    /// The error reported for a decision that selected nobody.
    pub fn rejection(&self, decision: &RouteDecision) -> TaskError {
        let reason = match decision {
            RouteDecision::Selected { agent_id, .. } => format!("agent {agent_id} was selected"),
            RouteDecision::BelowThreshold { best } => format!(
                "best score {best:.2} is below the acceptance threshold {:.2}",
                self.config.acceptance_threshold
            ),
            RouteDecision::Saturated => {
                "every agent is saturated, draining or unavailable".to_string()
            }
            RouteDecision::Empty => "the agent pool is empty".to_string(),
        };
        TaskError::NoSuitableAgent { reason }
    }
}
