use crate::config::AgentConfig;
use pilott_core::Task;
use pilott_memory::ScoredOutcome;
use serde::{Deserialize, Serialize};

/// History score used when an agent has no comparable past outcome.
pub const NEUTRAL_HISTORY: f64 = 0.5;
/// Minimum description similarity for a past outcome to count as comparable.
pub const SIMILARITY_THRESHOLD: f32 = 0.35;

/// How well an agent fits a task, before load is taken into account.
///
/// Every component lies in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Suitability {
    /// Fraction of the task's required capabilities the agent offers.
    pub capability: f64,
    /// 1 when the agent handles the task type, 0 when it does not,
    /// 0.5 when the task has no type.
    pub role_match: f64,
    /// Success fraction over comparable past outcomes.
    pub history: Option<f64>,
}

impl Suitability {
    /// Compute capability and role match; history comes from memory.
    pub fn assess(task: &Task, config: &AgentConfig, history: Option<f64>) -> Self {
        Self {
            capability: capability_overlap(&task.required_capabilities(), &config.capabilities),
            role_match: match task.task_type() {
                Some(t) if config.handles_type(t) => 1.0,
                Some(_) => 0.0,
                None => 0.5,
            },
            history: history.map(|h| h.clamp(0.0, 1.0)),
        }
    }

    pub fn history_score(&self) -> f64 {
        self.history.unwrap_or(NEUTRAL_HISTORY)
    }
}

/// Fraction of `required` tags present in `offered`, case-insensitively.
/// A task with no requirements is fully covered.
pub fn capability_overlap(required: &[String], offered: &[String]) -> f64 {
    if required.is_empty() {
        return 1.0;
    }
    let matched = required
        .iter()
        .filter(|r| offered.iter().any(|o| o.eq_ignore_ascii_case(r)))
        .count();
    matched as f64 / required.len() as f64
}

/// Success fraction of the comparable outcomes, `None` when there are none.
pub fn history_from(outcomes: &[ScoredOutcome]) -> Option<f64> {
    let comparable: Vec<&ScoredOutcome> = outcomes
        .iter()
        .filter(|o| o.similarity >= SIMILARITY_THRESHOLD)
        .collect();
    if comparable.is_empty() {
        return None;
    }
    let successes = comparable.iter().filter(|o| o.outcome.success).count();
    Some(successes as f64 / comparable.len() as f64)
}
