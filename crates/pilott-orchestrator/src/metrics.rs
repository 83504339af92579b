use pilott_agent::{AgentSnapshot, AgentStatus};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Orchestrator-wide counters. Cheap to update from any task.
#[derive(Debug, Default)]
pub struct OrchestratorMetrics {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
    redelivered: AtomicU64,
    running: AtomicU64,
    scale_ups: AtomicU64,
    scale_downs: AtomicU64,
    recoveries: AtomicU64,
    retirements: AtomicU64,
    rerouted: AtomicU64,
    preempted: AtomicU64,
}

/// Counter values at one instant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    /// Tasks failed before reaching an agent.
    pub rejected: u64,
    pub redelivered: u64,
    pub running: u64,
    pub scale_ups: u64,
    pub scale_downs: u64,
    pub recoveries: u64,
    pub retirements: u64,
    /// Queued reservations moved by the load balancer.
    pub rerouted: u64,
    /// In-flight tasks handed back by the load balancer.
    pub preempted: u64,
}

/// Pool-level view derived from agent snapshots.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolSummary {
    pub agents: usize,
    pub idle: usize,
    pub busy: usize,
    pub error: usize,
    pub draining: usize,
    /// Fraction of agents currently busy.
    pub utilization: f64,
}

impl PoolSummary {
    pub fn from_snapshots(agents: &[AgentSnapshot]) -> Self {
        let count = |status: AgentStatus| agents.iter().filter(|a| a.status == status).count();
        let busy = count(AgentStatus::Busy);
        Self {
            agents: agents.len(),
            idle: count(AgentStatus::Idle),
            busy,
            error: count(AgentStatus::Error),
            draining: agents.iter().filter(|a| a.draining).count(),
            utilization: if agents.is_empty() {
                0.0
            } else {
                busy as f64 / agents.len() as f64
            },
        }
    }
}

impl OrchestratorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_started(&self) {
        self.running.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the end of an execution attempt.
    pub fn task_finished(&self) {
        let _ = self
            .running
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn task_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_redelivered(&self) {
        self.redelivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn scaled_up(&self, agents: usize) {
        self.scale_ups.fetch_add(agents as u64, Ordering::Relaxed);
    }

    pub fn scaled_down(&self, agents: usize) {
        self.scale_downs.fetch_add(agents as u64, Ordering::Relaxed);
    }

    pub fn agent_recovered(&self) {
        self.recoveries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn agent_retired(&self) {
        self.retirements.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reservation_rerouted(&self) {
        self.rerouted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_preempted(&self) {
        self.preempted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            submitted: get(&self.submitted),
            completed: get(&self.completed),
            failed: get(&self.failed),
            rejected: get(&self.rejected),
            redelivered: get(&self.redelivered),
            running: get(&self.running),
            scale_ups: get(&self.scale_ups),
            scale_downs: get(&self.scale_downs),
            recoveries: get(&self.recoveries),
            retirements: get(&self.retirements),
            rerouted: get(&self.rerouted),
            preempted: get(&self.preempted),
        }
    }

    /// Counters plus per-agent state, for status endpoints and logs.
    pub fn to_json(&self, agents: &[AgentSnapshot]) -> serde_json::Value {
        serde_json::json!({
            "tasks": self.snapshot(),
            "pool": PoolSummary::from_snapshots(agents),
            "agents": agents,
        })
    }
}
