use futures_util::future::join_all;
use parking_lot::Mutex;
use pilott_agent::{Agent, AgentConfig, AgentSnapshot, LlmBackend};
use pilott_core::{PilottError, PilottResult, TaskError};
use pilott_memory::MemoryStore;
use pilott_skills::SkillRegistry;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

/// Builds the LLM backend for a new agent.
pub type BackendFactory = Arc<dyn Fn(&AgentConfig) -> Arc<dyn LlmBackend> + Send + Sync>;

/// Bounds and drain behaviour of the agent pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_min_agents")]
    pub min_agents: usize,
    #[serde(default = "default_max_agents")]
    pub max_agents: usize,
    /// How long a removed agent may keep working on its current task.
    #[serde(default = "default_drain_grace_period_ms")]
    pub drain_grace_period_ms: u64,
}

fn default_min_agents() -> usize {
    1
}

fn default_max_agents() -> usize {
    10
}

fn default_drain_grace_period_ms() -> u64 {
    30_000
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_agents: default_min_agents(),
            max_agents: default_max_agents(),
            drain_grace_period_ms: default_drain_grace_period_ms(),
        }
    }
}

impl PoolConfig {
    pub fn drain_grace_period(&self) -> Duration {
        Duration::from_millis(self.drain_grace_period_ms)
    }

    pub fn validate(&self) -> PilottResult<()> {
        validate_bounds(self.min_agents, self.max_agents)
    }
}

fn validate_bounds(min: usize, max: usize) -> PilottResult<()> {
    if max == 0 {
        return Err(PilottError::Config("max_agents must be at least 1".into()));
    }
    if min > max {
        return Err(PilottError::Config(format!(
            "min_agents ({min}) exceeds max_agents ({max})"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
struct Bounds {
    min: usize,
    max: usize,
}

#[derive(Default)]
struct Members {
    agents: HashMap<Uuid, Arc<Agent>>,
    /// Agents on their way out; they still count as members until stopped.
    leaving: HashSet<Uuid>,
}

impl Members {
    fn active(&self) -> usize {
        self.agents.len() - self.leaving.len()
    }
}

/// The set of running agents.
///
/// Agents are added started and only leave the map once stopped. Removal
/// respects the pool bounds; retirement by the fault monitor does not.
pub struct AgentPool {
    members: RwLock<Members>,
    bounds: Mutex<Bounds>,
    drain_grace: Duration,
    factory: BackendFactory,
    skills: Arc<SkillRegistry>,
    memory: Option<Arc<dyn MemoryStore>>,
    changed: Notify,
}

impl AgentPool {
    pub fn new(
        config: &PoolConfig,
        factory: BackendFactory,
        skills: Arc<SkillRegistry>,
        memory: Option<Arc<dyn MemoryStore>>,
    ) -> Self {
        Self {
            members: RwLock::new(Members::default()),
            bounds: Mutex::new(Bounds {
                min: config.min_agents,
                max: config.max_agents,
            }),
            drain_grace: config.drain_grace_period(),
            factory,
            skills,
            memory,
            changed: Notify::new(),
        }
    }

    /// Create, start and register an agent.
    pub async fn add(&self, config: AgentConfig) -> PilottResult<Uuid> {
        config.validate()?;
        let max = self.bounds.lock().max;
        let mut members = self.members.write().await;
        if members.active() >= max {
            return Err(PilottError::Orchestrator(format!(
                "pool is at its maximum of {max} agents"
            )));
        }

        let backend = (self.factory)(&config);
        let agent = Arc::new(Agent::new(
            config,
            backend,
            Arc::clone(&self.skills),
            self.memory.clone(),
        ));
        agent.start();
        let id = agent.id();
        info!(agent_id = %id, role = %agent.role(), pool_size = members.active() + 1, "Agent added to pool");
        members.agents.insert(id, agent);
        drop(members);
        self.changed.notify_waiters();
        Ok(id)
    }

    /// Drain and remove an agent, keeping at least `min_agents`.
    ///
    /// The agent stops taking work at once. Its current task gets the drain
    /// grace period to finish and is cancelled after that.
    pub async fn remove(&self, id: Uuid) -> PilottResult<()> {
        let agent = {
            let min = self.bounds.lock().min;
            let mut members = self.members.write().await;
            let agent = members
                .agents
                .get(&id)
                .cloned()
                .ok_or_else(|| PilottError::Orchestrator(format!("unknown agent {id}")))?;
            if members.leaving.contains(&id) {
                return Err(PilottError::Orchestrator(format!(
                    "agent {id} is already being removed"
                )));
            }
            if members.active() <= min {
                return Err(PilottError::Orchestrator(format!(
                    "removing agent {id} would drop the pool below its minimum of {min}"
                )));
            }
            members.leaving.insert(id);
            agent
        };

        agent.begin_drain();
        info!(agent_id = %id, grace_ms = self.drain_grace.as_millis() as u64, "Draining agent");
        if !agent.wait_until_idle(self.drain_grace).await {
            warn!(agent_id = %id, "Drain grace period expired; cancelling current task");
            agent.stop_with(TaskError::cancelled("agent removed after drain grace period"));
            agent.wait_until_idle(self.drain_grace).await;
        }
        agent.stop();
        self.forget(id).await;
        Ok(())
    }

    /// Stop an agent immediately, failing its task with `reason`.
    ///
    /// Ignores the minimum bound. Returns `false` if the agent is unknown or
    /// already leaving, so a retirement happens at most once.
    pub async fn retire(&self, id: Uuid, reason: TaskError) -> bool {
        let agent = {
            let mut members = self.members.write().await;
            let Some(agent) = members.agents.get(&id).cloned() else {
                return false;
            };
            if !members.leaving.insert(id) {
                return false;
            }
            agent
        };

        warn!(agent_id = %id, reason = %reason, "Retiring agent");
        agent.begin_drain();
        agent.stop_with(reason);
        agent.wait_until_idle(self.drain_grace).await;
        self.forget(id).await;
        true
    }

    /// Remove an agent only if it is idle right now and the pool stays
    /// at or above its minimum.
    pub async fn remove_if_idle(&self, id: Uuid) -> bool {
        let min = self.bounds.lock().min;
        let mut members = self.members.write().await;
        if members.leaving.contains(&id) || members.active() <= min {
            return false;
        }
        let stopped = members
            .agents
            .get(&id)
            .is_some_and(|agent| agent.stop_if_idle());
        if stopped {
            members.agents.remove(&id);
            info!(agent_id = %id, pool_size = members.active(), "Idle agent removed from pool");
            drop(members);
            self.changed.notify_waiters();
        }
        stopped
    }

    async fn forget(&self, id: Uuid) {
        let mut members = self.members.write().await;
        members.agents.remove(&id);
        members.leaving.remove(&id);
        info!(agent_id = %id, pool_size = members.active(), "Agent removed from pool");
        drop(members);
        self.changed.notify_waiters();
    }

    pub async fn get(&self, id: Uuid) -> Option<Arc<Agent>> {
        self.members.read().await.agents.get(&id).cloned()
    }

    /// All member agents, including those being drained, ordered by id.
    pub async fn agents(&self) -> Vec<Arc<Agent>> {
        let mut agents: Vec<Arc<Agent>> =
            self.members.read().await.agents.values().cloned().collect();
        agents.sort_by_key(|a| a.id());
        agents
    }

    pub async fn snapshots(&self) -> Vec<AgentSnapshot> {
        self.agents().await.iter().map(|a| a.snapshot()).collect()
    }

    /// Agents that are members and not being removed.
    pub async fn active_count(&self) -> usize {
        self.members.read().await.active()
    }

    pub fn bounds(&self) -> (usize, usize) {
        let b = self.bounds.lock();
        (b.min, b.max)
    }

    pub fn set_bounds(&self, min: usize, max: usize) -> PilottResult<()> {
        validate_bounds(min, max)?;
        *self.bounds.lock() = Bounds { min, max };
        Ok(())
    }

    /// Wake tasks waiting for pool capacity.
    pub fn notify_changed(&self) {
        self.changed.notify_waiters();
    }

    /// Resolves on the next membership or capacity change.
    pub async fn changed(&self) {
        self.changed.notified().await;
    }

    /// Stop and remove every agent, giving in-flight tasks `grace` to
    /// finish first.
    pub async fn shutdown(&self, grace: Duration) {
        let agents = self.agents().await;
        for agent in &agents {
            agent.begin_drain();
        }
        let drained = join_all(agents.iter().map(|a| a.wait_until_idle(grace))).await;
        let stragglers = drained.iter().filter(|idle| !**idle).count();
        if stragglers > 0 {
            warn!(stragglers, "Shutdown grace period expired; cancelling remaining tasks");
        }
        for agent in &agents {
            agent.stop_with(TaskError::cancelled("orchestrator shutting down"));
        }
        join_all(agents.iter().map(|a| a.wait_until_idle(grace))).await;

        let mut members = self.members.write().await;
        members.agents.clear();
        members.leaving.clear();
        drop(members);
        self.changed.notify_waiters();
        info!(agents = agents.len(), "Agent pool stopped");
    }
}
