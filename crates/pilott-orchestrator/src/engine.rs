use crate::balancer::{LoadBalancer, LoadBalancingConfig};
use crate::config::OrchestratorConfig;
use crate::dispatch::{DispatchLimits, Dispatcher};
use crate::fault::{FaultMonitor, FaultToleranceConfig};
use crate::metrics::{MetricsSnapshot, OrchestratorMetrics};
use crate::pool::{AgentPool, BackendFactory};
use crate::router::TaskRouter;
use crate::scaler::{DynamicScaler, ScalingConfig};
use crate::tracker::TaskTracker;
use crate::validation::TaskValidator;
use futures_util::future::join_all;
use pilott_agent::{AgentConfig, AgentSnapshot};
use pilott_core::{PilottError, PilottResult, Task, TaskResult};
use pilott_memory::{InMemoryStore, MemoryStore};
use pilott_skills::SkillRegistry;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// A background loop and the token that stops it.
struct LoopHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl LoopHandle {
    fn spawn<F, Fut>(run: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(cancel.clone()));
        Self { cancel, handle }
    }

    async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Background loop ended abnormally");
        }
    }
}

#[derive(Default)]
struct Loops {
    scaler: Option<LoopHandle>,
    balancer: Option<LoopHandle>,
    fault_monitor: Option<LoopHandle>,
    cleanup: Option<LoopHandle>,
}

impl Loops {
    fn take_all(&mut self) -> Vec<LoopHandle> {
        [
            self.scaler.take(),
            self.balancer.take(),
            self.fault_monitor.take(),
            self.cleanup.take(),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

/// The top-level orchestrator.
///
/// Owns the agent pool and the dispatcher and runs the optional scaling,
/// load balancing and fault monitoring loops. Submissions are accepted
/// between [`Orchestrator::start`] and [`Orchestrator::stop`].
pub struct Orchestrator {
    config: OrchestratorConfig,
    pool: Arc<AgentPool>,
    dispatcher: Arc<Dispatcher>,
    tracker: Arc<RwLock<TaskTracker>>,
    metrics: Arc<OrchestratorMetrics>,
    memory: Option<Arc<dyn MemoryStore>>,
    running: AtomicBool,
    loops: Mutex<Loops>,
}

impl Orchestrator {
    /// Create an orchestrator with no skills and an in-process memory store.
    pub fn new(config: OrchestratorConfig, factory: BackendFactory) -> PilottResult<Self> {
        Self::with_parts(
            config,
            factory,
            Arc::new(SkillRegistry::new()),
            Some(Arc::new(InMemoryStore::new())),
        )
    }

    /// Create an orchestrator with the given skills and memory store.
    pub fn with_parts(
        config: OrchestratorConfig,
        factory: BackendFactory,
        skills: Arc<SkillRegistry>,
        memory: Option<Arc<dyn MemoryStore>>,
    ) -> PilottResult<Self> {
        config.validate()?;
        let pool = Arc::new(AgentPool::new(&config.pool, factory, skills, memory.clone()));
        let tracker = Arc::new(RwLock::new(TaskTracker::new()));
        let metrics = Arc::new(OrchestratorMetrics::new());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&pool),
            TaskRouter::new(config.router.clone()),
            TaskValidator::new(config.task_types.clone()),
            Arc::clone(&tracker),
            Arc::clone(&metrics),
            DispatchLimits {
                max_concurrent_tasks: config.max_concurrent_tasks,
                admission_timeout: config.admission_timeout(),
                dispatch_timeout: config.dispatch_timeout(),
            },
        ));
        dispatcher.close();

        Ok(Self {
            config,
            pool,
            dispatcher,
            tracker,
            metrics,
            memory,
            running: AtomicBool::new(false),
            loops: Mutex::new(Loops::default()),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<AgentPool> {
        &self.pool
    }

    pub fn memory(&self) -> Option<&Arc<dyn MemoryStore>> {
        self.memory.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> PilottResult<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(PilottError::Orchestrator(
                "background loops can only be enabled while the orchestrator is running".into(),
            ))
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Create the configured agents, start the configured loops and begin
    /// accepting tasks. Calling it on a running orchestrator does nothing.
    pub async fn start(&self) -> PilottResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self.start_components().await {
            self.running.store(false, Ordering::SeqCst);
            for handle in self.loops.lock().await.take_all() {
                handle.stop().await;
            }
            self.pool.shutdown(self.config.shutdown_timeout()).await;
            return Err(e);
        }
        self.dispatcher.reopen();
        info!(
            name = %self.config.name,
            agents = self.pool.active_count().await,
            max_concurrent_tasks = self.config.max_concurrent_tasks,
            "Orchestrator started"
        );
        Ok(())
    }

    async fn start_components(&self) -> PilottResult<()> {
        for agent in &self.config.agents {
            self.pool.add(agent.clone()).await?;
        }
        if let Some(scaling) = self.config.scaling.clone() {
            self.enable_scaling(scaling).await?;
        }
        if let Some(lb) = self.config.load_balancing.clone() {
            self.enable_load_balancing(lb).await?;
        }
        if let Some(ft) = self.config.fault_tolerance.clone() {
            self.enable_fault_tolerance(ft).await?;
        }
        self.spawn_cleanup().await;
        Ok(())
    }

    /// Stop accepting tasks, stop the background loops and shut the pool
    /// down. Waiting tasks fail with `Cancelled`; running tasks get the
    /// shutdown timeout to finish before they are cancelled too.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(name = %self.config.name, "Orchestrator stopping");
        self.dispatcher.close();
        let handles = self.loops.lock().await.take_all();
        join_all(handles.into_iter().map(LoopHandle::stop)).await;
        self.pool.shutdown(self.config.shutdown_timeout()).await;
        self.pool.set_bounds(self.config.pool.min_agents, self.config.pool.max_agents)
            .unwrap_or_else(|e| warn!(error = %e, "Could not restore pool bounds"));
        info!(name = %self.config.name, "Orchestrator stopped");
    }

    async fn spawn_cleanup(&self) {
        let tracker = Arc::clone(&self.tracker);
        let interval = self.config.cleanup_interval();
        let retention = chrono::Duration::seconds(self.config.task_retention_secs as i64);
        let handle = LoopHandle::spawn(move |cancel| async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let cutoff = chrono::Utc::now() - retention;
                        let pruned = tracker.write().await.prune_terminal_before(cutoff);
                        if pruned > 0 {
                            info!(pruned, "Pruned finished tasks");
                        }
                    }
                }
            }
        });
        if let Some(previous) = self.loops.lock().await.cleanup.replace(handle) {
            previous.stop().await;
        }
    }

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    /// Run a task and wait for its final result.
    ///
    /// Never returns an error: rejections, timeouts and cancellations come
    /// back as a failed `TaskResult`.
    pub async fn submit(&self, task: Task) -> TaskResult {
        self.dispatcher.dispatch(task).await
    }

    /// Run tasks concurrently; results come back in submission order.
    pub async fn submit_batch(&self, tasks: Vec<Task>) -> Vec<TaskResult> {
        info!(count = tasks.len(), "Batch submitted");
        join_all(tasks.into_iter().map(|task| self.submit(task))).await
    }

    pub async fn task(&self, id: Uuid) -> Option<Task> {
        self.tracker.read().await.get(id).cloned()
    }

    /// All tracked tasks, oldest first.
    pub async fn tasks(&self) -> Vec<Task> {
        self.tracker
            .read()
            .await
            .all_tasks()
            .into_iter()
            .cloned()
            .collect()
    }

    // -----------------------------------------------------------------------
    // Agents
    // -----------------------------------------------------------------------

    pub async fn add_agent(&self, config: AgentConfig) -> PilottResult<Uuid> {
        self.pool.add(config).await
    }

    /// Drain and remove an agent; see [`AgentPool::remove`].
    pub async fn remove_agent(&self, id: Uuid) -> PilottResult<()> {
        self.pool.remove(id).await
    }

    pub async fn agents(&self) -> Vec<AgentSnapshot> {
        self.pool.snapshots().await
    }

    // -----------------------------------------------------------------------
    // Background loops
    // -----------------------------------------------------------------------

    /// Start (or reconfigure) dynamic scaling on a running orchestrator.
    ///
    /// The running check happens under the loop lock, so a concurrent
    /// [`Orchestrator::stop`] either sees the new loop or rejects it.
    pub async fn enable_scaling(&self, config: ScalingConfig) -> PilottResult<()> {
        config.validate()?;
        let min = config.min_agents.unwrap_or(self.config.pool.min_agents);
        let max = config.max_agents.unwrap_or(self.config.pool.max_agents);

        let scaler = Arc::new(DynamicScaler::new(
            Arc::clone(&self.pool),
            config,
            Arc::clone(&self.metrics),
        ));
        let previous = {
            let mut loops = self.loops.lock().await;
            self.ensure_running()?;
            self.pool.set_bounds(min, max)?;
            loops
                .scaler
                .replace(LoopHandle::spawn(move |cancel| scaler.run(cancel)))
        };
        if let Some(previous) = previous {
            previous.stop().await;
        }
        info!(min, max, "Dynamic scaling enabled");
        Ok(())
    }

    pub async fn disable_scaling(&self) {
        let handle = self.loops.lock().await.scaler.take();
        if let Some(handle) = handle {
            handle.stop().await;
            self.pool
                .set_bounds(self.config.pool.min_agents, self.config.pool.max_agents)
                .unwrap_or_else(|e| warn!(error = %e, "Could not restore pool bounds"));
            info!("Dynamic scaling disabled");
        }
    }

    pub async fn enable_load_balancing(&self, config: LoadBalancingConfig) -> PilottResult<()> {
        config.validate()?;
        let balancer = Arc::new(LoadBalancer::new(
            Arc::clone(&self.pool),
            Arc::clone(self.dispatcher.reservations()),
            Arc::clone(&self.tracker),
            self.dispatcher.router().clone(),
            config,
            Arc::clone(&self.metrics),
        ));
        let previous = {
            let mut loops = self.loops.lock().await;
            self.ensure_running()?;
            loops
                .balancer
                .replace(LoopHandle::spawn(move |cancel| balancer.run(cancel)))
        };
        if let Some(previous) = previous {
            previous.stop().await;
        }
        info!("Load balancing enabled");
        Ok(())
    }

    pub async fn disable_load_balancing(&self) {
        let handle = self.loops.lock().await.balancer.take();
        if let Some(handle) = handle {
            handle.stop().await;
            info!("Load balancing disabled");
        }
    }

    pub async fn enable_fault_tolerance(&self, config: FaultToleranceConfig) -> PilottResult<()> {
        config.validate()?;
        let monitor = Arc::new(FaultMonitor::new(
            Arc::clone(&self.pool),
            config,
            Arc::clone(&self.metrics),
        ));
        let previous = {
            let mut loops = self.loops.lock().await;
            self.ensure_running()?;
            loops
                .fault_monitor
                .replace(LoopHandle::spawn(move |cancel| monitor.run(cancel)))
        };
        if let Some(previous) = previous {
            previous.stop().await;
        }
        info!("Fault tolerance enabled");
        Ok(())
    }

    pub async fn disable_fault_tolerance(&self) {
        let handle = self.loops.lock().await.fault_monitor.take();
        if let Some(handle) = handle {
            handle.stop().await;
            info!("Fault tolerance disabled");
        }
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Task counters, pool summary and per-agent snapshots as JSON.
    pub async fn status_json(&self) -> serde_json::Value {
        let agents = self.pool.snapshots().await;
        let mut status = self.metrics.to_json(&agents);
        status["name"] = serde_json::Value::String(self.config.name.clone());
        status["running"] = serde_json::Value::Bool(self.is_running());
        status["queued"] = serde_json::json!(self.dispatcher.reservations().len());
        status
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pilott_agent::{LlmBackend, LlmResponse};
    use pilott_core::{Message, TaskError, TaskStatus};
    use pilott_skills::SkillDescriptor;
    use std::time::Duration;

    struct Done;

    #[async_trait]
    impl LlmBackend for Done {
        async fn chat(
            &self,
            _system_prompt: Option<&str>,
            _messages: &[Message],
            _tools: &[SkillDescriptor],
        ) -> PilottResult<LlmResponse> {
            Ok(LlmResponse::Done("done".into()))
        }
    }

    fn orchestrator(config: OrchestratorConfig) -> Orchestrator {
        Orchestrator::new(config, Arc::new(|_| Arc::new(Done))).unwrap()
    }

    fn one_agent() -> OrchestratorConfig {
        OrchestratorConfig {
            agents: vec![AgentConfig::new("worker")],
            ..OrchestratorConfig::default()
        }
    }

    #[tokio::test]
    async fn test_submit_before_start_is_cancelled() {
        let orch = orchestrator(one_agent());
        let result = orch.submit(Task::new("too early")).await;
        assert!(matches!(result.error, Some(TaskError::Cancelled { .. })));
    }

    #[tokio::test]
    async fn test_start_submit_stop() {
        let orch = orchestrator(one_agent());
        orch.start().await.unwrap();
        orch.start().await.unwrap();
        assert!(orch.is_running());
        assert_eq!(orch.agents().await.len(), 1);

        let task = Task::new("hello");
        let id = task.id;
        let result = orch.submit(task).await;
        assert!(result.success);
        assert_eq!(orch.task(id).await.unwrap().status, TaskStatus::Completed);
        assert_eq!(orch.metrics().completed, 1);

        let status = orch.status_json().await;
        assert_eq!(status["running"], true);
        assert_eq!(status["pool"]["agents"], 1);

        orch.stop().await;
        assert!(!orch.is_running());
        assert!(orch.agents().await.is_empty());
    }

    #[tokio::test]
    async fn test_restart_recreates_configured_agents() {
        let orch = orchestrator(one_agent());
        orch.start().await.unwrap();
        orch.stop().await;
        orch.start().await.unwrap();
        assert_eq!(orch.agents().await.len(), 1);
        assert!(orch.submit(Task::new("again")).await.success);
        orch.stop().await;
    }

    #[tokio::test]
    async fn test_enable_scaling_applies_bounds_and_disable_restores() {
        let orch = orchestrator(one_agent());
        orch.start().await.unwrap();
        orch.enable_scaling(ScalingConfig {
            min_agents: Some(2),
            max_agents: Some(3),
            ..ScalingConfig::default()
        })
        .await
        .unwrap();
        assert_eq!(orch.pool().bounds(), (2, 3));
        orch.disable_scaling().await;
        assert_eq!(orch.pool().bounds(), (1, 10));

        let bad = ScalingConfig {
            batch_size: 0,
            ..ScalingConfig::default()
        };
        assert!(orch.enable_scaling(bad).await.is_err());
        orch.stop().await;
    }

    #[tokio::test]
    async fn test_loops_are_not_enabled_while_stopped() {
        let orch = orchestrator(one_agent());
        let scaling = ScalingConfig {
            min_agents: Some(3),
            max_agents: Some(4),
            check_interval_ms: 10,
            ..ScalingConfig::default()
        };
        assert!(orch.enable_scaling(scaling.clone()).await.is_err());
        assert!(orch
            .enable_load_balancing(LoadBalancingConfig::default())
            .await
            .is_err());
        assert!(orch
            .enable_fault_tolerance(FaultToleranceConfig::default())
            .await
            .is_err());
        assert_eq!(orch.pool().bounds(), (1, 10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(orch.pool().active_count().await, 0);

        orch.start().await.unwrap();
        orch.stop().await;
        assert!(orch.enable_scaling(scaling).await.is_err());
        assert_eq!(orch.pool().active_count().await, 0);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = OrchestratorConfig {
            max_concurrent_tasks: 0,
            ..OrchestratorConfig::default()
        };
        assert!(Orchestrator::new(config, Arc::new(|_| Arc::new(Done))).is_err());
    }
}
