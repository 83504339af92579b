use crate::metrics::OrchestratorMetrics;
use crate::pool::AgentPool;
use crate::reservation::ReservationBoard;
use crate::router::{RouteDecision, RoutingCandidate, TaskRouter};
use crate::tracker::TaskTracker;
use crate::validation::TaskValidator;
use futures_util::future::join_all;
use parking_lot::Mutex;
use pilott_agent::{Agent, AssignedTask};
use pilott_core::{Task, TaskError, TaskResult, TaskStatus};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Fallback re-check interval while waiting for capacity.
const CAPACITY_POLL: Duration = Duration::from_millis(50);
const CLOSED_REASON: &str = "orchestrator is not accepting tasks";

/// Admission and waiting bounds for submitted tasks.
#[derive(Debug, Clone)]
pub struct DispatchLimits {
    pub max_concurrent_tasks: usize,
    pub admission_timeout: Duration,
    pub dispatch_timeout: Duration,
}

/// Snapshot and score every agent in `agents` for `task`.
pub(crate) async fn gather_candidates(
    agents: &[Arc<Agent>],
    queued: &HashMap<Uuid, usize>,
    task: &Task,
) -> Vec<RoutingCandidate> {
    join_all(agents.iter().map(|agent| async move {
        RoutingCandidate {
            snapshot: agent.snapshot(),
            queued: queued.get(&agent.id()).copied().unwrap_or(0),
            suitability: agent.evaluate_suitability(task).await,
        }
    }))
    .await
}

enum Waited {
    Assigned(AssignedTask),
    Reroute,
    Failed(TaskError),
}

/// Takes a submitted task from admission to a terminal result.
///
/// Each task runs as its own future: admission, routing, an optional wait
/// in a busy agent's line, execution, and at most one redelivery after an
/// agent fault.
pub struct Dispatcher {
    pool: Arc<AgentPool>,
    router: TaskRouter,
    board: Arc<ReservationBoard>,
    tracker: Arc<RwLock<TaskTracker>>,
    validator: TaskValidator,
    metrics: Arc<OrchestratorMetrics>,
    admission: Arc<Semaphore>,
    limits: DispatchLimits,
    shutdown: Mutex<CancellationToken>,
}

impl Dispatcher {
    pub fn new(
        pool: Arc<AgentPool>,
        router: TaskRouter,
        validator: TaskValidator,
        tracker: Arc<RwLock<TaskTracker>>,
        metrics: Arc<OrchestratorMetrics>,
        limits: DispatchLimits,
    ) -> Self {
        Self {
            pool,
            router,
            board: ReservationBoard::new(),
            tracker,
            validator,
            metrics,
            admission: Arc::new(Semaphore::new(limits.max_concurrent_tasks)),
            limits,
            shutdown: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn reservations(&self) -> &Arc<ReservationBoard> {
        &self.board
    }

    pub fn router(&self) -> &TaskRouter {
        &self.router
    }

    /// Fail every waiting task with `Cancelled`. New submissions are
    /// refused until [`Dispatcher::reopen`].
    pub fn close(&self) {
        self.shutdown.lock().cancel();
    }

    pub fn reopen(&self) {
        let mut token = self.shutdown.lock();
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.lock().is_cancelled()
    }

    /// Run `task` to completion and return its final result.
    pub async fn dispatch(&self, mut task: Task) -> TaskResult {
        self.metrics.task_submitted();
        if task.status != TaskStatus::Pending {
            self.metrics.task_rejected();
            return TaskResult::failure(
                task.id,
                None,
                TaskError::InvalidTask {
                    reason: format!("submitted task is {}, expected pending", task.status),
                },
            );
        }
        self.tracker.write().await.upsert(&task);
        info!(task_id = %task.id, priority = ?task.priority, task_type = ?task.task_type(), "Task submitted");

        if let Err(e) = self.validator.validate(&task) {
            return self.reject(&mut task, e).await;
        }

        let shutdown = self.shutdown.lock().clone();
        let admitted = tokio::select! {
            biased;
            _ = shutdown.cancelled() => Err(TaskError::cancelled(CLOSED_REASON)),
            acquired = tokio::time::timeout(
                self.limits.admission_timeout,
                Arc::clone(&self.admission).acquire_owned(),
            ) => match acquired {
                Ok(Ok(permit)) => Ok(permit),
                Ok(Err(_)) => Err(TaskError::cancelled("admission closed")),
                Err(_) => Err(TaskError::timeout("admission", self.limits.admission_timeout)),
            },
        };
        let _permit = match admitted {
            Ok(permit) => permit,
            Err(e) => return self.reject(&mut task, e).await,
        };

        let mut deadline = Instant::now() + self.limits.dispatch_timeout;
        let mut excluded = HashSet::new();
        loop {
            let assigned = match self.acquire(&task, &excluded, deadline, &shutdown).await {
                Ok(assigned) => assigned,
                Err(e) => return self.reject(&mut task, e).await,
            };
            let agent_id = assigned.agent_id();
            self.tracker.write().await.mark_running(task.id, agent_id);
            self.metrics.task_started();

            let result = assigned.run(&mut task).await;

            self.metrics.task_finished();
            self.pool.notify_changed();

            if task.can_requeue() && task.requeue().is_ok() {
                warn!(
                    task_id = %task.id,
                    agent_id = %agent_id,
                    error = ?result.error,
                    "Agent fault; redelivering task"
                );
                self.metrics.task_redelivered();
                excluded.insert(agent_id);
                // The redelivery gets its own routing window.
                deadline = Instant::now() + self.limits.dispatch_timeout;
                self.tracker.write().await.upsert(&task);
                continue;
            }

            if result.success {
                self.metrics.task_completed();
            } else {
                self.metrics.task_failed();
            }
            self.tracker.write().await.upsert(&task);
            return result;
        }
    }

    async fn reject(&self, task: &mut Task, error: TaskError) -> TaskResult {
        warn!(task_id = %task.id, error = %error, "Task rejected");
        self.metrics.task_rejected();
        if let Err(e) = task.reject(error.clone()) {
            warn!(task_id = %task.id, error = %e, "Could not record rejection");
        }
        self.tracker.write().await.upsert(task);
        task.result
            .clone()
            .unwrap_or_else(|| TaskResult::failure(task.id, None, error))
    }

    /// Find an agent and claim it, waiting for capacity up to `deadline`.
    async fn acquire(
        &self,
        task: &Task,
        excluded: &HashSet<Uuid>,
        deadline: Instant,
        shutdown: &CancellationToken,
    ) -> Result<AssignedTask, TaskError> {
        let mut last = RouteDecision::Empty;
        loop {
            if shutdown.is_cancelled() {
                return Err(TaskError::cancelled(CLOSED_REASON));
            }
            if Instant::now() >= deadline {
                return Err(match last {
                    RouteDecision::Selected { .. } => {
                        TaskError::timeout("dispatch", self.limits.dispatch_timeout)
                    }
                    other => self.router.rejection(&other),
                });
            }

            let candidates = self.candidates(task, excluded).await;
            let decision = self.router.decide(task, &candidates);
            match decision {
                RouteDecision::Selected { agent_id, score } => {
                    last = decision;
                    let Some(agent) = self.pool.get(agent_id).await else {
                        continue;
                    };
                    if self.board.queued(agent_id) == 0 {
                        match agent.try_assign(task) {
                            Ok(assigned) => {
                                debug!(task_id = %task.id, agent_id = %agent_id, score, "Task routed");
                                return Ok(assigned);
                            }
                            Err(TaskError::AgentBusy { .. }) => {}
                            Err(e) => {
                                debug!(task_id = %task.id, error = %e, "Selected agent went away; rerouting");
                                tokio::task::yield_now().await;
                                continue;
                            }
                        }
                    }
                    match self.wait_in_line(task, agent_id, deadline, shutdown).await {
                        Waited::Assigned(assigned) => return Ok(assigned),
                        Waited::Reroute => continue,
                        Waited::Failed(e) => return Err(e),
                    }
                }
                RouteDecision::BelowThreshold { .. } => {
                    return Err(self.router.rejection(&decision));
                }
                RouteDecision::Saturated | RouteDecision::Empty => {
                    debug!(task_id = %task.id, decision = ?decision, "No capacity; waiting");
                    last = decision;
                    tokio::select! {
                        _ = self.pool.changed() => {}
                        _ = tokio::time::sleep(CAPACITY_POLL) => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                        _ = shutdown.cancelled() => {}
                    }
                }
            }
        }
    }

    /// Queue behind a busy agent until this task is first in line and the
    /// agent is free.
    async fn wait_in_line(
        &self,
        task: &Task,
        agent_id: Uuid,
        deadline: Instant,
        shutdown: &CancellationToken,
    ) -> Waited {
        let mut reservation = self.board.reserve(agent_id, task);
        debug!(
            task_id = %task.id,
            agent_id = %agent_id,
            queued = self.board.queued(agent_id),
            "Task waiting for busy agent"
        );
        loop {
            let target = reservation.target();
            let Some(agent) = self.pool.get(target).await else {
                return Waited::Reroute;
            };
            let mut status = agent.subscribe_status();
            if reservation.is_head() {
                match agent.try_assign(task) {
                    Ok(assigned) => {
                        debug!(task_id = %task.id, agent_id = %target, "Reservation fulfilled");
                        return Waited::Assigned(assigned);
                    }
                    Err(TaskError::AgentBusy { .. }) => {}
                    Err(_) => return Waited::Reroute,
                }
            }
            tokio::select! {
                _ = status.changed() => {}
                _ = reservation.moved() => {}
                _ = tokio::time::sleep(CAPACITY_POLL) => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return Waited::Failed(TaskError::timeout("dispatch", self.limits.dispatch_timeout));
                }
                _ = shutdown.cancelled() => {
                    return Waited::Failed(TaskError::cancelled(CLOSED_REASON));
                }
            }
        }
    }

    /// Candidates for `task`. Agents that already faulted on it are skipped
    /// unless nobody else is left.
    async fn candidates(&self, task: &Task, excluded: &HashSet<Uuid>) -> Vec<RoutingCandidate> {
        let mut agents = self.pool.agents().await;
        if !excluded.is_empty() {
            let others: Vec<Arc<Agent>> = agents
                .iter()
                .filter(|a| !excluded.contains(&a.id()))
                .cloned()
                .collect();
            if !others.is_empty() {
                agents = others;
            }
        }
        gather_candidates(&agents, &self.board.queued_counts(), task).await
    }
}
