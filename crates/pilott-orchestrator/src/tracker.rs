use chrono::{DateTime, Utc};
use pilott_core::{Task, TaskStatus};
use std::collections::HashMap;
use uuid::Uuid;

/// Every task the orchestrator has accepted, keyed by id.
///
/// Holds copies; the dispatcher owns the live task and writes each state
/// change back here.
pub struct TaskTracker {
    tasks: HashMap<Uuid, Task>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
        }
    }

    /// Insert or replace a task.
    pub fn upsert(&mut self, task: &Task) {
        self.tasks.insert(task.id, task.clone());
    }

    /// Mark a tracked task as running on `agent_id`.
    pub fn mark_running(&mut self, id: Uuid, agent_id: Uuid) -> bool {
        match self.tasks.get_mut(&id) {
            Some(task) => task.start(agent_id).is_ok(),
            None => false,
        }
    }

    pub fn get(&self, id: Uuid) -> Option<&Task> {
        self.tasks.get(&id)
    }

    /// All tasks, oldest first.
    pub fn all_tasks(&self) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.tasks.values().collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.values().filter(|t| t.status == status).count()
    }

    pub fn total_count(&self) -> usize {
        self.tasks.len()
    }

    /// Drop terminal tasks that finished before `cutoff`.
    pub fn prune_terminal_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.tasks.len();
        self.tasks.retain(|_, t| {
            !(t.is_terminal() && t.completed_at.is_some_and(|done| done < cutoff))
        });
        before - self.tasks.len()
    }
}

impl Default for TaskTracker {
    fn default() -> Self {
        Self::new()
    }
}
