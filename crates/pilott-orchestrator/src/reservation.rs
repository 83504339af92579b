//! Waiting lines for busy agents.
//!
//! A task routed to a busy agent holds a reservation on that agent until it
//! can be assigned. The line is ordered by priority, then by arrival. The
//! load balancer may move a reservation to another agent; its holder learns
//! about the move through a watch channel.

use parking_lot::Mutex;
use pilott_core::{Task, TaskPriority};
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

struct Entry {
    task: Task,
    seq: u64,
    target: watch::Sender<Uuid>,
}

impl Entry {
    fn agent(&self) -> Uuid {
        *self.target.borrow()
    }

    fn rank(&self) -> (Reverse<TaskPriority>, u64) {
        (Reverse(self.task.priority), self.seq)
    }
}

#[derive(Default)]
struct Lines {
    entries: HashMap<u64, Entry>,
    next_seq: u64,
}

/// A queued reservation as seen by the load balancer.
#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub reservation: u64,
    pub task: Task,
}

#[derive(Default)]
pub struct ReservationBoard {
    lines: Mutex<Lines>,
}

/// Held by the waiting task. Dropping it leaves the line.
pub struct Reservation {
    board: Arc<ReservationBoard>,
    id: u64,
    target: watch::Receiver<Uuid>,
}

impl Reservation {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The agent this reservation currently waits on.
    pub fn target(&mut self) -> Uuid {
        *self.target.borrow_and_update()
    }

    /// Resolves when the reservation is moved to another agent.
    pub async fn moved(&mut self) {
        if self.target.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    pub fn is_head(&self) -> bool {
        self.board.is_head(self.id)
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.board.lines.lock().entries.remove(&self.id);
    }
}

impl ReservationBoard {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Join the line for `agent_id`.
    pub fn reserve(self: &Arc<Self>, agent_id: Uuid, task: &Task) -> Reservation {
        let (tx, rx) = watch::channel(agent_id);
        let mut lines = self.lines.lock();
        let seq = lines.next_seq;
        lines.next_seq += 1;
        lines.entries.insert(
            seq,
            Entry {
                task: task.clone(),
                seq,
                target: tx,
            },
        );
        Reservation {
            board: Arc::clone(self),
            id: seq,
            target: rx,
        }
    }

    /// Whether `id` is first in its agent's line.
    pub fn is_head(&self, id: u64) -> bool {
        let lines = self.lines.lock();
        let Some(entry) = lines.entries.get(&id) else {
            return false;
        };
        let agent = entry.agent();
        lines
            .entries
            .values()
            .filter(|e| e.agent() == agent)
            .min_by_key(|e| e.rank())
            .is_some_and(|head| head.seq == id)
    }

    pub fn queued(&self, agent_id: Uuid) -> usize {
        self.lines
            .lock()
            .entries
            .values()
            .filter(|e| e.agent() == agent_id)
            .count()
    }

    pub fn queued_counts(&self) -> HashMap<Uuid, usize> {
        let mut counts = HashMap::new();
        for entry in self.lines.lock().entries.values() {
            *counts.entry(entry.agent()).or_insert(0) += 1;
        }
        counts
    }

    /// Reservations waiting on `agent_id`, in line order.
    pub fn waiting_on(&self, agent_id: Uuid) -> Vec<QueuedTask> {
        let lines = self.lines.lock();
        let mut waiting: Vec<&Entry> = lines
            .entries
            .values()
            .filter(|e| e.agent() == agent_id)
            .collect();
        waiting.sort_by_key(|e| e.rank());
        waiting
            .into_iter()
            .map(|e| QueuedTask {
                reservation: e.seq,
                task: e.task.clone(),
            })
            .collect()
    }

    /// Move a reservation to another agent's line, keeping its arrival order.
    pub fn move_to(&self, id: u64, agent_id: Uuid) -> bool {
        let lines = self.lines.lock();
        match lines.entries.get(&id) {
            Some(entry) if entry.agent() != agent_id => {
                entry.target.send_replace(agent_id);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lines.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
