use crate::embedding::{cosine_similarity, LocalEmbedding};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pilott_core::{PilottResult, Task, TaskError, TaskResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// Default number of entries kept before the oldest are evicted.
pub const DEFAULT_CAPACITY: usize = 1000;

/// Outcome of one task execution, as recorded by the executing agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: Uuid,
    pub agent_id: Option<Uuid>,
    pub description: String,
    pub task_type: Option<String>,
    pub success: bool,
    pub execution_time_ms: u64,
    pub error: Option<TaskError>,
    pub timestamp: DateTime<Utc>,
}

/// Free-form knowledge made available to later tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Knowledge {
    pub text: String,
    pub metadata: HashMap<String, serde_json::Value>,
    pub tags: BTreeSet<String>,
}

/// The payload of a memory entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MemoryRecord {
    TaskStarted {
        task_id: Uuid,
        agent_id: Uuid,
        description: String,
    },
    TaskOutcome(TaskOutcome),
    Knowledge(Knowledge),
}

/// A single append-only memory entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: Uuid,
    pub record: MemoryRecord,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

/// A knowledge entry returned by [`MemoryStore::search`].
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub entry_id: Uuid,
    pub knowledge: Knowledge,
    pub score: f32,
    pub timestamp: DateTime<Utc>,
}

/// A past outcome together with its similarity to a query.
#[derive(Debug, Clone)]
pub struct ScoredOutcome {
    pub outcome: TaskOutcome,
    pub similarity: f32,
}

/// Boundary between agents and long-term memory.
///
/// Failures are reported to the caller, which logs them; they never block
/// task completion.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Record that an agent started a task.
    async fn store_task_start(&self, task: &Task, agent_id: Uuid) -> PilottResult<()>;

    /// Record the outcome of a task.
    async fn store_task_result(&self, task: &Task, result: &TaskResult) -> PilottResult<()>;

    /// Store a knowledge entry and return its id.
    async fn store_context(
        &self,
        text: &str,
        metadata: HashMap<String, serde_json::Value>,
        tags: &[String],
    ) -> PilottResult<Uuid>;

    /// Most recent outcomes, newest first, optionally for one agent only.
    async fn get_history(&self, agent_id: Option<Uuid>, limit: usize)
        -> PilottResult<Vec<TaskOutcome>>;

    /// An agent's past outcomes ranked by similarity to `query`.
    async fn similar_outcomes(
        &self,
        agent_id: Uuid,
        query: &str,
        limit: usize,
    ) -> PilottResult<Vec<ScoredOutcome>>;

    /// Knowledge entries carrying every tag in `tags`, ranked by similarity
    /// to `query` (or by recency when the query is empty).
    async fn search(&self, query: &str, tags: &[String], limit: usize)
        -> PilottResult<Vec<SearchResult>>;

    /// Drop entries older than `cutoff`, returning how many were removed.
    async fn prune_before(&self, cutoff: DateTime<Utc>) -> PilottResult<usize>;

    /// Number of entries currently held.
    async fn count(&self) -> PilottResult<usize>;
}

/// Bounded in-process memory store.
pub struct InMemoryStore {
    entries: RwLock<VecDeque<MemoryEntry>>,
    capacity: usize,
    embedder: LocalEmbedding,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY))),
            capacity: capacity.max(1),
            embedder: LocalEmbedding::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries whose timestamp falls in `[start, end]`, oldest first.
    pub async fn entries_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<MemoryEntry> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .filter(|e| e.timestamp >= start && e.timestamp <= end)
            .cloned()
            .collect()
    }

    async fn append(&self, record: MemoryRecord, embedding: Option<Vec<f32>>) -> Uuid {
        let entry = MemoryEntry {
            id: Uuid::new_v4(),
            record,
            timestamp: Utc::now(),
            embedding,
        };
        let id = entry.id;
        let mut entries = self.entries.write().await;
        entries.push_back(entry);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
        id
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn store_task_start(&self, task: &Task, agent_id: Uuid) -> PilottResult<()> {
        self.append(
            MemoryRecord::TaskStarted {
                task_id: task.id,
                agent_id,
                description: task.description.clone(),
            },
            None,
        )
        .await;
        Ok(())
    }

    async fn store_task_result(&self, task: &Task, result: &TaskResult) -> PilottResult<()> {
        let outcome = TaskOutcome {
            task_id: task.id,
            agent_id: result.agent_id,
            description: task.description.clone(),
            task_type: task.task_type().map(str::to_string),
            success: result.success,
            execution_time_ms: result.execution_time_ms,
            error: result.error.clone(),
            timestamp: result.completed_at,
        };
        let embedding = self.embedder.embed_text(&task.description);
        self.append(MemoryRecord::TaskOutcome(outcome), Some(embedding))
            .await;
        debug!(task_id = %task.id, success = result.success, "Stored task outcome");
        Ok(())
    }

    async fn store_context(
        &self,
        text: &str,
        metadata: HashMap<String, serde_json::Value>,
        tags: &[String],
    ) -> PilottResult<Uuid> {
        let knowledge = Knowledge {
            text: text.to_string(),
            metadata,
            tags: tags.iter().cloned().collect(),
        };
        let embedding = self.embedder.embed_text(text);
        Ok(self
            .append(MemoryRecord::Knowledge(knowledge), Some(embedding))
            .await)
    }

    async fn get_history(
        &self,
        agent_id: Option<Uuid>,
        limit: usize,
    ) -> PilottResult<Vec<TaskOutcome>> {
        let entries = self.entries.read().await;
        let history = entries
            .iter()
            .rev()
            .filter_map(|e| match &e.record {
                MemoryRecord::TaskOutcome(o) if agent_id.is_none() || o.agent_id == agent_id => {
                    Some(o.clone())
                }
                _ => None,
            })
            .take(limit)
            .collect();
        Ok(history)
    }

    async fn similar_outcomes(
        &self,
        agent_id: Uuid,
        query: &str,
        limit: usize,
    ) -> PilottResult<Vec<ScoredOutcome>> {
        let query_embedding = self.embedder.embed_text(query);
        let entries = self.entries.read().await;
        let mut scored: Vec<ScoredOutcome> = entries
            .iter()
            .filter_map(|e| match (&e.record, &e.embedding) {
                (MemoryRecord::TaskOutcome(o), Some(emb)) if o.agent_id == Some(agent_id) => {
                    Some(ScoredOutcome {
                        outcome: o.clone(),
                        similarity: cosine_similarity(&query_embedding, emb),
                    })
                }
                _ => None,
            })
            .collect();
        scored.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(limit);
        Ok(scored)
    }

    async fn search(
        &self,
        query: &str,
        tags: &[String],
        limit: usize,
    ) -> PilottResult<Vec<SearchResult>> {
        let query_embedding = if query.trim().is_empty() {
            None
        } else {
            Some(self.embedder.embed_text(query))
        };

        let entries = self.entries.read().await;
        let mut results: Vec<SearchResult> = entries
            .iter()
            .rev()
            .filter_map(|e| match &e.record {
                MemoryRecord::Knowledge(k) if tags.iter().all(|t| k.tags.contains(t)) => {
                    let score = match (&query_embedding, &e.embedding) {
                        (Some(q), Some(emb)) => cosine_similarity(q, emb),
                        _ => 0.0,
                    };
                    Some(SearchResult {
                        entry_id: e.id,
                        knowledge: k.clone(),
                        score,
                        timestamp: e.timestamp,
                    })
                }
                _ => None,
            })
            .collect();

        if query_embedding.is_some() {
            // Stable sort keeps newest-first among equal scores.
            results.sort_by(|a, b| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            results.retain(|r| r.score > 0.0);
        }
        results.truncate(limit);
        Ok(results)
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> PilottResult<usize> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|e| e.timestamp >= cutoff);
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, "Pruned memory entries");
        }
        Ok(removed)
    }

    async fn count(&self) -> PilottResult<usize> {
        Ok(self.entries.read().await.len())
    }
}
