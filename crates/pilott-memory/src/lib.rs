//! Task history and knowledge memory shared by Pilott agents.
//!
//! The store is append-only and bounded: it keeps a capacity window of the
//! most recent entries and can be pruned by age. Queries are read-only
//! projections (recent outcomes per agent, similarity and tag search).
//!
//! # Main types
//!
//! - [`MemoryStore`] — Async boundary agents use to record and recall work.
//! - [`InMemoryStore`] — Bounded in-process implementation.
//! - [`LocalEmbedding`] — Hashed bag-of-words embedding used for similarity.

/// Embedding provider trait and local implementation.
pub mod embedding;
/// Memory store trait and bounded in-memory implementation.
pub mod store;

pub use embedding::{cosine_similarity, EmbeddingProvider, LocalEmbedding};
pub use store::{
    InMemoryStore, Knowledge, MemoryEntry, MemoryRecord, MemoryStore, SearchResult, ScoredOutcome,
    TaskOutcome, DEFAULT_CAPACITY,
};
