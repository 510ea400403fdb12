//! Storage abstraction for the knowledge base.
//!
//! The [`Store`] trait covers everything the pipeline persists: indexed
//! chunks with their embeddings, generated test cases and scripts, and the
//! current HTML page snapshot. Two backends implement it:
//!
//! - [`SqliteStore`]: on-disk, survives restarts (the CLI's store).
//! - [`InMemoryStore`]: `RwLock`-guarded, for tests and embedding in other programs.
//!
//! Concurrent `upsert` and `query` calls are made safe by the backend
//! itself (SQLite transactions, `RwLock`); this layer adds no locking.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{
    DocumentSummary, GroundingRef, HtmlSnapshot, IndexEntry, RetrievedChunk, ScriptArtifact,
    TestCase,
};

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

/// What [`Store::prune_document`] removed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Pruned {
    pub chunks: usize,
    /// Test cases that cited a removed chunk. Their scripts go with them.
    pub test_cases: Vec<String>,
}

/// Abstract storage backend.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert`](Store::upsert) | Add or replace an index entry, keyed by chunk id |
/// | [`query`](Store::query) | Top-k entries by cosine similarity |
/// | [`reset`](Store::reset) | Clear chunks, test cases and scripts |
/// | [`prune_document`](Store::prune_document) | Drop a document's stale chunks and the artifacts citing them |
/// | [`save_test_cases`](Store::save_test_cases) | Persist a generated batch |
/// | [`save_script`](Store::save_script) | Persist a generated script |
/// | [`set_html_snapshot`](Store::set_html_snapshot) | Replace the page snapshot |
#[async_trait]
pub trait Store: Send + Sync {
    /// Add an entry, or replace the one with the same chunk id. A replaced
    /// entry keeps its original insertion sequence. Entries whose
    /// dimensionality differs from the indexed vectors are rejected with
    /// [`QaError::DimensionMismatch`](crate::error::QaError::DimensionMismatch).
    async fn upsert(&self, entry: &IndexEntry) -> Result<()>;

    /// Upsert a batch. Backends with transactions apply it atomically.
    async fn upsert_many(&self, entries: &[IndexEntry]) -> Result<()> {
        for entry in entries {
            self.upsert(entry).await?;
        }
        Ok(())
    }

    /// The `k` entries most similar to `embedding`, best first; equal
    /// scores are ordered by insertion sequence, earliest first.
    async fn query(&self, embedding: &[f32], k: usize) -> Result<Vec<RetrievedChunk>>;

    /// Remove all chunks, test cases and scripts. The HTML snapshot is kept.
    async fn reset(&self) -> Result<()>;

    /// Remove chunks of `document_id` whose ids are not in `keep`, along
    /// with every test case and script citing one of them.
    async fn prune_document(&self, document_id: &str, keep: &[String]) -> Result<Pruned>;

    /// Number of indexed chunks.
    async fn count(&self) -> Result<usize>;

    /// Dimensionality of the indexed vectors, if any are stored.
    async fn dims(&self) -> Result<Option<usize>>;

    /// Indexed sources with their chunk counts, by source name.
    async fn documents(&self) -> Result<Vec<DocumentSummary>>;

    async fn has_chunk(&self, id: &str) -> Result<bool>;

    /// Number the next generated test case will carry: one past the
    /// highest stored `TC-NNN`.
    async fn next_test_case_number(&self) -> Result<u32>;

    async fn save_test_cases(&self, cases: &[TestCase]) -> Result<()>;

    async fn test_case(&self, id: &str) -> Result<Option<TestCase>>;

    /// All test cases in generation order.
    async fn test_cases(&self) -> Result<Vec<TestCase>>;

    /// Store a script, replacing any earlier script for the same test case.
    async fn save_script(&self, script: &ScriptArtifact) -> Result<()>;

    async fn scripts(&self) -> Result<Vec<ScriptArtifact>>;

    async fn set_html_snapshot(&self, snapshot: &HtmlSnapshot) -> Result<()>;

    async fn html_snapshot(&self) -> Result<Option<HtmlSnapshot>>;
}

/// True when `grounding` cites any of `chunk_ids`.
pub(crate) fn cites_any(grounding: &[GroundingRef], chunk_ids: &[String]) -> bool {
    grounding
        .iter()
        .flat_map(|g| g.chunk_ids.iter())
        .any(|id| chunk_ids.contains(id))
}

pub(crate) fn next_number<'a>(ids: impl IntoIterator<Item = &'a str>) -> u32 {
    ids.into_iter()
        .filter_map(TestCase::number_of)
        .max()
        .unwrap_or(0)
        + 1
}

/// Sort by score descending, then sequence ascending, and keep the top `k`.
pub(crate) fn rank(mut candidates: Vec<RetrievedChunk>, k: usize) -> Vec<RetrievedChunk> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.seq.cmp(&b.seq)));
    candidates.truncate(k);
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Chunk;

    fn hit(id: &str, score: f32, seq: i64) -> RetrievedChunk {
        RetrievedChunk {
            chunk: Chunk {
                id: id.to_string(),
                document_id: "d".to_string(),
                source: "d.md".to_string(),
                chunk_index: 0,
                start: 0,
                end: 1,
                location: None,
                text: "x".to_string(),
                hash: String::new(),
            },
            score,
            seq,
        }
    }

    #[test]
    fn ties_break_by_insertion_order() {
        let ranked = rank(
            vec![hit("late", 0.5, 9), hit("best", 0.9, 5), hit("early", 0.5, 2)],
            3,
        );
        let ids: Vec<_> = ranked.iter().map(|r| r.chunk.id.as_str()).collect();
        assert_eq!(ids, vec!["best", "early", "late"]);
    }

    #[test]
    fn numbering_continues_past_gaps() {
        assert_eq!(next_number(Vec::<&str>::new()), 1);
        assert_eq!(next_number(["TC-002", "TC-007", "custom"]), 8);
    }

    #[test]
    fn rank_truncates() {
        let ranked = rank(vec![hit("a", 0.1, 1), hit("b", 0.2, 2)], 1);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].chunk.id, "b");
    }
}
