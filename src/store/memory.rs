//! In-memory [`Store`] implementation for tests and embedded use.
//!
//! Uses `Vec`s behind `std::sync::RwLock` for thread safety. Vector search
//! is brute-force cosine similarity over all stored entries.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::error::{QaError, Result};
use crate::models::{
    DocumentSummary, HtmlSnapshot, IndexEntry, RetrievedChunk, ScriptArtifact, TestCase,
};

use super::{cites_any, next_number, rank, Pruned, Store};

struct StoredEntry {
    entry: IndexEntry,
    seq: i64,
}

#[derive(Default)]
struct ChunkTable {
    rows: Vec<StoredEntry>,
    next_seq: i64,
}

/// In-memory store. Nothing survives the process.
#[derive(Default)]
pub struct InMemoryStore {
    chunks: RwLock<ChunkTable>,
    test_cases: RwLock<Vec<TestCase>>,
    scripts: RwLock<Vec<ScriptArtifact>>,
    html: RwLock<Option<HtmlSnapshot>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

// A panic while holding a lock leaves plain data behind; keep serving it.
fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

fn upsert_locked(table: &mut ChunkTable, entry: &IndexEntry) -> Result<()> {
    if let Some(existing) = table.rows.first() {
        let expected = existing.entry.embedding.len();
        if expected != entry.embedding.len() {
            return Err(QaError::DimensionMismatch {
                expected,
                actual: entry.embedding.len(),
            });
        }
    }
    match table
        .rows
        .iter_mut()
        .find(|r| r.entry.chunk.id == entry.chunk.id)
    {
        Some(row) => row.entry = entry.clone(),
        None => {
            table.next_seq += 1;
            let seq = table.next_seq;
            table.rows.push(StoredEntry {
                entry: entry.clone(),
                seq,
            });
        }
    }
    Ok(())
}

#[async_trait]
impl Store for InMemoryStore {
    async fn upsert(&self, entry: &IndexEntry) -> Result<()> {
        upsert_locked(&mut write(&self.chunks), entry)
    }

    async fn upsert_many(&self, entries: &[IndexEntry]) -> Result<()> {
        let mut table = write(&self.chunks);
        // Validate the whole batch before applying any of it.
        let expected = table
            .rows
            .first()
            .map(|r| r.entry.embedding.len())
            .or_else(|| entries.first().map(|e| e.embedding.len()));
        if let Some(expected) = expected {
            if let Some(bad) = entries.iter().find(|e| e.embedding.len() != expected) {
                return Err(QaError::DimensionMismatch {
                    expected,
                    actual: bad.embedding.len(),
                });
            }
        }
        for entry in entries {
            upsert_locked(&mut table, entry)?;
        }
        Ok(())
    }

    async fn query(&self, embedding: &[f32], k: usize) -> Result<Vec<RetrievedChunk>> {
        let table = read(&self.chunks);
        let candidates = table
            .rows
            .iter()
            .map(|r| RetrievedChunk {
                chunk: r.entry.chunk.clone(),
                score: cosine_similarity(embedding, &r.entry.embedding),
                seq: r.seq,
            })
            .collect();
        Ok(rank(candidates, k))
    }

    async fn reset(&self) -> Result<()> {
        *write(&self.chunks) = ChunkTable::default();
        write(&self.test_cases).clear();
        write(&self.scripts).clear();
        Ok(())
    }

    async fn prune_document(&self, document_id: &str, keep: &[String]) -> Result<Pruned> {
        let removed: Vec<String> = {
            let mut table = write(&self.chunks);
            let removed = table
                .rows
                .iter()
                .filter(|r| r.entry.chunk.document_id == document_id)
                .map(|r| r.entry.chunk.id.clone())
                .filter(|id| !keep.contains(id))
                .collect::<Vec<_>>();
            table.rows.retain(|r| !removed.contains(&r.entry.chunk.id));
            removed
        };
        if removed.is_empty() {
            return Ok(Pruned::default());
        }

        let stale: Vec<String> = {
            let mut cases = write(&self.test_cases);
            let stale = cases
                .iter()
                .filter(|c| cites_any(&c.grounding, &removed))
                .map(|c| c.id.clone())
                .collect::<Vec<_>>();
            cases.retain(|c| !stale.contains(&c.id));
            stale
        };
        write(&self.scripts).retain(|s| {
            !stale.contains(&s.test_case_id) && !cites_any(&s.grounding, &removed)
        });

        Ok(Pruned {
            chunks: removed.len(),
            test_cases: stale,
        })
    }

    async fn count(&self) -> Result<usize> {
        Ok(read(&self.chunks).rows.len())
    }

    async fn dims(&self) -> Result<Option<usize>> {
        Ok(read(&self.chunks)
            .rows
            .first()
            .map(|r| r.entry.embedding.len()))
    }

    async fn documents(&self) -> Result<Vec<DocumentSummary>> {
        let table = read(&self.chunks);
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for row in &table.rows {
            *counts.entry(row.entry.chunk.source.as_str()).or_default() += 1;
        }
        Ok(counts
            .into_iter()
            .map(|(source, chunks)| DocumentSummary {
                source: source.to_string(),
                chunks,
            })
            .collect())
    }

    async fn has_chunk(&self, id: &str) -> Result<bool> {
        Ok(read(&self.chunks).rows.iter().any(|r| r.entry.chunk.id == id))
    }

    async fn next_test_case_number(&self) -> Result<u32> {
        Ok(next_number(read(&self.test_cases).iter().map(|c| c.id.as_str())))
    }

    async fn save_test_cases(&self, cases: &[TestCase]) -> Result<()> {
        let mut stored = write(&self.test_cases);
        if let Some(dup) = cases.iter().find(|c| stored.iter().any(|s| s.id == c.id)) {
            return Err(QaError::Storage(format!("test case {} already exists", dup.id)));
        }
        stored.extend(cases.iter().cloned());
        Ok(())
    }

    async fn test_case(&self, id: &str) -> Result<Option<TestCase>> {
        Ok(read(&self.test_cases).iter().find(|c| c.id == id).cloned())
    }

    async fn test_cases(&self) -> Result<Vec<TestCase>> {
        Ok(read(&self.test_cases).clone())
    }

    async fn save_script(&self, script: &ScriptArtifact) -> Result<()> {
        let mut stored = write(&self.scripts);
        stored.retain(|s| s.test_case_id != script.test_case_id);
        stored.push(script.clone());
        Ok(())
    }

    async fn scripts(&self) -> Result<Vec<ScriptArtifact>> {
        Ok(read(&self.scripts).clone())
    }

    async fn set_html_snapshot(&self, snapshot: &HtmlSnapshot) -> Result<()> {
        *write(&self.html) = Some(snapshot.clone());
        Ok(())
    }

    async fn html_snapshot(&self) -> Result<Option<HtmlSnapshot>> {
        Ok(read(&self.html).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Chunk;

    fn entry(id: &str, source: &str, embedding: Vec<f32>) -> IndexEntry {
        IndexEntry {
            chunk: Chunk {
                id: id.to_string(),
                document_id: source.to_string(),
                source: source.to_string(),
                chunk_index: 0,
                start: 0,
                end: 4,
                location: None,
                text: format!("text of {}", id),
                hash: String::new(),
            },
            embedding,
            model: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn query_orders_by_score_then_insertion() {
        let store = InMemoryStore::new();
        store.upsert(&entry("a", "x.md", vec![0.0, 1.0])).await.unwrap();
        store.upsert(&entry("b", "x.md", vec![1.0, 0.0])).await.unwrap();
        store.upsert(&entry("c", "y.md", vec![1.0, 0.0])).await.unwrap();

        let hits = store.query(&[1.0, 0.0], 3).await.unwrap();
        let ids: Vec<_> = hits.iter().map(|h| h.chunk.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
    }

    #[tokio::test]
    async fn replacing_keeps_sequence() {
        let store = InMemoryStore::new();
        store.upsert(&entry("a", "x.md", vec![1.0, 0.0])).await.unwrap();
        store.upsert(&entry("b", "x.md", vec![1.0, 0.0])).await.unwrap();
        let mut replacement = entry("a", "x.md", vec![1.0, 0.0]);
        replacement.chunk.text = "updated".to_string();
        store.upsert(&replacement).await.unwrap();

        let hits = store.query(&[1.0, 0.0], 2).await.unwrap();
        assert_eq!(hits[0].chunk.id, "a");
        assert_eq!(hits[0].chunk.text, "updated");
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn dimension_mismatch_is_rejected() {
        let store = InMemoryStore::new();
        store.upsert(&entry("a", "x.md", vec![1.0, 0.0])).await.unwrap();
        let err = store
            .upsert(&entry("b", "x.md", vec![1.0, 0.0, 0.0]))
            .await
            .unwrap_err();
        assert!(matches!(err, QaError::DimensionMismatch { expected: 2, actual: 3 }));
        let err = store
            .upsert_many(&[entry("c", "x.md", vec![1.0, 0.0]), entry("d", "x.md", vec![1.0])])
            .await
            .unwrap_err();
        assert!(matches!(err, QaError::DimensionMismatch { .. }));
        assert!(!store.has_chunk("c").await.unwrap());
    }

    #[tokio::test]
    async fn replacing_the_only_entry_keeps_its_dimension() {
        let store = InMemoryStore::new();
        store.upsert(&entry("a", "x.md", vec![1.0, 0.0])).await.unwrap();
        let err = store
            .upsert(&entry("a", "x.md", vec![1.0, 0.0, 0.0]))
            .await
            .unwrap_err();
        assert!(matches!(err, QaError::DimensionMismatch { expected: 2, actual: 3 }));
        assert_eq!(store.dims().await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn reset_clears_everything_but_the_snapshot() {
        let store = InMemoryStore::new();
        store.upsert(&entry("a", "x.md", vec![1.0])).await.unwrap();
        let html = crate::html::parse_html("p.html", "<input id='q'>").unwrap();
        store
            .set_html_snapshot(&HtmlSnapshot {
                filename: "p.html".to_string(),
                structure: html,
                stored_at: chrono::Utc::now(),
            })
            .await
            .unwrap();
        store.reset().await.unwrap();
        assert_eq!(store.count().await.unwrap(), 0);
        assert_eq!(store.dims().await.unwrap(), None);
        assert!(store.html_snapshot().await.unwrap().is_some());
        // After a reset any dimensionality is accepted again.
        store.upsert(&entry("b", "x.md", vec![1.0, 0.0])).await.unwrap();
    }

    #[tokio::test]
    async fn prune_keeps_listed_chunks() {
        let store = InMemoryStore::new();
        store.upsert(&entry("a", "x.md", vec![1.0])).await.unwrap();
        store.upsert(&entry("b", "x.md", vec![1.0])).await.unwrap();
        store.upsert(&entry("c", "y.md", vec![1.0])).await.unwrap();
        let removed = store
            .prune_document("x.md", &["a".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, Pruned { chunks: 1, test_cases: Vec::new() });
        let docs = store.documents().await.unwrap();
        assert_eq!(
            docs,
            vec![
                DocumentSummary { source: "x.md".to_string(), chunks: 1 },
                DocumentSummary { source: "y.md".to_string(), chunks: 1 },
            ]
        );
    }

    fn case_citing(id: &str, chunk_ids: &[&str]) -> TestCase {
        TestCase {
            id: id.to_string(),
            feature: "Discounts".to_string(),
            scenario: "Apply SAVE15".to_string(),
            test_type: crate::models::TestType::Positive,
            preconditions: String::new(),
            steps: vec!["Enter SAVE15".to_string()],
            expected_result: "15% off".to_string(),
            grounding: vec![crate::models::GroundingRef {
                document: "x.md".to_string(),
                chunk_ids: chunk_ids.iter().map(|c| c.to_string()).collect(),
            }],
            created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn prune_drops_artifacts_citing_removed_chunks() {
        let store = InMemoryStore::new();
        store.upsert(&entry("a", "x.md", vec![1.0])).await.unwrap();
        store.upsert(&entry("b", "x.md", vec![1.0])).await.unwrap();
        store
            .save_test_cases(&[case_citing("TC-001", &["a"]), case_citing("TC-002", &["b"])])
            .await
            .unwrap();
        for id in ["TC-001", "TC-002"] {
            store
                .save_script(&ScriptArtifact {
                    test_case_id: id.to_string(),
                    filename: ScriptArtifact::filename_for(id),
                    script: "pass".to_string(),
                    selectors: Vec::new(),
                    html_fingerprint: String::new(),
                    grounding: store.test_case(id).await.unwrap().unwrap().grounding,
                    created_at: chrono::Utc::now(),
                })
                .await
                .unwrap();
        }

        let pruned = store.prune_document("x.md", &["a".to_string()]).await.unwrap();

        assert_eq!(pruned.chunks, 1);
        assert_eq!(pruned.test_cases, vec!["TC-002"]);
        let cases: Vec<String> = store.test_cases().await.unwrap().into_iter().map(|c| c.id).collect();
        assert_eq!(cases, vec!["TC-001"]);
        let scripts = store.scripts().await.unwrap();
        assert_eq!(scripts.len(), 1);
        assert_eq!(scripts[0].test_case_id, "TC-001");
        assert_eq!(store.next_test_case_number().await.unwrap(), 2);
    }
}
