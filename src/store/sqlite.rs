//! SQLite-backed [`Store`] implementation.
//!
//! Chunks, embeddings (little-endian `f32` BLOBs), test cases, scripts and
//! the HTML snapshot live in one database file. Similarity search loads the
//! vectors and ranks them in process; knowledge bases for a single
//! application's documentation stay small enough for that.

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::{QaError, Result};
use crate::migrate;
use crate::models::{
    Chunk, DocumentSummary, HtmlSnapshot, IndexEntry, RetrievedChunk, ScriptArtifact, TestCase,
};

use super::{cites_any, next_number, rank, Pruned, Store};

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to `db.path`, creating the file and schema if needed.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(&config.db.path).await?;
        migrate::run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn chunk_from_row(row: &SqliteRow) -> Chunk {
    let start: i64 = row.get("start_offset");
    let end: i64 = row.get("end_offset");
    Chunk {
        id: row.get("id"),
        document_id: row.get("document_id"),
        source: row.get("source"),
        chunk_index: row.get("chunk_index"),
        start: start as usize,
        end: end as usize,
        location: row.get("location"),
        text: row.get("text"),
        hash: row.get("hash"),
    }
}

async fn check_dims<'e, E>(executor: E, actual: usize) -> Result<()>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let existing: Option<i64> = sqlx::query_scalar("SELECT dims FROM chunks LIMIT 1")
        .fetch_optional(executor)
        .await?;
    match existing {
        Some(expected) if expected as usize != actual => Err(QaError::DimensionMismatch {
            expected: expected as usize,
            actual,
        }),
        _ => Ok(()),
    }
}

async fn upsert_row<'e, E>(executor: E, entry: &IndexEntry) -> Result<()>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let chunk = &entry.chunk;
    sqlx::query(
        r#"
        INSERT INTO chunks (id, document_id, source, chunk_index, start_offset, end_offset,
                            location, text, hash, model, dims, embedding)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            document_id = excluded.document_id,
            source = excluded.source,
            chunk_index = excluded.chunk_index,
            start_offset = excluded.start_offset,
            end_offset = excluded.end_offset,
            location = excluded.location,
            text = excluded.text,
            hash = excluded.hash,
            model = excluded.model,
            dims = excluded.dims,
            embedding = excluded.embedding
        "#,
    )
    .bind(&chunk.id)
    .bind(&chunk.document_id)
    .bind(&chunk.source)
    .bind(chunk.chunk_index)
    .bind(chunk.start as i64)
    .bind(chunk.end as i64)
    .bind(&chunk.location)
    .bind(&chunk.text)
    .bind(&chunk.hash)
    .bind(&entry.model)
    .bind(entry.embedding.len() as i64)
    .bind(vec_to_blob(&entry.embedding))
    .execute(executor)
    .await?;
    Ok(())
}

#[async_trait]
impl Store for SqliteStore {
    async fn upsert(&self, entry: &IndexEntry) -> Result<()> {
        self.upsert_many(std::slice::from_ref(entry)).await
    }

    async fn upsert_many(&self, entries: &[IndexEntry]) -> Result<()> {
        let Some(first) = entries.first() else {
            return Ok(());
        };
        let dims = first.embedding.len();
        if let Some(bad) = entries.iter().find(|e| e.embedding.len() != dims) {
            return Err(QaError::DimensionMismatch {
                expected: dims,
                actual: bad.embedding.len(),
            });
        }

        let mut tx = self.pool.begin().await?;
        check_dims(&mut *tx, dims).await?;
        for entry in entries {
            upsert_row(&mut *tx, entry).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn query(&self, embedding: &[f32], k: usize) -> Result<Vec<RetrievedChunk>> {
        let rows = sqlx::query(
            r#"
            SELECT seq, id, document_id, source, chunk_index, start_offset, end_offset,
                   location, text, hash, embedding
            FROM chunks
            ORDER BY seq ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let candidates = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                RetrievedChunk {
                    chunk: chunk_from_row(row),
                    score: cosine_similarity(embedding, &blob_to_vec(&blob)),
                    seq: row.get("seq"),
                }
            })
            .collect();

        Ok(rank(candidates, k))
    }

    async fn reset(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM test_cases").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM scripts").execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn prune_document(&self, document_id: &str, keep: &[String]) -> Result<Pruned> {
        let mut tx = self.pool.begin().await?;
        let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .fetch_all(&mut *tx)
            .await?;
        let removed: Vec<String> = ids.into_iter().filter(|id| !keep.contains(id)).collect();
        if removed.is_empty() {
            return Ok(Pruned::default());
        }
        for id in &removed {
            sqlx::query("DELETE FROM chunks WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        let cases: Vec<String> = sqlx::query_scalar("SELECT body_json FROM test_cases ORDER BY seq ASC")
            .fetch_all(&mut *tx)
            .await?;
        let mut stale = Vec::new();
        for body in &cases {
            let case: TestCase = serde_json::from_str(body)?;
            if cites_any(&case.grounding, &removed) {
                sqlx::query("DELETE FROM test_cases WHERE id = ?")
                    .bind(&case.id)
                    .execute(&mut *tx)
                    .await?;
                stale.push(case.id);
            }
        }

        let scripts: Vec<String> = sqlx::query_scalar("SELECT body_json FROM scripts")
            .fetch_all(&mut *tx)
            .await?;
        for body in &scripts {
            let script: ScriptArtifact = serde_json::from_str(body)?;
            if stale.contains(&script.test_case_id) || cites_any(&script.grounding, &removed) {
                sqlx::query("DELETE FROM scripts WHERE test_case_id = ?")
                    .bind(&script.test_case_id)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;
        Ok(Pruned {
            chunks: removed.len(),
            test_cases: stale,
        })
    }

    async fn count(&self) -> Result<usize> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        Ok(n as usize)
    }

    async fn dims(&self) -> Result<Option<usize>> {
        let dims: Option<i64> = sqlx::query_scalar("SELECT dims FROM chunks LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(dims.map(|d| d as usize))
    }

    async fn documents(&self) -> Result<Vec<DocumentSummary>> {
        let rows = sqlx::query(
            "SELECT source, COUNT(*) AS chunks FROM chunks GROUP BY source ORDER BY source",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let chunks: i64 = row.get("chunks");
                DocumentSummary {
                    source: row.get("source"),
                    chunks: chunks as usize,
                }
            })
            .collect())
    }

    async fn has_chunk(&self, id: &str) -> Result<bool> {
        let found: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM chunks WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Ok(found)
    }

    async fn next_test_case_number(&self) -> Result<u32> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM test_cases")
            .fetch_all(&self.pool)
            .await?;
        Ok(next_number(ids.iter().map(String::as_str)))
    }

    async fn save_test_cases(&self, cases: &[TestCase]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for case in cases {
            sqlx::query("INSERT INTO test_cases (id, body_json, created_at) VALUES (?, ?, ?)")
                .bind(&case.id)
                .bind(serde_json::to_string(case)?)
                .bind(case.created_at.timestamp())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn test_case(&self, id: &str) -> Result<Option<TestCase>> {
        let body: Option<String> = sqlx::query_scalar("SELECT body_json FROM test_cases WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        body.map(|b| serde_json::from_str(&b).map_err(QaError::from))
            .transpose()
    }

    async fn test_cases(&self) -> Result<Vec<TestCase>> {
        let bodies: Vec<String> =
            sqlx::query_scalar("SELECT body_json FROM test_cases ORDER BY seq ASC")
                .fetch_all(&self.pool)
                .await?;
        bodies
            .iter()
            .map(|b| serde_json::from_str(b).map_err(QaError::from))
            .collect()
    }

    async fn save_script(&self, script: &ScriptArtifact) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scripts (test_case_id, body_json, created_at)
            VALUES (?, ?, ?)
            ON CONFLICT(test_case_id) DO UPDATE SET
                body_json = excluded.body_json,
                created_at = excluded.created_at
            "#,
        )
        .bind(&script.test_case_id)
        .bind(serde_json::to_string(script)?)
        .bind(script.created_at.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn scripts(&self) -> Result<Vec<ScriptArtifact>> {
        let bodies: Vec<String> = sqlx::query_scalar("SELECT body_json FROM scripts ORDER BY seq ASC")
            .fetch_all(&self.pool)
            .await?;
        bodies
            .iter()
            .map(|b| serde_json::from_str(b).map_err(QaError::from))
            .collect()
    }

    async fn set_html_snapshot(&self, snapshot: &HtmlSnapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO html_snapshot (slot, body_json, stored_at)
            VALUES (1, ?, ?)
            ON CONFLICT(slot) DO UPDATE SET
                body_json = excluded.body_json,
                stored_at = excluded.stored_at
            "#,
        )
        .bind(serde_json::to_string(snapshot)?)
        .bind(snapshot.stored_at.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn html_snapshot(&self) -> Result<Option<HtmlSnapshot>> {
        let body: Option<String> =
            sqlx::query_scalar("SELECT body_json FROM html_snapshot WHERE slot = 1")
                .fetch_optional(&self.pool)
                .await?;
        body.map(|b| serde_json::from_str(&b).map_err(QaError::from))
            .transpose()
    }
}
