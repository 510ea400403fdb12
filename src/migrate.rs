use sqlx::SqlitePool;

use crate::error::Result;

/// Create the knowledge-base schema. Idempotent.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Chunks and their embeddings. `seq` records insertion order and is
    // kept when a chunk is replaced.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            document_id TEXT NOT NULL,
            source TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            start_offset INTEGER NOT NULL,
            end_offset INTEGER NOT NULL,
            location TEXT,
            text TEXT NOT NULL,
            hash TEXT NOT NULL,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            embedding BLOB NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Generated test cases, stored as JSON bodies in generation order.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS test_cases (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            body_json TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS scripts (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            test_case_id TEXT NOT NULL UNIQUE,
            body_json TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // At most one HTML snapshot; a new upload replaces it.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS html_snapshot (
            slot INTEGER PRIMARY KEY CHECK (slot = 1),
            body_json TEXT NOT NULL,
            stored_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_source ON chunks(source)")
        .execute(pool)
        .await?;

    Ok(())
}
