//! Ingestion pipeline orchestration.
//!
//! Coordinates the flow for each uploaded file: parse → chunk → embed →
//! store. Failures are recorded per file in the [`IngestReport`]; one bad
//! file never aborts the batch. HTML uploads are indexed like any other
//! document and also become the stored page snapshot used for script
//! generation.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Utc;
use walkdir::WalkDir;

use crate::chunk::chunk_document;
use crate::config::Config;
use crate::embedding::{create_embedder, embed_checked, Embedder};
use crate::error::{QaError, Result};
use crate::html::parse_html;
use crate::models::{DocumentFormat, HtmlSnapshot, IndexEntry, UploadedFile};
use crate::parse::parse_document;
use crate::store::{SqliteStore, Store};

/// Outcome of ingesting one file.
#[derive(Debug)]
pub struct FileOutcome {
    pub filename: String,
    /// Chunks indexed from this file (0 on failure).
    pub chunks: usize,
    pub error: Option<QaError>,
}

impl FileOutcome {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Per-file results plus the total number of chunks indexed.
#[derive(Debug, Default)]
pub struct IngestReport {
    pub files: Vec<FileOutcome>,
    pub chunks_indexed: usize,
    /// Filename of the HTML page stored as the snapshot, if one was ingested.
    pub html_snapshot: Option<String>,
    /// Test cases removed because a re-ingested document no longer has
    /// the chunks they cited. Their scripts were removed too.
    pub invalidated_test_cases: Vec<String>,
}

impl IngestReport {
    pub fn succeeded(&self) -> usize {
        self.files.iter().filter(|f| f.is_ok()).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &FileOutcome> {
        self.files.iter().filter(|f| !f.is_ok())
    }
}

/// Ingest a batch of uploaded files into `store`.
pub async fn ingest_files(
    store: &dyn Store,
    embedder: &dyn Embedder,
    config: &Config,
    files: &[UploadedFile],
) -> Result<IngestReport> {
    let mut report = IngestReport::default();

    for file in files {
        match ingest_one(store, embedder, config, file).await {
            Ok(Indexed {
                chunks,
                is_html,
                invalidated,
            }) => {
                tracing::info!(file = %file.filename, chunks, "indexed document");
                if is_html {
                    report.html_snapshot = Some(file.filename.clone());
                }
                report.chunks_indexed += chunks;
                report.invalidated_test_cases.extend(invalidated);
                report.files.push(FileOutcome {
                    filename: file.filename.clone(),
                    chunks,
                    error: None,
                });
            }
            Err(e) => {
                tracing::warn!(file = %file.filename, kind = e.kind(), error = %e, "ingestion failed");
                report.files.push(FileOutcome {
                    filename: file.filename.clone(),
                    chunks: 0,
                    error: Some(e),
                });
            }
        }
    }

    Ok(report)
}

/// Clear the knowledge base, then ingest `files` from scratch.
pub async fn rebuild(
    store: &dyn Store,
    embedder: &dyn Embedder,
    config: &Config,
    files: &[UploadedFile],
) -> Result<IngestReport> {
    store.reset().await?;
    tracing::info!(files = files.len(), "rebuilding knowledge base");
    ingest_files(store, embedder, config, files).await
}

struct Indexed {
    chunks: usize,
    is_html: bool,
    invalidated: Vec<String>,
}

async fn ingest_one(
    store: &dyn Store,
    embedder: &dyn Embedder,
    config: &Config,
    file: &UploadedFile,
) -> Result<Indexed> {
    let parsed = parse_document(file)?;
    let chunks = chunk_document(&parsed.document, &parsed.segments, &config.chunking);
    if chunks.is_empty() {
        tracing::warn!(file = %file.filename, "document has no text; nothing indexed");
    }

    // Embed everything before writing so a failed batch leaves the
    // document's previous chunks in place.
    let batch_size = config.embedding.batch_size.max(1);
    let mut entries = Vec::with_capacity(chunks.len());
    for batch in chunks.chunks(batch_size) {
        let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
        let vectors = embed_checked(embedder, &texts).await?;
        for (chunk, embedding) in batch.iter().zip(vectors) {
            entries.push(IndexEntry {
                chunk: chunk.clone(),
                embedding,
                model: embedder.model_name().to_string(),
            });
        }
    }

    store.upsert_many(&entries).await?;
    let keep: Vec<String> = chunks.iter().map(|c| c.id.clone()).collect();
    let pruned = store.prune_document(&parsed.document.id, &keep).await?;
    if pruned.chunks > 0 {
        tracing::debug!(file = %file.filename, pruned = pruned.chunks, "removed stale chunks");
    }
    if !pruned.test_cases.is_empty() {
        tracing::warn!(
            file = %file.filename,
            test_cases = ?pruned.test_cases,
            "removed test cases citing replaced chunks"
        );
    }

    let is_html = match parsed.html {
        Some(structure) => {
            store
                .set_html_snapshot(&HtmlSnapshot {
                    filename: file.filename.clone(),
                    structure,
                    stored_at: Utc::now(),
                })
                .await?;
            true
        }
        None => false,
    };

    Ok(Indexed {
        chunks: entries.len(),
        is_html,
        invalidated: pruned.test_cases,
    })
}

/// Parse an HTML page and store it as the current snapshot without
/// indexing it.
pub async fn store_html_snapshot(store: &dyn Store, file: &UploadedFile) -> Result<HtmlSnapshot> {
    let source = std::str::from_utf8(&file.bytes)
        .map_err(|e| QaError::parse(&file.filename, format!("invalid UTF-8: {}", e)))?;
    let snapshot = HtmlSnapshot {
        filename: file.filename.clone(),
        structure: parse_html(&file.filename, source)?,
        stored_at: Utc::now(),
    };
    store.set_html_snapshot(&snapshot).await?;
    Ok(snapshot)
}

/// Read files named on the command line. Directories are walked
/// recursively (sorted by name) and only files with a supported
/// extension are taken from them; explicitly named files are always
/// taken so an unsupported format is reported. Unreadable files become
/// failed outcomes.
pub fn collect_files(paths: &[PathBuf]) -> (Vec<UploadedFile>, Vec<FileOutcome>) {
    let mut files = Vec::new();
    let mut failures = Vec::new();

    let mut read = |path: &Path, name: String| match std::fs::read(path) {
        Ok(bytes) => files.push(UploadedFile::new(name, bytes)),
        Err(e) => failures.push(FileOutcome {
            filename: name.clone(),
            chunks: 0,
            error: Some(QaError::parse(name, e)),
        }),
    };

    for path in paths {
        if path.is_dir() {
            for entry in WalkDir::new(path)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
            {
                let supported = entry
                    .path()
                    .extension()
                    .and_then(|e| e.to_str())
                    .and_then(DocumentFormat::from_extension)
                    .is_some();
                if !supported {
                    continue;
                }
                let rel = entry
                    .path()
                    .strip_prefix(path)
                    .unwrap_or(entry.path())
                    .to_string_lossy()
                    .replace('\\', "/");
                read(entry.path(), rel);
            }
        } else {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| path.display().to_string());
            read(path, name);
        }
    }

    (files, failures)
}

/// CLI entry point for `qa ingest`.
pub async fn run_ingest(config: &Config, paths: &[PathBuf], rebuild_kb: bool) -> anyhow::Result<()> {
    let store = SqliteStore::open(config).await?;
    let embedder = create_embedder(&config.embedding).context("Failed to create embedder")?;

    let (files, read_failures) = collect_files(paths);
    let mut report = if rebuild_kb {
        rebuild(&store, embedder.as_ref(), config, &files).await?
    } else {
        ingest_files(&store, embedder.as_ref(), config, &files).await?
    };
    report.files.extend(read_failures);

    println!("ingest{}", if rebuild_kb { " (rebuild)" } else { "" });
    for outcome in &report.files {
        match &outcome.error {
            None => println!("  ok      {} ({} chunks)", outcome.filename, outcome.chunks),
            Some(e) => println!("  failed  {}: {}: {}", outcome.filename, e.kind(), e),
        }
    }
    println!(
        "  files: {} ok, {} failed",
        report.succeeded(),
        report.files.len() - report.succeeded()
    );
    println!("  chunks indexed: {}", report.chunks_indexed);
    if let Some(html) = &report.html_snapshot {
        println!("  html snapshot: {}", html);
    }
    if !report.invalidated_test_cases.is_empty() {
        println!(
            "  removed test cases citing replaced chunks: {}",
            report.invalidated_test_cases.join(", ")
        );
    }
    println!("ok");

    store.close().await;
    Ok(())
}

/// CLI entry point for `qa reset`.
pub async fn run_reset(config: &Config) -> anyhow::Result<()> {
    let store = SqliteStore::open(config).await?;
    store.reset().await?;
    println!("reset: knowledge base cleared (chunks, test cases, scripts)");
    store.close().await;
    Ok(())
}

/// CLI entry point for `qa html <file>`.
pub async fn run_html(config: &Config, path: &Path) -> anyhow::Result<()> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read HTML file: {}", path.display()))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());

    let store = SqliteStore::open(config).await?;
    let snapshot = store_html_snapshot(&store, &UploadedFile::new(name, bytes)).await?;

    println!("html snapshot: {}", snapshot.filename);
    if let Some(title) = &snapshot.structure.title {
        println!("  title: {}", title);
    }
    println!("  elements: {}", snapshot.structure.elements.len());
    println!("  fingerprint: {}", &snapshot.structure.fingerprint[..12]);
    println!("{}", snapshot.structure.describe_elements());

    store.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingEmbedder;
    use crate::store::InMemoryStore;

    #[tokio::test]
    async fn one_bad_file_does_not_abort_the_batch() {
        let store = InMemoryStore::new();
        let embedder = HashingEmbedder::new(64);
        let config = Config::minimal();
        let files = vec![
            UploadedFile::new("a.md", "# A\n\nAlpha content."),
            UploadedFile::new("bad.json", "{oops"),
            UploadedFile::new("deck.pptx", "binary"),
            UploadedFile::new("b.txt", "Beta content."),
        ];
        let report = ingest_files(&store, &embedder, &config, &files).await.unwrap();
        assert_eq!(report.succeeded(), 2);
        let kinds: Vec<_> = report
            .failures()
            .map(|f| f.error.as_ref().unwrap().kind())
            .collect();
        assert_eq!(kinds, vec!["ParseError", "UnsupportedFormat"]);
        assert_eq!(report.chunks_indexed, store.count().await.unwrap());
    }

    #[tokio::test]
    async fn reingesting_a_changed_file_drops_stale_chunks() {
        let store = InMemoryStore::new();
        let embedder = HashingEmbedder::new(64);
        let mut config = Config::minimal();
        config.chunking.chunk_size = 40;
        config.chunking.chunk_overlap = 0;

        let long = "First sentence here. Second sentence here. Third sentence here.";
        ingest_files(&store, &embedder, &config, &[UploadedFile::new("a.txt", long)])
            .await
            .unwrap();
        assert!(store.count().await.unwrap() > 1);

        ingest_files(&store, &embedder, &config, &[UploadedFile::new("a.txt", "Short.")])
            .await
            .unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn html_upload_becomes_snapshot() {
        let store = InMemoryStore::new();
        let embedder = HashingEmbedder::new(64);
        let files = vec![UploadedFile::new(
            "checkout.html",
            "<html><title>Shop</title><body><input id='discountCode'></body></html>",
        )];
        let report = ingest_files(&store, &embedder, &Config::minimal(), &files)
            .await
            .unwrap();
        assert_eq!(report.html_snapshot.as_deref(), Some("checkout.html"));
        let snapshot = store.html_snapshot().await.unwrap().unwrap();
        assert!(snapshot.structure.contains_selector("#discountCode"));
    }

    #[test]
    fn directories_are_walked_for_supported_files() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("docs/nested")).unwrap();
        std::fs::write(tmp.path().join("docs/a.md"), "a").unwrap();
        std::fs::write(tmp.path().join("docs/nested/b.json"), "{}").unwrap();
        std::fs::write(tmp.path().join("docs/skip.png"), "x").unwrap();

        let (files, failures) = collect_files(&[
            tmp.path().join("docs"),
            tmp.path().join("missing.txt"),
        ]);
        let names: Vec<_> = files.iter().map(|f| f.filename.as_str()).collect();
        assert_eq!(names, vec!["a.md", "nested/b.json"]);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].filename, "missing.txt");
    }
}
