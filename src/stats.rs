//! Knowledge-base statistics.
//!
//! Summarises what is indexed: chunk counts per source document, vector
//! dimensionality, generated test cases and scripts, and the stored HTML
//! snapshot. Used by `qa stats` to confirm ingestion and generation worked.

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::store::{SqliteStore, Store};

/// Run the stats command: query the store and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let store = SqliteStore::open(config).await?;

    let total_chunks = store.count().await?;
    let dims = store.dims().await?;
    let documents = store.documents().await?;
    let test_cases = store.test_cases().await?;
    let scripts = store.scripts().await?;
    let snapshot = store.html_snapshot().await?;
    store.close().await;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("QA Harness Knowledge Base Stats");
    println!("=================================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Documents:   {}", documents.len());
    println!("  Chunks:      {}", total_chunks);
    println!(
        "  Dimensions:  {}",
        dims.map(|d| d.to_string()).unwrap_or_else(|| "-".to_string())
    );
    println!("  Test cases:  {}", test_cases.len());
    println!("  Scripts:     {}", scripts.len());
    match &snapshot {
        Some(s) => println!(
            "  HTML page:   {} ({} elements, stored {})",
            s.filename,
            s.structure.elements.len(),
            format_relative(s.stored_at)
        ),
        None => println!("  HTML page:   none"),
    }

    if !documents.is_empty() {
        println!();
        println!("  By source:");
        println!("  {:<40} {:>8}", "SOURCE", "CHUNKS");
        println!("  {}", "-".repeat(49));
        for doc in &documents {
            println!("  {:<40} {:>8}", doc.source, doc.chunks);
        }
    }

    if let Some(last) = test_cases.last() {
        println!();
        println!(
            "  Last test case: {} ({})",
            last.id,
            format_relative(last.created_at)
        );
    }

    println!();
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a timestamp relative to now (e.g. "3 hours ago").
fn format_relative(at: DateTime<Utc>) -> String {
    let delta = (Utc::now() - at).num_seconds();

    if delta < 0 {
        at.format("%Y-%m-%d %H:%M").to_string()
    } else if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        at.format("%Y-%m-%d %H:%M").to_string()
    }
}
