//! SQLite store behaviour across connections.

mod common;

use chrono::Utc;
use tempfile::TempDir;

use common::*;
use qa_harness::config::Config;
use qa_harness::embedding::{embed_query, Embedder, HashingEmbedder};
use qa_harness::error::QaError;
use qa_harness::ingest::{ingest_files, store_html_snapshot};
use qa_harness::models::{
    Chunk, GroundingRef, IndexEntry, ScriptArtifact, TestCase, TestType, UploadedFile,
};
use qa_harness::store::{SqliteStore, Store};

fn config_in(tmp: &TempDir) -> Config {
    let mut config = Config::minimal();
    config.db.path = tmp.path().join("data").join("qa.sqlite");
    config
}

fn entry(id: &str, text: &str, embedding: Vec<f32>) -> IndexEntry {
    IndexEntry {
        chunk: Chunk {
            id: id.to_string(),
            document_id: "doc".to_string(),
            source: "doc.md".to_string(),
            chunk_index: 0,
            start: 0,
            end: text.chars().count(),
            location: None,
            text: text.to_string(),
            hash: String::new(),
        },
        embedding,
        model: "test".to_string(),
    }
}

fn test_case(id: &str) -> TestCase {
    TestCase {
        id: id.to_string(),
        feature: "Discount Code".to_string(),
        scenario: "Apply SAVE15".to_string(),
        test_type: TestType::Positive,
        preconditions: String::new(),
        steps: vec!["Enter SAVE15".to_string()],
        expected_result: "15% off".to_string(),
        grounding: vec![GroundingRef {
            document: "product_specs.md".to_string(),
            chunk_ids: vec!["c1".to_string()],
        }],
        created_at: Utc::now(),
    }
}

#[tokio::test]
async fn knowledge_base_survives_reopen() {
    let tmp = TempDir::new().unwrap();
    let config = config_in(&tmp);
    let embedder = HashingEmbedder::new(256);

    {
        let store = SqliteStore::open(&config).await.unwrap();
        let mut files = doc_files();
        files.push(UploadedFile::new("checkout.html", CHECKOUT_HTML));
        let report = ingest_files(&store, &embedder, &config, &files).await.unwrap();
        assert_eq!(report.succeeded(), 4);
        assert_eq!(report.html_snapshot.as_deref(), Some("checkout.html"));
        store.save_test_cases(&[test_case("TC-001")]).await.unwrap();
        store.close().await;
    }

    let store = SqliteStore::open(&config).await.unwrap();
    assert_eq!(store.documents().await.unwrap().len(), 4);
    assert_eq!(store.dims().await.unwrap(), Some(256));
    assert_eq!(store.next_test_case_number().await.unwrap(), 2);
    let case = store.test_case("TC-001").await.unwrap().unwrap();
    assert_eq!(case.scenario, "Apply SAVE15");
    let snapshot = store.html_snapshot().await.unwrap().unwrap();
    assert_eq!(snapshot.structure.title.as_deref(), Some("E-Shop Checkout"));

    let query = embed_query(&embedder, "SAVE15 applies a 15% discount to the cart subtotal")
        .await
        .unwrap();
    let hits = store.query(&query, 1).await.unwrap();
    assert_eq!(hits[0].chunk.source, "product_specs.md");
    store.close().await;
}

#[tokio::test]
async fn replacement_keeps_insertion_order() {
    let tmp = TempDir::new().unwrap();
    let store = SqliteStore::open(&config_in(&tmp)).await.unwrap();

    store.upsert(&entry("a", "first", vec![1.0, 0.0])).await.unwrap();
    store.upsert(&entry("b", "second", vec![1.0, 0.0])).await.unwrap();
    store.upsert(&entry("a", "first, revised", vec![1.0, 0.0])).await.unwrap();

    let hits = store.query(&[1.0, 0.0], 5).await.unwrap();
    let ids: Vec<&str> = hits.iter().map(|h| h.chunk.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b"]);
    assert_eq!(hits[0].chunk.text, "first, revised");
    assert_eq!(store.count().await.unwrap(), 2);
    store.close().await;
}

#[tokio::test]
async fn mismatched_dimensions_are_rejected_until_reset() {
    let tmp = TempDir::new().unwrap();
    let store = SqliteStore::open(&config_in(&tmp)).await.unwrap();

    store.upsert(&entry("a", "x", vec![1.0, 0.0])).await.unwrap();
    let err = store
        .upsert(&entry("b", "y", vec![1.0, 0.0, 0.0]))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        QaError::DimensionMismatch {
            expected: 2,
            actual: 3
        }
    ));

    store.reset().await.unwrap();
    store.upsert(&entry("b", "y", vec![1.0, 0.0, 0.0])).await.unwrap();
    assert_eq!(store.dims().await.unwrap(), Some(3));
    store.close().await;
}

#[tokio::test]
async fn scripts_are_replaced_per_test_case() {
    let tmp = TempDir::new().unwrap();
    let store = SqliteStore::open(&config_in(&tmp)).await.unwrap();
    store.save_test_cases(&[test_case("TC-001")]).await.unwrap();

    let mut script = ScriptArtifact {
        test_case_id: "TC-001".to_string(),
        filename: ScriptArtifact::filename_for("TC-001"),
        script: "v1".to_string(),
        selectors: vec!["#discountCode".to_string()],
        html_fingerprint: "abc".to_string(),
        grounding: Vec::new(),
        created_at: Utc::now(),
    };
    store.save_script(&script).await.unwrap();
    script.script = "v2".to_string();
    store.save_script(&script).await.unwrap();

    let scripts = store.scripts().await.unwrap();
    assert_eq!(scripts.len(), 1);
    assert_eq!(scripts[0].script, "v2");

    let err = store.save_test_cases(&[test_case("TC-001")]).await;
    assert!(err.is_err());
    store.close().await;
}

#[tokio::test]
async fn html_snapshot_is_replaced_and_survives_reset() {
    let tmp = TempDir::new().unwrap();
    let store = SqliteStore::open(&config_in(&tmp)).await.unwrap();

    store_html_snapshot(&store, &UploadedFile::new("checkout.html", CHECKOUT_HTML))
        .await
        .unwrap();
    store_html_snapshot(
        &store,
        &UploadedFile::new("login.html", "<html><body><form id=\"login\"></form></body></html>"),
    )
    .await
    .unwrap();
    store.reset().await.unwrap();

    let snapshot = store.html_snapshot().await.unwrap().unwrap();
    assert_eq!(snapshot.filename, "login.html");
    store.close().await;
}

#[tokio::test]
async fn embedder_dims_match_stored_vectors() {
    let tmp = TempDir::new().unwrap();
    let config = config_in(&tmp);
    let store = SqliteStore::open(&config).await.unwrap();
    let embedder = HashingEmbedder::new(256);

    ingest_files(&store, &embedder, &config, &doc_files()).await.unwrap();
    assert_eq!(store.dims().await.unwrap(), Some(embedder.dims()));
    store.close().await;
}

#[tokio::test]
async fn changed_document_takes_its_citing_artifacts_with_it() {
    let tmp = TempDir::new().unwrap();
    let config = config_in(&tmp);
    let store = SqliteStore::open(&config).await.unwrap();
    let embedder = HashingEmbedder::new(256);
    ingest_files(&store, &embedder, &config, &doc_files()).await.unwrap();

    let query = embed_query(&embedder, "SAVE15 discount").await.unwrap();
    let mut cases = Vec::new();
    for (id, source) in [("TC-001", "product_specs.md"), ("TC-002", "ui_ux_guide.txt")] {
        let hits = store.query(&query, 100).await.unwrap();
        let mut case = test_case(id);
        case.grounding = vec![GroundingRef {
            document: source.to_string(),
            chunk_ids: hits
                .iter()
                .filter(|h| h.chunk.source == source)
                .map(|h| h.chunk.id.clone())
                .collect(),
        }];
        cases.push(case);
    }
    store.save_test_cases(&cases).await.unwrap();

    let report = ingest_files(
        &store,
        &embedder,
        &config,
        &[UploadedFile::new("product_specs.md", "SAVE20 applies a 20% discount.")],
    )
    .await
    .unwrap();
    assert_eq!(report.invalidated_test_cases, vec!["TC-001"]);
    store.close().await;

    let store = SqliteStore::open(&config).await.unwrap();
    let remaining = store.test_cases().await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, "TC-002");
    for chunk_id in &remaining[0].grounding[0].chunk_ids {
        assert!(store.has_chunk(chunk_id).await.unwrap());
    }
    assert_eq!(store.next_test_case_number().await.unwrap(), 3);
    store.close().await;
}

