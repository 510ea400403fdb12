use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn qa_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("qa");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let docs_dir = root.join("docs");
    fs::create_dir_all(docs_dir.join("nested")).unwrap();
    fs::write(
        docs_dir.join("product_specs.md"),
        "# Discount Codes\n\nThe discount code SAVE15 applies a 15% discount.\n\n# Shipping\n\nExpress shipping costs $10.",
    )
    .unwrap();
    fs::write(
        docs_dir.join("nested").join("ui_ux_guide.txt"),
        "Error messages are displayed in red text below the field.",
    )
    .unwrap();
    fs::write(
        docs_dir.join("api_endpoints.json"),
        r#"{"apply_coupon": {"method": "POST", "path": "/api/coupon"}}"#,
    )
    .unwrap();
    fs::write(docs_dir.join("broken.pdf"), b"%PDF-1.4 not a real pdf").unwrap();
    fs::write(docs_dir.join("notes.docx"), b"ignored").unwrap();

    let pages_dir = root.join("pages");
    fs::create_dir_all(&pages_dir).unwrap();
    fs::write(
        pages_dir.join("checkout.html"),
        r#"<html><head><title>Checkout</title></head><body>
<form id="checkoutForm">
  <input type="text" id="discountCode" name="discount_code">
  <button type="button" id="applyDiscount">Apply</button>
</form></body></html>"#,
    )
    .unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/qa.sqlite"

[chunking]
chunk_size = 500
chunk_overlap = 50

[retrieval]
top_k = 3

[embedding]
provider = "hashing"
dims = 256

[llm]
provider = "disabled"

[output]
scripts_dir = "{root}/generated_scripts"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("qa.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_qa(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = qa_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run qa binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_qa(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data").join("qa.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_qa(&config_path, &["init"]);
    assert!(success1, "First init failed");
    let (_, _, success2) = run_qa(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_ingest_reports_per_file() {
    let (tmp, config_path) = setup_test_env();
    let docs = tmp.path().join("docs");

    let (stdout, stderr, success) = run_qa(&config_path, &["ingest", docs.to_str().unwrap()]);
    assert!(success, "ingest failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("ok      product_specs.md"));
    assert!(stdout.contains("ok      nested/ui_ux_guide.txt"));
    assert!(stdout.contains("failed  broken.pdf: ParseError"));
    assert!(stdout.contains("files: 3 ok, 1 failed"));
    assert!(!stdout.contains("notes.docx"));
    assert!(stdout.trim_end().ends_with("ok"));
}

#[test]
fn test_search_returns_grounded_chunks() {
    let (tmp, config_path) = setup_test_env();
    let docs = tmp.path().join("docs");
    run_qa(&config_path, &["ingest", docs.to_str().unwrap()]);

    let (stdout, _, success) = run_qa(&config_path, &["search", "SAVE15 discount", "--limit", "1"]);
    assert!(success);
    assert!(stdout.contains("1. ["), "got: {}", stdout);
    assert!(stdout.contains("product_specs.md"), "got: {}", stdout);
    assert!(!stdout.contains("2. ["));
}

#[test]
fn test_search_empty_knowledge_base() {
    let (_tmp, config_path) = setup_test_env();
    run_qa(&config_path, &["init"]);

    let (stdout, _, success) = run_qa(&config_path, &["search", "anything"]);
    assert!(success);
    assert!(stdout.contains("knowledge base is empty"));
}

#[test]
fn test_rebuild_replaces_index() {
    let (tmp, config_path) = setup_test_env();
    let docs = tmp.path().join("docs");
    run_qa(&config_path, &["ingest", docs.to_str().unwrap()]);

    let only = docs.join("api_endpoints.json");
    let (stdout, _, success) =
        run_qa(&config_path, &["ingest", only.to_str().unwrap(), "--rebuild"]);
    assert!(success);
    assert!(stdout.contains("ingest (rebuild)"));

    let (stats, _, _) = run_qa(&config_path, &["stats"]);
    assert!(stats.contains("Documents:   1"), "got: {}", stats);
    assert!(stats.contains("api_endpoints.json"));
    assert!(!stats.contains("product_specs.md"));
}

#[test]
fn test_html_snapshot_and_stats() {
    let (tmp, config_path) = setup_test_env();
    let page = tmp.path().join("pages").join("checkout.html");

    let (stdout, stderr, success) = run_qa(&config_path, &["html", page.to_str().unwrap()]);
    assert!(success, "html failed: {}", stderr);
    assert!(stdout.contains("html snapshot: checkout.html"));
    assert!(stdout.contains("#discountCode"));

    run_qa(&config_path, &["reset"]);
    let (stats, _, _) = run_qa(&config_path, &["stats"]);
    assert!(stats.contains("HTML page:   checkout.html"), "got: {}", stats);
    assert!(stats.contains("Chunks:      0"));
}

#[test]
fn test_generation_requires_llm_provider() {
    let (tmp, config_path) = setup_test_env();
    let docs = tmp.path().join("docs");
    run_qa(&config_path, &["ingest", docs.to_str().unwrap()]);

    let (_, stderr, success) = run_qa(&config_path, &["generate", "tests", "discount codes"]);
    assert!(!success);
    assert!(stderr.contains("disabled"), "got: {}", stderr);
}

#[test]
fn test_list_commands_on_fresh_database() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success) = run_qa(&config_path, &["list", "tests"]);
    assert!(success);
    assert!(stdout.contains("No test cases"));

    let (stdout, _, success) = run_qa(&config_path, &["list", "scripts"]);
    assert!(success);
    assert!(stdout.contains("No scripts"));
}

#[test]
fn test_invalid_config_is_rejected() {
    let (tmp, config_path) = setup_test_env();
    let bad = tmp.path().join("config").join("bad.toml");
    fs::write(
        &bad,
        fs::read_to_string(&config_path)
            .unwrap()
            .replace("chunk_overlap = 50", "chunk_overlap = 900"),
    )
    .unwrap();

    let (_, stderr, success) = run_qa(&bad, &["init"]);
    assert!(!success);
    assert!(stderr.contains("chunk_overlap"));
}
