//! Selenium script generation.
//!
//! Turns a stored test case plus the stored HTML snapshot into a Python
//! Selenium script. The model must report the selectors it relies on and
//! any elements the page lacks; every reported selector and every `By.*`
//! locator in the script is checked against the snapshot. A script that
//! would touch an element the page does not have is rejected with
//! [`QaError::SelectorNotFound`] and is never stored or retried.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use crate::agent::{AgentRun, AgentState};
use crate::config::Config;
use crate::embedding::{create_embedder, Embedder};
use crate::error::{QaError, Result};
use crate::html::HtmlStructure;
use crate::llm::{complete_with_timeout, create_model, ChatRequest, LanguageModel};
use crate::models::{HtmlSnapshot, ScriptArtifact, TestCase};
use crate::retrieval::{format_context, Retriever};
use crate::store::{SqliteStore, Store};

pub const SYSTEM_PROMPT: &str = r##"You are an expert Selenium WebDriver (Python) developer.
Your task is to generate clean, executable Selenium test scripts.

CRITICAL REQUIREMENTS:
1. Use ONLY the element selectors (IDs, names, classes) listed under HTML ELEMENTS AVAILABLE
2. If the test case needs an element that is not listed, do not invent one: report it in "missing_elements"
3. Generate COMPLETE, RUNNABLE Python code with imports and setup
4. Add explicit waits for element loading
5. Include assertions that verify the expected result
6. Use Chrome WebDriver with webdriver-manager:
   service = Service(ChromeDriverManager().install())
   driver = webdriver.Chrome(service=service)

OUTPUT FORMAT:
Return a single JSON object:
{
  "selectors": ["#elementId", "input[name='email']"],
  "missing_elements": [],
  "script": "from selenium import webdriver\n..."
}
"selectors" lists every element the script locates, as CSS selectors."##;

pub const SELENIUM_IMPORTS: &str = "from selenium import webdriver
from selenium.webdriver.common.by import By
from selenium.webdriver.support.ui import WebDriverWait
from selenium.webdriver.support import expected_conditions as EC
from selenium.webdriver.chrome.service import Service
from webdriver_manager.chrome import ChromeDriverManager
from selenium.common.exceptions import TimeoutException, NoSuchElementException
import time
import os

";

static JSON_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```json\s*(.*?)\s*```").expect("valid fence regex"));

static CODE_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"```(?:python|py)?").expect("valid code fence regex"));

/// Any element lookup call, including the legacy `find_element_by_*` form.
static LOOKUP_CALL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\bfind_elements?(?:_by_([a-z_]+))?\s*\(").expect("valid lookup call regex")
});

/// `By.<KIND>` wherever it appears, e.g. inside expected-condition tuples.
static BY_KIND: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bBy\.[A-Z_]+").expect("valid By regex"));

/// `By.` opening the first argument of a call.
static CALL_BY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(?:by\s*=\s*)?By\.").expect("valid call By regex"));

/// `(by, value)` arguments with a literal value, anchored at the first argument.
static LOCATOR_ARGS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"^\s*(?:by\s*=\s*)?(?:By\.([A-Z_]+)|"([a-z ]+)"|'([a-z ]+)')\s*,\s*(?:value\s*=\s*)?(?:"([^"\\]*)"|'([^'\\]*)')\s*[),]"#,
    )
    .expect("valid locator args regex")
});

/// Single literal argument of a legacy `find_element_by_*` call.
static LEGACY_ARG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\s*(?:"([^"\\]*)"|'([^'\\]*)')\s*\)"#).expect("valid legacy arg regex")
});

/// Result of a successful script generation.
#[derive(Debug, Clone)]
pub struct ScriptGeneration {
    pub artifact: ScriptArtifact,
    pub attempts: u32,
    pub states: Vec<AgentState>,
}

#[derive(Debug, Deserialize)]
struct RawScript {
    #[serde(default)]
    selectors: Vec<String>,
    #[serde(default)]
    missing_elements: Vec<String>,
    script: String,
}

pub struct ScriptAgent {
    retriever: Retriever,
    model: Arc<dyn LanguageModel>,
    context_k: usize,
    temperature: f32,
    max_tokens: u32,
    timeout: Duration,
}

impl ScriptAgent {
    pub fn new(retriever: Retriever, model: Arc<dyn LanguageModel>, config: &Config) -> Self {
        Self {
            retriever,
            model,
            context_k: config.retrieval.script_context_k,
            temperature: config.llm.temperature,
            max_tokens: config.llm.max_tokens,
            timeout: Duration::from_secs(config.llm.timeout_secs),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Generate, verify and store the script for `test_case_id`.
    pub async fn generate(&self, test_case_id: &str) -> Result<ScriptGeneration> {
        let mut run = AgentRun::new("script");
        match self.drive(&mut run, test_case_id.trim()).await {
            Ok(artifact) => {
                run.advance(AgentState::Done)?;
                tracing::info!(
                    test_case = %artifact.test_case_id,
                    selectors = artifact.selectors.len(),
                    "generated script"
                );
                Ok(ScriptGeneration {
                    artifact,
                    attempts: run.attempts(),
                    states: run.history().to_vec(),
                })
            }
            Err(e) => {
                run.fail();
                tracing::warn!(error = %e, test_case = test_case_id, "script generation failed");
                Err(e)
            }
        }
    }

    async fn drive(&self, run: &mut AgentRun, test_case_id: &str) -> Result<ScriptArtifact> {
        run.advance(AgentState::Retrieving)?;
        let store = self.retriever.store();
        if store.count().await? == 0 {
            return Err(QaError::EmptyKnowledgeBase);
        }
        let case = store
            .test_case(test_case_id)
            .await?
            .ok_or_else(|| QaError::TestCaseNotFound(test_case_id.to_string()))?;
        let snapshot = store
            .html_snapshot()
            .await?
            .ok_or(QaError::MissingHtmlSnapshot)?;
        let documentation = self.documentation_for(&case).await?;
        let base_prompt = script_prompt(&case, &snapshot, &documentation);

        let mut correction: Option<String> = None;
        loop {
            run.advance(AgentState::Prompting)?;
            let mut user = base_prompt.clone();
            if let Some(reason) = &correction {
                user.push_str(&format!(
                    "\n\nYour previous response could not be used: {}. \
Respond with ONLY the JSON object in the required format.",
                    reason
                ));
            }
            let chat = ChatRequest {
                system: SYSTEM_PROMPT.to_string(),
                user,
                temperature: self.temperature,
                max_tokens: self.max_tokens,
            };

            run.advance(AgentState::AwaitingLlm)?;
            let raw = complete_with_timeout(self.model.as_ref(), &chat, self.timeout).await?;

            run.advance(AgentState::Parsing)?;
            let parsed = match parse_script_response(&raw) {
                Ok(parsed) => parsed,
                Err(reason) if run.can_retry() => {
                    tracing::warn!(%reason, "model output unusable, retrying once");
                    correction = Some(reason);
                    continue;
                }
                Err(reason) => {
                    return Err(QaError::GenerationParseError {
                        attempts: run.attempts(),
                        reason,
                    })
                }
            };

            let script = clean_script(&parsed.script);
            let (selectors, missing) = verify(&parsed, &script, &snapshot.structure);
            if !missing.is_empty() {
                return Err(QaError::SelectorNotFound {
                    test_case_id: case.id.clone(),
                    missing,
                });
            }

            let artifact = ScriptArtifact {
                test_case_id: case.id.clone(),
                filename: ScriptArtifact::filename_for(&case.id),
                script,
                selectors,
                html_fingerprint: snapshot.structure.fingerprint.clone(),
                grounding: case.grounding.clone(),
                created_at: Utc::now(),
            };
            store.save_script(&artifact).await?;
            return Ok(artifact);
        }
    }

    /// Supporting documentation for the case.
    async fn documentation_for(&self, case: &TestCase) -> Result<String> {
        if self.context_k == 0 {
            return Ok(String::new());
        }
        let query = format!("{} {}", case.feature, case.scenario);
        match self.retriever.retrieve(&query, self.context_k).await {
            Ok(hits) => Ok(format_context(&hits)),
            Err(QaError::InvalidRequest(_)) => Ok(String::new()),
            Err(e) => Err(e),
        }
    }
}

fn script_prompt(case: &TestCase, snapshot: &HtmlSnapshot, documentation: &str) -> String {
    let steps: Vec<String> = case
        .steps
        .iter()
        .enumerate()
        .map(|(i, s)| format!("{}. {}", i + 1, s))
        .collect();

    let mut prompt = format!(
        "Generate a Selenium Python script for this test case:

TEST CASE:
- Test ID: {id}
- Feature: {feature}
- Scenario: {scenario}
- Type: {test_type:?}
- Preconditions: {preconditions}

TEST STEPS:
{steps}

EXPECTED RESULT:
{expected}

PAGE UNDER TEST: {page}

HTML ELEMENTS AVAILABLE:
{elements}

Load the page from a path relative to the script:
current_dir = os.path.dirname(os.path.abspath(__file__))
html_path = os.path.abspath(os.path.join(current_dir, \"..\", \"uploads\", \"{page}\"))
driver.get(f\"file:///{{html_path}}\")",
        id = case.id,
        feature = case.feature,
        scenario = case.scenario,
        test_type = case.test_type,
        preconditions = case.preconditions,
        steps = steps.join("\n"),
        expected = case.expected_result,
        page = snapshot.filename,
        elements = snapshot.structure.describe_elements(),
    );
    if !documentation.is_empty() {
        prompt.push_str("\n\nRELEVANT DOCUMENTATION:\n");
        prompt.push_str(documentation);
    }
    prompt
}

/// Extract the `{selectors, missing_elements, script}` object.
fn parse_script_response(text: &str) -> std::result::Result<RawScript, String> {
    let mut candidates: Vec<&str> = Vec::new();
    if let Some(m) = JSON_FENCE.captures(text).and_then(|c| c.get(1)) {
        candidates.push(m.as_str());
    }
    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if start < end {
            candidates.push(&text[start..=end]);
        }
    }
    candidates.push(text.trim());

    let mut last_err = String::from("response is empty");
    for candidate in candidates {
        match serde_json::from_str::<RawScript>(candidate) {
            Ok(raw) if raw.script.trim().is_empty() => last_err = "script is empty".to_string(),
            Ok(raw) => return Ok(raw),
            Err(e) => last_err = format!("invalid script response: {}", e),
        }
    }
    Err(last_err)
}

/// Strip markdown fences and make sure the Selenium imports are present.
pub fn clean_script(script: &str) -> String {
    let script = CODE_FENCE.replace_all(script, "");
    let script = script.trim();
    if script.starts_with("from") || script.starts_with("import") {
        format!("{}\n", script)
    } else {
        format!("{}{}\n", SELENIUM_IMPORTS, script)
    }
}

/// An element lookup found in a generated script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptLocator {
    /// A `By.<KIND>` (or string kind) lookup with a literal value.
    Literal { kind: String, value: String },
    /// A lookup whose target cannot be known without running the script:
    /// a variable, an f-string, a concatenation, an unpacked tuple.
    Unverifiable(String),
}

/// Every element lookup in a script, in order of appearance.
pub fn script_locators(script: &str) -> Vec<ScriptLocator> {
    let mut found: Vec<(usize, ScriptLocator)> = Vec::new();
    // Start offsets of `By.` already consumed as call arguments.
    let mut covered: Vec<usize> = Vec::new();

    for call in LOOKUP_CALL.captures_iter(script) {
        let Some(whole) = call.get(0) else { continue };
        let rest = &script[whole.end()..];
        let locator = match call.get(1) {
            Some(legacy) => LEGACY_ARG.captures(rest).map(|c| ScriptLocator::Literal {
                kind: legacy.as_str().to_ascii_uppercase(),
                value: literal(&c, 1, 2),
            }),
            None => LOCATOR_ARGS.captures(rest).map(|c| locator_from_args(&c)),
        };
        if let Some(by) = CALL_BY.find(rest) {
            covered.push(whole.end() + by.end() - "By.".len());
        }
        let locator = locator
            .unwrap_or_else(|| ScriptLocator::Unverifiable(snippet(&script[whole.start()..])));
        found.push((whole.start(), locator));
    }

    for by in BY_KIND.find_iter(script) {
        if covered.contains(&by.start()) {
            continue;
        }
        let locator = LOCATOR_ARGS
            .captures(&script[by.start()..])
            .map(|c| locator_from_args(&c))
            .unwrap_or_else(|| ScriptLocator::Unverifiable(snippet(&script[by.start()..])));
        found.push((by.start(), locator));
    }

    found.sort_by_key(|(pos, _)| *pos);
    found.into_iter().map(|(_, locator)| locator).collect()
}

fn locator_from_args(c: &regex::Captures<'_>) -> ScriptLocator {
    let kind = match c.get(1) {
        Some(by) => by.as_str().to_string(),
        None => literal(c, 2, 3).to_ascii_uppercase().replace(' ', "_"),
    };
    ScriptLocator::Literal {
        kind,
        value: literal(c, 4, 5),
    }
}

fn literal(c: &regex::Captures<'_>, double: usize, single: usize) -> String {
    c.get(double)
        .or_else(|| c.get(single))
        .map(|m| m.as_str().to_string())
        .unwrap_or_default()
}

/// The lookup as written, up to its closing paren or the end of the line.
fn snippet(text: &str) -> String {
    let line = text.lines().next().unwrap_or_default();
    let mut depth = 0usize;
    for (i, ch) in line.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' if depth <= 1 => return line[..=i].to_string(),
            ')' => depth -= 1,
            _ => {}
        }
    }
    line.trim_end().to_string()
}

/// Selector spelling of a locator, as recorded on the artifact.
fn locator_label(kind: &str, value: &str) -> String {
    match kind {
        "ID" => format!("#{}", value),
        "NAME" => format!("[name='{}']", value),
        "CLASS_NAME" => format!(".{}", value),
        "TAG_NAME" | "CSS_SELECTOR" => value.to_string(),
        other => format!("By.{}={}", other, value),
    }
}

/// Split everything the response references into verified selectors and
/// missing ones.
fn verify(raw: &RawScript, script: &str, page: &HtmlStructure) -> (Vec<String>, Vec<String>) {
    fn push(list: &mut Vec<String>, item: String) {
        if !list.contains(&item) {
            list.push(item);
        }
    }

    let mut verified: Vec<String> = Vec::new();
    let mut missing: Vec<String> = Vec::new();

    for element in &raw.missing_elements {
        let element = element.trim();
        if !element.is_empty() {
            push(&mut missing, element.to_string());
        }
    }
    for selector in &raw.selectors {
        let selector = selector.trim();
        if selector.is_empty() {
            continue;
        }
        if page.contains_selector(selector) {
            push(&mut verified, selector.to_string());
        } else {
            push(&mut missing, selector.to_string());
        }
    }
    for locator in script_locators(script) {
        match locator {
            ScriptLocator::Literal { kind, value } => {
                let label = locator_label(&kind, &value);
                if page.verify_locator(&kind, &value) {
                    push(&mut verified, label);
                } else {
                    push(&mut missing, label);
                }
            }
            ScriptLocator::Unverifiable(call) => {
                push(&mut missing, format!("unverifiable locator: {}", call))
            }
        }
    }
    (verified, missing)
}

// ============ CLI ============

/// CLI entry point for `qa generate script`.
pub async fn run_generate_script(config: &Config, test_case_id: &str) -> anyhow::Result<()> {
    let store = Arc::new(SqliteStore::open(config).await?);
    let embedder: Arc<dyn Embedder> = Arc::from(create_embedder(&config.embedding)?);
    let model: Arc<dyn LanguageModel> = Arc::from(create_model(&config.llm)?);
    let agent = ScriptAgent::new(Retriever::new(store.clone(), embedder), model, config);

    let result = agent.generate(test_case_id).await;
    store.close().await;
    let generation = result?;

    let path = write_script(config, &generation.artifact)?;
    println!("  wrote {}", path.display());
    println!("  selectors: {}", generation.artifact.selectors.join(", "));
    println!("ok");
    Ok(())
}

fn write_script(config: &Config, artifact: &ScriptArtifact) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(&config.output.scripts_dir).with_context(|| {
        format!(
            "Failed to create scripts directory: {}",
            config.output.scripts_dir.display()
        )
    })?;
    let path = config.output.scripts_dir.join(&artifact.filename);
    std::fs::write(&path, &artifact.script)
        .with_context(|| format!("Failed to write script: {}", path.display()))?;
    Ok(path)
}

/// CLI entry point for `qa list scripts`.
pub async fn run_list_scripts(config: &Config) -> anyhow::Result<()> {
    let store = SqliteStore::open(config).await?;
    let scripts = store.scripts().await?;
    store.close().await;

    if scripts.is_empty() {
        println!("No scripts. Generate one with `qa generate script <TC-ID>`.");
        return Ok(());
    }
    for script in &scripts {
        println!(
            "{}  {}  ({} selectors, html {})",
            script.test_case_id,
            script.filename,
            script.selectors.len(),
            &script.html_fingerprint[..script.html_fingerprint.len().min(12)]
        );
    }
    Ok(())
}
