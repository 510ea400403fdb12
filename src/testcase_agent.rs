//! Documentation-grounded test-case generation.
//!
//! Retrieves context for a free-text request, asks the model for a JSON
//! array of test cases, and validates every case's citations against the
//! documents that were actually retrieved. A case citing only documents
//! outside the retrieved context is treated as a hallucination and fails
//! the parse. One malformed response earns exactly one retry with a
//! correction note; the batch is persisted only when parsing succeeds.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use crate::agent::{AgentRun, AgentState};
use crate::config::Config;
use crate::embedding::{create_embedder, Embedder};
use crate::error::{QaError, Result};
use crate::llm::{complete_with_timeout, create_model, ChatRequest, LanguageModel};
use crate::models::{GroundingRef, RetrievedChunk, TestCase, TestType};
use crate::retrieval::{GroundedPrompt, Retriever};
use crate::store::{SqliteStore, Store};

pub const SYSTEM_PROMPT: &str = r#"You are an expert QA Test Case Designer.

Your task is to generate comprehensive, documentation-grounded test cases.

CRITICAL RULES:
1. Base ALL test cases ONLY on the provided documentation
2. DO NOT invent, assume, or hallucinate any features not mentioned in the docs
3. Each test case MUST reference which document(s) it is based on
4. Be specific and actionable

OUTPUT FORMAT:
Return test cases as a JSON array with this structure:
[
  {
    "test_id": "TC-001",
    "feature": "Feature name",
    "test_scenario": "Detailed scenario description",
    "test_type": "positive|negative|edge_case",
    "preconditions": "Setup required before test",
    "test_steps": [
      "Step 1: Action to perform",
      "Step 2: Next action",
      "Step 3: Verification"
    ],
    "expected_result": "What should happen",
    "grounded_in": "Exact source document name (e.g., product_specs.md)"
  }
]

Generate clear, testable scenarios that can be automated with Selenium."#;

const NEGATIVE_SUFFIX: &str = " Include both positive and negative test scenarios.";

/// Sources inherited by a case that cites nothing.
const INHERITED_SOURCES: usize = 3;

static JSON_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```json\s*(.*?)\s*```").expect("valid fence regex"));

/// Result of a successful generation.
#[derive(Debug, Clone)]
pub struct TestCaseGeneration {
    /// Persisted test cases, in id order.
    pub test_cases: Vec<TestCase>,
    /// The context the cases were grounded on.
    pub retrieved: Vec<RetrievedChunk>,
    /// Prompts sent to the model (1, or 2 after a retry).
    pub attempts: u32,
    pub states: Vec<AgentState>,
}

pub struct TestCaseAgent {
    retriever: Retriever,
    model: Arc<dyn LanguageModel>,
    k: usize,
    temperature: f32,
    max_tokens: u32,
    timeout: Duration,
}

impl TestCaseAgent {
    pub fn new(retriever: Retriever, model: Arc<dyn LanguageModel>, config: &Config) -> Self {
        Self {
            retriever,
            model,
            k: config.retrieval.test_case_k,
            temperature: config.llm.temperature,
            max_tokens: config.llm.max_tokens,
            timeout: Duration::from_secs(config.llm.timeout_secs),
        }
    }

    /// Override the LLM deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Generate, validate and persist test cases for `request`.
    pub async fn generate(&self, request: &str, include_negative: bool) -> Result<TestCaseGeneration> {
        let mut run = AgentRun::new("test_case");
        match self.drive(&mut run, request, include_negative).await {
            Ok((test_cases, retrieved)) => {
                run.advance(AgentState::Done)?;
                tracing::info!(
                    cases = test_cases.len(),
                    attempts = run.attempts(),
                    "generated test cases"
                );
                Ok(TestCaseGeneration {
                    test_cases,
                    retrieved,
                    attempts: run.attempts(),
                    states: run.history().to_vec(),
                })
            }
            Err(e) => {
                run.fail();
                tracing::warn!(error = %e, attempts = run.attempts(), "test case generation failed");
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        run: &mut AgentRun,
        request: &str,
        include_negative: bool,
    ) -> Result<(Vec<TestCase>, Vec<RetrievedChunk>)> {
        run.advance(AgentState::Retrieving)?;
        let mut query = request.trim().to_string();
        if query.is_empty() {
            return Err(QaError::InvalidRequest("request is empty".to_string()));
        }
        if include_negative {
            query.push_str(NEGATIVE_SUFFIX);
        }
        let grounded = self.retriever.ground(&query, self.k).await?;
        let store = self.retriever.store();
        let first_number = store.next_test_case_number().await?;

        let mut correction: Option<String> = None;
        loop {
            run.advance(AgentState::Prompting)?;
            let mut user = grounded.user_message.clone();
            if let Some(reason) = &correction {
                user.push_str(&correction_note(reason));
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
            match parse_test_cases(&raw, &grounded, first_number) {
                Ok(cases) => {
                    store.save_test_cases(&cases).await?;
                    return Ok((cases, grounded.chunks));
                }
                Err(reason) if run.can_retry() => {
                    tracing::warn!(%reason, "model output unusable, retrying once");
                    correction = Some(reason);
                }
                Err(reason) => {
                    return Err(QaError::GenerationParseError {
                        attempts: run.attempts(),
                        reason,
                    })
                }
            }
        }
    }
}

fn correction_note(reason: &str) -> String {
    format!(
        "\n\nYour previous response could not be used: {}. \
Respond with ONLY a JSON array of test cases in the required format, \
and cite only the documents provided above in \"grounded_in\".",
        reason
    )
}

// ============ Response parsing ============

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StringOrList {
    One(String),
    Many(Vec<String>),
}

impl StringOrList {
    fn into_vec(self) -> Vec<String> {
        match self {
            StringOrList::One(s) => vec![s],
            StringOrList::Many(v) => v,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawTestCase {
    #[serde(alias = "feature_name")]
    feature: String,
    #[serde(alias = "scenario")]
    test_scenario: String,
    #[serde(default)]
    test_type: Option<String>,
    #[serde(default)]
    preconditions: Option<StringOrList>,
    #[serde(alias = "steps")]
    test_steps: StringOrList,
    expected_result: String,
    #[serde(default, alias = "source", alias = "sources")]
    grounded_in: Option<StringOrList>,
}

/// Pull the JSON payload out of a model response: a ```` ```json ```` fence,
/// else the outermost `[...]`, else the whole text. A single object is
/// wrapped into a one-element list.
pub(crate) fn extract_json_array(text: &str) -> std::result::Result<Vec<Value>, String> {
    let candidate = if let Some(caps) = JSON_FENCE.captures(text) {
        caps.get(1).map(|m| m.as_str()).unwrap_or_default()
    } else if let (Some(start), Some(end)) = (text.find('['), text.rfind(']')) {
        if start < end {
            &text[start..=end]
        } else {
            text.trim()
        }
    } else {
        text.trim()
    };

    match serde_json::from_str::<Value>(candidate) {
        Ok(Value::Array(items)) => Ok(items),
        Ok(obj @ Value::Object(_)) => Ok(vec![obj]),
        Ok(other) => Err(format!("expected a JSON array, got {}", json_kind(&other))),
        Err(e) => Err(format!("invalid JSON: {}", e)),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Match a cited name to a retrieved source: exact, case-insensitive, or
/// by file name when the source is a relative path.
fn resolve_source<'a>(cited: &str, sources: &'a [String]) -> Option<&'a String> {
    let cited = cited.trim().trim_matches(|c| c == '"' || c == '\'' || c == '`');
    if cited.is_empty() {
        return None;
    }
    sources
        .iter()
        .find(|s| s.as_str() == cited)
        .or_else(|| sources.iter().find(|s| s.eq_ignore_ascii_case(cited)))
        .or_else(|| {
            sources.iter().find(|s| {
                s.rsplit('/')
                    .next()
                    .is_some_and(|name| name.eq_ignore_ascii_case(cited))
            })
        })
}

fn grounding_for(sources: &[&String], grounded: &GroundedPrompt) -> Vec<GroundingRef> {
    sources
        .iter()
        .map(|source| GroundingRef {
            document: (*source).clone(),
            chunk_ids: grounded.chunk_ids_for(source),
        })
        .collect()
}

/// Turn a model response into numbered, citation-checked test cases.
pub(crate) fn parse_test_cases(
    text: &str,
    grounded: &GroundedPrompt,
    first_number: u32,
) -> std::result::Result<Vec<TestCase>, String> {
    let items = extract_json_array(text)?;
    if items.is_empty() {
        return Err("response contained no test cases".to_string());
    }

    let sources = grounded.sources();
    let mut inherited: Vec<&String> = Vec::new();
    for hit in grounded.chunks.iter().take(INHERITED_SOURCES) {
        if let Some(s) = sources.iter().find(|s| **s == hit.chunk.source) {
            if !inherited.contains(&s) {
                inherited.push(s);
            }
        }
    }

    let now = Utc::now();
    let mut cases = Vec::with_capacity(items.len());
    for (i, item) in items.into_iter().enumerate() {
        let raw: RawTestCase = serde_json::from_value(item)
            .map_err(|e| format!("test case {} is malformed: {}", i + 1, e))?;

        let cited: Vec<String> = raw
            .grounded_in
            .map(StringOrList::into_vec)
            .unwrap_or_default()
            .iter()
            .flat_map(|s| s.split(','))
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let mut resolved: Vec<&String> = Vec::new();
        for name in &cited {
            match resolve_source(name, &sources) {
                Some(source) if !resolved.contains(&source) => resolved.push(source),
                Some(_) => {}
                None => tracing::debug!(cited = %name, "dropping citation of unretrieved document"),
            }
        }
        if !cited.is_empty() && resolved.is_empty() {
            return Err(format!(
                "test case {} cites documents that were not provided: {}",
                i + 1,
                cited.join(", ")
            ));
        }
        if resolved.is_empty() {
            resolved = inherited.clone();
        }

        let steps: Vec<String> = raw
            .test_steps
            .into_vec()
            .into_iter()
            .flat_map(|s| s.lines().map(str::to_string).collect::<Vec<_>>())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if steps.is_empty() {
            return Err(format!("test case {} has no steps", i + 1));
        }

        cases.push(TestCase {
            id: TestCase::format_id(first_number + i as u32),
            feature: raw.feature.trim().to_string(),
            scenario: raw.test_scenario.trim().to_string(),
            test_type: TestType::from_label(raw.test_type.as_deref().unwrap_or("positive")),
            preconditions: raw
                .preconditions
                .map(|p| p.into_vec().join("; "))
                .unwrap_or_default(),
            steps,
            expected_result: raw.expected_result.trim().to_string(),
            grounding: grounding_for(&resolved, grounded),
            created_at: now,
        });
    }
    Ok(cases)
}

// ============ CLI ============

/// CLI entry point for `qa generate tests`.
pub async fn run_generate_tests(
    config: &Config,
    request: &str,
    include_negative: bool,
) -> anyhow::Result<()> {
    let store = Arc::new(SqliteStore::open(config).await?);
    let embedder: Arc<dyn Embedder> = Arc::from(create_embedder(&config.embedding)?);
    let model: Arc<dyn LanguageModel> = Arc::from(create_model(&config.llm)?);
    let agent = TestCaseAgent::new(Retriever::new(store.clone(), embedder), model, config);

    let result = agent.generate(request, include_negative).await;
    store.close().await;
    let generation = result?;

    for case in &generation.test_cases {
        print_test_case(case);
    }
    println!(
        "  {} test case(s) generated from {} retrieved chunk(s)",
        generation.test_cases.len(),
        generation.retrieved.len()
    );
    println!("ok");
    Ok(())
}

/// CLI entry point for `qa list tests`.
pub async fn run_list_tests(config: &Config) -> anyhow::Result<()> {
    let store = SqliteStore::open(config).await?;
    let cases = store.test_cases().await?;
    store.close().await;

    if cases.is_empty() {
        println!("No test cases. Generate some with `qa generate tests \"<request>\"`.");
        return Ok(());
    }
    for case in &cases {
        print_test_case(case);
    }
    Ok(())
}

fn print_test_case(case: &TestCase) {
    let label = match case.test_type {
        TestType::Positive => "positive",
        TestType::Negative => "negative",
        TestType::EdgeCase => "edge_case",
    };
    println!("{} [{}] {}", case.id, label, case.feature);
    println!("  scenario: {}", case.scenario);
    if !case.preconditions.is_empty() {
        println!("  preconditions: {}", case.preconditions);
    }
    for (i, step) in case.steps.iter().enumerate() {
        println!("  {}. {}", i + 1, step);
    }
    println!("  expected: {}", case.expected_result);
    let docs: Vec<&str> = case.grounding.iter().map(|g| g.document.as_str()).collect();
    println!("  grounded in: {}", docs.join(", "));
    println!();
}
