//! Error taxonomy for the ingestion, retrieval, and generation pipeline.
//!
//! Every failure a caller can observe is a [`QaError`] variant carrying
//! enough detail to identify the offending file or request. Ingestion
//! collects per-file errors into its report instead of aborting; generation
//! errors abort only the request that raised them.

use std::time::Duration;

use thiserror::Error;

use crate::agent::AgentState;

/// Result alias used across the library.
pub type Result<T> = std::result::Result<T, QaError>;

#[derive(Debug, Error)]
pub enum QaError {
    /// The file's declared or detected format has no parser.
    #[error("unsupported format for '{file}': {format}")]
    UnsupportedFormat { file: String, format: String },

    /// The file is in a supported format but could not be read.
    #[error("failed to parse '{file}': {reason}")]
    ParseError { file: String, reason: String },

    /// A generation request arrived while no chunks are indexed.
    #[error("knowledge base is empty: ingest documents before generating")]
    EmptyKnowledgeBase,

    /// The model output could not be turned into structured records.
    #[error("could not parse model output after {attempts} attempt(s): {reason}")]
    GenerationParseError { attempts: u32, reason: String },

    /// A UI element the test case needs is not present in the HTML snapshot.
    #[error("selector(s) not found in HTML snapshot for {test_case_id}: {}", .missing.join(", "))]
    SelectorNotFound {
        test_case_id: String,
        missing: Vec<String>,
    },

    /// The LLM call did not complete within the configured timeout.
    #[error("LLM call timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("test case not found: {0}")]
    TestCaseNotFound(String),

    #[error("no HTML snapshot stored: upload a page with `qa html <file>` first")]
    MissingHtmlSnapshot,

    #[error("embedding dimension mismatch: index holds {expected}-d vectors, got {actual}-d")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("LLM request failed: {0}")]
    Llm(String),

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("illegal agent transition {from:?} -> {to:?}")]
    InvalidTransition { from: AgentState, to: AgentState },
}

impl QaError {
    pub(crate) fn parse(file: impl Into<String>, reason: impl ToString) -> Self {
        QaError::ParseError {
            file: file.into(),
            reason: reason.to_string(),
        }
    }

    /// Short machine-friendly label, used in logs and CLI reports.
    pub fn kind(&self) -> &'static str {
        match self {
            QaError::UnsupportedFormat { .. } => "UnsupportedFormat",
            QaError::ParseError { .. } => "ParseError",
            QaError::EmptyKnowledgeBase => "EmptyKnowledgeBase",
            QaError::GenerationParseError { .. } => "GenerationParseError",
            QaError::SelectorNotFound { .. } => "SelectorNotFound",
            QaError::Timeout(_) => "TimeoutError",
            QaError::InvalidRequest(_) => "InvalidRequest",
            QaError::TestCaseNotFound(_) => "TestCaseNotFound",
            QaError::MissingHtmlSnapshot => "MissingHtmlSnapshot",
            QaError::DimensionMismatch { .. } => "DimensionMismatch",
            QaError::Llm(_) => "LlmError",
            QaError::Embedding(_) => "EmbeddingError",
            QaError::Storage(_) | QaError::Database(_) => "StorageError",
            QaError::Io(_) => "IoError",
            QaError::InvalidTransition { .. } => "InvalidTransition",
        }
    }
}

impl From<serde_json::Error> for QaError {
    fn from(e: serde_json::Error) -> Self {
        QaError::Storage(format!("serialization failed: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_not_found_lists_every_selector() {
        let err = QaError::SelectorNotFound {
            test_case_id: "TC-004".to_string(),
            missing: vec!["#coupon".to_string(), "[name='promo']".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("TC-004"));
        assert!(msg.contains("#coupon"));
        assert!(msg.contains("[name='promo']"));
        assert_eq!(err.kind(), "SelectorNotFound");
    }

    #[test]
    fn parse_error_names_the_file() {
        let err = QaError::parse("broken.pdf", "bad xref");
        assert_eq!(err.to_string(), "failed to parse 'broken.pdf': bad xref");
    }
}
