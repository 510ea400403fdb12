//! Core data models used throughout the QA harness.
//!
//! These types represent the documents, chunks, index entries, and generated
//! artifacts that flow through the ingestion, retrieval, and generation
//! pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::html::HtmlStructure;

/// Input formats the parser understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    Markdown,
    Text,
    Json,
    Html,
    Pdf,
}

impl DocumentFormat {
    /// Map a file extension (without the dot, any case) to a format.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "md" | "markdown" => Some(Self::Markdown),
            "txt" | "text" => Some(Self::Text),
            "json" => Some(Self::Json),
            "html" | "htm" => Some(Self::Html),
            "pdf" => Some(Self::Pdf),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Markdown => "markdown",
            Self::Text => "text",
            Self::Json => "json",
            Self::Html => "html",
            Self::Pdf => "pdf",
        }
    }
}

/// A raw uploaded artifact: filename, optional declared format, and bytes.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub filename: String,
    pub format: Option<DocumentFormat>,
    pub bytes: Vec<u8>,
}

impl UploadedFile {
    pub fn new(filename: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            filename: filename.into(),
            format: None,
            bytes: bytes.into(),
        }
    }

    pub fn with_format(mut self, format: DocumentFormat) -> Self {
        self.format = Some(format);
        self
    }
}

/// A parsed document. Immutable once produced by the parser.
#[derive(Debug, Clone)]
pub struct Document {
    /// Stable identifier derived from the filename.
    pub id: String,
    pub filename: String,
    pub format: DocumentFormat,
    /// Plain text extracted by the parser.
    pub text: String,
    pub size_bytes: usize,
    pub uploaded_at: DateTime<Utc>,
}

impl Document {
    pub fn id_for(filename: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(filename.as_bytes());
        format!("{:x}", hasher.finalize())[..16].to_string()
    }
}

/// A span of the parsed text with a human-readable location label
/// (e.g. `"page 2"` for PDFs). Offsets are char offsets into
/// [`Document::text`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub label: Option<String>,
    pub start: usize,
    pub end: usize,
}

/// A chunk of a document's text, the unit of retrieval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    /// Source filename, used for citations.
    pub source: String,
    pub chunk_index: i64,
    /// Char offsets into the parsed document text.
    pub start: usize,
    pub end: usize,
    /// Location label of the segment the chunk starts in, if any.
    pub location: Option<String>,
    pub text: String,
    pub hash: String,
}

/// A chunk together with its embedding, as stored in the vector index.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub chunk: Chunk,
    pub embedding: Vec<f32>,
    pub model: String,
}

/// A chunk returned from a similarity query.
#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub chunk: Chunk,
    /// Cosine similarity to the query embedding.
    pub score: f32,
    /// Insertion order in the index; the tie-breaker for equal scores.
    pub seq: i64,
}

/// Per-source chunk counts for stats output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentSummary {
    pub source: String,
    pub chunks: usize,
}

/// Classification of a generated test case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestType {
    Positive,
    Negative,
    EdgeCase,
}

impl TestType {
    /// Lenient mapping from model-provided labels; unknown labels are
    /// treated as positive scenarios.
    pub fn from_label(label: &str) -> Self {
        match label
            .trim()
            .to_ascii_lowercase()
            .replace(['-', ' '], "_")
            .as_str()
        {
            "negative" => Self::Negative,
            "edge_case" | "edge" | "boundary" => Self::EdgeCase,
            _ => Self::Positive,
        }
    }
}

/// The documents (and retrieved chunks) a test case is derived from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroundingRef {
    pub document: String,
    pub chunk_ids: Vec<String>,
}

/// A generated, documentation-grounded test case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    /// Sequential identifier, e.g. `TC-001`.
    pub id: String,
    pub feature: String,
    pub scenario: String,
    pub test_type: TestType,
    pub preconditions: String,
    pub steps: Vec<String>,
    pub expected_result: String,
    pub grounding: Vec<GroundingRef>,
    pub created_at: DateTime<Utc>,
}

impl TestCase {
    pub fn format_id(number: u32) -> String {
        format!("TC-{:03}", number)
    }

    /// Sequence number of a `TC-NNN` id.
    pub fn number_of(id: &str) -> Option<u32> {
        id.strip_prefix("TC-")?.parse().ok()
    }

    pub fn cites(&self, document: &str) -> bool {
        self.grounding.iter().any(|g| g.document == document)
    }
}

/// A generated automation script for one test case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptArtifact {
    pub test_case_id: String,
    pub filename: String,
    pub script: String,
    /// Selectors the script uses, each verified against the snapshot.
    pub selectors: Vec<String>,
    /// Fingerprint of the [`HtmlStructure`] the script was built against.
    pub html_fingerprint: String,
    pub grounding: Vec<GroundingRef>,
    pub created_at: DateTime<Utc>,
}

impl ScriptArtifact {
    /// `TC-001` → `test_tc_001.py`.
    pub fn filename_for(test_case_id: &str) -> String {
        format!("test_{}.py", test_case_id.replace('-', "_").to_lowercase())
    }
}

/// A stored HTML page snapshot with its source filename.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HtmlSnapshot {
    pub filename: String,
    pub structure: HtmlStructure,
    pub stored_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_from_extension() {
        assert_eq!(
            DocumentFormat::from_extension("MD"),
            Some(DocumentFormat::Markdown)
        );
        assert_eq!(
            DocumentFormat::from_extension("htm"),
            Some(DocumentFormat::Html)
        );
        assert_eq!(DocumentFormat::from_extension("docx"), None);
    }

    #[test]
    fn test_ids_are_zero_padded() {
        assert_eq!(TestCase::format_id(1), "TC-001");
        assert_eq!(TestCase::format_id(42), "TC-042");
        assert_eq!(TestCase::format_id(1234), "TC-1234");
    }

    #[test]
    fn script_filename() {
        assert_eq!(ScriptArtifact::filename_for("TC-007"), "test_tc_007.py");
    }

    #[test]
    fn test_type_labels() {
        assert_eq!(TestType::from_label("Negative"), TestType::Negative);
        assert_eq!(TestType::from_label("edge-case"), TestType::EdgeCase);
        assert_eq!(TestType::from_label("edge case"), TestType::EdgeCase);
        assert_eq!(TestType::from_label("smoke"), TestType::Positive);
    }

    #[test]
    fn document_id_is_stable() {
        assert_eq!(Document::id_for("a.md"), Document::id_for("a.md"));
        assert_ne!(Document::id_for("a.md"), Document::id_for("b.md"));
        assert_eq!(Document::id_for("a.md").len(), 16);
    }
}
