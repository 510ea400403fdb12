//! Document parsing: uploaded bytes to plain text with located segments.
//!
//! Supported formats are Markdown, plain text, JSON, HTML and PDF. Each
//! parser produces the document's plain text plus a list of [`Segment`]s
//! (a Markdown section, a paragraph, a JSON top-level key, a PDF page) whose
//! char offsets point into that text, so chunks can carry a location label
//! for citation.
//!
//! Parsing never panics: malformed input becomes [`QaError::ParseError`]
//! naming the file, and an unknown format becomes
//! [`QaError::UnsupportedFormat`]. Ingestion records either per file and
//! moves on.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::error::{QaError, Result};
use crate::html::{parse_html, HtmlStructure};
use crate::models::{Document, DocumentFormat, Segment, UploadedFile};

static EXCESS_NEWLINES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n{3,}").expect("valid newline regex"));

/// Result of parsing one uploaded file.
#[derive(Debug, Clone)]
pub struct ParsedDocument {
    pub document: Document,
    pub segments: Vec<Segment>,
    /// Page structure, present for HTML uploads.
    pub html: Option<HtmlStructure>,
}

/// Resolve the file's format: the declared one, else its extension.
pub fn detect_format(file: &UploadedFile) -> Result<DocumentFormat> {
    if let Some(format) = file.format {
        return Ok(format);
    }
    let ext = Path::new(&file.filename)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("");
    DocumentFormat::from_extension(ext).ok_or_else(|| QaError::UnsupportedFormat {
        file: file.filename.clone(),
        format: if ext.is_empty() {
            "(no extension)".to_string()
        } else {
            ext.to_string()
        },
    })
}

/// Parse one uploaded file into a [`ParsedDocument`].
pub fn parse_document(file: &UploadedFile) -> Result<ParsedDocument> {
    let format = detect_format(file)?;
    let name = file.filename.as_str();

    let mut html = None;
    let builder = match format {
        DocumentFormat::Markdown => parse_markdown(&decode_utf8(name, &file.bytes)?),
        DocumentFormat::Text => parse_plain_text(&decode_utf8(name, &file.bytes)?),
        DocumentFormat::Json => parse_json(name, &decode_utf8(name, &file.bytes)?)?,
        DocumentFormat::Html => {
            let structure = parse_html(name, &decode_utf8(name, &file.bytes)?)?;
            let builder = html_segments(&structure);
            html = Some(structure);
            builder
        }
        DocumentFormat::Pdf => parse_pdf(name, &file.bytes)?,
    };

    let (text, segments) = builder.finish();
    tracing::debug!(
        file = name,
        format = format.as_str(),
        chars = text.chars().count(),
        segments = segments.len(),
        "parsed document"
    );

    Ok(ParsedDocument {
        document: Document {
            id: Document::id_for(name),
            filename: file.filename.clone(),
            format,
            text,
            size_bytes: file.bytes.len(),
            uploaded_at: Utc::now(),
        },
        segments,
        html,
    })
}

fn decode_utf8(file: &str, bytes: &[u8]) -> Result<String> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| QaError::parse(file, format!("invalid UTF-8: {}", e)))?;
    Ok(text.trim_start_matches('\u{feff}').to_string())
}

/// Normalise line endings, drop control characters other than newline and
/// tab, and collapse runs of blank lines.
pub fn clean_text(raw: &str) -> String {
    let normalized = raw.replace("\r\n", "\n").replace('\r', "\n");
    let stripped: String = normalized
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect();
    EXCESS_NEWLINES
        .replace_all(&stripped, "\n\n")
        .trim()
        .to_string()
}

/// Accumulates segment bodies into the document text, recording char
/// offsets as it goes.
#[derive(Default)]
struct TextBuilder {
    text: String,
    chars: usize,
    segments: Vec<Segment>,
}

impl TextBuilder {
    fn push(&mut self, label: Option<String>, body: &str) {
        let body = body.trim();
        if body.is_empty() {
            return;
        }
        if !self.text.is_empty() {
            self.text.push_str("\n\n");
            self.chars += 2;
        }
        let start = self.chars;
        self.text.push_str(body);
        self.chars += body.chars().count();
        self.segments.push(Segment {
            label,
            start,
            end: self.chars,
        });
    }

    fn finish(self) -> (String, Vec<Segment>) {
        (self.text, self.segments)
    }
}

/// One segment per section; a section starts at each ATX heading and is
/// labelled with the heading text.
fn parse_markdown(raw: &str) -> TextBuilder {
    let cleaned = clean_text(raw);
    let mut builder = TextBuilder::default();
    let mut label: Option<String> = None;
    let mut section: Vec<&str> = Vec::new();

    for line in cleaned.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with('#') {
            let heading = trimmed.trim_start_matches('#');
            if heading.is_empty() || heading.starts_with(' ') {
                builder.push(label.take(), &section.join("\n"));
                section.clear();
                label = Some(heading.trim().to_string()).filter(|h| !h.is_empty());
            }
        }
        section.push(line);
    }
    builder.push(label, &section.join("\n"));
    builder
}

/// One segment per paragraph.
fn parse_plain_text(raw: &str) -> TextBuilder {
    let cleaned = clean_text(raw);
    let mut builder = TextBuilder::default();
    for paragraph in cleaned.split("\n\n") {
        builder.push(None, paragraph);
    }
    builder
}

/// JSON is flattened to readable `key: value` lines; each top-level key
/// (or array element) becomes its own segment.
fn parse_json(file: &str, raw: &str) -> Result<TextBuilder> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| QaError::parse(file, format!("invalid JSON: {}", e)))?;
    let mut builder = TextBuilder::default();
    match &value {
        Value::Object(map) => {
            for (key, v) in map {
                let mut lines = Vec::new();
                flatten_entry(key, v, 0, &mut lines);
                builder.push(Some(key.clone()), &lines.join("\n"));
            }
        }
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                let mut lines = Vec::new();
                flatten_item(item, 0, &mut lines);
                builder.push(Some(format!("[{}]", i)), &lines.join("\n"));
            }
        }
        scalar => builder.push(None, &scalar_text(scalar)),
    }
    Ok(builder)
}

fn flatten_entry(key: &str, value: &Value, depth: usize, out: &mut Vec<String>) {
    let pad = "  ".repeat(depth);
    match value {
        Value::Object(map) => {
            out.push(format!("{}{}:", pad, key));
            for (k, v) in map {
                flatten_entry(k, v, depth + 1, out);
            }
        }
        Value::Array(items) => {
            out.push(format!("{}{}:", pad, key));
            for item in items {
                flatten_item(item, depth + 1, out);
            }
        }
        scalar => out.push(format!("{}{}: {}", pad, key, scalar_text(scalar))),
    }
}

fn flatten_item(value: &Value, depth: usize, out: &mut Vec<String>) {
    let pad = "  ".repeat(depth);
    match value {
        Value::Object(map) => {
            out.push(format!("{}-", pad));
            for (k, v) in map {
                flatten_entry(k, v, depth + 1, out);
            }
        }
        Value::Array(items) => {
            out.push(format!("{}-", pad));
            for item in items {
                flatten_item(item, depth + 1, out);
            }
        }
        scalar => out.push(format!("{}- {}", pad, scalar_text(scalar))),
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

fn html_segments(structure: &HtmlStructure) -> TextBuilder {
    let mut builder = TextBuilder::default();
    for block in structure.document_text().split("\n\n") {
        let label = if block.starts_with("Page Title:") {
            Some("title".to_string())
        } else if block.starts_with("--- Form ---") {
            block
                .lines()
                .nth(1)
                .and_then(|l| l.strip_prefix("Form ID: "))
                .map(|id| format!("form {}", id))
        } else {
            Some("page content".to_string())
        };
        builder.push(label, block);
    }
    builder
}

/// Extract text per page. `pdf-extract` can panic on malformed input, so
/// the call is isolated with `catch_unwind`.
fn parse_pdf(file: &str, bytes: &[u8]) -> Result<TextBuilder> {
    let extracted = catch_unwind(AssertUnwindSafe(|| pdf_extract::extract_text_from_mem(bytes)))
        .map_err(|_| QaError::parse(file, "PDF extraction panicked on malformed input"))?
        .map_err(|e| QaError::parse(file, format!("PDF extraction failed: {}", e)))?;

    let mut builder = TextBuilder::default();
    for (i, page) in extracted.split('\u{c}').enumerate() {
        let page = clean_text(page);
        if page.is_empty() {
            continue;
        }
        let n = i + 1;
        builder.push(
            Some(format!("page {}", n)),
            &format!("--- Page {} ---\n{}", n, page),
        );
    }
    if builder.segments.is_empty() {
        return Err(QaError::parse(file, "PDF contains no extractable text"));
    }
    Ok(builder)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_of(parsed: &ParsedDocument, seg: &Segment) -> String {
        parsed
            .document
            .text
            .chars()
            .skip(seg.start)
            .take(seg.end - seg.start)
            .collect()
    }

    #[test]
    fn markdown_sections_are_labelled_by_heading() {
        let md = "# Discounts\n\nSAVE15 gives 15% off orders above $50.\n\n## Shipping\r\nExpress costs $10.\n";
        let parsed = parse_document(&UploadedFile::new("rules.md", md)).unwrap();
        assert_eq!(parsed.document.format, DocumentFormat::Markdown);
        assert_eq!(parsed.segments.len(), 2);
        assert_eq!(parsed.segments[0].label.as_deref(), Some("Discounts"));
        assert_eq!(parsed.segments[1].label.as_deref(), Some("Shipping"));
        assert!(text_of(&parsed, &parsed.segments[0]).contains("SAVE15"));
        assert!(text_of(&parsed, &parsed.segments[1]).starts_with("## Shipping"));
        assert!(!parsed.document.text.contains('\r'));
    }

    #[test]
    fn hashtags_are_not_headings() {
        let parsed =
            parse_document(&UploadedFile::new("n.md", "intro\n#hashtag line\nmore")).unwrap();
        assert_eq!(parsed.segments.len(), 1);
        assert_eq!(parsed.segments[0].label, None);
    }

    #[test]
    fn control_characters_are_stripped() {
        let cleaned = clean_text("a\u{0}b\u{7}c\n\n\n\n\td");
        assert_eq!(cleaned, "abc\n\n\td");
    }

    #[test]
    fn plain_text_paragraph_offsets_are_char_based() {
        let parsed =
            parse_document(&UploadedFile::new("notes.txt", "Prix: 10€\n\nSecond paragraph")).unwrap();
        assert_eq!(parsed.segments.len(), 2);
        assert_eq!(text_of(&parsed, &parsed.segments[0]), "Prix: 10€");
        assert_eq!(text_of(&parsed, &parsed.segments[1]), "Second paragraph");
    }

    #[test]
    fn json_is_flattened() {
        let json = r#"{"discounts": {"SAVE15": {"percent": 15, "min_order": 50}}, "currencies": ["USD", "EUR"]}"#;
        let parsed = parse_document(&UploadedFile::new("product.json", json)).unwrap();
        let text = &parsed.document.text;
        assert!(text.contains("discounts:\n  SAVE15:\n    min_order: 50\n    percent: 15"));
        assert!(text.contains("currencies:\n  - USD\n  - EUR"));
        let mut labels: Vec<_> = parsed
            .segments
            .iter()
            .filter_map(|s| s.label.clone())
            .collect();
        labels.sort();
        assert_eq!(labels, vec!["currencies", "discounts"]);
    }

    #[test]
    fn invalid_json_is_a_parse_error() {
        let err = parse_document(&UploadedFile::new("bad.json", "{not json")).unwrap_err();
        assert!(matches!(err, QaError::ParseError { ref file, .. } if file == "bad.json"));
    }

    #[test]
    fn invalid_utf8_is_a_parse_error() {
        let err = parse_document(&UploadedFile::new("bin.txt", vec![0xff, 0xfe, 0x00])).unwrap_err();
        assert!(matches!(err, QaError::ParseError { .. }));
    }

    #[test]
    fn unknown_extension_is_unsupported() {
        let err = parse_document(&UploadedFile::new("slides.pptx", "x")).unwrap_err();
        assert!(matches!(err, QaError::UnsupportedFormat { ref format, .. } if format == "pptx"));
        let err = parse_document(&UploadedFile::new("README", "x")).unwrap_err();
        assert!(matches!(err, QaError::UnsupportedFormat { .. }));
    }

    #[test]
    fn declared_format_overrides_extension() {
        let file = UploadedFile::new("upload.bin", "plain words").with_format(DocumentFormat::Text);
        let parsed = parse_document(&file).unwrap();
        assert_eq!(parsed.document.text, "plain words");
    }

    #[test]
    fn html_carries_structure_and_summary() {
        let html = r#"<html><head><title>Checkout</title></head>
            <body><form id="pay"><input id="card" name="card" type="text"><button id="go">Pay</button></form>
            <p>Secure payment</p></body></html>"#;
        let parsed = parse_document(&UploadedFile::new("checkout.html", html)).unwrap();
        let structure = parsed.html.as_ref().unwrap();
        assert!(structure.contains_selector("#card"));
        assert!(parsed.document.text.contains("Page Title: Checkout"));
        assert!(parsed.document.text.contains("Form ID: pay"));
        assert!(parsed
            .segments
            .iter()
            .any(|s| s.label.as_deref() == Some("form pay")));
    }

    #[test]
    fn unparsable_pdf_is_a_parse_error() {
        let err = parse_document(&UploadedFile::new("broken.pdf", "not a pdf")).unwrap_err();
        assert!(matches!(err, QaError::ParseError { ref file, .. } if file == "broken.pdf"));
    }

    #[test]
    fn empty_text_has_no_segments() {
        let parsed = parse_document(&UploadedFile::new("empty.txt", "  \n\n ")).unwrap();
        assert!(parsed.document.text.is_empty());
        assert!(parsed.segments.is_empty());
    }
}
