//! Overlapping-window text chunker.
//!
//! Splits a parsed document's text into [`Chunk`]s of at most
//! `chunk_size` chars. Consecutive chunks share up to `chunk_overlap`
//! chars so context at a boundary appears in both. Window ends prefer the
//! strongest separator available: a blank line, then a newline, then a
//! space, falling back to a hard cut.
//!
//! Chunk IDs are derived from the document ID, chunk index, and text, so
//! re-ingesting the same documents yields the same IDs. Each chunk also
//! carries a SHA-256 of its text.

use sha2::{Digest, Sha256};

use crate::config::ChunkingConfig;
use crate::models::{Chunk, Document, Segment};

const SEPARATORS: &[&str] = &["\n\n", "\n", " "];

/// Split a document into overlapping chunks. Returns chunks with
/// contiguous indices starting at 0; an empty (or whitespace-only)
/// document yields no chunks.
pub fn chunk_document(
    document: &Document,
    segments: &[Segment],
    config: &ChunkingConfig,
) -> Vec<Chunk> {
    let chars: Vec<char> = document.text.chars().collect();
    let size = config.chunk_size.max(1);
    let overlap = config.chunk_overlap.min(size - 1);
    let n = chars.len();

    let mut chunks = Vec::new();
    let mut pos = 0usize;

    while pos < n {
        let window_end = (pos + size).min(n);
        let split = if window_end < n {
            find_split(&chars, pos + overlap + 1, window_end)
        } else {
            window_end
        };

        if let Some((start, end)) = trim_span(&chars, pos, split) {
            let text: String = chars[start..end].iter().collect();
            let index = chunks.len() as i64;
            chunks.push(make_chunk(document, index, start, end, text, segments));
        }

        if split >= n {
            break;
        }
        pos = next_start(&chars, split.saturating_sub(overlap).max(pos + 1), split);
    }

    chunks
}

/// Latest split point in `(min_split..=end)` that falls right after a
/// separator, trying separators strongest first.
fn find_split(chars: &[char], min_split: usize, end: usize) -> usize {
    if min_split >= end {
        return end;
    }
    for sep in SEPARATORS {
        let sep: Vec<char> = sep.chars().collect();
        let mut i = end;
        while i >= min_split.max(sep.len()) {
            if chars[i - sep.len()..i] == sep[..] {
                return i;
            }
            i -= 1;
        }
    }
    end
}

/// Move an overlap start forward to the next word boundary so chunks do
/// not begin mid-word, staying before `limit`.
fn next_start(chars: &[char], candidate: usize, limit: usize) -> usize {
    if candidate == 0 || chars[candidate - 1].is_whitespace() {
        return candidate;
    }
    (candidate..limit)
        .find(|&i| chars[i].is_whitespace())
        .map(|i| i + 1)
        .filter(|&i| i < limit)
        .unwrap_or(candidate)
}

fn trim_span(chars: &[char], mut start: usize, mut end: usize) -> Option<(usize, usize)> {
    while start < end && chars[start].is_whitespace() {
        start += 1;
    }
    while end > start && chars[end - 1].is_whitespace() {
        end -= 1;
    }
    (start < end).then_some((start, end))
}

fn make_chunk(
    document: &Document,
    index: i64,
    start: usize,
    end: usize,
    text: String,
    segments: &[Segment],
) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        id: chunk_id(&document.id, index, &text),
        document_id: document.id.clone(),
        source: document.filename.clone(),
        chunk_index: index,
        start,
        end,
        location: location_for(segments, start),
        text,
        hash,
    }
}

/// Deterministic chunk identifier.
pub fn chunk_id(document_id: &str, index: i64, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(index.to_le_bytes());
    hasher.update([0u8]);
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())[..32].to_string()
}

/// Label of the last segment starting at or before `offset`.
fn location_for(segments: &[Segment], offset: usize) -> Option<String> {
    segments
        .iter()
        .take_while(|s| s.start <= offset)
        .last()
        .and_then(|s| s.label.clone())
}
