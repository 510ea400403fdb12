//! Retrieval and grounding.
//!
//! Embeds a free-text request with the same embedder used at ingestion,
//! pulls the top-K most similar chunks from the store, and assembles a
//! grounded prompt: every retrieved chunk labelled with its source document
//! and relevance, followed by the request and an instruction to answer only
//! from that material.
//!
//! An empty knowledge base is an error ([`QaError::EmptyKnowledgeBase`]),
//! never an empty context: an ungrounded prompt is not forwarded to the
//! model.

use std::sync::Arc;

use anyhow::Context;

use crate::config::Config;
use crate::embedding::{create_embedder, embed_query, Embedder};
use crate::error::{QaError, Result};
use crate::models::RetrievedChunk;
use crate::store::{SqliteStore, Store};

/// Instruction appended to every grounded user message.
pub const GROUNDING_INSTRUCTION: &str = "Please respond based ONLY on the provided documentation. \
If the documentation does not contain the information needed, say so explicitly. \
Do not invent features, values, or behaviour that the documentation does not state.";

/// A request together with the retrieved context it is grounded on.
#[derive(Debug, Clone)]
pub struct GroundedPrompt {
    pub request: String,
    /// Retrieved chunks, best first.
    pub chunks: Vec<RetrievedChunk>,
    /// The formatted context blocks.
    pub context: String,
    /// Full user message: context, request, and grounding instruction.
    pub user_message: String,
}

impl GroundedPrompt {
    /// Distinct source documents in rank order.
    pub fn sources(&self) -> Vec<String> {
        let mut sources: Vec<String> = Vec::new();
        for hit in &self.chunks {
            if !sources.contains(&hit.chunk.source) {
                sources.push(hit.chunk.source.clone());
            }
        }
        sources
    }

    /// Ids of the retrieved chunks that came from `source`.
    pub fn chunk_ids_for(&self, source: &str) -> Vec<String> {
        self.chunks
            .iter()
            .filter(|h| h.chunk.source == source)
            .map(|h| h.chunk.id.clone())
            .collect()
    }
}

/// Render retrieved chunks as labelled context blocks.
pub fn format_context(chunks: &[RetrievedChunk]) -> String {
    chunks
        .iter()
        .map(|hit| {
            let location = hit
                .chunk
                .location
                .as_deref()
                .map(|l| format!(", {}", l))
                .unwrap_or_default();
            format!(
                "=== From {}{} (relevance: {:.2}) [chunk {}] ===\n{}\n",
                hit.chunk.source, location, hit.score, hit.chunk.id, hit.chunk.text
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Build the grounded user message for a request and its context.
pub fn grounded_user_message(context: &str, request: &str) -> String {
    format!(
        "Based on the following documentation:\n\n{}\n\nUser Request: {}\n\n{}",
        context, request, GROUNDING_INSTRUCTION
    )
}

/// Top-K retrieval over a [`Store`] with a fixed [`Embedder`].
#[derive(Clone)]
pub struct Retriever {
    store: Arc<dyn Store>,
    embedder: Arc<dyn Embedder>,
}

impl Retriever {
    pub fn new(store: Arc<dyn Store>, embedder: Arc<dyn Embedder>) -> Self {
        Self { store, embedder }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// The `k` chunks most relevant to `request`.
    pub async fn retrieve(&self, request: &str, k: usize) -> Result<Vec<RetrievedChunk>> {
        let request = request.trim();
        if request.is_empty() {
            return Err(QaError::InvalidRequest("request is empty".to_string()));
        }
        if k == 0 {
            return Err(QaError::InvalidRequest("k must be at least 1".to_string()));
        }
        if self.store.count().await? == 0 {
            return Err(QaError::EmptyKnowledgeBase);
        }

        let query = embed_query(self.embedder.as_ref(), request).await?;
        let hits = self.store.query(&query, k).await?;
        if hits.is_empty() {
            return Err(QaError::EmptyKnowledgeBase);
        }

        tracing::debug!(
            k,
            hits = hits.len(),
            best = hits[0].score,
            "retrieved context"
        );
        Ok(hits)
    }

    /// Retrieve context for `request` and assemble the grounded prompt.
    pub async fn ground(&self, request: &str, k: usize) -> Result<GroundedPrompt> {
        let chunks = self.retrieve(request, k).await?;
        let context = format_context(&chunks);
        let request = request.trim().to_string();
        Ok(GroundedPrompt {
            user_message: grounded_user_message(&context, &request),
            request,
            chunks,
            context,
        })
    }
}

/// CLI entry point for `qa search`.
pub async fn run_search(config: &Config, query: &str, limit: Option<usize>) -> anyhow::Result<()> {
    let store = Arc::new(SqliteStore::open(config).await?);
    let embedder: Arc<dyn Embedder> =
        Arc::from(create_embedder(&config.embedding).context("Failed to create embedder")?);
    let retriever = Retriever::new(store.clone(), embedder);

    let k = limit.unwrap_or(config.retrieval.top_k);
    let hits = match retriever.retrieve(query, k).await {
        Ok(hits) => hits,
        Err(QaError::EmptyKnowledgeBase) => {
            println!("No results. The knowledge base is empty; run `qa ingest` first.");
            store.close().await;
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    for (i, hit) in hits.iter().enumerate() {
        let location = hit
            .chunk
            .location
            .as_deref()
            .map(|l| format!(" ({})", l))
            .unwrap_or_default();
        println!("{}. [{:.2}] {}{}", i + 1, hit.score, hit.chunk.source, location);
        let excerpt: String = hit.chunk.text.chars().take(240).collect();
        println!("    excerpt: \"{}\"", excerpt.replace('\n', " ").trim());
        println!("    chunk: {}", hit.chunk.id);
        println!();
    }

    store.close().await;
    Ok(())
}
