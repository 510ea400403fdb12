//! Shared fixtures for library integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use qa_harness::config::Config;
use qa_harness::embedding::HashingEmbedder;
use qa_harness::error::Result;
use qa_harness::ingest::{ingest_files, IngestReport};
use qa_harness::llm::{ChatRequest, LanguageModel};
use qa_harness::models::UploadedFile;
use qa_harness::retrieval::Retriever;
use qa_harness::store::{InMemoryStore, Store};

pub const PRODUCT_SPECS: &str = "# E-Shop Checkout Product Specifications

## Discount Codes

The discount code SAVE15 applies a 15% discount to the cart subtotal.
Discount codes are case-sensitive. An invalid code shows the message
\"Invalid discount code\" and leaves the total unchanged.

## Shipping

Standard shipping is free. Express shipping costs $10.
";

pub const UI_GUIDE: &str = "Error messages must be displayed in red text directly below the field.

The Pay Now button turns green when the form is valid.";

pub const API_ENDPOINTS: &str = r#"{"endpoints": {"apply_coupon": {"method": "POST", "path": "/api/coupon"}}}"#;

pub const CHECKOUT_HTML: &str = r#"<!DOCTYPE html>
<html>
<head><title>E-Shop Checkout</title>
<style>.error { color: red; }</style>
<script>function applyDiscount() { return true; }</script>
</head>
<body>
<h1>Checkout</h1>
<form id="checkoutForm">
  <input type="text" id="name" name="name" placeholder="Full Name">
  <input type="email" id="email" name="email" placeholder="Email">
  <input type="text" id="discountCode" name="discount_code" placeholder="Discount code">
  <button type="button" id="applyDiscount" class="btn">Apply</button>
  <span id="discountMessage" class="error"></span>
  <button type="submit" id="payNow" class="btn primary">Pay Now</button>
</form>
</body>
</html>"#;

pub fn doc_files() -> Vec<UploadedFile> {
    vec![
        UploadedFile::new("product_specs.md", PRODUCT_SPECS),
        UploadedFile::new("ui_ux_guide.txt", UI_GUIDE),
        UploadedFile::new("api_endpoints.json", API_ENDPOINTS),
    ]
}

/// A [`LanguageModel`] that replays canned responses and records prompts.
pub struct ScriptedModel {
    replies: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<ChatRequest>>,
    delay: Option<Duration>,
}

impl ScriptedModel {
    pub fn new(replies: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
            prompts: Mutex::new(Vec::new()),
            delay: None,
        })
    }

    pub fn slow(delay: Duration, reply: &str) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(VecDeque::from([reply.to_string()])),
            prompts: Mutex::new(Vec::new()),
            delay: Some(delay),
        })
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn prompt(&self, i: usize) -> ChatRequest {
        self.prompts.lock().unwrap()[i].clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &ChatRequest) -> Result<String> {
        self.prompts.lock().unwrap().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.replies.lock().unwrap().pop_front().unwrap_or_default())
    }
}

pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub embedder: Arc<HashingEmbedder>,
    pub config: Config,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            store: Arc::new(InMemoryStore::new()),
            embedder: Arc::new(HashingEmbedder::new(256)),
            config: Config::minimal(),
        }
    }

    pub async fn ingest(&self, files: &[UploadedFile]) -> IngestReport {
        ingest_files(
            self.store.as_ref(),
            self.embedder.as_ref(),
            &self.config,
            files,
        )
        .await
        .unwrap()
    }

    pub fn retriever(&self) -> Retriever {
        let store: Arc<dyn Store> = self.store.clone();
        Retriever::new(store, self.embedder.clone())
    }
}

pub fn test_case_reply(grounded_in: &str) -> String {
    format!(
        r#"```json
[
  {{
    "test_id": "TC-001",
    "feature": "Discount Code",
    "test_scenario": "Apply the valid discount code SAVE15",
    "test_type": "positive",
    "preconditions": "Cart contains items",
    "test_steps": ["Enter SAVE15 in the discount code field", "Click Apply"],
    "expected_result": "A 15% discount is applied to the subtotal",
    "grounded_in": "{g}"
  }},
  {{
    "test_id": "TC-002",
    "feature": "Discount Code",
    "test_scenario": "Apply an invalid discount code",
    "test_type": "negative",
    "preconditions": "Cart contains items",
    "test_steps": ["Enter SAVE99 in the discount code field", "Click Apply"],
    "expected_result": "The message Invalid discount code is shown in red",
    "grounded_in": "{g}"
  }}
]
```"#,
        g = grounded_in
    )
}
