//! # QA Harness
//!
//! A local-first, documentation-grounded QA assistant.
//!
//! QA Harness ingests project documentation (Markdown, plain text, JSON,
//! HTML, PDF) into a persistent knowledge base, retrieves grounded context
//! for a free-text request, asks a chat-completion model to author test
//! cases that cite the retrieved documents, and turns a chosen test case
//! plus a stored HTML page snapshot into a Selenium script that only uses
//! selectors present in the page.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌───────────┐
//! │   Parser    │──▶│ Chunk+Embed  │──▶│  SQLite   │
//! │ md/txt/json │   │              │   │  vectors  │
//! │  html/pdf   │   └──────────────┘   └─────┬─────┘
//! └─────────────┘                            │
//!                                  ┌─────────┴─────────┐
//!                                  ▼                   ▼
//!                          ┌──────────────┐    ┌──────────────┐
//!                          │  Test-case   │───▶│    Script    │
//!                          │    agent     │    │    agent     │
//!                          └──────────────┘    └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! qa init                                   # create database
//! qa ingest ./docs ./pages/checkout.html    # index documentation
//! qa generate tests "discount code feature" # grounded test cases
//! qa generate script TC-001                 # Selenium script
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy |
//! | [`models`] | Core data types |
//! | [`parse`] | Document parsing |
//! | [`html`] | HTML page structure and selector checks |
//! | [`chunk`] | Text chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`store`] | Vector store and artifact persistence |
//! | [`ingest`] | Ingestion pipeline |
//! | [`retrieval`] | Top-K retrieval and grounded prompts |
//! | [`llm`] | Chat-completion model boundary |
//! | [`agent`] | Agent lifecycle state machine |
//! | [`testcase_agent`] | Test-case generation |
//! | [`script_agent`] | Selenium script generation |
//! | [`stats`] | Knowledge-base statistics |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod agent;
pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod html;
pub mod ingest;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod parse;
pub mod retrieval;
pub mod script_agent;
pub mod stats;
pub mod store;
pub mod testcase_agent;
