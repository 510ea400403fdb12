//! # QA Harness CLI (`qa`)
//!
//! The `qa` binary drives the whole pipeline: knowledge-base setup,
//! document ingestion, retrieval, test-case generation and Selenium script
//! generation.
//!
//! ## Usage
//!
//! ```bash
//! qa --config ./config/qa.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `qa init` | Create the SQLite database and run schema migrations |
//! | `qa ingest <paths…>` | Parse, chunk, embed and index documents |
//! | `qa reset` | Clear chunks, test cases and scripts |
//! | `qa stats` | Show what is indexed and generated |
//! | `qa search "<query>"` | Show the top-K chunks for a query |
//! | `qa html <file>` | Store an HTML page as the script-generation snapshot |
//! | `qa generate tests "<request>"` | Generate grounded test cases |
//! | `qa generate script <TC-ID>` | Generate a Selenium script for a test case |
//! | `qa list tests` / `qa list scripts` | List generated artifacts |
//!
//! ## Examples
//!
//! ```bash
//! # Index a docs folder and the page under test, replacing the old index
//! qa ingest ./docs ./pages/checkout.html --rebuild
//!
//! # Positive-only test cases
//! qa generate tests "discount code validation" --no-negative
//!
//! # Script for the first case, written to [output].scripts_dir
//! qa generate script TC-001
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use qa_harness::{config, ingest, retrieval, script_agent, stats, store, testcase_agent};

/// QA Harness CLI: documentation-grounded test cases and Selenium scripts.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file.
#[derive(Parser)]
#[command(
    name = "qa",
    about = "QA Harness: documentation-grounded test case and Selenium script generation",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/qa.toml")]
    config: PathBuf,

    /// Log pipeline activity to stderr at debug level.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent: running it multiple times is safe.
    Init,

    /// Ingest documents into the knowledge base.
    ///
    /// Accepts files and directories; directories are walked recursively
    /// and only supported formats (md, txt, json, html, pdf) are picked up.
    /// A file that fails to parse is reported and skipped.
    Ingest {
        /// Files or directories to ingest.
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Clear the knowledge base first, then ingest.
        #[arg(long)]
        rebuild: bool,
    },

    /// Clear all chunks, test cases and scripts.
    Reset,

    /// Show knowledge-base statistics.
    Stats,

    /// Retrieve the chunks most relevant to a query.
    Search {
        query: String,

        /// Number of chunks to return (defaults to `retrieval.top_k`).
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Store an HTML page as the snapshot used for script generation.
    Html {
        file: PathBuf,
    },

    /// Generate test cases or scripts.
    Generate {
        #[command(subcommand)]
        what: GenerateCommand,
    },

    /// List generated artifacts.
    List {
        #[command(subcommand)]
        what: ListCommand,
    },
}

#[derive(Subcommand)]
enum GenerateCommand {
    /// Generate test cases grounded in the indexed documentation.
    Tests {
        /// What to test, e.g. "discount code feature".
        request: String,

        /// Do not ask for negative scenarios.
        #[arg(long)]
        no_negative: bool,
    },
    /// Generate a Selenium script for a stored test case.
    Script {
        /// Test case id, e.g. `TC-001`.
        test_case_id: String,
    },
}

#[derive(Subcommand)]
enum ListCommand {
    Tests,
    Scripts,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("qa_harness=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let store = store::SqliteStore::open(&cfg).await?;
            store.close().await;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { paths, rebuild } => {
            ingest::run_ingest(&cfg, &paths, rebuild).await?;
        }
        Commands::Reset => {
            ingest::run_reset(&cfg).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Search { query, limit } => {
            retrieval::run_search(&cfg, &query, limit).await?;
        }
        Commands::Html { file } => {
            ingest::run_html(&cfg, &file).await?;
        }
        Commands::Generate { what } => match what {
            GenerateCommand::Tests {
                request,
                no_negative,
            } => {
                testcase_agent::run_generate_tests(&cfg, &request, !no_negative).await?;
            }
            GenerateCommand::Script { test_case_id } => {
                script_agent::run_generate_script(&cfg, &test_case_id).await?;
            }
        },
        Commands::List { what } => match what {
            ListCommand::Tests => testcase_agent::run_list_tests(&cfg).await?,
            ListCommand::Scripts => script_agent::run_list_scripts(&cfg).await?,
        },
    }

    Ok(())
}
