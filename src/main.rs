//! # Knowledge Engine CLI (`ke`)
//!
//! Index a folder, search it, and ask questions about it. The index lives
//! in memory, so `search` and `ask` scan `--path` first; unchanged files
//! are cheap to rescan. Without a path, the `[[sources]]` folders from the
//! config are scanned.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ke scan [path]` | Index a folder and print scan statistics |
//! | `ke search "<query>" --path <dir>` | Hybrid search over a folder |
//! | `ke ask "<question>" --path <dir>` | Streamed, cited answer over a folder |
//! | `ke providers` | List providers and their status |
//! | `ke test-embedding [text]` | Embed a sample with the active provider |
//!
//! ## Examples
//!
//! ```bash
//! ke scan ~/notes --progress json
//! ke search "budget report" --path ~/notes --weight 0
//! OPENAI_API_KEY=sk-... ke --config ./ke.toml ask "when is the budget due?" --path ~/notes
//! ```
//!
//! Logging goes to stderr and is controlled with `RUST_LOG`
//! (default `info`). Ctrl-C during a scan stops it after the current file.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use knowledge_engine::chat::{ChatEvent, ChatRequest};
use knowledge_engine::config::{self, Config};
use knowledge_engine::progress::ProgressMode;
use knowledge_engine::scan::{ScanSnapshot, ScanStatus};
use knowledge_engine::{Engine, SearchQuery};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "./ke.toml";

/// Knowledge Engine: hybrid search and cited answers over your files.
///
/// Every command accepts `--config` pointing to a TOML file. Without it,
/// `./ke.toml` is used when present, otherwise built-in defaults (offline
/// hash embeddings, no LLM).
#[derive(Parser)]
#[command(
    name = "ke",
    about = "Knowledge Engine: hybrid search and cited answers over your files",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Scan progress on stderr. Defaults to `human` on a terminal, else `off`.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressMode>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index a folder.
    ///
    /// Walks the folder, skips hidden and junk directories, and indexes
    /// every matching text file. Prints the final scan snapshot as JSON.
    Scan {
        /// Folder to index. Defaults to the configured sources.
        path: Option<PathBuf>,
    },

    /// Search a folder with hybrid (semantic + BM25) ranking.
    Search {
        /// The search query string.
        query: String,

        /// Folder to index before searching. Defaults to the configured sources.
        #[arg(long)]
        path: Option<PathBuf>,

        /// Maximum number of results to return.
        #[arg(long)]
        limit: Option<usize>,

        /// Semantic weight in [0, 1]: 0 is pure BM25, 1 pure vector search.
        #[arg(long)]
        weight: Option<f64>,
    },

    /// Ask a question and stream a cited answer.
    ///
    /// Requires an LLM provider (`[llm] provider = "openai"` or `"ollama"`).
    Ask {
        /// The question.
        question: String,

        /// Folder to index before answering. Defaults to the configured sources.
        #[arg(long)]
        path: Option<PathBuf>,

        /// Number of chunks to put in the prompt.
        #[arg(long)]
        top_k: Option<usize>,
    },

    /// List embedding and chat providers with their status as JSON.
    Providers,

    /// Embed a sample text with the active embedding provider.
    TestEmbedding {
        #[arg(default_value = "Hello, this is a test of the embedding system.")]
        text: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = resolve_config(cli.config.as_deref())?;
    let progress = cli.progress.unwrap_or_else(ProgressMode::default_for_tty);
    let engine = Engine::new(cfg).context("Failed to start engine")?;

    match cli.command {
        Commands::Scan { path } => {
            let snapshot = scan_with_progress(&engine, path.as_deref(), progress).await?;
            println!("{}", serde_json::to_string_pretty(&*snapshot)?);
        }
        Commands::Search {
            query,
            path,
            limit,
            weight,
        } => {
            scan_with_progress(&engine, path.as_deref(), progress).await?;
            let response = engine
                .search(SearchQuery {
                    query,
                    limit,
                    semantic_weight: weight,
                })
                .await;
            if let Some(err) = response.error {
                bail!("Search failed: {err}");
            }
            print_results(&response);
        }
        Commands::Ask {
            question,
            path,
            top_k,
        } => {
            scan_with_progress(&engine, path.as_deref(), progress).await?;
            ask(&engine, question, top_k).await?;
        }
        Commands::Providers => {
            println!("{}", serde_json::to_string_pretty(&engine.providers())?);
        }
        Commands::TestEmbedding { text } => {
            let result = engine.test_embedding(&text).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.success {
                bail!("Embedding test failed");
            }
        }
    }

    Ok(())
}

fn resolve_config(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => config::load_config(path),
        None if Path::new(DEFAULT_CONFIG).exists() => config::load_config(Path::new(DEFAULT_CONFIG)),
        None => Ok(Config::default()),
    }
}

/// Run a scan to completion, reporting progress and stopping on Ctrl-C.
async fn scan_with_progress(
    engine: &Engine,
    path: Option<&Path>,
    mode: ProgressMode,
) -> anyhow::Result<Arc<ScanSnapshot>> {
    match path {
        Some(path) => engine.start_scan(path)?,
        None => engine
            .scan_all()
            .context("No path given and no [[sources]] configured")?,
    };
    let reporter = mode.reporter();

    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut stop_requested = false;
    let mut last: Option<(ScanStatus, usize, usize)> = None;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let snapshot = engine.scan_status();
                let key = (snapshot.status, snapshot.processed_files, snapshot.total_files);
                if last != Some(key) {
                    reporter.report(&snapshot);
                    last = Some(key);
                }
                if snapshot.status.is_terminal() {
                    break;
                }
            }
            res = &mut ctrl_c, if !stop_requested => {
                stop_requested = true;
                if res.is_ok() {
                    engine.stop_scan();
                }
            }
        }
    }

    let snapshot = engine.wait_for_scan().await;
    if snapshot.status == ScanStatus::Failed {
        bail!(
            "Scan failed: {}",
            snapshot.message.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(snapshot)
}

fn print_results(response: &knowledge_engine::SearchResponse) {
    if response.results.is_empty() {
        println!("No results.");
        return;
    }

    for (i, result) in response.results.iter().enumerate() {
        let title_display = result.title.as_deref().unwrap_or("(untitled)");
        println!(
            "{}. [{:.2}] {} (semantic {:.2}, lexical {:.2})",
            i + 1,
            result.combined_score,
            title_display,
            result.semantic_score,
            result.lexical_score
        );
        println!("    source: {}#{}", result.source_path, result.sequence_index);
        println!(
            "    excerpt: \"{}\"",
            result.highlighted_text.replace('\n', " ").trim()
        );
        println!("    id: {}", result.chunk_id);
        println!();
    }
    if response.stale_chunks > 0 {
        println!(
            "{} chunks have no vector from the active provider and were ranked lexically only.",
            response.stale_chunks
        );
    }
    println!(
        "{} results in {} ms",
        response.total_results, response.search_time_ms
    );
}

async fn ask(engine: &Engine, question: String, top_k: Option<usize>) -> anyhow::Result<()> {
    let mut rx = engine.chat(ChatRequest {
        message: question,
        history: Vec::new(),
        top_k_context: top_k,
    });

    let mut sources = Vec::new();
    let mut stdout = std::io::stdout();
    while let Some(event) = rx.recv().await {
        match event {
            ChatEvent::Sources { data } => sources = data,
            ChatEvent::Chunk { content } => {
                write!(stdout, "{content}")?;
                stdout.flush()?;
            }
            ChatEvent::Done { .. } => {
                writeln!(stdout)?;
                break;
            }
            ChatEvent::Error { content, partial } => {
                if !partial.is_empty() {
                    writeln!(stdout)?;
                }
                bail!("Answer failed: {content}");
            }
        }
    }

    if !sources.is_empty() {
        println!("\nSources:");
        for (n, source) in sources.iter().enumerate() {
            println!(
                "  [{}] {} ({:.2})",
                n + 1,
                source.title.as_deref().unwrap_or(&source.source_path),
                source.relevance_score
            );
            println!("      {}", source.source_path);
        }
    }
    Ok(())
}
