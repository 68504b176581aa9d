//! # Tutor CLI (`tutor`)
//!
//! ## Usage
//!
//! ```bash
//! tutor --config ./config/tutor.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `tutor init` | Create the SQLite database and index schema |
//! | `tutor ingest [PATHS]` | Load, chunk and embed the corpus incrementally |
//! | `tutor search "<query>"` | Show the chunks retrieval would select |
//! | `tutor ask "<question>"` | Answer one question |
//! | `tutor chat` | Interactive tutoring session |
//! | `tutor history` | Print recent sessions from the history log |
//! | `tutor stats` | Index summary |
//! | `tutor completions <shell>` | Shell completion script |
//!
//! Diagnostics go to stderr and are controlled with `RUST_LOG`
//! (default `warn`).

use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use tracing_subscriber::EnvFilter;

use ragtutor::ingest::IngestOptions;
use ragtutor::{chat, config, history_log, ingest, migrate, search, stats};

/// Retrieval-augmented tutor for data structures and algorithms.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/tutor.example.toml` for a full example.
#[derive(Parser)]
#[command(name = "tutor", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/tutor.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and index schema. Safe to run repeatedly.
    Init,

    /// Ingest the corpus into the index.
    ///
    /// Unchanged chunks are skipped, new or edited chunks are embedded and
    /// chunks that no longer exist in a re-ingested source are deleted.
    Ingest {
        /// Only ingest files at or beneath these paths.
        paths: Vec<PathBuf>,

        /// Also delete sources that are no longer in the corpus.
        #[arg(long, conflicts_with = "paths")]
        full: bool,

        /// Scan, load and chunk without embedding or writing anything.
        #[arg(long)]
        dry_run: bool,
    },

    /// Retrieve chunks for a query without calling the model.
    Search {
        query: String,

        /// Number of chunks to select (defaults to `retrieval.k`).
        #[arg(long)]
        k: Option<usize>,
    },

    /// Ask a single question.
    Ask {
        question: String,

        /// List the chunks the answer drew on.
        #[arg(long)]
        sources: bool,
    },

    /// Start an interactive session. Ctrl-C cancels the current answer.
    Chat {
        /// List the chunks each answer drew on.
        #[arg(long)]
        sources: bool,
    },

    /// Print recent sessions from the history log.
    History {
        /// Number of sessions (defaults to `chat.history_sessions`).
        #[arg(long)]
        sessions: Option<usize>,
    },

    /// Show index statistics.
    Stats,

    /// Generate a shell completion script.
    Completions { shell: Shell },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Commands that don't require config
    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "tutor", &mut std::io::stdout());
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest {
            paths,
            full,
            dry_run,
        } => {
            let options = IngestOptions {
                paths,
                full,
                dry_run,
            };
            ingest::run_ingest(&cfg, &options).await?;
        }
        Commands::Search { query, k } => {
            search::run_search(&cfg, &query, k).await?;
        }
        Commands::Ask { question, sources } => {
            chat::run_ask(&cfg, &question, sources).await?;
        }
        Commands::Chat { sources } => {
            chat::run_chat(&cfg, sources).await?;
        }
        Commands::History { sessions } => {
            history_log::run_history(&cfg, sessions.unwrap_or(cfg.chat.history_sessions))?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}
