//! # Support Harness daemon (`supportd`)
//!
//! ## Usage
//!
//! ```bash
//! supportd --config ./config/support.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `supportd init` | Create the SQLite database and run schema migrations |
//! | `supportd sync` | Run one synchronization pass against the knowledge source |
//! | `supportd ask "<message>"` | Answer one message from the command line |
//! | `supportd serve` | Start the HTTP server and background sync worker |
//!
//! Log verbosity follows `RUST_LOG` (default `info`).

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use support_harness::compose::SessionContext;
use support_harness::runtime::Runtime;
use support_harness::{config, migrate, server};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Support Harness: spreadsheet-synced knowledge retrieval, answer
/// composition, and signed webhook ingestion for support chat.
#[derive(Parser)]
#[command(name = "supportd", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/support.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent; running it multiple times is safe.
    Init,

    /// Run one synchronization pass and print the report.
    ///
    /// Restores persisted state first, so unchanged documents are not
    /// re-embedded.
    Sync,

    /// Answer a single message using the current knowledge base.
    Ask {
        /// The customer message.
        message: String,

        /// Restrict retrieval to one category.
        #[arg(long)]
        category: Option<String>,

        /// Session id to report in the turn. Generated when omitted.
        #[arg(long)]
        session: Option<String>,
    },

    /// Start the HTTP server.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries command output.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Sync => {
            let runtime = Runtime::build(&cfg).await?;
            runtime.synchronizer.restore().await?;
            let report = runtime
                .synchronizer
                .run(runtime.source.as_ref(), &CancellationToken::new())
                .await?;

            println!(
                "sync {}: added {}, updated {}, deleted {}, unchanged {}",
                cfg.source.kind, report.added, report.updated, report.deleted, report.unchanged
            );
            for (doc_id, reason) in &report.failed {
                println!("  failed   {}: {}", doc_id, reason);
            }
            for (row, reason) in &report.rejected {
                println!("  rejected {}: {}", row, reason);
            }
            println!("index: {} chunks", runtime.index.count());
        }
        Commands::Ask {
            message,
            category,
            session,
        } => {
            let runtime = Runtime::build(&cfg).await?;
            let restored = runtime.synchronizer.restore().await?;
            if restored == 0 {
                println!("(knowledge base is empty; run `supportd sync` first)");
            }

            let session = SessionContext {
                session_id: session,
                category,
                ..SessionContext::default()
            };
            let turn = runtime
                .composer
                .answer(&message, session, &CancellationToken::new())
                .await?;

            println!("{}", turn.response);
            println!();
            println!(
                "confidence: {:.2}  knowledge match: {}  escalate: {}",
                turn.confidence, turn.knowledge_match, turn.escalate
            );
            if !turn.sources.is_empty() {
                println!("sources: {}", turn.sources.join(", "));
            }
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
