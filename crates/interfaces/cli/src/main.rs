mod interactive;
mod memory_cmds;

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

use mnemo_config::AppConfig;
use mnemo_llm::{ModelClient, OllamaClient};
use mnemo_memory::{Category, ExportFormat, MemorySystem};

#[derive(Debug, Parser)]
#[command(
    name = "mnemo",
    version,
    about = "A local chat agent with consolidated long-term memory"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, default_value = "config/default.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Interactive chat session (default).
    Chat {
        /// Write the multiplexed wire format (reply text, memory sentinels,
        /// metadata) instead of plain text.
        #[arg(long)]
        wire: bool,
    },
    /// Consolidate the short-term buffer now.
    Sleep,
    /// List knowledge chunks.
    Chunks {
        #[arg(long)]
        category: Option<Category>,
    },
    Conflicts {
        #[command(subcommand)]
        command: ConflictCommands,
    },
    Archive {
        #[command(subcommand)]
        command: ArchiveCommands,
    },
    /// Review candidates quarantined by consolidation.
    Holding {
        #[command(subcommand)]
        command: HoldingCommands,
    },
    Export {
        #[arg(long, default_value = "json")]
        format: ExportFormat,
        /// Write to a file instead of stdout.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Load an export into an empty knowledge store.
    Import {
        #[arg(value_name = "PATH")]
        path: PathBuf,
        #[arg(long, default_value = "json")]
        format: ExportFormat,
    },
    Stats,
    /// Delete every knowledge chunk and the buffered turns.
    Clear {
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Debug, Subcommand)]
enum ConflictCommands {
    /// Report near-duplicate chunk pairs.
    Scan {
        #[arg(long)]
        threshold: Option<f32>,
    },
    /// Scan, then let the model merge or drop conflicting chunks.
    Resolve {
        #[arg(long)]
        threshold: Option<f32>,
    },
}

#[derive(Debug, Subcommand)]
enum ArchiveCommands {
    List,
    Snapshot,
    /// Replace the whole knowledge store with a snapshot.
    Restore {
        index: u64,
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Debug, Subcommand)]
enum HoldingCommands {
    List,
    Approve {
        id: String,
        /// Replace the held content before committing it.
        #[arg(long)]
        content: Option<String>,
    },
    Reject {
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = AppConfig::load_from(&cli.config)?;
    let _log_guard = init_tracing(&config)?;

    let model: Arc<dyn ModelClient> = Arc::new(OllamaClient::from_config(&config.llm)?);
    let system = Arc::new(MemorySystem::open(config, Arc::clone(&model))?);

    match cli.command.unwrap_or(Commands::Chat { wire: false }) {
        Commands::Chat { wire } => {
            interactive::run_chat_session(Arc::clone(&system), model, wire).await?;
        }
        Commands::Sleep => memory_cmds::run_sleep(&system).await?,
        Commands::Chunks { category } => memory_cmds::run_chunks(&system, category).await,
        Commands::Conflicts { command } => match command {
            ConflictCommands::Scan { threshold } => {
                memory_cmds::run_conflicts_scan(&system, threshold).await;
            }
            ConflictCommands::Resolve { threshold } => {
                memory_cmds::run_conflicts_resolve(&system, threshold).await?;
            }
        },
        Commands::Archive { command } => match command {
            ArchiveCommands::List => memory_cmds::run_archive_list(&system).await,
            ArchiveCommands::Snapshot => memory_cmds::run_archive_snapshot(&system).await?,
            ArchiveCommands::Restore { index, yes } => {
                memory_cmds::run_archive_restore(&system, index, yes).await?;
            }
        },
        Commands::Holding { command } => match command {
            HoldingCommands::List => memory_cmds::run_holding_list(&system).await,
            HoldingCommands::Approve { id, content } => {
                memory_cmds::run_holding_approve(&system, &id, content).await?;
            }
            HoldingCommands::Reject { id } => memory_cmds::run_holding_reject(&system, &id).await?,
        },
        Commands::Export { format, out } => {
            memory_cmds::run_export(&system, format, out.as_deref()).await?;
        }
        Commands::Import { path, format } => {
            memory_cmds::run_import(&system, &path, format).await?;
        }
        Commands::Stats => memory_cmds::run_stats(&system).await,
        Commands::Clear { yes } => memory_cmds::run_clear(&system, yes).await?,
    }

    Ok(())
}

/// `RUST_LOG` (or `telemetry.log_level`) filters the log.  With
/// `log_to_file` it goes to a daily file under `<data_dir>/logs` and the
/// console only shows warnings.
fn init_tracing(config: &AppConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.telemetry.log_level));

    if !config.telemetry.log_to_file {
        let console = fmt::layer()
            .with_writer(io::stderr)
            .with_target(false)
            .with_filter(filter);
        tracing_subscriber::registry().with(console).init();
        return Ok(None);
    }

    let logs_dir = config.memory.data_path().join("logs");
    fs::create_dir_all(&logs_dir)
        .with_context(|| format!("create log directory {}", logs_dir.display()))?;
    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(&logs_dir, "mnemo.log"));

    let console = fmt::layer()
        .with_writer(io::stderr)
        .with_target(false)
        .with_filter(LevelFilter::WARN);
    let file = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_filter(filter);

    tracing_subscriber::registry().with(console).with(file).init();
    Ok(Some(guard))
}
