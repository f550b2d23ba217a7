mod memory_cmds;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use being_config::AppConfig;
use being_runtime::{
    DaemonOptions, DryRunExecutor, RunMode, Scheduler, StatusSnapshot, UnavailableRanking,
    bootstrap, open_read_only, spawn,
};

const DEFAULT_CONFIG_PATH: &str = "config/being.toml";

#[derive(Debug, Parser)]
#[command(
    name = "being",
    version,
    about = "Energy- and cooldown-aware activity scheduler for a digital being"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the scheduling loop with the dry-run executor.
    Run {
        /// Stop after this many cycles.
        #[arg(long)]
        cycles: Option<u64>,
    },
    /// Show state, recent memory and pending chat.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// List registered activities and when each is next available.
    Activities,
    Memory {
        #[command(subcommand)]
        command: MemoryCommands,
    },
    /// Queue or answer chat messages.  Fails while `run` owns the store.
    Chat {
        #[command(subcommand)]
        command: ChatCommands,
    },
}

#[derive(Debug, Subcommand)]
enum MemoryCommands {
    /// Most recent records first.
    Recent {
        #[arg(long, default_value_t = 10)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Archived records of one activity.
    History {
        #[arg(value_name = "ACTIVITY")]
        category: String,
    },
    /// Chat messages waiting for an answer.
    Pending,
    Stats,
}

#[derive(Debug, Subcommand)]
enum ChatCommands {
    Send {
        #[arg(value_name = "MESSAGE")]
        message: String,
        #[arg(long, default_value = "user")]
        sender: String,
    },
    Answer {
        #[arg(value_name = "ID")]
        id: uuid::Uuid,
        #[arg(value_name = "RESPONSE")]
        response: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.telemetry.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Run { cycles } => run(config, cycles).await?,
        Commands::Status { json } => {
            let scheduler = open_read_only(&config).await?;
            let status = StatusSnapshot::collect(&scheduler, RunMode::Stopping).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                memory_cmds::print_status(&config, &status);
            }
        }
        Commands::Activities => {
            let scheduler = open_read_only(&config).await?;
            memory_cmds::print_activities(&scheduler).await;
        }
        Commands::Memory { command } => {
            let scheduler = open_read_only(&config).await?;
            let memory = scheduler.memory().await;
            match command {
                MemoryCommands::Recent { limit, offset } => {
                    memory_cmds::print_records(&memory.recent_page(limit, offset));
                }
                MemoryCommands::History { category } => {
                    memory_cmds::print_records(&memory.activity_history(&category));
                }
                MemoryCommands::Pending => {
                    memory_cmds::print_records(&memory.pending_chat());
                }
                MemoryCommands::Stats => memory_cmds::print_stats(&memory.stats()),
            }
        }
        Commands::Chat { command } => {
            let scheduler = open(&config).await?;
            match command {
                ChatCommands::Send { message, sender } => {
                    let id = scheduler.add_chat_message(&sender, &message).await?;
                    println!("queued chat message {id}");
                }
                ChatCommands::Answer { id, response } => {
                    let record = scheduler.mark_answered(id, &response).await?;
                    println!("answered {} ({:?})", record.id_short(), record.status);
                }
            }
            scheduler.shutdown().await?;
        }
    }

    Ok(())
}

/// Exclusive open for commands that write the store.
async fn open(config: &AppConfig) -> Result<Arc<Scheduler>> {
    bootstrap(config, Arc::new(DryRunExecutor), Arc::new(UnavailableRanking)).await
}

async fn run(config: AppConfig, cycles: Option<u64>) -> Result<()> {
    if !config.agent.setup_complete {
        bail!(
            "agent setup is not complete; \
             set agent.setup_complete = true in the config to start scheduling"
        );
    }

    let scheduler = open(&config).await?;
    let options = DaemonOptions {
        max_cycles: cycles,
        ..DaemonOptions::from_config(&config)
    };
    info!(agent = %config.agent.name, "starting scheduler");
    let (handle, mut task) = spawn(scheduler, options);

    tokio::select! {
        finished = &mut task => return finished?,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, stopping after the current cycle");
            handle.stop();
        }
    }
    task.await?
}
