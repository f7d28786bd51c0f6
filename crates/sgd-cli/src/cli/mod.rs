//! CLI for the SGD download manager.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use sgd_core::config;

use commands::{
    open_manager, run_add, run_cancel, run_clear, run_move, run_remove, run_retry, run_run,
    run_status,
};

/// Top-level CLI for the SGD download manager.
#[derive(Debug, Parser)]
#[command(name = "sgd")]
#[command(about = "SGD: queued Steam game downloader driving SteamCMD", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Queue a new game download.
    Add {
        /// Steam app id to download.
        app_id: u32,

        /// Display name override (default: store catalog name).
        #[arg(long)]
        name: Option<String>,

        /// Target platform: windows (default), linux or macos.
        #[arg(long)]
        platform: Option<String>,

        /// Steam account name; omit for anonymous login (free games only).
        #[arg(long)]
        username: Option<String>,

        /// Account password; falls back to $SGD_STEAM_PASSWORD.
        #[arg(long)]
        password: Option<String>,

        /// Steam Guard code, if the account has one enabled.
        #[arg(long)]
        guard_code: Option<String>,

        /// Verify files after download (overrides the config default).
        #[arg(long, conflicts_with = "no_validate")]
        validate: bool,

        /// Skip file verification (overrides the config default).
        #[arg(long)]
        no_validate: bool,
    },

    /// Run the download engine until the queue is drained.
    Run,

    /// Show active, queued and finished jobs.
    Status,

    /// Cancel a job by its ID.
    Cancel {
        /// Job identifier.
        id: i64,
    },

    /// Retry a failed or cancelled job by its ID.
    Retry {
        /// Job identifier.
        id: i64,
    },

    /// Move a queued job to another queue position (1-based).
    Move {
        /// Current position in the queue.
        from: usize,
        /// Position to move to.
        to: usize,
    },

    /// Remove a queued job by its queue position (1-based).
    Remove {
        /// Position in the queue.
        position: usize,
    },

    /// Clear finished jobs from history.
    Clear {
        /// Only clear one terminal state: completed, failed or cancelled.
        #[arg(long)]
        state: Option<String>,
    },
}

impl CliCommand {
    pub async fn run_from_args() -> Result<()> {
        let cli = Cli::parse();
        let cfg = config::load_or_init()?;
        tracing::debug!("loaded config: {:?}", cfg);
        let manager = open_manager(cfg).await?;

        match cli.command {
            CliCommand::Add {
                app_id,
                name,
                platform,
                username,
                password,
                guard_code,
                validate,
                no_validate,
            } => {
                run_add(
                    &manager, app_id, name, platform, username, password, guard_code, validate,
                    no_validate,
                )
                .await?
            }
            CliCommand::Run => run_run(&manager).await?,
            CliCommand::Status => run_status(&manager)?,
            CliCommand::Cancel { id } => run_cancel(&manager, id).await?,
            CliCommand::Retry { id } => run_retry(&manager, id).await?,
            CliCommand::Move { from, to } => run_move(&manager, from, to).await?,
            CliCommand::Remove { position } => run_remove(&manager, position).await?,
            CliCommand::Clear { state } => run_clear(&manager, state).await?,
        }

        Ok(())
    }
}
