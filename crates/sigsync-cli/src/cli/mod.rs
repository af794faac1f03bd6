use anyhow::Result;
use clap::{Parser, Subcommand};
use sigsync_core::config;
use std::path::PathBuf;

mod commands;


/// Top-level CLI for the sigsync content-synchronization engine.
#[derive(Debug, Parser)]
#[command(name = "sigsync")]
#[command(about = "sigsync: signage-player content synchronization", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Run one synchronization pass against the required-files manifest.
    Sync {
        /// Path to the manifest document; defaults to
        /// `required-files.json` under the library root.
        #[arg(long)]
        manifest: Option<PathBuf>,
    },

    /// Show the digest cache and manifest completion state.
    Status,

    /// Compute the MD5 digest of a file.
    Digest {
        /// File to hash.
        path: PathBuf,
    },

    /// Reconcile the digest cache against the required-files document.
    Regenerate,
}

impl CliCommand {
    pub fn run_from_args() -> Result<()> {
        let cli = Cli::parse();

        // Load global config early; every command hands it down explicitly.
        let cfg = config::load_or_init()?;
        tracing::debug!("loaded config: {:?}", cfg);

        match cli.command {
            CliCommand::Sync { manifest } => commands::sync::run_sync(&cfg, manifest),
            CliCommand::Status => commands::status::run_status(&cfg),
            CliCommand::Digest { path } => commands::digest::run_digest(&path),
            CliCommand::Regenerate => commands::regenerate::run_regenerate(&cfg),
        }
    }
}
