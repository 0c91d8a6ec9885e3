mod migrate;
mod serve;
mod send;

pub use migrate::MigrateCommand;
pub use serve::ServeCommand;
pub use send::SendCommand;

use anyhow::Result;
use clap::{Parser, Subcommand};

/// Quill - durable background jobs for the learning platform
#[derive(Parser)]
#[command(name = "quill")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// CLI commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Serve the webhook endpoint and, in embedded mode, drive runs.
    Serve(ServeCommand),

    /// Manage database migrations.
    Migrate(MigrateCommand),

    /// Send one event to the broker.
    Send(SendCommand),
}

impl Cli {
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Serve(cmd) => cmd.execute().await,
            Commands::Migrate(cmd) => cmd.execute().await,
            Commands::Send(cmd) => cmd.execute().await,
        }
    }
}
