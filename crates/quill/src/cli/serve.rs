use anyhow::Result;
use clap::Parser;
use console::style;
use tracing::info;

use quill::Quill;
use quill_core::config::{EngineMode, QuillConfig};

/// Serve the Quill runtime.
#[derive(Parser)]
pub struct ServeCommand {
    /// Configuration file path.
    #[arg(short, long, default_value = "quill.toml")]
    pub config: String,

    /// Port to listen on (overrides config).
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Let an external broker drive runs instead of the embedded scheduler.
    #[arg(long, conflicts_with = "embedded")]
    pub broker: bool,

    /// Drive runs with the embedded scheduler (overrides config).
    #[arg(long)]
    pub embedded: bool,

    /// Additional migrations directory.
    #[arg(short, long, default_value = "migrations")]
    pub migrations_dir: String,
}

impl ServeCommand {
    /// Load the config file, or defaults when it does not exist.
    fn load_config(&self) -> Result<QuillConfig> {
        let mut config = if std::path::Path::new(&self.config).exists() {
            QuillConfig::from_file(&self.config)?
        } else {
            QuillConfig::default()
        };

        if let Some(port) = self.port {
            config.webhook.port = port;
        }
        if self.broker {
            config.engine.mode = EngineMode::Broker;
        }
        if self.embedded {
            config.engine.mode = EngineMode::Embedded;
        }
        if !config.database.is_configured() {
            if let Ok(url) = std::env::var("DATABASE_URL") {
                config.database.url = url;
            }
        }
        Ok(config)
    }

    pub async fn execute(self) -> Result<()> {
        dotenvy::dotenv().ok();

        let config = self.load_config()?;
        quill_runtime::init_tracing(&config.observability)?;

        println!();
        println!(
            "  {} v{}",
            style("QUILL").bold().cyan(),
            env!("CARGO_PKG_VERSION")
        );
        println!();
        println!(
            "  {} Webhook at {}",
            style("→").dim(),
            style(format!(
                "http://0.0.0.0:{}{}",
                config.webhook.port, config.webhook.path
            ))
            .cyan()
        );
        let mode = match config.engine.mode {
            EngineMode::Embedded => "embedded scheduler",
            EngineMode::Broker => "broker callbacks",
        };
        println!("  {} Runs driven by {}", style("→").dim(), mode);
        if !config.database.is_configured() {
            println!(
                "  {} No database configured, state is kept in memory",
                style("!").yellow()
            );
        }
        println!();

        info!(config = %self.config, "Configuration loaded");

        let quill = Quill::builder()
            .config(config)
            .migrations_dir(&self.migrations_dir)
            .build()?;
        quill.run().await?;

        println!("\n  {} Stopped", style("✓").green());
        Ok(())
    }
}
