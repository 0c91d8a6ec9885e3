use anyhow::{Context, Result};
use clap::Parser;
use console::style;

use quill_core::config::QuillConfig;
use quill_core::event::{Event, EventBus};
use quill_runtime::HttpEventBus;

/// Send one event to the broker.
#[derive(Parser)]
pub struct SendCommand {
    /// Event name, e.g. `users/import.requested`.
    pub name: String,

    /// JSON payload.
    #[arg(short, long, default_value = "{}")]
    pub data: String,

    /// Event id used for deduplication.
    #[arg(long)]
    pub id: Option<String>,

    /// Configuration file path.
    #[arg(short, long, default_value = "quill.toml")]
    pub config: String,

    /// Broker base URL (overrides config).
    #[arg(long)]
    pub url: Option<String>,

    /// Event key (overrides config).
    #[arg(long)]
    pub key: Option<String>,
}

impl SendCommand {
    fn event(&self) -> Result<Event> {
        let data: serde_json::Value =
            serde_json::from_str(&self.data).context("--data is not valid JSON")?;
        let mut event = Event::new(&self.name, data);
        if let Some(id) = &self.id {
            event = event.with_id(id);
        }
        event.validate()?;
        Ok(event)
    }

    pub async fn execute(self) -> Result<()> {
        dotenvy::dotenv().ok();
        let event = self.event()?;

        let config = if std::path::Path::new(&self.config).exists() {
            QuillConfig::from_file(&self.config)?
        } else {
            QuillConfig::default()
        };
        let url = self
            .url
            .clone()
            .or(config.broker.url)
            .context("No broker URL: pass --url or set broker.url")?;
        let key = self
            .key
            .clone()
            .or(config.broker.event_key)
            .unwrap_or_default();

        let bus = HttpEventBus::new(&url, &key)?;
        let receipt = bus.send(vec![event]).await?;

        for id in &receipt.ids {
            println!("  {} Sent {} ({})", style("✓").green(), self.name, id);
        }
        Ok(())
    }
}
