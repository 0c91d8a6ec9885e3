use std::path::Path;

use anyhow::Result;
use clap::{Parser, Subcommand};
use console::style;

use quill::ports::product_migrations;
use quill_core::config::QuillConfig;
use quill_runtime::migrations::{builtin_migrations, load_migrations_from_dir, Migration, MigrationRunner};
use quill_runtime::Database;

/// Manage database migrations.
#[derive(Parser)]
pub struct MigrateCommand {
    #[command(subcommand)]
    pub action: MigrateAction,

    /// Configuration file path.
    #[arg(short, long, default_value = "quill.toml", global = true)]
    pub config: String,

    /// Additional migrations directory.
    #[arg(short, long, default_value = "migrations", global = true)]
    pub migrations_dir: String,
}

#[derive(Subcommand)]
pub enum MigrateAction {
    /// Apply all pending migrations.
    Up,

    /// List known migrations in the order they apply.
    List,
}

impl MigrateCommand {
    fn app_migrations(&self) -> Result<Vec<Migration>> {
        let mut migrations = product_migrations();
        migrations.extend(load_migrations_from_dir(Path::new(&self.migrations_dir))?);
        Ok(migrations)
    }

    pub async fn execute(self) -> Result<()> {
        dotenvy::dotenv().ok();

        println!();
        println!("  {} Migrations", style("QUILL").bold().cyan());
        println!();

        let app = self.app_migrations()?;

        match self.action {
            MigrateAction::List => {
                for migration in builtin_migrations().iter().chain(app.iter()) {
                    println!("    {} {}", style("→").dim(), style(&migration.name).cyan());
                }
            }
            MigrateAction::Up => {
                let config_path = Path::new(&self.config);
                let mut config = if config_path.exists() {
                    QuillConfig::from_file(config_path)?
                } else {
                    QuillConfig::default()
                };
                if !config.database.is_configured() {
                    if let Ok(url) = std::env::var("DATABASE_URL") {
                        config.database.url = url;
                    }
                }
                if !config.database.is_configured() {
                    anyhow::bail!(
                        "No database configured: set database.url in {} or DATABASE_URL",
                        self.config
                    );
                }

                let db = Database::from_config(&config.database).await?;
                println!("  {} Running pending migrations...", style("→").dim());
                let applied = MigrationRunner::new(db.pool().clone()).run(app).await?;
                db.close().await;

                if applied.is_empty() {
                    println!("  {} Already up to date", style("ℹ").blue());
                } else {
                    for name in &applied {
                        println!("  {} Applied: {}", style("✓").green(), name);
                    }
                }
            }
        }

        println!();
        Ok(())
    }
}
