use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};

use quill_core::config::DatabaseConfig;
use quill_core::error::{QuillError, Result};

/// Postgres connection pool.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect using the configured URL and pool limits.
    pub async fn from_config(config: &DatabaseConfig) -> Result<Self> {
        if !config.is_configured() {
            return Err(QuillError::Config("database.url is empty".into()));
        }

        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(Duration::from_secs(config.pool_timeout_secs))
            .connect(&config.url)
            .await
            .map_err(|e| QuillError::Database(format!("Failed to connect: {}", e)))?;

        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database connectivity.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| QuillError::Database(format!("Health check failed: {}", e)))?;
        Ok(())
    }

    /// Close all connections gracefully.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unconfigured_url_is_rejected() {
        let err = Database::from_config(&DatabaseConfig::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, QuillError::Config(_)));
    }
}
