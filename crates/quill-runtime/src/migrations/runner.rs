//! Migration runner guarded by a Postgres advisory lock.
//!
//! Several processes may boot against the same database; only the one holding
//! the lock applies pending migrations, the others wait and then find nothing
//! left to do.

use std::collections::HashSet;
use std::path::Path;

use quill_core::error::{QuillError, Result};
use sqlx::PgPool;
use tracing::{debug, info, warn};

/// "QUILL" in ASCII.
const MIGRATION_LOCK_ID: i64 = 0x5155494C4C;

/// A named SQL script.
#[derive(Debug, Clone)]
pub struct Migration {
    /// Sort key and identity, e.g. `0001_quill_runs`.
    pub name: String,
    pub sql: String,
}

impl Migration {
    pub fn new(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql: sql.into(),
        }
    }
}

/// Applies built-in and application migrations once each.
pub struct MigrationRunner {
    pool: PgPool,
}

impl MigrationRunner {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply pending migrations, built-in ones first.
    ///
    /// Returns the names of the migrations applied by this call.
    pub async fn run(&self, app_migrations: Vec<Migration>) -> Result<Vec<String>> {
        // Session-level locks belong to one connection, so hold one for the
        // whole run.
        let mut conn = self.pool.acquire().await.map_err(|e| {
            QuillError::Database(format!("Failed to acquire migration connection: {}", e))
        })?;

        debug!("Acquiring migration lock");
        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(MIGRATION_LOCK_ID)
            .execute(&mut *conn)
            .await
            .map_err(|e| QuillError::Database(format!("Failed to acquire migration lock: {}", e)))?;

        let result = self.apply_pending(app_migrations).await;

        if let Err(e) = sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(MIGRATION_LOCK_ID)
            .execute(&mut *conn)
            .await
        {
            warn!(error = %e, "Failed to release migration lock");
        }

        result
    }

    async fn apply_pending(&self, app_migrations: Vec<Migration>) -> Result<Vec<String>> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS quill_migrations (
                name VARCHAR(255) PRIMARY KEY,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| QuillError::Database(format!("Failed to create migrations table: {}", e)))?;

        let applied: HashSet<String> = sqlx::query_scalar("SELECT name FROM quill_migrations")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| QuillError::Database(format!("Failed to read applied migrations: {}", e)))?
            .into_iter()
            .collect();

        let mut newly_applied = Vec::new();
        for migration in super::builtin::builtin_migrations()
            .into_iter()
            .chain(app_migrations)
        {
            if applied.contains(&migration.name) {
                continue;
            }
            self.apply(&migration).await?;
            newly_applied.push(migration.name);
        }

        Ok(newly_applied)
    }

    async fn apply(&self, migration: &Migration) -> Result<()> {
        info!(migration = %migration.name, "Applying migration");

        let fail = |e: sqlx::Error| {
            QuillError::Database(format!("Migration '{}' failed: {}", migration.name, e))
        };

        let mut tx = self.pool.begin().await.map_err(fail)?;
        sqlx::raw_sql(&migration.sql)
            .execute(&mut *tx)
            .await
            .map_err(fail)?;
        sqlx::query("INSERT INTO quill_migrations (name) VALUES ($1)")
            .bind(&migration.name)
            .execute(&mut *tx)
            .await
            .map_err(fail)?;
        tx.commit().await.map_err(fail)?;

        Ok(())
    }
}

/// Load application migrations from a directory of `NNNN_name.sql` files,
/// sorted by name. A missing directory yields no migrations.
pub fn load_migrations_from_dir(dir: &Path) -> Result<Vec<Migration>> {
    if !dir.exists() {
        debug!(dir = %dir.display(), "No migrations directory");
        return Ok(Vec::new());
    }

    let mut migrations = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().map_or(true, |ext| ext != "sql") {
            continue;
        }
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| QuillError::Config(format!("Invalid migration file {:?}", path)))?
            .to_string();
        migrations.push(Migration::new(name, std::fs::read_to_string(&path)?));
    }

    migrations.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(migrations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_missing_dir_is_empty() {
        let migrations = load_migrations_from_dir(Path::new("/nonexistent/quill")).unwrap();
        assert!(migrations.is_empty());
    }

    #[test]
    fn test_load_sorted_sql_only() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("0002_submissions.sql"), "SELECT 2;").unwrap();
        fs::write(dir.path().join("0001_users.sql"), "SELECT 1;").unwrap();
        fs::write(dir.path().join("notes.txt"), "not sql").unwrap();
        fs::write(dir.path().join("0003_old.sql.bak"), "backup").unwrap();

        let migrations = load_migrations_from_dir(dir.path()).unwrap();
        let names: Vec<_> = migrations.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["0001_users", "0002_submissions"]);
        assert_eq!(migrations[0].sql, "SELECT 1;");
    }
}
