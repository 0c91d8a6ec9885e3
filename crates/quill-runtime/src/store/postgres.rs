use std::str::FromStr;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use quill_core::error::{QuillError, Result};
use quill_core::run::{RunRecord, RunStatus};
use quill_core::step::{StepRecord, StepStatus};
use quill_core::store::{Claim, RunCreation, RunStore};
use quill_core::Event;

const RUN_COLUMNS: &str = r#"
    id, function_id, event_id, event, concurrency_key, status, attempt,
    next_run_at, created_at, started_at, completed_at, output, error, leased_until
"#;

/// Run store over the `quill_runs` and `quill_steps` tables.
#[derive(Clone)]
pub struct PgRunStore {
    pool: PgPool,
}

impl PgRunStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn run_from_row(row: &PgRow) -> Result<RunRecord> {
    let event: Event = serde_json::from_value(row.try_get("event")?)?;
    let status: String = row.try_get("status")?;
    let attempt: i32 = row.try_get("attempt")?;

    Ok(RunRecord {
        id: row.try_get("id")?,
        function_id: row.try_get("function_id")?,
        event_id: row.try_get("event_id")?,
        event,
        concurrency_key: row.try_get("concurrency_key")?,
        status: RunStatus::from_str(&status)?,
        attempt: u32::try_from(attempt).unwrap_or(0),
        next_run_at: row.try_get("next_run_at")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        output: row.try_get("output")?,
        error: row.try_get("error")?,
        leased_until: row.try_get("leased_until")?,
    })
}

fn step_from_row(row: &PgRow) -> Result<StepRecord> {
    let status: String = row.try_get("status")?;
    let position: i32 = row.try_get("position")?;
    let attempts: i32 = row.try_get("attempts")?;

    Ok(StepRecord {
        run_id: row.try_get("run_id")?,
        step_name: row.try_get("step_name")?,
        position: u32::try_from(position).unwrap_or(0),
        attempts: u32::try_from(attempts).unwrap_or(0),
        status: StepStatus::from_str(&status)?,
        result: row.try_get("result")?,
        error: row.try_get("error")?,
        updated_at: row.try_get("updated_at")?,
    })
}

impl RunStore for PgRunStore {
    fn create_run(&self, run: RunRecord) -> BoxFuture<'_, Result<RunCreation>> {
        Box::pin(async move {
            let event = serde_json::to_value(&run.event)?;
            let inserted: Option<Uuid> = sqlx::query_scalar(
                r#"
                INSERT INTO quill_runs (
                    id, function_id, event_name, event_id, event, concurrency_key,
                    status, attempt, next_run_at, created_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (function_id, event_name, event_id) DO NOTHING
                RETURNING id
                "#,
            )
            .bind(run.id)
            .bind(&run.function_id)
            .bind(&run.event.name)
            .bind(&run.event_id)
            .bind(&event)
            .bind(&run.concurrency_key)
            .bind(run.status.as_str())
            .bind(run.attempt as i32)
            .bind(run.next_run_at)
            .bind(run.created_at)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(id) = inserted {
                return Ok(RunCreation::Created(id));
            }

            let existing: Uuid = sqlx::query_scalar(
                r#"
                SELECT id FROM quill_runs
                WHERE function_id = $1 AND event_name = $2 AND event_id = $3
                "#,
            )
            .bind(&run.function_id)
            .bind(&run.event.name)
            .bind(&run.event_id)
            .fetch_one(&self.pool)
            .await?;

            Ok(RunCreation::Existing(existing))
        })
    }

    fn get_run(&self, run_id: Uuid) -> BoxFuture<'_, Result<Option<RunRecord>>> {
        Box::pin(async move {
            let row = sqlx::query(&format!("SELECT {RUN_COLUMNS} FROM quill_runs WHERE id = $1"))
                .bind(run_id)
                .fetch_optional(&self.pool)
                .await?;
            row.as_ref().map(run_from_row).transpose()
        })
    }

    fn update_run(&self, run: RunRecord) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async move {
            let result = sqlx::query(
                r#"
                UPDATE quill_runs
                SET status = $2,
                    attempt = $3,
                    next_run_at = $4,
                    started_at = $5,
                    completed_at = $6,
                    output = $7,
                    error = $8
                WHERE id = $1
                  AND status NOT IN ('completed', 'failed', 'cancelled')
                "#,
            )
            .bind(run.id)
            .bind(run.status.as_str())
            .bind(run.attempt as i32)
            .bind(run.next_run_at)
            .bind(run.started_at)
            .bind(run.completed_at)
            .bind(&run.output)
            .bind(&run.error)
            .execute(&self.pool)
            .await?;

            Ok(result.rows_affected() > 0)
        })
    }

    fn cancel_run(&self, run_id: Uuid) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async move {
            let result = sqlx::query(
                r#"
                UPDATE quill_runs
                SET status = 'cancelled', completed_at = NOW(), next_run_at = NULL
                WHERE id = $1
                  AND status NOT IN ('completed', 'failed', 'cancelled')
                "#,
            )
            .bind(run_id)
            .execute(&self.pool)
            .await?;

            Ok(result.rows_affected() > 0)
        })
    }

    fn claim_run(&self, run_id: Uuid, limit: Option<u32>) -> BoxFuture<'_, Result<Claim>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await?;

            let row = sqlx::query(
                "SELECT function_id, concurrency_key, status FROM quill_runs WHERE id = $1 FOR UPDATE",
            )
            .bind(run_id)
            .fetch_optional(&mut *tx)
            .await?;

            let Some(row) = row else {
                return Ok(Claim::Finished);
            };
            let function_id: String = row.try_get("function_id")?;
            let key: Option<String> = row.try_get("concurrency_key")?;
            let status = RunStatus::from_str(&row.try_get::<String, _>("status")?)?;

            match status {
                RunStatus::Running => return Ok(Claim::Claimed),
                s if s.is_terminal() => return Ok(Claim::Finished),
                _ => {}
            }

            if let Some(limit) = limit {
                // Serializes claims for one (function, key) pair so the count
                // below cannot be raced.
                sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1 || ':' || COALESCE($2, '')))")
                    .bind(&function_id)
                    .bind(&key)
                    .execute(&mut *tx)
                    .await?;

                let running: i64 = sqlx::query_scalar(
                    r#"
                    SELECT COUNT(*) FROM quill_runs
                    WHERE function_id = $1
                      AND concurrency_key IS NOT DISTINCT FROM $2
                      AND status = 'running'
                    "#,
                )
                .bind(&function_id)
                .bind(&key)
                .fetch_one(&mut *tx)
                .await?;

                if running >= i64::from(limit) {
                    tx.commit().await?;
                    return Ok(Claim::Throttled);
                }
            }

            sqlx::query(
                r#"
                UPDATE quill_runs
                SET status = 'running', started_at = COALESCE(started_at, NOW())
                WHERE id = $1
                "#,
            )
            .bind(run_id)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;

            Ok(Claim::Claimed)
        })
    }

    fn try_lease(
        &self,
        run_id: Uuid,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async move {
            let result = sqlx::query(
                r#"
                UPDATE quill_runs
                SET leased_until = $3
                WHERE id = $1
                  AND (leased_until IS NULL OR leased_until <= $2)
                "#,
            )
            .bind(run_id)
            .bind(now)
            .bind(until)
            .execute(&self.pool)
            .await?;

            Ok(result.rows_affected() > 0)
        })
    }

    fn release_lease(&self, run_id: Uuid, until: DateTime<Utc>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            sqlx::query("UPDATE quill_runs SET leased_until = NULL WHERE id = $1 AND leased_until = $2")
                .bind(run_id)
                .bind(until)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
    }

    fn list_steps(&self, run_id: Uuid) -> BoxFuture<'_, Result<Vec<StepRecord>>> {
        Box::pin(async move {
            let rows = sqlx::query(
                r#"
                SELECT run_id, step_name, position, attempts, status, result, error, updated_at
                FROM quill_steps
                WHERE run_id = $1
                ORDER BY position
                "#,
            )
            .bind(run_id)
            .fetch_all(&self.pool)
            .await?;

            rows.iter().map(step_from_row).collect()
        })
    }

    fn save_step(&self, step: StepRecord) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            sqlx::query(
                r#"
                INSERT INTO quill_steps (
                    run_id, step_name, position, attempts, status, result, error, updated_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (run_id, step_name) DO UPDATE
                SET position = EXCLUDED.position,
                    attempts = EXCLUDED.attempts,
                    status = EXCLUDED.status,
                    result = EXCLUDED.result,
                    error = EXCLUDED.error,
                    updated_at = EXCLUDED.updated_at
                WHERE quill_steps.status <> 'succeeded'
                "#,
            )
            .bind(step.run_id)
            .bind(&step.step_name)
            .bind(step.position as i32)
            .bind(step.attempts as i32)
            .bind(step.status.as_str())
            .bind(&step.result)
            .bind(&step.error)
            .bind(step.updated_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
    }

    fn due_runs(&self, now: DateTime<Utc>, limit: usize) -> BoxFuture<'_, Result<Vec<Uuid>>> {
        Box::pin(async move {
            let limit = i64::try_from(limit)
                .map_err(|_| QuillError::InvalidState(format!("batch size {limit} too large")))?;
            let ids = sqlx::query_scalar(
                r#"
                SELECT id FROM quill_runs
                WHERE status IN ('scheduled', 'running')
                  AND next_run_at <= $1
                  AND (leased_until IS NULL OR leased_until <= $1)
                ORDER BY next_run_at
                LIMIT $2
                "#,
            )
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
            Ok(ids)
        })
    }
}
