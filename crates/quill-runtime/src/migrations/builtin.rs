//! Built-in schema, applied before any application migrations.

use super::runner::Migration;

const QUILL_RUNS_SQL: &str = include_str!("../../migrations/0001_quill_runs.sql");

/// Migrations owned by the engine, in apply order.
pub fn builtin_migrations() -> Vec<Migration> {
    vec![Migration::new("0001_quill_runs", QUILL_RUNS_SQL)]
}
