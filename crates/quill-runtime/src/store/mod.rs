//! Postgres-backed run store.

mod postgres;

pub use postgres::PgRunStore;
