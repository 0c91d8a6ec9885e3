//! Persistence seam for runs and step records.

mod memory;

pub use memory::MemoryRunStore;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use uuid::Uuid;

use crate::error::Result;
use crate::run::RunRecord;
use crate::step::StepRecord;

/// Result of [`RunStore::create_run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunCreation {
    /// A new run was stored.
    Created(Uuid),
    /// A run for the same `(function_id, event_id)` already existed.
    Existing(Uuid),
}

impl RunCreation {
    pub fn run_id(&self) -> Uuid {
        match self {
            Self::Created(id) | Self::Existing(id) => *id,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// Result of [`RunStore::claim_run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The run is `Running` (just claimed or claimed earlier).
    Claimed,
    /// The concurrency limit is reached; the run stays `Scheduled`.
    Throttled,
    /// The run is already terminal.
    Finished,
}

/// Durable storage of runs and their steps.
///
/// Every method is atomic with respect to concurrent callers on the same run.
pub trait RunStore: Send + Sync {
    /// Insert a run unless one exists for its `(function_id, event_id)`.
    fn create_run(&self, run: RunRecord) -> BoxFuture<'_, Result<RunCreation>>;

    fn get_run(&self, run_id: Uuid) -> BoxFuture<'_, Result<Option<RunRecord>>>;

    /// Persist run fields other than the lease.
    ///
    /// Returns `false` without writing when the stored run is already
    /// terminal, so a concurrent cancel is never overwritten.
    fn update_run(&self, run: RunRecord) -> BoxFuture<'_, Result<bool>>;

    /// Move a non-terminal run to `Cancelled`. Returns `false` if it was terminal.
    fn cancel_run(&self, run_id: Uuid) -> BoxFuture<'_, Result<bool>>;

    /// Move a `Scheduled` run to `Running` if fewer than `limit` runs of the
    /// same function and concurrency key are running.
    fn claim_run(&self, run_id: Uuid, limit: Option<u32>) -> BoxFuture<'_, Result<Claim>>;

    /// Take the advance lease unless another holder's lease is still live.
    fn try_lease(
        &self,
        run_id: Uuid,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<bool>>;

    /// Clear the lease if it is still the one taken with `until`.
    fn release_lease(&self, run_id: Uuid, until: DateTime<Utc>) -> BoxFuture<'_, Result<()>>;

    /// Step records of a run, ordered by position.
    fn list_steps(&self, run_id: Uuid) -> BoxFuture<'_, Result<Vec<StepRecord>>>;

    /// Upsert a step record. A `Succeeded` record is never replaced.
    fn save_step(&self, step: StepRecord) -> BoxFuture<'_, Result<()>>;

    /// Non-terminal runs whose `next_run_at` has passed and whose lease is free.
    fn due_runs(&self, now: DateTime<Utc>, limit: usize) -> BoxFuture<'_, Result<Vec<Uuid>>>;
}
