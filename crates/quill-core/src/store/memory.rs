use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{Claim, RunCreation, RunStore};
use crate::error::Result;
use crate::run::{RunRecord, RunStatus};
use crate::step::{StepRecord, StepStatus};

type DedupKey = (String, String, String);

#[derive(Default)]
struct Inner {
    runs: HashMap<Uuid, RunRecord>,
    by_event: HashMap<DedupKey, Uuid>,
    steps: HashMap<Uuid, Vec<StepRecord>>,
}

/// Process-local run store.
///
/// Used in tests and when no database is configured. State is lost on restart.
#[derive(Clone, Default)]
pub struct MemoryRunStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored run.
    pub async fn runs(&self) -> Vec<RunRecord> {
        let inner = self.inner.lock().await;
        let mut runs: Vec<_> = inner.runs.values().cloned().collect();
        runs.sort_by_key(|r| r.created_at);
        runs
    }
}

fn dedup_key(run: &RunRecord) -> DedupKey {
    (
        run.function_id.clone(),
        run.event.name.clone(),
        run.event_id.clone(),
    )
}

impl RunStore for MemoryRunStore {
    fn create_run(&self, run: RunRecord) -> BoxFuture<'_, Result<RunCreation>> {
        Box::pin(async move {
            let mut inner = self.inner.lock().await;
            let key = dedup_key(&run);
            if let Some(existing) = inner.by_event.get(&key) {
                return Ok(RunCreation::Existing(*existing));
            }
            let id = run.id;
            inner.by_event.insert(key, id);
            inner.runs.insert(id, run);
            Ok(RunCreation::Created(id))
        })
    }

    fn get_run(&self, run_id: Uuid) -> BoxFuture<'_, Result<Option<RunRecord>>> {
        Box::pin(async move { Ok(self.inner.lock().await.runs.get(&run_id).cloned()) })
    }

    fn update_run(&self, run: RunRecord) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async move {
            let mut inner = self.inner.lock().await;
            match inner.runs.get_mut(&run.id) {
                Some(stored) if !stored.status.is_terminal() => {
                    let lease = stored.leased_until;
                    *stored = RunRecord {
                        leased_until: lease,
                        ..run
                    };
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    fn cancel_run(&self, run_id: Uuid) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async move {
            let mut inner = self.inner.lock().await;
            match inner.runs.get_mut(&run_id) {
                Some(run) if !run.status.is_terminal() => {
                    run.cancel()?;
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    fn claim_run(&self, run_id: Uuid, limit: Option<u32>) -> BoxFuture<'_, Result<Claim>> {
        Box::pin(async move {
            let mut inner = self.inner.lock().await;
            let Some(run) = inner.runs.get(&run_id) else {
                return Ok(Claim::Finished);
            };
            match run.status {
                RunStatus::Running => return Ok(Claim::Claimed),
                s if s.is_terminal() => return Ok(Claim::Finished),
                _ => {}
            }

            if let Some(limit) = limit {
                let running = inner
                    .runs
                    .values()
                    .filter(|r| {
                        r.status == RunStatus::Running
                            && r.function_id == run.function_id
                            && r.concurrency_key == run.concurrency_key
                    })
                    .count();
                if running >= limit as usize {
                    return Ok(Claim::Throttled);
                }
            }

            if let Some(run) = inner.runs.get_mut(&run_id) {
                run.start()?;
            }
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
            let mut inner = self.inner.lock().await;
            match inner.runs.get_mut(&run_id) {
                Some(run) if run.leased_until.map_or(true, |l| l <= now) => {
                    run.leased_until = Some(until);
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    fn release_lease(&self, run_id: Uuid, until: DateTime<Utc>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if let Some(run) = self.inner.lock().await.runs.get_mut(&run_id) {
                if run.leased_until == Some(until) {
                    run.leased_until = None;
                }
            }
            Ok(())
        })
    }

    fn list_steps(&self, run_id: Uuid) -> BoxFuture<'_, Result<Vec<StepRecord>>> {
        Box::pin(async move {
            let inner = self.inner.lock().await;
            let mut steps = inner.steps.get(&run_id).cloned().unwrap_or_default();
            steps.sort_by_key(|s| s.position);
            Ok(steps)
        })
    }

    fn save_step(&self, step: StepRecord) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut inner = self.inner.lock().await;
            let steps = inner.steps.entry(step.run_id).or_default();
            match steps.iter_mut().find(|s| s.step_name == step.step_name) {
                Some(existing) if existing.status == StepStatus::Succeeded => {}
                Some(existing) => *existing = step,
                None => steps.push(step),
            }
            Ok(())
        })
    }

    fn due_runs(&self, now: DateTime<Utc>, limit: usize) -> BoxFuture<'_, Result<Vec<Uuid>>> {
        Box::pin(async move {
            let inner = self.inner.lock().await;
            let mut due: Vec<_> = inner
                .runs
                .values()
                .filter(|r| !r.status.is_terminal())
                .filter(|r| r.next_run_at.is_some_and(|at| at <= now))
                .filter(|r| r.leased_until.map_or(true, |l| l <= now))
                .collect();
            due.sort_by_key(|r| r.next_run_at);
            Ok(due.into_iter().take(limit).map(|r| r.id).collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use serde_json::json;

    fn run_for(function_id: &str, event_id: &str, key: Option<&str>) -> RunRecord {
        RunRecord::new(
            function_id,
            Event::new("a/b", json!({})).with_id(event_id),
            key.map(str::to_string),
        )
    }

    #[tokio::test]
    async fn test_create_is_idempotent_per_function_and_event() {
        let store = MemoryRunStore::new();
        let first = store.create_run(run_for("f", "e1", None)).await.unwrap();
        let again = store.create_run(run_for("f", "e1", None)).await.unwrap();
        let other_fn = store.create_run(run_for("g", "e1", None)).await.unwrap();

        assert!(first.is_created());
        assert_eq!(again, RunCreation::Existing(first.run_id()));
        assert!(other_fn.is_created());
        assert_eq!(store.runs().await.len(), 2);
    }

    #[tokio::test]
    async fn test_claim_respects_limit_per_key() {
        let store = MemoryRunStore::new();
        let a1 = store.create_run(run_for("f", "1", Some("a"))).await.unwrap().run_id();
        let a2 = store.create_run(run_for("f", "2", Some("a"))).await.unwrap().run_id();
        let b1 = store.create_run(run_for("f", "3", Some("b"))).await.unwrap().run_id();

        assert_eq!(store.claim_run(a1, Some(1)).await.unwrap(), Claim::Claimed);
        assert_eq!(store.claim_run(a2, Some(1)).await.unwrap(), Claim::Throttled);
        assert_eq!(store.claim_run(b1, Some(1)).await.unwrap(), Claim::Claimed);
        assert_eq!(store.claim_run(a1, Some(1)).await.unwrap(), Claim::Claimed);

        let mut done = store.get_run(a1).await.unwrap().unwrap();
        done.complete(json!(null)).unwrap();
        assert!(store.update_run(done).await.unwrap());
        assert_eq!(store.claim_run(a2, Some(1)).await.unwrap(), Claim::Claimed);
    }

    #[tokio::test]
    async fn test_update_never_overwrites_terminal() {
        let store = MemoryRunStore::new();
        let id = store.create_run(run_for("f", "1", None)).await.unwrap().run_id();
        let stale = store.get_run(id).await.unwrap().unwrap();

        assert!(store.cancel_run(id).await.unwrap());
        assert!(!store.update_run(stale).await.unwrap());
        assert_eq!(
            store.get_run(id).await.unwrap().unwrap().status,
            RunStatus::Cancelled
        );
        assert!(!store.cancel_run(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_lease_is_exclusive_until_expiry() {
        let store = MemoryRunStore::new();
        let id = store.create_run(run_for("f", "1", None)).await.unwrap().run_id();
        let now = Utc::now();
        let until = now + chrono::Duration::seconds(30);

        assert!(store.try_lease(id, now, until).await.unwrap());
        assert!(!store.try_lease(id, now, until).await.unwrap());
        assert!(store.due_runs(now, 10).await.unwrap().is_empty());

        let later = until + chrono::Duration::seconds(1);
        let later_until = later + chrono::Duration::seconds(30);
        assert!(store.try_lease(id, later, later_until).await.unwrap());

        store.release_lease(id, later_until).await.unwrap();
        assert!(store.try_lease(id, now, until).await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_holder_cannot_release_newer_lease() {
        let store = MemoryRunStore::new();
        let id = store.create_run(run_for("f", "1", None)).await.unwrap().run_id();
        let now = Utc::now();
        let first = now + chrono::Duration::seconds(1);
        assert!(store.try_lease(id, now, first).await.unwrap());

        let later = first + chrono::Duration::seconds(1);
        let second = later + chrono::Duration::seconds(30);
        assert!(store.try_lease(id, later, second).await.unwrap());

        store.release_lease(id, first).await.unwrap();
        assert!(!store.try_lease(id, later, second).await.unwrap());

        store.release_lease(id, second).await.unwrap();
        assert!(store.try_lease(id, later, second).await.unwrap());
    }

    #[tokio::test]
    async fn test_succeeded_step_is_immutable() {
        let store = MemoryRunStore::new();
        let run_id = Uuid::new_v4();
        store
            .save_step(StepRecord::succeeded(run_id, "s", 0, 1, json!(1)))
            .await
            .unwrap();
        store
            .save_step(StepRecord::succeeded(run_id, "s", 0, 2, json!(2)))
            .await
            .unwrap();
        store
            .save_step(StepRecord::failed(run_id, "s", 0, 3, "late"))
            .await
            .unwrap();

        let steps = store.list_steps(run_id).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].result, Some(json!(1)));
    }
}
