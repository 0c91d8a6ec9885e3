use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::record::StepRecord;
use super::runner::StepRunner;
use crate::error::{QuillError, Result};
use crate::event::{Event, EventBus, SendReceipt};
use crate::run::{RunRecord, RunStatus};
use crate::store::RunStore;

/// The step that ran during the current invocation.
#[derive(Debug, Clone)]
pub struct ExecutedStep {
    pub record: StepRecord,
    /// The error the step failed with, when it failed.
    pub error: Option<ExecutedError>,
}

/// Failure of the executed step, kept so the engine can apply retry policy.
#[derive(Debug, Clone)]
pub struct ExecutedError {
    pub message: String,
    pub retryable: bool,
}

#[derive(Default)]
struct Replay {
    seen: HashMap<String, u32>,
    position: u32,
    executed: Option<ExecutedStep>,
}

pub(crate) enum Begin {
    Memoized(serde_json::Value),
    Execute {
        name: String,
        position: u32,
        attempts: u32,
    },
}

/// Context handed to a function body for one invocation.
///
/// Holds the memoized step results of the run. At most one step without a
/// memoized result executes per invocation; reaching another one returns
/// [`QuillError::StepInterrupt`], which the body propagates with `?`.
pub struct StepContext {
    run_id: Uuid,
    function_id: String,
    event: Event,
    attempt: u32,
    store: Arc<dyn RunStore>,
    bus: Option<Arc<dyn EventBus>>,
    memo: HashMap<String, StepRecord>,
    replay: Mutex<Replay>,
}

impl StepContext {
    /// Create a context for the given run.
    pub fn new(run: &RunRecord, store: Arc<dyn RunStore>) -> Self {
        Self {
            run_id: run.id,
            function_id: run.function_id.clone(),
            event: run.event.clone(),
            attempt: run.attempt + 1,
            store,
            bus: None,
            memo: HashMap::new(),
            replay: Mutex::new(Replay::default()),
        }
    }

    /// Restore persisted step records.
    pub fn with_steps(mut self, steps: Vec<StepRecord>) -> Self {
        self.memo = steps
            .into_iter()
            .map(|s| (s.step_name.clone(), s))
            .collect();
        self
    }

    /// Attach the bus used by [`StepContext::send_event`].
    pub fn with_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn function_id(&self) -> &str {
        &self.function_id
    }

    /// The triggering event.
    pub fn event(&self) -> &Event {
        &self.event
    }

    /// Current attempt of the pending step, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Whether a step already has a memoized result.
    pub fn is_step_completed(&self, name: &str) -> bool {
        self.memo.get(name).is_some_and(StepRecord::is_succeeded)
    }

    /// Typed memoized result of a completed step.
    pub fn get_step_result<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        self.memo
            .get(name)
            .filter(|s| s.is_succeeded())
            .and_then(|s| s.result.clone())
            .and_then(|v| serde_json::from_value(v).ok())
    }

    /// Declare a durable step.
    ///
    /// ```ignore
    /// let user = ctx
    ///     .step("load-user", || async { users.find(id).await })
    ///     .run()
    ///     .await?;
    /// ```
    pub fn step<'a, T, F, Fut>(&'a self, name: impl Into<String>, work: F) -> StepRunner<'a, T>
    where
        T: Serialize + DeserializeOwned + Send + 'a,
        F: FnOnce() -> Fut + Send + 'a,
        Fut: Future<Output = Result<T>> + Send + 'a,
    {
        StepRunner::new(self, name, work)
    }

    /// Emit events as a memoized step.
    ///
    /// Events without an id get one derived from the run and step name, so a
    /// retried send does not start duplicate runs downstream.
    pub async fn send_event(&self, name: &str, events: Vec<Event>) -> Result<SendReceipt> {
        let bus = self
            .bus
            .clone()
            .ok_or_else(|| QuillError::Config("no event bus attached to step context".into()))?;
        let prefix = format!("{}:{}", self.run_id, name);
        let events: Vec<Event> = events
            .into_iter()
            .enumerate()
            .map(|(i, e)| {
                if e.event_id().is_empty() {
                    e.with_id(format!("{prefix}:{i}"))
                } else {
                    e
                }
            })
            .collect();

        self.step(name, move || async move { bus.send(events).await })
            .run()
            .await
    }

    /// The step executed during this invocation, if any.
    pub async fn executed(&self) -> Option<ExecutedStep> {
        self.replay.lock().await.executed.clone()
    }

    pub(crate) async fn begin(&self, name: &str) -> Result<Begin> {
        let mut replay = self.replay.lock().await;

        let count = replay.seen.entry(name.to_string()).or_insert(0);
        let unique = if *count == 0 {
            name.to_string()
        } else {
            format!("{name}:{count}")
        };
        *count += 1;
        let position = replay.position;
        replay.position += 1;

        if let Some(record) = self.memo.get(&unique).filter(|s| s.is_succeeded()) {
            tracing::debug!(run_id = %self.run_id, step = %unique, "Step memoized");
            return Ok(Begin::Memoized(
                record.result.clone().unwrap_or(serde_json::Value::Null),
            ));
        }

        if let Some(executed) = &replay.executed {
            return Err(QuillError::StepInterrupt(executed.record.step_name.clone()));
        }
        drop(replay);

        match self.store.get_run(self.run_id).await? {
            Some(run) if run.status == RunStatus::Cancelled => return Err(QuillError::Cancelled),
            Some(_) => {}
            None => return Err(QuillError::NotFound(format!("run {}", self.run_id))),
        }

        let attempts = self.memo.get(&unique).map(|s| s.attempts).unwrap_or(0);
        Ok(Begin::Execute {
            name: unique,
            position,
            attempts,
        })
    }

    pub(crate) async fn finish(&self, record: StepRecord, error: Option<&QuillError>) -> Result<()> {
        self.store.save_step(record.clone()).await?;
        let error = error.map(|e| ExecutedError {
            message: e.to_string(),
            retryable: e.is_retryable(),
        });
        self.replay.lock().await.executed = Some(ExecutedStep { record, error });
        Ok(())
    }
}
