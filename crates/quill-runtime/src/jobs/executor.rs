use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::Instrument;
use uuid::Uuid;

use quill_core::config::EngineConfig;
use quill_core::error::{QuillError, Result};
use quill_core::function::RetryConfig;
use quill_core::run::{RunRecord, RunStatus};
use quill_core::step::{StepContext, StepRecord};
use quill_core::store::{Claim, RunStore};
use quill_core::EventBus;

use super::registry::{FunctionEntry, FunctionRegistry};

/// Executor timing knobs.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// How long one advance may hold a run.
    pub lease: Duration,
    /// Delay before a throttled run is reconsidered.
    pub throttle_delay: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for ExecutorConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            lease: Duration::from_secs(config.lease_secs),
            throttle_delay: Duration::from_millis(config.throttle_delay_ms),
        }
    }
}

/// Result of advancing a run by one invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum AdvanceOutcome {
    /// A step finished and the body has more to do.
    StepCompleted { step: String, result: Value },
    /// The body returned.
    Completed { output: Value },
    /// The invocation failed and will be attempted again.
    RetryScheduled {
        step: Option<String>,
        attempt: u32,
        retry_after: Duration,
        error: String,
    },
    /// The run failed for good.
    Failed { error: String },
    Cancelled,
    /// The concurrency limit is reached; nothing ran.
    Throttled { retry_after: Duration },
    /// Another caller holds the run's lease.
    Busy,
}

impl AdvanceOutcome {
    /// Whether the run still needs advancing.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            Self::StepCompleted { .. }
                | Self::RetryScheduled { .. }
                | Self::Throttled { .. }
                | Self::Busy
        )
    }
}

/// A run with its step records.
#[derive(Debug, Clone, Serialize)]
pub struct RunView {
    #[serde(flatten)]
    pub run: RunRecord,
    pub steps: Vec<StepRecord>,
}

/// Slack added on top of a function's timeout when sizing its lease.
const LEASE_MARGIN: Duration = Duration::from_secs(30);

fn chrono_delay(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365))
}

fn terminal_outcome(run: &RunRecord) -> Option<AdvanceOutcome> {
    match run.status {
        RunStatus::Completed => Some(AdvanceOutcome::Completed {
            output: run.output.clone().unwrap_or(Value::Null),
        }),
        RunStatus::Failed => Some(AdvanceOutcome::Failed {
            error: run.error.clone().unwrap_or_else(|| "run failed".into()),
        }),
        RunStatus::Cancelled => Some(AdvanceOutcome::Cancelled),
        RunStatus::Scheduled | RunStatus::Running => None,
    }
}

/// Apply the retry policy to a failed invocation.
fn fail_or_retry(
    run: &mut RunRecord,
    retry: &RetryConfig,
    step: Option<String>,
    error: String,
    retryable: bool,
) -> Result<AdvanceOutcome> {
    if !retryable {
        run.fail(error.clone())?;
        return Ok(AdvanceOutcome::Failed { error });
    }

    let attempt = run.attempt + 1;
    if !retry.allows_retry(attempt) {
        let error = format!("{error} (gave up after {attempt} attempts)");
        run.fail(error.clone())?;
        return Ok(AdvanceOutcome::Failed { error });
    }

    let retry_after = retry.calculate_backoff(attempt);
    run.schedule_retry(Utc::now() + chrono_delay(retry_after), error.clone());
    Ok(AdvanceOutcome::RetryScheduled {
        step,
        attempt,
        retry_after,
        error,
    })
}

/// Advances runs one invocation at a time.
///
/// Each call replays the function body against the run's memoized steps,
/// executes at most one new step, then persists the run's next state. The
/// caller (a broker callback or the embedded scheduler) decides when to call
/// again.
pub struct Executor {
    registry: Arc<FunctionRegistry>,
    store: Arc<dyn RunStore>,
    bus: Option<Arc<dyn EventBus>>,
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(
        registry: Arc<FunctionRegistry>,
        store: Arc<dyn RunStore>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            registry,
            store,
            bus: None,
            config,
        }
    }

    /// Bus handed to function bodies for follow-up events.
    pub fn with_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn registry(&self) -> &Arc<FunctionRegistry> {
        &self.registry
    }

    /// Load a run, failing with `NotFound` when it does not exist.
    pub async fn get_run(&self, run_id: Uuid) -> Result<RunRecord> {
        self.load(run_id).await
    }

    async fn load(&self, run_id: Uuid) -> Result<RunRecord> {
        self.store
            .get_run(run_id)
            .await?
            .ok_or_else(|| QuillError::NotFound(format!("run {run_id}")))
    }

    /// Advance a run by at most one step.
    ///
    /// When `step` names a step that already succeeded, its memoized result
    /// is returned and nothing executes.
    pub async fn advance(&self, run_id: Uuid, step: Option<&str>) -> Result<AdvanceOutcome> {
        let run = self.load(run_id).await?;

        if let Some(step) = step {
            let memo = self
                .store
                .list_steps(run_id)
                .await?
                .into_iter()
                .find(|s| s.step_name == step && s.is_succeeded());
            if let Some(record) = memo {
                return Ok(AdvanceOutcome::StepCompleted {
                    step: record.step_name,
                    result: record.result.unwrap_or(Value::Null),
                });
            }
        }

        if let Some(outcome) = terminal_outcome(&run) {
            return Ok(outcome);
        }

        let Some(entry) = self.registry.get(&run.function_id) else {
            let error = format!("function '{}' is not registered", run.function_id);
            tracing::error!(run_id = %run_id, function_id = %run.function_id, "{}", error);
            let mut run = run;
            run.fail(error.clone())?;
            self.store.update_run(run).await?;
            return Ok(AdvanceOutcome::Failed { error });
        };

        let now = Utc::now();
        let until = self.lease_until(now, &entry);
        if !self.store.try_lease(run_id, now, until).await? {
            tracing::debug!(run_id = %run_id, "Run is leased elsewhere");
            return Ok(AdvanceOutcome::Busy);
        }

        let outcome = self.advance_leased(run_id, &entry).await;

        if let Err(e) = self.store.release_lease(run_id, until).await {
            tracing::warn!(run_id = %run_id, error = %e, "Failed to release run lease");
        }
        outcome
    }

    /// The lease outlives the longest invocation the function allows.
    ///
    /// Truncated to microseconds so a Postgres round-trip compares equal.
    fn lease_until(&self, now: DateTime<Utc>, entry: &FunctionEntry) -> DateTime<Utc> {
        let lease = self.config.lease.max(entry.info.timeout + LEASE_MARGIN);
        (now + chrono_delay(lease)).trunc_subsecs(6)
    }

    async fn advance_leased(&self, run_id: Uuid, entry: &FunctionEntry) -> Result<AdvanceOutcome> {
        let run = self.load(run_id).await?;
        if let Some(outcome) = terminal_outcome(&run) {
            return Ok(outcome);
        }

        let limit = entry.info.concurrency.as_ref().map(|c| c.limit);
        match self.store.claim_run(run_id, limit).await? {
            Claim::Claimed => {}
            Claim::Throttled => {
                let mut run = run;
                let retry_after = self.config.throttle_delay;
                run.defer(Utc::now() + chrono_delay(retry_after));
                self.store.update_run(run).await?;
                tracing::debug!(run_id = %run_id, function_id = entry.info.id, "Run throttled");
                return Ok(AdvanceOutcome::Throttled { retry_after });
            }
            Claim::Finished => {
                let run = self.load(run_id).await?;
                return Ok(terminal_outcome(&run).unwrap_or(AdvanceOutcome::Busy));
            }
        }

        let mut run = self.load(run_id).await?;
        let steps = self.store.list_steps(run_id).await?;
        let mut ctx = StepContext::new(&run, self.store.clone()).with_steps(steps);
        if let Some(bus) = &self.bus {
            ctx = ctx.with_bus(bus.clone());
        }

        let span = tracing::info_span!(
            "run",
            run_id = %run.id,
            function_id = %run.function_id,
            attempt = ctx.attempt(),
        );
        let invocation = tokio::time::timeout(
            entry.info.timeout,
            (entry.handler)(&ctx, run.event.data.clone()),
        )
        .instrument(span)
        .await;

        let executed = ctx.executed().await;
        let step_name = executed.as_ref().map(|s| s.record.step_name.clone());
        if executed.as_ref().is_some_and(|s| s.error.is_none()) {
            run.step_succeeded();
        }

        let outcome = match invocation {
            Ok(Ok(output)) => {
                run.complete(output.clone())?;
                AdvanceOutcome::Completed { output }
            }
            Ok(Err(QuillError::StepInterrupt(_))) => match executed {
                Some(step) => match step.error {
                    None => AdvanceOutcome::StepCompleted {
                        step: step.record.step_name,
                        result: step.record.result.unwrap_or(Value::Null),
                    },
                    Some(err) => fail_or_retry(
                        &mut run,
                        &entry.info.retry,
                        step_name,
                        err.message,
                        err.retryable,
                    )?,
                },
                None => fail_or_retry(
                    &mut run,
                    &entry.info.retry,
                    None,
                    "interrupted without an executed step".into(),
                    true,
                )?,
            },
            Ok(Err(QuillError::Cancelled)) => {
                tracing::info!(run_id = %run_id, "Run cancelled before next step");
                return Ok(AdvanceOutcome::Cancelled);
            }
            Ok(Err(e)) => {
                let retryable = e.is_retryable();
                fail_or_retry(&mut run, &entry.info.retry, step_name, e.to_string(), retryable)?
            }
            Err(_) => fail_or_retry(
                &mut run,
                &entry.info.retry,
                step_name,
                format!("invocation exceeded {:?}", entry.info.timeout),
                true,
            )?,
        };

        if !self.store.update_run(run).await? {
            let current = self.load(run_id).await?;
            let outcome = terminal_outcome(&current).unwrap_or(AdvanceOutcome::Busy);
            tracing::info!(
                run_id = %run_id,
                status = ?current.status,
                "Run finished elsewhere during invocation"
            );
            return Ok(outcome);
        }

        match &outcome {
            AdvanceOutcome::StepCompleted { step, .. } => {
                tracing::debug!(run_id = %run_id, step = %step, "Step completed");
            }
            AdvanceOutcome::Completed { .. } => {
                tracing::info!(run_id = %run_id, function_id = entry.info.id, "Run completed");
            }
            AdvanceOutcome::RetryScheduled {
                attempt,
                retry_after,
                error,
                ..
            } => {
                tracing::warn!(
                    run_id = %run_id,
                    function_id = entry.info.id,
                    attempt,
                    retry_after_ms = retry_after.as_millis() as u64,
                    error = %error,
                    "Run failed, will retry"
                );
            }
            AdvanceOutcome::Failed { error } => {
                tracing::error!(
                    run_id = %run_id,
                    function_id = entry.info.id,
                    error = %error,
                    "Run failed permanently"
                );
            }
            _ => {}
        }

        Ok(outcome)
    }

    /// Move a non-terminal run to `Cancelled`.
    ///
    /// Returns `false` when the run had already finished.
    pub async fn cancel(&self, run_id: Uuid) -> Result<bool> {
        self.load(run_id).await?;
        let cancelled = self.store.cancel_run(run_id).await?;
        if cancelled {
            tracing::info!(run_id = %run_id, "Run cancelled");
        }
        Ok(cancelled)
    }

    /// A run and its steps.
    pub async fn inspect(&self, run_id: Uuid) -> Result<RunView> {
        let run = self.load(run_id).await?;
        let steps = self.store.list_steps(run_id).await?;
        Ok(RunView { run, steps })
    }
}
