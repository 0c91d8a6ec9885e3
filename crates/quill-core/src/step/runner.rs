//! Fluent step runner.
//!
//! ```ignore
//! let rows = ctx.step("validate-rows", || async { validate(&input.rows) }).run().await?;
//!
//! ctx.step("generate-questions", || async { generator.generate(&prompt).await })
//!     .timeout(Duration::from_secs(120))
//!     .run()
//!     .await?;
//! ```

use std::future::Future;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use serde::{de::DeserializeOwned, Serialize};
use tracing::Instrument;

use super::context::{Begin, StepContext};
use super::record::StepRecord;
use crate::error::{QuillError, Result};

type StepFn<'a, T> = Box<dyn FnOnce() -> BoxFuture<'a, Result<T>> + Send + 'a>;

/// A step waiting to be run. Created via [`StepContext::step`].
pub struct StepRunner<'a, T> {
    ctx: &'a StepContext,
    name: String,
    work: StepFn<'a, T>,
    timeout: Option<Duration>,
}

impl<'a, T> StepRunner<'a, T>
where
    T: Serialize + DeserializeOwned + Send + 'a,
{
    pub(crate) fn new<F, Fut>(ctx: &'a StepContext, name: impl Into<String>, work: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'a,
        Fut: Future<Output = Result<T>> + Send + 'a,
    {
        let work: StepFn<'a, T> =
            Box::new(move || -> BoxFuture<'a, Result<T>> { Box::pin(work()) });
        Self {
            ctx,
            name: name.into(),
            work,
            timeout: None,
        }
    }

    /// Fail the step with a retryable timeout after `duration`.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Return the memoized result, or execute the work and persist its outcome.
    pub async fn run(self) -> Result<T> {
        let (name, position, attempts) = match self.ctx.begin(&self.name).await? {
            Begin::Memoized(value) => return Ok(serde_json::from_value(value)?),
            Begin::Execute {
                name,
                position,
                attempts,
            } => (name, position, attempts + 1),
        };

        let run_id = self.ctx.run_id();
        let span = tracing::info_span!("step", %run_id, step = %name, attempt = attempts);
        let started = Instant::now();

        let fut = (self.work)();
        let outcome = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).instrument(span).await {
                Ok(result) => result,
                Err(_) => Err(QuillError::Timeout(format!(
                    "step '{}' exceeded {:?}",
                    name, limit
                ))),
            },
            None => fut.instrument(span).await,
        };

        match outcome {
            Ok(value) => {
                let json = serde_json::to_value(&value)?;
                self.ctx
                    .finish(
                        StepRecord::succeeded(run_id, &name, position, attempts, json),
                        None,
                    )
                    .await?;
                tracing::debug!(
                    %run_id,
                    step = %name,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Step succeeded"
                );
                Ok(value)
            }
            Err(e) => {
                let err = e.into_step(&name);
                self.ctx
                    .finish(
                        StepRecord::failed(run_id, &name, position, attempts, err.to_string()),
                        Some(&err),
                    )
                    .await?;
                tracing::warn!(
                    %run_id,
                    step = %name,
                    attempt = attempts,
                    retryable = err.is_retryable(),
                    error = %err,
                    "Step failed"
                );
                Err(err)
            }
        }
    }
}
