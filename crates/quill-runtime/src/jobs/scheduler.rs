use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use quill_core::config::EngineConfig;
use quill_core::store::RunStore;

use super::executor::{AdvanceOutcome, Executor};

/// Steps one spawned task may drive before yielding its permit.
const MAX_STEPS_PER_TURN: usize = 64;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub max_concurrent: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for SchedulerConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            batch_size: config.batch_size.max(1),
            max_concurrent: config.max_concurrent.max(1),
        }
    }
}

/// In-process driver that stands in for broker callbacks.
///
/// Polls the store for due runs and advances each one step after another
/// until it finishes, waits for a retry, or is throttled.
pub struct RunScheduler {
    executor: Arc<Executor>,
    store: Arc<dyn RunStore>,
    config: SchedulerConfig,
    wake: Arc<Notify>,
    shutdown: CancellationToken,
}

impl RunScheduler {
    pub fn new(
        executor: Arc<Executor>,
        store: Arc<dyn RunStore>,
        config: SchedulerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            executor,
            store,
            config,
            wake: Arc::new(Notify::new()),
            shutdown,
        }
    }

    /// Poll immediately when this is notified, e.g. after a dispatch.
    pub fn with_wake(mut self, wake: Arc<Notify>) -> Self {
        self.wake = wake;
        self
    }

    /// Run until the shutdown token is cancelled, then wait for in-flight
    /// advances.
    pub async fn run(self) {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent));

        tracing::info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            max_concurrent = self.config.max_concurrent,
            "Run scheduler started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }

            let available = semaphore.available_permits();
            if available == 0 {
                continue;
            }

            let due = match self
                .store
                .due_runs(Utc::now(), available.min(self.config.batch_size))
                .await
            {
                Ok(due) => due,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to fetch due runs");
                    continue;
                }
            };

            for run_id in due {
                let Ok(permit) = semaphore.clone().acquire_owned().await else {
                    break;
                };
                let executor = self.executor.clone();
                tokio::spawn(async move {
                    drive(&executor, run_id).await;
                    drop(permit);
                });
            }
        }

        tracing::info!("Run scheduler stopping");
        let _ = semaphore
            .acquire_many(self.config.max_concurrent as u32)
            .await;
    }
}

async fn drive(executor: &Executor, run_id: Uuid) {
    for _ in 0..MAX_STEPS_PER_TURN {
        match executor.advance(run_id, None).await {
            Ok(AdvanceOutcome::StepCompleted { .. }) => continue,
            Ok(_) => return,
            Err(e) => {
                tracing::error!(run_id = %run_id, error = %e, "Failed to advance run");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_engine() {
        let config = SchedulerConfig::from(&EngineConfig {
            poll_interval_ms: 50,
            batch_size: 0,
            ..Default::default()
        });
        assert_eq!(config.poll_interval, Duration::from_millis(50));
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.max_concurrent, 16);
    }
}
