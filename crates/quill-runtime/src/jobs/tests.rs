use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use quill_core::error::{QuillError, Result};
use quill_core::function::{FunctionInfo, QuillFunction, RetryConfig};
use quill_core::run::RunStatus;
use quill_core::step::StepContext;
use quill_core::store::RunStore;
use quill_core::{assert_err_variant, assert_ok, Event, MemoryRunStore};

use super::{
    AdvanceOutcome, Dispatcher, Executor, ExecutorConfig, FunctionRegistry, RunScheduler,
    SchedulerConfig,
};
use crate::bus::LocalEventBus;

#[derive(Deserialize)]
struct Empty {}

/// Two steps; the second fails `failures` times before succeeding.
#[derive(Clone, Default)]
struct TwoSteps {
    first_calls: Arc<AtomicU32>,
    second_calls: Arc<AtomicU32>,
    failures: u32,
    retryable: bool,
}

impl QuillFunction for TwoSteps {
    type Input = Empty;
    type Output = Value;

    fn info(&self) -> FunctionInfo {
        FunctionInfo::new("two-steps", "test/two-steps")
            .retry(RetryConfig::attempts(3).with_base_delay(Duration::from_millis(1)))
    }

    fn execute<'a>(&'a self, ctx: &'a StepContext, _: Empty) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            let a: u32 = ctx
                .step("first", || async {
                    self.first_calls.fetch_add(1, Ordering::SeqCst);
                    Ok(1)
                })
                .run()
                .await?;
            let b: u32 = ctx
                .step("second", || async {
                    let n = self.second_calls.fetch_add(1, Ordering::SeqCst);
                    if n < self.failures {
                        return Err(if self.retryable {
                            QuillError::Capability("flaky".into())
                        } else {
                            QuillError::Validation("bad data".into())
                        });
                    }
                    Ok(2)
                })
                .run()
                .await?;
            Ok(json!({"sum": a + b}))
        })
    }
}

/// One slow step, limited to one running run per key.
#[derive(Clone, Default)]
struct Serialized {
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    done: Arc<AtomicUsize>,
}

impl QuillFunction for Serialized {
    type Input = Value;
    type Output = ();

    fn info(&self) -> FunctionInfo {
        FunctionInfo::new("serialized", "test/serialized").concurrency(1, Some("/org"))
    }

    fn execute<'a>(&'a self, ctx: &'a StepContext, _: Value) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            ctx.step("work", || async {
                let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                self.active.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            })
            .run()
            .await?;
            ctx.step("finish", || async {
                self.done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .run()
            .await
        })
    }
}

/// One step that outlasts a short lease.
#[derive(Clone, Default)]
struct Slow {
    calls: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl QuillFunction for Slow {
    type Input = Value;
    type Output = ();

    fn info(&self) -> FunctionInfo {
        FunctionInfo::new("slow", "test/slow")
    }

    fn execute<'a>(&'a self, ctx: &'a StepContext, _: Value) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            ctx.step("work", || async {
                self.calls.fetch_add(1, Ordering::SeqCst);
                let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(300)).await;
                self.active.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            })
            .run()
            .await
        })
    }
}

/// Completes its own run in the store while the invocation is still going.
struct FinishedElsewhere {
    store: MemoryRunStore,
}

impl QuillFunction for FinishedElsewhere {
    type Input = Value;
    type Output = ();

    fn info(&self) -> FunctionInfo {
        FunctionInfo::new("finished-elsewhere", "test/finished-elsewhere")
    }

    fn execute<'a>(&'a self, ctx: &'a StepContext, _: Value) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let run_id = ctx.run_id();
            ctx.step("finish", move || async move {
                let mut run = self
                    .store
                    .get_run(run_id)
                    .await?
                    .ok_or_else(|| QuillError::NotFound(run_id.to_string()))?;
                run.complete(json!("elsewhere"))?;
                self.store.update_run(run).await?;
                Ok(())
            })
            .run()
            .await
        })
    }
}

/// Emits a follow-up event.
struct Relay;

impl QuillFunction for Relay {
    type Input = Value;
    type Output = Vec<String>;

    fn info(&self) -> FunctionInfo {
        FunctionInfo::new("relay", "test/relay")
    }

    fn execute<'a>(&'a self, ctx: &'a StepContext, _: Value) -> BoxFuture<'a, Result<Vec<String>>> {
        Box::pin(async move {
            let receipt = ctx
                .send_event("emit", vec![Event::new("test/two-steps", json!({}))])
                .await?;
            Ok(receipt.ids)
        })
    }
}

struct Engine {
    store: MemoryRunStore,
    dispatcher: Arc<Dispatcher>,
    executor: Arc<Executor>,
}

fn engine(registry: FunctionRegistry) -> Engine {
    let config = ExecutorConfig {
        lease: Duration::from_secs(60),
        throttle_delay: Duration::from_millis(5),
    };
    engine_with(registry, MemoryRunStore::new(), config)
}

fn engine_with(registry: FunctionRegistry, store: MemoryRunStore, config: ExecutorConfig) -> Engine {
    let registry = Arc::new(registry);
    let shared: Arc<dyn RunStore> = Arc::new(store.clone());
    let dispatcher = Arc::new(Dispatcher::new(registry.clone(), shared.clone()));
    let executor = Arc::new(
        Executor::new(registry, shared, config)
            .with_bus(Arc::new(LocalEventBus::new(dispatcher.clone()))),
    );
    Engine {
        store,
        dispatcher,
        executor,
    }
}

async fn trigger(engine: &Engine, name: &str, data: Value, id: &str) -> uuid::Uuid {
    let report = engine
        .dispatcher
        .dispatch(vec![Event::new(name, data).with_id(id)])
        .await
        .unwrap();
    report.runs[0].run_id
}

#[tokio::test]
async fn test_each_advance_executes_one_step_and_memoizes() {
    let function = TwoSteps::default();
    let mut registry = FunctionRegistry::new();
    registry.register(function.clone()).unwrap();
    let engine = engine(registry);
    let run_id = trigger(&engine, "test/two-steps", json!({}), "e1").await;

    let first = engine.executor.advance(run_id, None).await.unwrap();
    assert_eq!(
        first,
        AdvanceOutcome::StepCompleted {
            step: "first".into(),
            result: json!(1)
        }
    );
    let second = engine.executor.advance(run_id, None).await.unwrap();
    assert!(matches!(second, AdvanceOutcome::StepCompleted { ref step, .. } if step == "second"));
    let done = engine.executor.advance(run_id, None).await.unwrap();
    assert_eq!(done, AdvanceOutcome::Completed { output: json!({"sum": 3}) });

    assert_eq!(function.first_calls.load(Ordering::SeqCst), 1);
    assert_eq!(function.second_calls.load(Ordering::SeqCst), 1);

    // A finished run reports its output again without executing anything.
    let again = engine.executor.advance(run_id, None).await.unwrap();
    assert_eq!(again, done);
    assert_eq!(function.first_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_named_step_returns_memo_without_execution() {
    let function = TwoSteps::default();
    let mut registry = FunctionRegistry::new();
    registry.register(function.clone()).unwrap();
    let engine = engine(registry);
    let run_id = trigger(&engine, "test/two-steps", json!({}), "e1").await;

    engine.executor.advance(run_id, None).await.unwrap();
    let memo = engine
        .executor
        .advance(run_id, Some("first"))
        .await
        .unwrap();
    assert_eq!(
        memo,
        AdvanceOutcome::StepCompleted {
            step: "first".into(),
            result: json!(1)
        }
    );
    assert_eq!(function.second_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_retries_stop_after_max_attempts() {
    let function = TwoSteps {
        failures: u32::MAX,
        retryable: true,
        ..Default::default()
    };
    let mut registry = FunctionRegistry::new();
    registry.register(function.clone()).unwrap();
    let engine = engine(registry);
    let run_id = trigger(&engine, "test/two-steps", json!({}), "e1").await;

    engine.executor.advance(run_id, None).await.unwrap();

    let mut outcomes = Vec::new();
    for _ in 0..3 {
        outcomes.push(engine.executor.advance(run_id, None).await.unwrap());
    }
    assert!(matches!(
        outcomes[0],
        AdvanceOutcome::RetryScheduled { attempt: 1, ref step, .. } if step.as_deref() == Some("second")
    ));
    assert!(matches!(outcomes[1], AdvanceOutcome::RetryScheduled { attempt: 2, .. }));
    assert!(matches!(outcomes[2], AdvanceOutcome::Failed { .. }));

    assert_eq!(function.second_calls.load(Ordering::SeqCst), 3);
    let run = engine.executor.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.unwrap().contains("flaky"));

    // No fourth execution.
    engine.executor.advance(run_id, None).await.unwrap();
    assert_eq!(function.second_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_recovered_step_resets_attempts() {
    let function = TwoSteps {
        failures: 2,
        retryable: true,
        ..Default::default()
    };
    let mut registry = FunctionRegistry::new();
    registry.register(function.clone()).unwrap();
    let engine = engine(registry);
    let run_id = trigger(&engine, "test/two-steps", json!({}), "e1").await;

    let mut last = AdvanceOutcome::Busy;
    for _ in 0..5 {
        last = engine.executor.advance(run_id, None).await.unwrap();
        if !last.is_pending() {
            break;
        }
    }
    assert_eq!(last, AdvanceOutcome::Completed { output: json!({"sum": 3}) });
    let run = engine.executor.get_run(run_id).await.unwrap();
    assert_eq!(run.attempt, 0);
    assert!(run.error.is_none());
}

#[tokio::test]
async fn test_non_retryable_failure_fails_run() {
    let function = TwoSteps {
        failures: 1,
        retryable: false,
        ..Default::default()
    };
    let mut registry = FunctionRegistry::new();
    registry.register(function.clone()).unwrap();
    let engine = engine(registry);
    let run_id = trigger(&engine, "test/two-steps", json!({}), "e1").await;

    engine.executor.advance(run_id, None).await.unwrap();
    let outcome = engine.executor.advance(run_id, None).await.unwrap();
    assert!(matches!(outcome, AdvanceOutcome::Failed { ref error } if error.contains("bad data")));
    assert_eq!(function.second_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_bad_input_fails_without_retry() {
    #[derive(Deserialize)]
    #[allow(dead_code)]
    struct Needs {
        user_id: String,
    }

    struct Strict;
    impl QuillFunction for Strict {
        type Input = Needs;
        type Output = ();
        fn info(&self) -> FunctionInfo {
            FunctionInfo::new("strict", "test/strict")
        }
        fn execute<'a>(&'a self, _: &'a StepContext, _: Needs) -> BoxFuture<'a, Result<()>> {
            Box::pin(async { Ok(()) })
        }
    }

    let mut registry = FunctionRegistry::new();
    registry.register(Strict).unwrap();
    let engine = engine(registry);

    let report = engine
        .dispatcher
        .dispatch(vec![Event::new("test/strict", json!({"user": 1}))])
        .await
        .unwrap();
    assert!(report.runs.is_empty());
    assert_eq!(report.rejected.len(), 1);
    assert!(engine.store.runs().await.is_empty());
}

#[tokio::test]
async fn test_cancel_stops_before_next_step() {
    let function = TwoSteps::default();
    let mut registry = FunctionRegistry::new();
    registry.register(function.clone()).unwrap();
    let engine = engine(registry);
    let run_id = trigger(&engine, "test/two-steps", json!({}), "e1").await;

    engine.executor.advance(run_id, None).await.unwrap();
    assert!(engine.executor.cancel(run_id).await.unwrap());
    assert!(!engine.executor.cancel(run_id).await.unwrap());

    let outcome = engine.executor.advance(run_id, None).await.unwrap();
    assert_eq!(outcome, AdvanceOutcome::Cancelled);
    assert_eq!(function.second_calls.load(Ordering::SeqCst), 0);

    assert_err_variant!(
        engine.executor.cancel(uuid::Uuid::new_v4()).await,
        QuillError::NotFound(_)
    );
}

#[tokio::test]
async fn test_leased_run_is_busy() {
    let mut registry = FunctionRegistry::new();
    assert_ok!(registry.register(TwoSteps::default()));
    assert_err_variant!(
        registry.register(TwoSteps::default()),
        QuillError::DuplicateFunctionId(_)
    );
    let engine = engine(registry);
    let run_id = trigger(&engine, "test/two-steps", json!({}), "e1").await;

    let now = Utc::now();
    assert!(engine
        .store
        .try_lease(run_id, now, now + chrono::Duration::seconds(30))
        .await
        .unwrap());
    let outcome = engine.executor.advance(run_id, None).await.unwrap();
    assert_eq!(outcome, AdvanceOutcome::Busy);
}

#[tokio::test]
async fn test_lease_outlives_a_slow_step() {
    let function = Slow::default();
    let mut registry = FunctionRegistry::new();
    registry.register(function.clone()).unwrap();
    let config = ExecutorConfig {
        lease: Duration::from_millis(50),
        throttle_delay: Duration::from_millis(5),
    };
    let engine = engine_with(registry, MemoryRunStore::new(), config);
    let run_id = trigger(&engine, "test/slow", json!({}), "s1").await;

    let executor = engine.executor.clone();
    let first = tokio::spawn(async move { executor.advance(run_id, None).await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    let second = engine.executor.advance(run_id, None).await.unwrap();
    let first = first.await.unwrap().unwrap();

    assert_eq!(second, AdvanceOutcome::Busy);
    assert_eq!(first, AdvanceOutcome::Completed { output: Value::Null });
    assert_eq!(function.calls.load(Ordering::SeqCst), 1);
    assert_eq!(function.peak.load(Ordering::SeqCst), 1);

    // The lease is released once the invocation ends.
    let run = engine.store.get_run(run_id).await.unwrap().unwrap();
    assert!(run.leased_until.is_none());
}

#[tokio::test]
async fn test_lost_update_reports_stored_outcome() {
    let store = MemoryRunStore::new();
    let mut registry = FunctionRegistry::new();
    registry
        .register(FinishedElsewhere {
            store: store.clone(),
        })
        .unwrap();
    let config = ExecutorConfig {
        lease: Duration::from_secs(60),
        throttle_delay: Duration::from_millis(5),
    };
    let engine = engine_with(registry, store, config);
    let run_id = trigger(&engine, "test/finished-elsewhere", json!({}), "f1").await;

    let outcome = engine.executor.advance(run_id, None).await.unwrap();
    assert_eq!(outcome, AdvanceOutcome::Completed { output: json!("elsewhere") });
    let run = engine.executor.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
}

#[tokio::test]
async fn test_second_run_with_same_key_is_throttled() {
    let function = Serialized::default();
    let mut registry = FunctionRegistry::new();
    registry.register(function.clone()).unwrap();
    let engine = engine(registry);

    let a = trigger(&engine, "test/serialized", json!({"org": "o1"}), "a").await;
    let b = trigger(&engine, "test/serialized", json!({"org": "o1"}), "b").await;
    let c = trigger(&engine, "test/serialized", json!({"org": "o2"}), "c").await;

    assert!(matches!(
        engine.executor.advance(a, None).await.unwrap(),
        AdvanceOutcome::StepCompleted { .. }
    ));
    assert!(matches!(
        engine.executor.advance(b, None).await.unwrap(),
        AdvanceOutcome::Throttled { .. }
    ));
    assert!(matches!(
        engine.executor.advance(c, None).await.unwrap(),
        AdvanceOutcome::StepCompleted { .. }
    ));

    // Finishing `a` frees the slot.
    engine.executor.advance(a, None).await.unwrap();
    assert!(matches!(
        engine.executor.advance(a, None).await.unwrap(),
        AdvanceOutcome::Completed { .. }
    ));
    assert!(matches!(
        engine.executor.advance(b, None).await.unwrap(),
        AdvanceOutcome::StepCompleted { .. }
    ));
}

#[tokio::test]
async fn test_scheduler_never_overlaps_limited_runs() {
    let function = Serialized::default();
    let mut registry = FunctionRegistry::new();
    registry.register(function.clone()).unwrap();
    let engine = engine(registry);

    let events = (0..5)
        .map(|i| Event::new("test/serialized", json!({"org": "o1"})).with_id(format!("e{i}")))
        .collect();
    engine.dispatcher.dispatch(events).await.unwrap();

    let shutdown = CancellationToken::new();
    let scheduler = RunScheduler::new(
        engine.executor.clone(),
        Arc::new(engine.store.clone()),
        SchedulerConfig {
            poll_interval: Duration::from_millis(5),
            batch_size: 10,
            max_concurrent: 8,
        },
        shutdown.clone(),
    )
    .with_wake(engine.dispatcher.wake_handle());
    let handle = tokio::spawn(scheduler.run());

    let finished = tokio::time::timeout(Duration::from_secs(10), async {
        while function.done.load(Ordering::SeqCst) < 5 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    shutdown.cancel();
    handle.await.unwrap();

    assert!(finished.is_ok(), "runs did not finish");
    assert_eq!(function.peak.load(Ordering::SeqCst), 1);
    assert!(engine
        .store
        .runs()
        .await
        .iter()
        .all(|r| r.status == RunStatus::Completed));
}

#[tokio::test]
async fn test_send_event_is_memoized_and_deduplicated() {
    let mut registry = FunctionRegistry::new();
    registry.register(Relay).unwrap();
    registry.register(TwoSteps::default()).unwrap();
    let engine = engine(registry);
    let run_id = trigger(&engine, "test/relay", json!({}), "r1").await;

    let emitted = engine.executor.advance(run_id, None).await.unwrap();
    let AdvanceOutcome::StepCompleted { result, .. } = emitted else {
        panic!("expected step completion, got {emitted:?}");
    };
    let ids: Vec<String> = serde_json::from_value(result["ids"].clone()).unwrap();
    assert_eq!(ids, vec![format!("{run_id}:emit:0")]);

    let done = engine.executor.advance(run_id, None).await.unwrap();
    assert!(matches!(done, AdvanceOutcome::Completed { .. }));

    let downstream: Vec<_> = engine
        .store
        .runs()
        .await
        .into_iter()
        .filter(|r| r.function_id == "two-steps")
        .collect();
    assert_eq!(downstream.len(), 1);
    assert_eq!(downstream[0].event_id, format!("{run_id}:emit:0"));
}
