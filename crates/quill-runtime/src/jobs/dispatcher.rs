use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Notify;
use uuid::Uuid;

use quill_core::error::Result;
use quill_core::run::RunRecord;
use quill_core::store::RunStore;
use quill_core::Event;

use super::registry::FunctionRegistry;

/// A run created or found for an event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchedRun {
    pub run_id: Uuid,
    pub function_id: String,
    pub event_id: String,
    /// `false` when the event was a duplicate delivery.
    pub created: bool,
}

/// An event, or one of its matches, that produced no run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectedEvent {
    /// Position in the submitted batch.
    pub index: usize,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_id: Option<String>,
    pub error: String,
}

/// Outcome of one dispatch call.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DispatchReport {
    /// Events that passed validation.
    pub accepted: usize,
    pub runs: Vec<DispatchedRun>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rejected: Vec<RejectedEvent>,
}

impl DispatchReport {
    /// Runs that did not exist before this call.
    pub fn created(&self) -> impl Iterator<Item = &DispatchedRun> {
        self.runs.iter().filter(|r| r.created)
    }
}

/// Turns inbound events into runs.
///
/// For every event and every function it triggers, one run exists per
/// `(function_id, event name, event id)`; a redelivered event finds the
/// existing run instead of creating another.
pub struct Dispatcher {
    registry: Arc<FunctionRegistry>,
    store: Arc<dyn RunStore>,
    wake: Arc<Notify>,
}

impl Dispatcher {
    pub fn new(registry: Arc<FunctionRegistry>, store: Arc<dyn RunStore>) -> Self {
        Self {
            registry,
            store,
            wake: Arc::new(Notify::new()),
        }
    }

    /// Signalled whenever a new run is created.
    pub fn wake_handle(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// Dispatch a batch of events.
    ///
    /// Invalid events are reported and skipped. Store failures abort the call
    /// so the sender can redeliver; runs created before the failure are found
    /// again on redelivery.
    pub async fn dispatch(&self, events: Vec<Event>) -> Result<DispatchReport> {
        let mut report = DispatchReport::default();

        for (index, event) in events.into_iter().enumerate() {
            let event = event.stamped();
            if let Err(e) = event.validate() {
                tracing::warn!(event = %event.name, error = %e, "Rejected event");
                report.rejected.push(RejectedEvent {
                    index,
                    name: event.name.clone(),
                    function_id: None,
                    error: e.to_string(),
                });
                continue;
            }
            report.accepted += 1;

            let matches = self.registry.matching(&event.name);
            if matches.is_empty() {
                tracing::debug!(event = %event.name, "No function matches event");
            }

            for entry in matches {
                let function_id = entry.info.id;
                if let Err(e) = entry.validate_input(&event.data) {
                    tracing::warn!(event = %event.name, function_id, error = %e, "Event input rejected");
                    report.rejected.push(RejectedEvent {
                        index,
                        name: event.name.clone(),
                        function_id: Some(function_id.to_string()),
                        error: e.to_string(),
                    });
                    continue;
                }

                let key = entry
                    .info
                    .concurrency
                    .as_ref()
                    .and_then(|c| c.resolve_key(&event.data));
                let creation = self
                    .store
                    .create_run(RunRecord::new(function_id, event.clone(), key))
                    .await?;

                if creation.is_created() {
                    tracing::info!(
                        run_id = %creation.run_id(),
                        function_id,
                        event = %event.name,
                        event_id = event.event_id(),
                        "Run scheduled"
                    );
                } else {
                    tracing::debug!(
                        run_id = %creation.run_id(),
                        function_id,
                        event_id = event.event_id(),
                        "Duplicate event, run exists"
                    );
                }

                report.runs.push(DispatchedRun {
                    run_id: creation.run_id(),
                    function_id: function_id.to_string(),
                    event_id: event.event_id().to_string(),
                    created: creation.is_created(),
                });
            }
        }

        if report.created().next().is_some() {
            self.wake.notify_one();
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use quill_core::function::{FunctionInfo, QuillFunction};
    use quill_core::step::StepContext;
    use quill_core::MemoryRunStore;
    use serde::Deserialize;
    use serde_json::json;

    struct ByUser;

    #[derive(Deserialize)]
    struct Input {
        #[allow(dead_code)]
        user_id: String,
    }

    impl QuillFunction for ByUser {
        type Input = Input;
        type Output = ();

        fn info(&self) -> FunctionInfo {
            FunctionInfo::new("by-user", "users/*").concurrency(1, Some("/user_id"))
        }

        fn execute<'a>(&'a self, _: &'a StepContext, _: Input) -> BoxFuture<'a, Result<()>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn dispatcher() -> (Dispatcher, MemoryRunStore) {
        let mut registry = FunctionRegistry::new();
        registry.register(ByUser).unwrap();
        let store = MemoryRunStore::new();
        (
            Dispatcher::new(Arc::new(registry), Arc::new(store.clone())),
            store,
        )
    }

    #[tokio::test]
    async fn test_duplicate_delivery_creates_one_run() {
        let (dispatcher, store) = dispatcher();
        let event = Event::new("users/deletion.requested", json!({"user_id": "u1"})).with_id("e1");

        let first = dispatcher.dispatch(vec![event.clone()]).await.unwrap();
        let second = dispatcher.dispatch(vec![event]).await.unwrap();

        assert!(first.runs[0].created);
        assert!(!second.runs[0].created);
        assert_eq!(first.runs[0].run_id, second.runs[0].run_id);
        assert_eq!(store.runs().await.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrency_key_resolved_from_data() {
        let (dispatcher, store) = dispatcher();
        dispatcher
            .dispatch(vec![Event::new("users/x", json!({"user_id": "u7"}))])
            .await
            .unwrap();
        let runs = store.runs().await;
        assert_eq!(runs[0].concurrency_key.as_deref(), Some("u7"));
    }

    #[tokio::test]
    async fn test_invalid_events_are_reported_without_runs() {
        let (dispatcher, store) = dispatcher();
        let report = dispatcher
            .dispatch(vec![
                Event::new("users/x", json!([1])),
                Event::new("users/x", json!({"wrong": true})),
                Event::new("users/x", json!({"user_id": "u1"})),
            ])
            .await
            .unwrap();

        assert_eq!(report.accepted, 2);
        assert_eq!(report.rejected.len(), 2);
        assert_eq!(report.rejected[0].index, 0);
        assert!(report.rejected[0].function_id.is_none());
        assert_eq!(report.rejected[1].function_id.as_deref(), Some("by-user"));
        assert_eq!(store.runs().await.len(), 1);
    }
}
