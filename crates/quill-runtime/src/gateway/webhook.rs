//! The broker-facing endpoint: discovery, ingestion and step callbacks.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use quill_core::event::Event;
use quill_core::function::{ConcurrencyConfig, FunctionInfo, RetryConfig};

use super::response::WebhookResponse;
use crate::jobs::{AdvanceOutcome, Dispatcher, Executor, FunctionRegistry, RejectedEvent};

/// Shared state of the webhook routes.
pub struct WebhookState {
    /// Application name reported by discovery.
    pub app: String,
    pub registry: Arc<FunctionRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub executor: Arc<Executor>,
    /// Upper bound on one ingestion call.
    pub ingest_timeout: Duration,
}

/// One function as listed by discovery.
#[derive(Debug, Serialize)]
pub struct FunctionDescriptor {
    pub id: String,
    pub name: String,
    pub trigger: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<ConcurrencyConfig>,
    pub retries: RetryConfig,
    pub timeout_secs: u64,
}

impl From<&FunctionInfo> for FunctionDescriptor {
    fn from(info: &FunctionInfo) -> Self {
        Self {
            id: info.id.to_string(),
            name: info.name.to_string(),
            trigger: info.trigger.to_string(),
            concurrency: info.concurrency.clone(),
            retries: info.retry.clone(),
            timeout_secs: info.timeout.as_secs(),
        }
    }
}

/// `GET`: describe the registered functions.
pub async fn discover(State(state): State<Arc<WebhookState>>) -> Json<Value> {
    let functions: Vec<FunctionDescriptor> =
        state.registry.list().map(FunctionDescriptor::from).collect();
    Json(json!({
        "app": state.app,
        "framework_version": env!("CARGO_PKG_VERSION"),
        "functions": functions,
    }))
}

/// Split a POST body into events, recording shape errors by position.
fn parse_events(body: Value) -> Result<(Vec<(usize, Event)>, Vec<RejectedEvent>), String> {
    let items = match body {
        Value::Array(items) => items,
        item @ Value::Object(_) => vec![item],
        other => return Err(format!("expected an event or an array of events, got {other}")),
    };

    let mut events = Vec::with_capacity(items.len());
    let mut rejected = Vec::new();
    for (index, item) in items.into_iter().enumerate() {
        let name = item
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        match serde_json::from_value::<Event>(item) {
            Ok(event) => events.push((index, event)),
            Err(e) => rejected.push(RejectedEvent {
                index,
                name,
                function_id: None,
                error: format!("malformed event: {e}"),
            }),
        }
    }
    Ok((events, rejected))
}

/// `POST`: ingest one event or a batch.
pub async fn ingest(State(state): State<Arc<WebhookState>>, body: Bytes) -> WebhookResponse {
    let body: Value = match serde_json::from_slice(&body) {
        Ok(body) => body,
        Err(e) => {
            return WebhookResponse::fatal(StatusCode::BAD_REQUEST, format!("invalid JSON: {e}"))
        }
    };
    let (events, mut rejected) = match parse_events(body) {
        Ok(parsed) => parsed,
        Err(e) => return WebhookResponse::fatal(StatusCode::BAD_REQUEST, e),
    };

    let (positions, events): (Vec<usize>, Vec<Event>) = events.into_iter().unzip();
    let dispatched =
        tokio::time::timeout(state.ingest_timeout, state.dispatcher.dispatch(events)).await;
    let report = match dispatched {
        Ok(Ok(report)) => report,
        Ok(Err(e)) => {
            tracing::error!(error = %e, "Dispatch failed");
            return WebhookResponse::from_error(&e);
        }
        Err(_) => {
            return WebhookResponse::retryable("dispatch timed out", Duration::from_secs(1));
        }
    };

    rejected.extend(report.rejected.into_iter().map(|mut r| {
        r.index = positions.get(r.index).copied().unwrap_or(r.index);
        r
    }));
    rejected.sort_by_key(|r| r.index);

    WebhookResponse::accepted()
        .with("accepted", report.accepted)
        .with("runs", report.runs)
        .with("rejected", rejected)
}

/// Body of a step callback.
#[derive(Debug, Deserialize)]
pub struct AdvanceRequest {
    pub run_id: Uuid,
    #[serde(default)]
    pub function_id: Option<String>,
    #[serde(default)]
    pub step: Option<String>,
}

/// `PUT`: advance a run by one step.
pub async fn advance(State(state): State<Arc<WebhookState>>, body: Bytes) -> WebhookResponse {
    let request: AdvanceRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return WebhookResponse::fatal(
                StatusCode::BAD_REQUEST,
                format!("invalid step request: {e}"),
            )
        }
    };
    let run_id = request.run_id;

    if let Some(function_id) = &request.function_id {
        match state.executor.get_run(run_id).await {
            Ok(run) if &run.function_id != function_id => {
                return WebhookResponse::fatal(
                    StatusCode::BAD_REQUEST,
                    format!("run {run_id} belongs to '{}'", run.function_id),
                )
            }
            Ok(_) => {}
            Err(e) => return WebhookResponse::from_error(&e),
        }
    }

    let outcome = match state
        .executor
        .advance(run_id, request.step.as_deref())
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(run_id = %run_id, error = %e, "Advance failed");
            return WebhookResponse::from_error(&e).with("run_id", run_id);
        }
    };

    let response = match outcome {
        AdvanceOutcome::StepCompleted { step, result } => WebhookResponse::partial()
            .with("step", step)
            .with("result", result)
            .with("done", false),
        AdvanceOutcome::Completed { output } => WebhookResponse::accepted()
            .with("done", true)
            .with("output", output),
        AdvanceOutcome::Cancelled => WebhookResponse::accepted()
            .with("done", true)
            .with("cancelled", true),
        AdvanceOutcome::RetryScheduled {
            step,
            attempt,
            retry_after,
            error,
        } => WebhookResponse::retryable(error, retry_after)
            .with("step", step)
            .with("attempt", attempt),
        AdvanceOutcome::Failed { error } => {
            WebhookResponse::fatal(StatusCode::INTERNAL_SERVER_ERROR, error)
        }
        AdvanceOutcome::Throttled { retry_after } => {
            WebhookResponse::retryable("concurrency limit reached", retry_after)
        }
        AdvanceOutcome::Busy => {
            WebhookResponse::retryable("run is being advanced", Duration::from_secs(1))
        }
    };
    response.with("run_id", run_id)
}

/// `GET {path}/runs/{id}`: a run and its steps.
pub async fn get_run(
    State(state): State<Arc<WebhookState>>,
    Path(run_id): Path<Uuid>,
) -> WebhookResponse {
    match state.executor.inspect(run_id).await {
        Ok(view) => WebhookResponse::accepted().with("run", view),
        Err(e) => WebhookResponse::from_error(&e),
    }
}

/// `POST {path}/runs/{id}/cancel`.
pub async fn cancel_run(
    State(state): State<Arc<WebhookState>>,
    Path(run_id): Path<Uuid>,
) -> WebhookResponse {
    match state.executor.cancel(run_id).await {
        Ok(cancelled) => WebhookResponse::accepted()
            .with("run_id", run_id)
            .with("cancelled", cancelled),
        Err(e) => WebhookResponse::from_error(&e),
    }
}
