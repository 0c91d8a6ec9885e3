use std::time::Duration;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::{json, Map, Value};

use quill_core::error::QuillError;

/// Header telling the broker not to retry a request.
pub const NO_RETRY_HEADER: &str = "x-quill-no-retry";

/// Status vocabulary shared with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum WebhookStatus {
    Accepted,
    RetryableError,
    FatalError,
}

/// A webhook reply: status word, HTTP code and JSON body.
#[derive(Debug, Clone)]
pub struct WebhookResponse {
    pub status: WebhookStatus,
    pub code: StatusCode,
    pub body: Map<String, Value>,
    pub retry_after: Option<Duration>,
}

impl WebhookResponse {
    fn new(status: WebhookStatus, code: StatusCode) -> Self {
        Self {
            status,
            code,
            body: Map::new(),
            retry_after: None,
        }
    }

    /// 200 accepted.
    pub fn accepted() -> Self {
        Self::new(WebhookStatus::Accepted, StatusCode::OK)
    }

    /// 206: a step finished and the run has more to do.
    pub fn partial() -> Self {
        Self::new(WebhookStatus::Accepted, StatusCode::PARTIAL_CONTENT)
    }

    /// 503 with `Retry-After`.
    pub fn retryable(error: impl Into<String>, retry_after: Duration) -> Self {
        let mut response = Self::new(WebhookStatus::RetryableError, StatusCode::SERVICE_UNAVAILABLE)
            .with("error", error.into());
        response.retry_after = Some(retry_after);
        response
    }

    /// A non-retryable failure with the given HTTP code.
    pub fn fatal(code: StatusCode, error: impl Into<String>) -> Self {
        Self::new(WebhookStatus::FatalError, code).with("error", error.into())
    }

    /// Map an engine error onto the vocabulary.
    pub fn from_error(error: &QuillError) -> Self {
        match error {
            QuillError::NotFound(_) => Self::fatal(StatusCode::NOT_FOUND, error.to_string()),
            QuillError::Validation(_) | QuillError::Serialization(_) => {
                Self::fatal(StatusCode::BAD_REQUEST, error.to_string())
            }
            QuillError::Unauthorized(_) => Self::fatal(StatusCode::UNAUTHORIZED, error.to_string()),
            e if e.is_retryable() => Self::retryable(e.to_string(), Duration::from_secs(1)),
            e => Self::fatal(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        }
    }

    /// Add a body field.
    pub fn with(mut self, key: &str, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.body.insert(key.to_string(), value);
        self
    }

    fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after.map(|d| d.as_secs_f64().ceil().max(1.0) as u64)
    }
}

impl IntoResponse for WebhookResponse {
    fn into_response(self) -> Response {
        let retry_after = self.retry_after_secs();
        let mut body = self.body;
        body.insert("status".into(), json!(self.status));
        if let Some(secs) = retry_after {
            body.insert("retry_after".into(), json!(secs));
        }

        let mut response = (self.code, Json(Value::Object(body))).into_response();
        let headers = response.headers_mut();
        if let Some(secs) = retry_after {
            headers.insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        if self.status == WebhookStatus::FatalError {
            headers.insert(NO_RETRY_HEADER, HeaderValue::from_static("true"));
        }
        response
    }
}
