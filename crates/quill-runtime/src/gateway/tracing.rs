use axum::extract::Request;
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;
use tracing::Instrument;
use uuid::Uuid;

pub const TRACE_ID_HEADER: &str = "x-trace-id";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Trace identifiers of the current request.
#[derive(Debug, Clone)]
pub struct TracingState {
    /// Propagated from the caller when present.
    pub trace_id: String,
    pub request_id: String,
}

impl TracingState {
    pub fn new() -> Self {
        Self::with_trace_id(Uuid::new_v4().to_string())
    }

    pub fn with_trace_id(trace_id: String) -> Self {
        Self {
            trace_id,
            request_id: Uuid::new_v4().to_string(),
        }
    }
}

impl Default for TracingState {
    fn default() -> Self {
        Self::new()
    }
}

/// Attach trace ids to the request, its span and the response headers.
pub async fn tracing_middleware(mut req: Request, next: Next) -> Response {
    let state = req
        .headers()
        .get(TRACE_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(|v| TracingState::with_trace_id(v.to_string()))
        .unwrap_or_default();

    let span = tracing::info_span!(
        "webhook",
        method = %req.method(),
        path = %req.uri().path(),
        trace_id = %state.trace_id,
        request_id = %state.request_id,
    );
    req.extensions_mut().insert(state.clone());

    let mut response = next.run(req).instrument(span).await;

    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&state.trace_id) {
        headers.insert(TRACE_ID_HEADER, value);
    }
    if let Ok(value) = HeaderValue::from_str(&state.request_id) {
        headers.insert(REQUEST_ID_HEADER, value);
    }
    response
}
