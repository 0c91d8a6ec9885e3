//! HTTP clients for the collaborators jobs call.
//!
//! Responses are classified the same way everywhere: transport errors,
//! timeouts, 408, 429 and 5xx are retryable; other 4xx answers are permanent.
//! 404 and 415 keep their own variants so callers can react to them.

mod extractor;
mod generator;
mod identity;
mod mailer;
mod storage;

pub use extractor::HttpExtractor;
pub use generator::HttpGenerator;
pub use identity::HttpIdentity;
pub use mailer::HttpMailer;
pub use storage::HttpObjectStore;

use std::time::Duration;

use reqwest::{RequestBuilder, Response, StatusCode};

use quill_core::config::EndpointConfig;
use quill_core::error::{QuillError, Result};

/// Shared plumbing of every client.
#[derive(Clone)]
struct Endpoint {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    service: &'static str,
}

impl Endpoint {
    fn new(service: &'static str, config: &EndpointConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| QuillError::Config(format!("{service} client: {e}")))?;
        Ok(Self {
            client,
            url: config.url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            service,
        })
    }

    fn url(&self, path: &str) -> String {
        if path.is_empty() {
            self.url.clone()
        } else {
            format!("{}/{}", self.url, path.trim_start_matches('/'))
        }
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    /// Send and classify the answer; only 2xx passes through.
    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = self.authorize(request).send().await.map_err(|e| {
            if e.is_timeout() {
                QuillError::Timeout(format!("{} request timed out", self.service))
            } else {
                QuillError::Capability(format!("{} unreachable: {e}", self.service))
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify(self.service, status, &body))
    }
}

fn classify(service: &str, status: StatusCode, body: &str) -> QuillError {
    let message = format!("{service} answered {status}: {}", truncate(body, 500));
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        QuillError::Capability(message)
    } else if status == StatusCode::NOT_FOUND {
        QuillError::NotFound(message)
    } else if status == StatusCode::UNSUPPORTED_MEDIA_TYPE {
        QuillError::UnsupportedType(message)
    } else {
        QuillError::Validation(message)
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert!(classify("mail", StatusCode::BAD_GATEWAY, "").is_retryable());
        assert!(classify("mail", StatusCode::TOO_MANY_REQUESTS, "").is_retryable());
        assert!(!classify("mail", StatusCode::UNPROCESSABLE_ENTITY, "bad address").is_retryable());
        assert!(matches!(
            classify("storage", StatusCode::NOT_FOUND, ""),
            QuillError::NotFound(_)
        ));
    }

    #[test]
    fn test_url_join() {
        let endpoint = Endpoint::new(
            "storage",
            &EndpointConfig {
                url: "https://files.example.com/".into(),
                api_key: None,
                model: None,
                from: None,
                timeout_secs: 5,
            },
        )
        .unwrap();
        assert_eq!(endpoint.url("/objects/a.pdf"), "https://files.example.com/objects/a.pdf");
        assert_eq!(endpoint.url(""), "https://files.example.com");
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("hi", 10), "hi");
    }
}
