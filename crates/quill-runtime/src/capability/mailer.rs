use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::json;

use quill_core::capability::{EmailMessage, Mailer};
use quill_core::config::EndpointConfig;
use quill_core::error::{QuillError, Result};

use super::Endpoint;

/// Transactional email API client.
///
/// Posts `{from, to, subject, html, text}` and forwards the message's
/// idempotency key in the `Idempotency-Key` header.
#[derive(Clone)]
pub struct HttpMailer {
    endpoint: Endpoint,
    from: String,
}

#[derive(Deserialize)]
struct Sent {
    id: String,
}

impl HttpMailer {
    pub fn new(config: &EndpointConfig) -> Result<Self> {
        let from = config
            .from
            .clone()
            .ok_or_else(|| QuillError::Config("capabilities.email.from is required".into()))?;
        Ok(Self {
            endpoint: Endpoint::new("email", config)?,
            from,
        })
    }
}

impl Mailer for HttpMailer {
    fn send(&self, message: EmailMessage) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let mut request = self.endpoint.client.post(self.endpoint.url("")).json(&json!({
                "from": self.from,
                "to": [message.to],
                "subject": message.subject,
                "html": message.html,
                "text": message.text,
            }));
            if let Some(key) = &message.idempotency_key {
                request = request.header("Idempotency-Key", key);
            }

            let sent: Sent = self
                .endpoint
                .send(request)
                .await?
                .json()
                .await
                .map_err(|e| QuillError::Capability(format!("email response: {e}")))?;
            Ok(sent.id)
        })
    }
}
