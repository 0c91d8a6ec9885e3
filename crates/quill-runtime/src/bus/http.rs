use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;

use quill_core::error::{QuillError, Result};
use quill_core::{Event, EventBus, SendReceipt};

/// Sends events to a broker's ingestion endpoint.
#[derive(Clone)]
pub struct HttpEventBus {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Deserialize)]
struct IngestAck {
    #[serde(default)]
    ids: Vec<String>,
}

impl HttpEventBus {
    /// Build a bus posting to `{base_url}/e/{event_key}`.
    pub fn new(base_url: &str, event_key: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| QuillError::Config(format!("http client: {e}")))?;
        Ok(Self::with_client(client, base_url, event_key))
    }

    pub fn with_client(client: reqwest::Client, base_url: &str, event_key: &str) -> Self {
        Self {
            client,
            endpoint: format!("{}/e/{}", base_url.trim_end_matches('/'), event_key),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl EventBus for HttpEventBus {
    fn send(&self, events: Vec<Event>) -> BoxFuture<'_, Result<SendReceipt>> {
        Box::pin(async move {
            let events = super::prepare(events)?;
            if events.is_empty() {
                return Ok(SendReceipt::default());
            }

            let response = self
                .client
                .post(&self.endpoint)
                .json(&events)
                .send()
                .await
                .map_err(|e| QuillError::Delivery(format!("broker unreachable: {e}")))?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(QuillError::Delivery(format!(
                    "broker answered {status}: {body}"
                )));
            }

            // Brokers that echo ids win over the locally stamped ones.
            let ids = match response.json::<IngestAck>().await {
                Ok(ack) if ack.ids.len() == events.len() => ack.ids,
                _ => events.iter().map(|e| e.event_id().to_string()).collect(),
            };
            tracing::debug!(count = events.len(), endpoint = %self.endpoint, "Events sent");
            Ok(SendReceipt { ids })
        })
    }
}
