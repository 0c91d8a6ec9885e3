use futures::future::BoxFuture;
use reqwest::header::CONTENT_TYPE;

use quill_core::capability::{ObjectStore, StoredObject};
use quill_core::config::EndpointConfig;
use quill_core::error::{QuillError, Result};

use super::Endpoint;

/// Read-only object storage over HTTP: `GET {url}/{key}`.
#[derive(Clone)]
pub struct HttpObjectStore {
    endpoint: Endpoint,
}

impl HttpObjectStore {
    pub fn new(config: &EndpointConfig) -> Result<Self> {
        Ok(Self {
            endpoint: Endpoint::new("storage", config)?,
        })
    }
}

impl ObjectStore for HttpObjectStore {
    fn fetch<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<StoredObject>> {
        Box::pin(async move {
            let response = self
                .endpoint
                .send(self.endpoint.client.get(self.endpoint.url(key)))
                .await?;
            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let bytes = response
                .bytes()
                .await
                .map_err(|e| QuillError::Capability(format!("storage read: {e}")))?;
            Ok(StoredObject {
                bytes: bytes.to_vec(),
                content_type,
            })
        })
    }
}
