use futures::future::BoxFuture;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;

use quill_core::capability::TextExtractor;
use quill_core::config::EndpointConfig;
use quill_core::error::{QuillError, Result};

use super::Endpoint;

const PDF: &str = "application/pdf";
const DOCX: &str = "application/vnd.openxmlformats-officedocument.wordprocessingml.document";

/// Text extraction service client.
///
/// Plain text and markdown are decoded locally; PDF and DOCX are posted to
/// the service; anything else is unsupported.
#[derive(Clone)]
pub struct HttpExtractor {
    endpoint: Endpoint,
}

#[derive(Deserialize)]
struct Extracted {
    text: String,
}

impl HttpExtractor {
    pub fn new(config: &EndpointConfig) -> Result<Self> {
        Ok(Self {
            endpoint: Endpoint::new("extraction", config)?,
        })
    }
}

impl TextExtractor for HttpExtractor {
    fn extract<'a>(&'a self, bytes: &'a [u8], mime: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let base = mime.split(';').next().unwrap_or(mime).trim();
            match base {
                "text/plain" | "text/markdown" => {
                    return String::from_utf8(bytes.to_vec())
                        .map_err(|_| QuillError::Validation("document is not valid UTF-8".into()));
                }
                PDF | DOCX => {}
                other => return Err(QuillError::UnsupportedType(other.to_string())),
            }

            let request = self
                .endpoint
                .client
                .post(self.endpoint.url(""))
                .header(CONTENT_TYPE, base)
                .body(bytes.to_vec());
            let response = match self.endpoint.send(request).await {
                Err(QuillError::UnsupportedType(_)) => {
                    return Err(QuillError::UnsupportedType(base.to_string()))
                }
                other => other?,
            };
            let extracted: Extracted = response
                .json()
                .await
                .map_err(|e| QuillError::Capability(format!("extraction response: {e}")))?;
            Ok(extracted.text)
        })
    }
}
