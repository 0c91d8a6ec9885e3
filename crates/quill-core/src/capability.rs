//! External collaborators reached by jobs.
//!
//! Every capability is slow and may fail transiently. Implementations map
//! transport failures to retryable errors (`QuillError::Capability`,
//! `QuillError::Timeout`) and bad requests to permanent ones.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// An outbound email.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub html: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Passed to the transport so a re-sent message is delivered once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

/// Transactional email transport.
pub trait Mailer: Send + Sync {
    /// Send a message, returning the transport's delivery id.
    fn send(&self, message: EmailMessage) -> BoxFuture<'_, Result<String>>;
}

/// A request to the generative model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub prompt: String,
    /// Ask the model for a JSON document.
    #[serde(default)]
    pub json: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn json(mut self) -> Self {
        self.json = true;
        self
    }
}

/// Generative model: prompt in, text out.
pub trait Generator: Send + Sync {
    fn generate(&self, request: GenerationRequest) -> BoxFuture<'_, Result<String>>;
}

/// Document text extraction.
pub trait TextExtractor: Send + Sync {
    /// Extract plain text. Unknown MIME types fail with
    /// `QuillError::UnsupportedType`.
    fn extract<'a>(&'a self, bytes: &'a [u8], mime: &'a str) -> BoxFuture<'a, Result<String>>;
}

/// A fetched object.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredObject {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

/// Read-only object storage.
pub trait ObjectStore: Send + Sync {
    fn fetch<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<StoredObject>>;
}

/// Identity provider administration.
pub trait IdentityProvider: Send + Sync {
    /// Revoke sessions and disable sign-in. Revoking an unknown user succeeds.
    fn revoke<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, Result<()>>;
}

/// Guess a MIME type from a file name when storage does not report one.
pub fn mime_from_name(name: &str) -> &'static str {
    let ext = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "pdf" => "application/pdf",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "txt" => "text/plain",
        "md" => "text/markdown",
        _ => "application/octet-stream",
    }
}
