//! In-memory capability doubles that record calls.
//!
//! Each mock can be told to fail its next `n` calls with a retryable error,
//! which is how retry behavior is exercised without a network.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;

use crate::capability::{
    EmailMessage, GenerationRequest, Generator, IdentityProvider, Mailer, ObjectStore,
    StoredObject, TextExtractor,
};
use crate::error::{QuillError, Result};
use crate::event::{Event, EventBus, SendReceipt};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct Failures(Mutex<u32>);

impl Failures {
    fn arm(&self, n: u32) {
        *lock(&self.0) = n;
    }

    fn take(&self) -> bool {
        let mut left = lock(&self.0);
        if *left > 0 {
            *left -= 1;
            true
        } else {
            false
        }
    }
}

/// Mailer that records delivered messages and honors idempotency keys.
#[derive(Clone, Default)]
pub struct MockMailer {
    sent: Arc<Mutex<Vec<EmailMessage>>>,
    keys: Arc<Mutex<HashMap<String, String>>>,
    attempts: Arc<Mutex<u32>>,
    failures: Arc<Failures>,
}

impl MockMailer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` sends.
    pub fn fail_next(&self, n: u32) {
        self.failures.arm(n);
    }

    /// Distinct messages delivered.
    pub fn sent(&self) -> Vec<EmailMessage> {
        lock(&self.sent).clone()
    }

    pub fn sent_to(&self, to: &str) -> Vec<EmailMessage> {
        lock(&self.sent).iter().filter(|m| m.to == to).cloned().collect()
    }

    /// Send calls, including failed and deduplicated ones.
    pub fn attempts(&self) -> u32 {
        *lock(&self.attempts)
    }
}

impl Mailer for MockMailer {
    fn send(&self, message: EmailMessage) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            *lock(&self.attempts) += 1;
            if self.failures.take() {
                return Err(QuillError::Capability("mail transport unavailable".into()));
            }
            if let Some(key) = &message.idempotency_key {
                if let Some(id) = lock(&self.keys).get(key) {
                    return Ok(id.clone());
                }
            }
            let mut sent = lock(&self.sent);
            let id = format!("msg-{}", sent.len() + 1);
            if let Some(key) = &message.idempotency_key {
                lock(&self.keys).insert(key.clone(), id.clone());
            }
            sent.push(message);
            Ok(id)
        })
    }
}

type GenerateFn = Arc<dyn Fn(&GenerationRequest) -> Result<String> + Send + Sync>;

/// Generator that replays queued replies, then falls back to a handler.
#[derive(Clone, Default)]
pub struct MockGenerator {
    replies: Arc<Mutex<VecDeque<String>>>,
    handler: Option<GenerateFn>,
    requests: Arc<Mutex<Vec<GenerationRequest>>>,
    failures: Arc<Failures>,
}

impl MockGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every request with the handler's output once the queue is empty.
    pub fn with_handler<F>(mut self, f: F) -> Self
    where
        F: Fn(&GenerationRequest) -> Result<String> + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(f));
        self
    }

    /// Queue a reply.
    pub fn push_reply(&self, text: impl Into<String>) {
        lock(&self.replies).push_back(text.into());
    }

    pub fn fail_next(&self, n: u32) {
        self.failures.arm(n);
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        lock(&self.requests).clone()
    }

    pub fn calls(&self) -> usize {
        lock(&self.requests).len()
    }
}

impl Generator for MockGenerator {
    fn generate(&self, request: GenerationRequest) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            lock(&self.requests).push(request.clone());
            if self.failures.take() {
                return Err(QuillError::Capability("model overloaded".into()));
            }
            if let Some(reply) = lock(&self.replies).pop_front() {
                return Ok(reply);
            }
            match &self.handler {
                Some(handler) => handler(&request),
                None => Err(QuillError::Capability("no reply queued".into())),
            }
        })
    }
}

/// Extractor that decodes bytes as UTF-8 for the MIME types it accepts.
#[derive(Clone)]
pub struct MockExtractor {
    accepted: Arc<HashSet<String>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl Default for MockExtractor {
    fn default() -> Self {
        Self::accepting(&[
            "application/pdf",
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
            "text/plain",
        ])
    }
}

impl MockExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accepting(mimes: &[&str]) -> Self {
        Self {
            accepted: Arc::new(mimes.iter().map(|m| m.to_string()).collect()),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// MIME types passed to `extract`.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }
}

impl TextExtractor for MockExtractor {
    fn extract<'a>(&'a self, bytes: &'a [u8], mime: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            lock(&self.calls).push(mime.to_string());
            if !self.accepted.contains(mime) {
                return Err(QuillError::UnsupportedType(mime.to_string()));
            }
            Ok(String::from_utf8_lossy(bytes).into_owned())
        })
    }
}

/// Object store backed by a map.
#[derive(Clone, Default)]
pub struct MockObjectStore {
    objects: Arc<Mutex<HashMap<String, StoredObject>>>,
    failures: Arc<Failures>,
}

impl MockObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: &str, bytes: impl Into<Vec<u8>>, content_type: Option<&str>) {
        lock(&self.objects).insert(
            key.to_string(),
            StoredObject {
                bytes: bytes.into(),
                content_type: content_type.map(str::to_string),
            },
        );
    }

    pub fn fail_next(&self, n: u32) {
        self.failures.arm(n);
    }
}

impl ObjectStore for MockObjectStore {
    fn fetch<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<StoredObject>> {
        Box::pin(async move {
            if self.failures.take() {
                return Err(QuillError::Capability("storage unavailable".into()));
            }
            lock(&self.objects)
                .get(key)
                .cloned()
                .ok_or_else(|| QuillError::NotFound(format!("object '{key}'")))
        })
    }
}

/// Identity provider that records revocations.
#[derive(Clone, Default)]
pub struct MockIdentity {
    revoked: Arc<Mutex<Vec<String>>>,
    failures: Arc<Failures>,
}

impl MockIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn revoked(&self) -> Vec<String> {
        lock(&self.revoked).clone()
    }

    pub fn fail_next(&self, n: u32) {
        self.failures.arm(n);
    }
}

impl IdentityProvider for MockIdentity {
    fn revoke<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if self.failures.take() {
                return Err(QuillError::Capability("identity provider timeout".into()));
            }
            lock(&self.revoked).push(user_id.to_string());
            Ok(())
        })
    }
}

/// Event bus that records what was sent.
#[derive(Clone, Default)]
pub struct MockEventBus {
    events: Arc<Mutex<Vec<Event>>>,
    failures: Arc<Failures>,
}

impl MockEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        lock(&self.events).clone()
    }

    pub fn events_named(&self, name: &str) -> Vec<Event> {
        lock(&self.events)
            .iter()
            .filter(|e| e.name == name)
            .cloned()
            .collect()
    }

    pub fn fail_next(&self, n: u32) {
        self.failures.arm(n);
    }
}

impl EventBus for MockEventBus {
    fn send(&self, events: Vec<Event>) -> BoxFuture<'_, Result<SendReceipt>> {
        Box::pin(async move {
            if self.failures.take() {
                return Err(QuillError::Delivery("broker unreachable".into()));
            }
            let events: Vec<Event> = events.into_iter().map(Event::stamped).collect();
            let ids = events.iter().map(|e| e.event_id().to_string()).collect();
            lock(&self.events).extend(events);
            Ok(SendReceipt { ids })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(key: Option<&str>) -> EmailMessage {
        EmailMessage {
            to: "a@example.com".into(),
            subject: "Hi".into(),
            html: "<p>Hi</p>".into(),
            text: None,
            idempotency_key: key.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_mailer_dedups_on_idempotency_key() {
        let mailer = MockMailer::new();
        let first = mailer.send(message(Some("k1"))).await.unwrap();
        let again = mailer.send(message(Some("k1"))).await.unwrap();
        mailer.send(message(None)).await.unwrap();

        assert_eq!(first, again);
        assert_eq!(mailer.sent().len(), 2);
        assert_eq!(mailer.attempts(), 3);
    }

    #[tokio::test]
    async fn test_fail_next_is_retryable_then_recovers() {
        let mailer = MockMailer::new();
        mailer.fail_next(1);
        let err = mailer.send(message(None)).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(mailer.send(message(None)).await.is_ok());
    }

    #[tokio::test]
    async fn test_generator_queue_then_handler() {
        let generator = MockGenerator::new().with_handler(|req| Ok(format!("echo:{}", req.prompt)));
        generator.push_reply("first");

        let a = generator.generate(GenerationRequest::new("p1")).await.unwrap();
        let b = generator.generate(GenerationRequest::new("p2")).await.unwrap();
        assert_eq!(a, "first");
        assert_eq!(b, "echo:p2");
        assert_eq!(generator.calls(), 2);
    }

    #[tokio::test]
    async fn test_extractor_rejects_unknown_mime() {
        let extractor = MockExtractor::new();
        assert_eq!(
            extractor.extract(b"hello", "text/plain").await.unwrap(),
            "hello"
        );
        let err = extractor.extract(b"\x89PNG", "image/png").await.unwrap_err();
        assert!(matches!(err, QuillError::UnsupportedType(_)));
        assert!(!err.is_retryable());
    }
}
