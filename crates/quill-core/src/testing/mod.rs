//! Test doubles for Quill functions.
//!
//! Enabled with the `testing` feature. Jobs are exercised against a
//! [`MemoryRunStore`](crate::store::MemoryRunStore) and these mocks, so a test
//! can drive a run step by step and inspect every side effect.
//!
//! ```ignore
//! let mailer = MockMailer::new();
//! mailer.fail_next(1);
//! // first advance fails and schedules a retry, second one delivers
//! assert_eq!(mailer.sent().len(), 1);
//! ```

pub mod assertions;
mod mocks;

pub use assertions::json_matches;
pub use mocks::{
    MockEventBus, MockExtractor, MockGenerator, MockIdentity, MockMailer, MockObjectStore,
};
