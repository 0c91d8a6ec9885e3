//! Quill: durable background jobs for the learning platform.
//!
//! The engine lives in `quill-core` and `quill-runtime`; this crate holds the
//! platform's jobs, the product data they touch, and the process that serves
//! them.

pub mod jobs;
pub mod ports;
mod runtime;

pub use quill_runtime::migrations::Migration;

pub use runtime::prelude;
pub use runtime::{Quill, QuillBuilder, Unavailable};
