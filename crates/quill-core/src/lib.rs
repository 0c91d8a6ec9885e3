//! Core types for Quill: events, function definitions, runs, durable steps
//! and the collaborator traits jobs depend on.

pub mod capability;
pub mod config;
pub mod error;
pub mod event;
pub mod function;
pub mod run;
pub mod step;
pub mod store;

#[cfg(feature = "testing")]
pub mod testing;

pub use config::QuillConfig;
pub use error::{QuillError, Result};
pub use event::{Event, EventBus, EventPattern, SendReceipt};
pub use function::{BackoffStrategy, ConcurrencyConfig, FunctionInfo, QuillFunction, RetryConfig};
pub use run::{RunRecord, RunStatus};
pub use step::{StepContext, StepRecord, StepStatus};
pub use store::{Claim, MemoryRunStore, RunCreation, RunStore};
