mod context;
mod record;
mod runner;

pub use context::{ExecutedError, ExecutedStep, StepContext};
pub use record::{StepRecord, StepStatus};
pub use runner::StepRunner;
