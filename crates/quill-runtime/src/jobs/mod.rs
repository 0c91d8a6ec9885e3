//! Dispatch, execution and scheduling of function runs.

mod dispatcher;
mod executor;
mod registry;
mod scheduler;

#[cfg(test)]
mod tests;

pub use dispatcher::{DispatchReport, DispatchedRun, Dispatcher, RejectedEvent};
pub use executor::{AdvanceOutcome, Executor, ExecutorConfig, RunView};
pub use registry::{BoxedFunctionHandler, FunctionEntry, FunctionRegistry};
pub use scheduler::{RunScheduler, SchedulerConfig};
