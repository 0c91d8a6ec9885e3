//! Runtime for Quill functions: run storage, event buses, the job engine and
//! the webhook server.

pub mod bus;
pub mod capability;
pub mod db;
pub mod gateway;
pub mod jobs;
pub mod migrations;
pub mod observability;
pub mod store;

pub use bus::{HttpEventBus, LocalEventBus};
pub use db::Database;
pub use gateway::{WebhookResponse, WebhookServer, WebhookStatus};
pub use jobs::{
    AdvanceOutcome, DispatchReport, Dispatcher, Executor, ExecutorConfig, FunctionRegistry,
    RunScheduler, SchedulerConfig,
};
pub use migrations::{Migration, MigrationRunner};
pub use observability::init_tracing;
pub use store::PgRunStore;
