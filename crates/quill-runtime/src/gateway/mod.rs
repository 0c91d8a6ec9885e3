//! HTTP surface of the engine.

mod auth;
mod response;
mod server;
mod tracing;
mod webhook;


pub use auth::{AuthError, BrokerAuth, BrokerClaims};
pub use response::{WebhookResponse, WebhookStatus, NO_RETRY_HEADER};
pub use server::{HealthResponse, WebhookServer};
pub use tracing::TracingState;
pub use webhook::{AdvanceRequest, FunctionDescriptor, WebhookState};
