//! The Quill process: webhook server plus, in embedded mode, the run
//! scheduler, wired to Postgres or to in-memory stores.

use std::path::PathBuf;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use quill_core::capability::{
    EmailMessage, GenerationRequest, Generator, IdentityProvider, Mailer, ObjectStore,
    StoredObject, TextExtractor,
};
use quill_core::config::{CapabilitiesConfig, EngineMode, QuillConfig};
use quill_core::error::{QuillError, Result};
use quill_core::event::EventBus;
use quill_core::function::QuillFunction;
use quill_core::store::{MemoryRunStore, RunStore};
use quill_runtime::capability::{
    HttpExtractor, HttpGenerator, HttpIdentity, HttpMailer, HttpObjectStore,
};
use quill_runtime::migrations::{load_migrations_from_dir, Migration, MigrationRunner};
use quill_runtime::{
    Database, Dispatcher, Executor, ExecutorConfig, FunctionRegistry, HttpEventBus,
    LocalEventBus, PgRunStore, RunScheduler, SchedulerConfig, WebhookServer,
};

use crate::jobs::{self, JobServices};
use crate::ports::{
    product_migrations, DeliveryLog, MemoryPorts, OwnershipStore, PgPorts, QuestionBank,
    SubmissionStore, UserDirectory,
};

/// Prelude module for writing additional functions.
pub mod prelude {
    pub use chrono::{DateTime, Utc};
    pub use futures::future::BoxFuture;
    pub use uuid::Uuid;

    pub use quill_core::config::QuillConfig;
    pub use quill_core::error::{QuillError, Result};
    pub use quill_core::event::{Event, EventBus};
    pub use quill_core::function::{FunctionInfo, QuillFunction, RetryConfig};
    pub use quill_core::step::StepContext;

    pub use crate::jobs::JobServices;
    pub use crate::{Quill, QuillBuilder};
}

/// The Quill runtime.
pub struct Quill {
    config: QuillConfig,
    registry: FunctionRegistry,
    services: Option<JobServices>,
    migrations_dir: PathBuf,
    extra_migrations: Vec<Migration>,
    shutdown: CancellationToken,
}

impl Quill {
    pub fn builder() -> QuillBuilder {
        QuillBuilder::new()
    }

    pub fn config(&self) -> &QuillConfig {
        &self.config
    }

    /// Functions registered so far. The platform jobs join them in `run`.
    pub fn registry(&self) -> &FunctionRegistry {
        &self.registry
    }

    /// Token that stops `run` when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serve until ctrl-c or until the shutdown token is cancelled.
    pub async fn run(mut self) -> Result<()> {
        tracing::info!(project = %self.config.project.name, "Quill runtime starting");

        let db = if self.config.database.is_configured() {
            let db = Database::from_config(&self.config.database).await?;
            tracing::info!("Connected to database");

            if self.config.database.run_migrations {
                let mut migrations = product_migrations();
                migrations.extend(load_migrations_from_dir(&self.migrations_dir)?);
                migrations.extend(self.extra_migrations.clone());
                let applied = MigrationRunner::new(db.pool().clone())
                    .run(migrations)
                    .await?;
                tracing::info!(applied = applied.len(), "Migrations completed");
            }
            Some(db)
        } else {
            tracing::warn!("No database configured, runs and product data live in memory");
            None
        };

        let store: Arc<dyn RunStore> = match &db {
            Some(db) => Arc::new(PgRunStore::new(db.pool().clone())),
            None => Arc::new(MemoryRunStore::new()),
        };
        let services = match self.services.take() {
            Some(services) => services,
            None => match &db {
                Some(db) => services_with(
                    Arc::new(PgPorts::new(db.pool().clone())),
                    &self.config.capabilities,
                )?,
                None => services_with(Arc::new(MemoryPorts::new()), &self.config.capabilities)?,
            },
        };

        jobs::register_all(&mut self.registry, &services)?;
        let registry = Arc::new(self.registry);
        let dispatcher = Arc::new(Dispatcher::new(registry.clone(), store.clone()));

        let mode = self.config.engine.mode;
        let bus: Arc<dyn EventBus> = match (mode, &self.config.broker.url) {
            (EngineMode::Broker, Some(url)) => Arc::new(HttpEventBus::new(
                url,
                self.config.broker.event_key.as_deref().unwrap_or_default(),
            )?),
            (EngineMode::Broker, None) => {
                tracing::warn!("Broker mode without broker.url, follow-up events stay in-process");
                Arc::new(LocalEventBus::new(dispatcher.clone()))
            }
            (EngineMode::Embedded, _) => Arc::new(LocalEventBus::new(dispatcher.clone())),
        };
        let executor = Arc::new(
            Executor::new(
                registry.clone(),
                store.clone(),
                ExecutorConfig::from(&self.config.engine),
            )
            .with_bus(bus),
        );

        let token = self.shutdown.clone();
        let mut handles = Vec::new();

        let server = WebhookServer::new(
            self.config.webhook.clone(),
            self.config.project.name.clone(),
            registry.clone(),
            dispatcher.clone(),
            executor.clone(),
        );
        {
            let token = token.clone();
            handles.push(tokio::spawn(async move {
                if let Err(e) = server.run(token.clone()).await {
                    tracing::error!(error = %e, "Webhook server error");
                    token.cancel();
                }
            }));
        }

        if mode == EngineMode::Embedded {
            let scheduler = RunScheduler::new(
                executor.clone(),
                store.clone(),
                SchedulerConfig::from(&self.config.engine),
                token.clone(),
            )
            .with_wake(dispatcher.wake_handle());
            handles.push(tokio::spawn(scheduler.run()));
            tracing::info!("Embedded scheduler started");
        }

        tracing::info!(
            mode = ?mode,
            functions = registry.len(),
            port = self.config.webhook.port,
            "Quill runtime started"
        );

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received shutdown signal");
            }
            _ = token.cancelled() => {
                tracing::info!("Received shutdown notification");
            }
        }

        token.cancel();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }

        if let Some(db) = db {
            db.close().await;
        }
        tracing::info!("Quill runtime stopped");
        Ok(())
    }

    /// Request shutdown.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// Job services backed by one product store and the configured endpoints.
fn services_with<P>(ports: Arc<P>, capabilities: &CapabilitiesConfig) -> Result<JobServices>
where
    P: UserDirectory + OwnershipStore + QuestionBank + SubmissionStore + DeliveryLog + 'static,
{
    let mailer: Arc<dyn Mailer> = match &capabilities.email {
        Some(config) => Arc::new(HttpMailer::new(config)?),
        None => Arc::new(Unavailable("email")),
    };
    let generator: Arc<dyn Generator> = match &capabilities.generation {
        Some(config) => Arc::new(HttpGenerator::new(config)?),
        None => Arc::new(Unavailable("generation")),
    };
    let extractor: Arc<dyn TextExtractor> = match &capabilities.extraction {
        Some(config) => Arc::new(HttpExtractor::new(config)?),
        None => Arc::new(Unavailable("extraction")),
    };
    let storage: Arc<dyn ObjectStore> = match &capabilities.storage {
        Some(config) => Arc::new(HttpObjectStore::new(config)?),
        None => Arc::new(Unavailable("storage")),
    };
    let identity: Arc<dyn IdentityProvider> = match &capabilities.identity {
        Some(config) => Arc::new(HttpIdentity::new(config)?),
        None => Arc::new(Unavailable("identity")),
    };

    Ok(JobServices {
        users: ports.clone(),
        ownership: ports.clone(),
        questions: ports.clone(),
        submissions: ports.clone(),
        deliveries: ports,
        mailer,
        generator,
        extractor,
        storage,
        identity,
    })
}

/// Stands in for a capability with no configured endpoint.
///
/// Every call fails permanently, so runs that need it fail instead of
/// retrying forever.
#[derive(Debug, Clone, Copy)]
pub struct Unavailable(pub &'static str);

impl Unavailable {
    fn error(&self) -> QuillError {
        QuillError::Config(format!(
            "capabilities.{} is not configured",
            self.0
        ))
    }
}

impl Mailer for Unavailable {
    fn send(&self, _message: EmailMessage) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move { Err(self.error()) })
    }
}

impl Generator for Unavailable {
    fn generate(&self, _request: GenerationRequest) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move { Err(self.error()) })
    }
}

impl TextExtractor for Unavailable {
    fn extract<'a>(&'a self, _bytes: &'a [u8], _mime: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move { Err(self.error()) })
    }
}

impl ObjectStore for Unavailable {
    fn fetch<'a>(&'a self, _key: &'a str) -> BoxFuture<'a, Result<StoredObject>> {
        Box::pin(async move { Err(self.error()) })
    }
}

impl IdentityProvider for Unavailable {
    fn revoke<'a>(&'a self, _user_id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { Err(self.error()) })
    }
}

/// Builder for configuring the Quill runtime.
pub struct QuillBuilder {
    config: Option<QuillConfig>,
    registry: FunctionRegistry,
    services: Option<JobServices>,
    migrations_dir: PathBuf,
    extra_migrations: Vec<Migration>,
}

impl QuillBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            registry: FunctionRegistry::new(),
            services: None,
            migrations_dir: PathBuf::from("migrations"),
            extra_migrations: Vec::new(),
        }
    }

    pub fn config(mut self, config: QuillConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Directory of additional `*.sql` migrations (default: ./migrations).
    pub fn migrations_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.migrations_dir = path.into();
        self
    }

    /// Add a migration programmatically.
    pub fn migration(mut self, name: impl Into<String>, sql: impl Into<String>) -> Self {
        self.extra_migrations.push(Migration::new(name, sql));
        self
    }

    /// Replace the stores and capability clients the jobs use.
    pub fn services(mut self, services: JobServices) -> Self {
        self.services = Some(services);
        self
    }

    /// Register a function next to the platform jobs.
    pub fn function<F>(mut self, function: F) -> Result<Self>
    where
        F: QuillFunction,
        F::Input: 'static,
        F::Output: 'static,
    {
        self.registry.register(function)?;
        Ok(self)
    }

    pub fn registry_mut(&mut self) -> &mut FunctionRegistry {
        &mut self.registry
    }

    pub fn build(self) -> Result<Quill> {
        let config = self
            .config
            .ok_or_else(|| QuillError::Config("Configuration is required".to_string()))?;

        Ok(Quill {
            config,
            registry: self.registry,
            services: self.services,
            migrations_dir: self.migrations_dir,
            extra_migrations: self.extra_migrations,
            shutdown: CancellationToken::new(),
        })
    }
}

impl Default for QuillBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::BulkUserImport;
    use quill_core::testing::MockMailer;

    #[test]
    fn test_builder_new() {
        let builder = QuillBuilder::new();
        assert!(builder.config.is_none());
        assert_eq!(builder.migrations_dir, PathBuf::from("migrations"));
    }

    #[test]
    fn test_builder_requires_config() {
        assert!(QuillBuilder::new().build().is_err());
    }

    #[test]
    fn test_builder_with_config() {
        let quill = QuillBuilder::new()
            .config(QuillConfig::default())
            .migration("0500_extra", "SELECT 1")
            .build()
            .unwrap();
        assert_eq!(quill.extra_migrations.len(), 1);
        assert!(quill.registry().is_empty());
    }

    #[test]
    fn test_builder_rejects_duplicate_function() {
        let ports = Arc::new(MemoryPorts::new());
        let mailer = Arc::new(MockMailer::new());
        let builder = QuillBuilder::new()
            .function(BulkUserImport::new(ports.clone(), mailer.clone()))
            .unwrap();
        let err = builder
            .function(BulkUserImport::new(ports, mailer))
            .err()
            .unwrap();
        assert!(matches!(err, QuillError::DuplicateFunctionId(_)));
    }

    #[tokio::test]
    async fn test_unavailable_capability_fails_permanently() {
        let err = Unavailable("email")
            .send(EmailMessage {
                to: "a@example.com".into(),
                subject: "Hi".into(),
                html: "<p>Hi</p>".into(),
                text: None,
                idempotency_key: None,
            })
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("capabilities.email"));
    }

    #[test]
    fn test_memory_services_without_endpoints() {
        let services =
            services_with(Arc::new(MemoryPorts::new()), &CapabilitiesConfig::default()).unwrap();
        let mut registry = FunctionRegistry::new();
        jobs::register_all(&mut registry, &services).unwrap();
        assert_eq!(registry.len(), 6);
    }

    #[tokio::test]
    async fn test_shutdown_token_is_shared() {
        let quill = QuillBuilder::new()
            .config(QuillConfig::default())
            .build()
            .unwrap();
        let token = quill.shutdown_token();
        quill.shutdown();
        assert!(token.is_cancelled());
    }
}
