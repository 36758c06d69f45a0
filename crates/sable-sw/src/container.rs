//! The hosting application's entry surface.

use std::sync::Arc;

use tracing::debug;
use url::Url;

use sable_engine::ScriptEngine;

use crate::error::{SwError, SwResult};
use crate::factory::{RegistrationFactory, SwServices, WorkerFactory, WorkerRegistry};
use crate::fetch::{HttpFetcher, ScriptFetcher};
use crate::registration::{
    RegisterOutcome, Registration, default_scope, normalize_scope, validate_scope,
};
use crate::storage::{MemoryStore, SwStorage};

/// Entry point for embedding the worker runtime.
///
/// # Example
///
/// ```ignore
/// let container = ServiceWorkerContainer::builder()
///     .engine(engine)
///     .build()?;
///
/// let outcome = container.register("https://example.com/app/sw.js", None).await?;
/// outcome.completion.await.ok();
/// ```
pub struct ServiceWorkerContainer {
    registrations: Arc<RegistrationFactory>,
}

impl ServiceWorkerContainer {
    pub fn builder() -> ContainerBuilder {
        ContainerBuilder {
            engine: None,
            storage: None,
            fetcher: None,
        }
    }

    /// Register `script_url` under `scope`, defaulting to the script's
    /// directory. The worker in the outcome is immediately visible in the
    /// registration's `installing` slot.
    pub async fn register(
        &self,
        script_url: &str,
        scope: Option<&str>,
    ) -> SwResult<RegisterOutcome> {
        let script_url = Url::parse(script_url)
            .map_err(|e| SwError::validation(format!("invalid script URL {script_url}: {e}")))?;
        let scope = match scope {
            Some(raw) => normalize_scope(&script_url, raw)?,
            None => default_scope(&script_url)?,
        };
        validate_scope(&scope, &script_url)?;
        debug!(script = %script_url, scope = %scope, "register");
        let registration = self.registrations.get_or_create(&scope)?;
        registration.register(script_url).await
    }

    /// The registration exactly matching `scope`, if any. Longest-prefix
    /// matching over client URLs belongs to the host; this lookup is
    /// exact.
    pub fn get_registration(&self, scope: &str) -> SwResult<Option<Arc<Registration>>> {
        let scope =
            Url::parse(scope).map_err(|e| SwError::validation(format!("invalid scope {scope}: {e}")))?;
        self.registrations.get_by_scope(&scope)
    }

    /// Every persisted registration.
    pub fn get_registrations(&self) -> SwResult<Vec<Arc<Registration>>> {
        self.registrations.all()
    }
}

/// Assembles a container from its collaborators.
pub struct ContainerBuilder {
    engine: Option<Arc<dyn ScriptEngine>>,
    storage: Option<Arc<dyn SwStorage>>,
    fetcher: Option<Arc<dyn ScriptFetcher>>,
}

impl ContainerBuilder {
    /// The script engine workers run on. Required.
    pub fn engine(mut self, engine: Arc<dyn ScriptEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Persistence collaborator. Defaults to an in-memory store.
    pub fn storage(mut self, storage: Arc<dyn SwStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Network collaborator. Defaults to the HTTP delegate.
    pub fn fetcher(mut self, fetcher: Arc<dyn ScriptFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn build(self) -> SwResult<ServiceWorkerContainer> {
        let engine = self
            .engine
            .ok_or_else(|| SwError::configuration("a script engine is required"))?;
        let storage: Arc<dyn SwStorage> = match self.storage {
            Some(storage) => storage,
            None => Arc::new(MemoryStore::new()),
        };
        let fetcher: Arc<dyn ScriptFetcher> = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(HttpFetcher::new()?),
        };
        let services = Arc::new(SwServices {
            engine,
            storage,
            fetcher,
            registry: WorkerRegistry::default(),
        });
        let workers = Arc::new(WorkerFactory::new(services.clone()));
        let registrations = RegistrationFactory::new(services, workers);
        Ok(ServiceWorkerContainer { registrations })
    }
}
