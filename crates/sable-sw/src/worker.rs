//! Worker facade: install state, statechange observers, and the lazily
//! created execution environment.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::environment::{EnvironmentConfig, EventPayload, ExecutionEnvironment};
use crate::error::{SwError, SwResult};
use crate::event::{ExtendableEvent, FetchEvent};
use crate::event_target::{EventTarget, ListenerId};
use crate::factory::SwServices;
use crate::fetch::FetchRequest;
use crate::registration::Registration;
use crate::storage::{RegistrationId, WorkerId, WorkerRecord};

/// Install state of a worker. Mutated only by registration transitions;
/// `Redundant` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallState {
    Installing,
    Installed,
    Activating,
    Activated,
    Redundant,
}

impl std::fmt::Display for InstallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Installing => "installing",
            Self::Installed => "installed",
            Self::Activating => "activating",
            Self::Activated => "activated",
            Self::Redundant => "redundant",
        };
        f.write_str(name)
    }
}

/// Callback fired on every install-state transition.
pub type StateListener = Arc<dyn Fn(InstallState) + Send + Sync>;

/// One service worker.
///
/// Obtained from a registration's slots or from `register`. The script
/// execution environment is created on first use and torn down when the
/// worker becomes redundant; a worker handle held across that transition
/// stays inspectable but refuses further dispatch.
pub struct Worker {
    id: WorkerId,
    registration_id: RegistrationId,
    script_url: Url,
    state: Mutex<InstallState>,
    skip_waiting: AtomicBool,
    registration: Mutex<Weak<Registration>>,
    environment: tokio::sync::Mutex<Option<Arc<ExecutionEnvironment>>>,
    events: EventTarget<StateListener>,
    services: Arc<SwServices>,
}

impl Worker {
    pub(crate) fn new_installing(
        id: WorkerId,
        registration_id: RegistrationId,
        script_url: Url,
        services: Arc<SwServices>,
    ) -> Self {
        Self {
            id,
            registration_id,
            script_url,
            state: Mutex::new(InstallState::Installing),
            skip_waiting: AtomicBool::new(false),
            registration: Mutex::new(Weak::new()),
            environment: tokio::sync::Mutex::new(None),
            events: EventTarget::new(),
            services,
        }
    }

    pub(crate) fn from_record(
        record: &WorkerRecord,
        script_url: Url,
        services: Arc<SwServices>,
    ) -> Self {
        let mut worker = Self::new_installing(record.id, record.registration_id, script_url, services);
        worker.state = Mutex::new(record.state);
        worker
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn registration_id(&self) -> RegistrationId {
        self.registration_id
    }

    pub fn script_url(&self) -> &Url {
        &self.script_url
    }

    pub fn state(&self) -> InstallState {
        *self.state.lock()
    }

    /// The owning registration, while it is alive.
    pub fn registration(&self) -> Option<Arc<Registration>> {
        self.registration.lock().upgrade()
    }

    pub(crate) fn attach_registration(&self, registration: &Arc<Registration>) {
        *self.registration.lock() = Arc::downgrade(registration);
    }

    /// Observe install-state transitions.
    pub fn on_statechange(&self, listener: StateListener) -> ListenerId {
        self.events.add_listener("statechange", listener)
    }

    pub fn remove_statechange(&self, id: ListenerId) -> bool {
        self.events.remove_listener("statechange", id)
    }

    pub(crate) fn set_state(&self, state: InstallState) {
        {
            let mut current = self.state.lock();
            if *current == state {
                return;
            }
            debug!(worker = %self.id, from = %current, to = %state, "worker state change");
            *current = state;
        }
        // Listeners run outside the state lock; they may re-read state().
        for listener in self.events.snapshot("statechange") {
            listener(state);
        }
    }

    /// Set by the `skipWaiting` binding; consulted when install completes.
    pub(crate) fn request_skip_waiting(&self) {
        self.skip_waiting.store(true, Ordering::SeqCst);
    }

    pub fn skip_waiting_requested(&self) -> bool {
        self.skip_waiting.load(Ordering::SeqCst)
    }

    /// The live execution environment, when one has been started.
    pub async fn environment(&self) -> Option<Arc<ExecutionEnvironment>> {
        self.environment.lock().await.clone()
    }

    /// Create the environment and run the main script, once. Subsequent
    /// calls return the cached environment.
    pub(crate) async fn start(&self) -> SwResult<Arc<ExecutionEnvironment>> {
        let mut slot = self.environment.lock().await;
        if let Some(environment) = slot.as_ref() {
            return Ok(environment.clone());
        }
        if self.state() == InstallState::Redundant {
            return Err(SwError::invalid_state("a redundant worker cannot start"));
        }
        let source = self
            .services
            .storage
            .script(self.id)?
            .ok_or_else(|| SwError::invalid_state("worker has no stored script content"))?;
        let environment = ExecutionEnvironment::create(EnvironmentConfig {
            worker_id: self.id,
            script_url: self.script_url.clone(),
            engine: self.services.engine.clone(),
            fetcher: self.services.fetcher.clone(),
            registry: self.services.registry.clone(),
            runtime: tokio::runtime::Handle::current(),
        })
        .await?;
        let body = source.body_text().into_owned();
        if let Err(error) = environment
            .evaluate(&body, Some(self.script_url.as_str()))
            .await
        {
            if let Err(teardown_error) = environment.teardown().await {
                warn!(worker = %self.id, error = %teardown_error, "teardown after failed main script evaluation");
            }
            return Err(error);
        }
        *slot = Some(environment.clone());
        Ok(environment)
    }

    /// Dispatch an extendable event to this worker and wait for every
    /// extension its handlers registered.
    pub async fn dispatch_extendable(&self, event: Arc<ExtendableEvent>) -> SwResult<()> {
        let environment = self.start().await?;
        if let Err(error) = environment
            .dispatch(EventPayload::Extendable(event.clone()))
            .await
        {
            event.invalidate();
            return Err(error);
        }
        event.resolve().await
    }

    /// Dispatch a `message` event carrying `data`.
    pub async fn post_message(&self, data: Value) -> SwResult<()> {
        if self.state() == InstallState::Redundant {
            return Err(SwError::invalid_state(
                "cannot post a message to a redundant worker",
            ));
        }
        let event = Arc::new(ExtendableEvent::with_data("message", data));
        self.dispatch_extendable(event).await
    }

    /// Dispatch a fetch event. Returns the worker-provided response
    /// snapshot, or `None` when no handler claimed the event.
    pub async fn dispatch_fetch(&self, request: FetchRequest) -> SwResult<Option<Value>> {
        if self.state() == InstallState::Redundant {
            return Err(SwError::invalid_state(
                "cannot dispatch fetch to a redundant worker",
            ));
        }
        let environment = self.start().await?;
        let event = Arc::new(FetchEvent::new(request));
        if let Err(error) = environment.dispatch(EventPayload::Fetch(event.clone())).await {
            event.invalidate();
            return Err(error);
        }
        event.resolve().await?;
        match event.take_response() {
            None => Ok(None),
            Some(receiver) => receiver
                .await
                .map_err(|_| SwError::internal("respondWith settlement channel dropped"))?
                .map(Some),
        }
    }

    /// Wait for worker-opened resources to settle.
    pub async fn ensure_finished(&self) -> SwResult<()> {
        let environment = self.environment().await;
        match environment {
            Some(environment) => environment.ensure_finished().await,
            None => Ok(()),
        }
    }

    /// Terminal transition: the worker never runs again. Tears down the
    /// execution environment if one was started.
    pub(crate) async fn mark_redundant(&self) {
        self.set_state(InstallState::Redundant);
        let environment = self.environment.lock().await.take();
        if let Some(environment) = environment {
            if let Err(error) = environment.teardown().await {
                warn!(worker = %self.id, error = %error, "environment teardown failed");
            }
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("url", &self.script_url.as_str())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_state_display_and_serde() {
        assert_eq!(InstallState::Installing.to_string(), "installing");
        assert_eq!(InstallState::Redundant.to_string(), "redundant");
        assert_eq!(
            serde_json::to_value(InstallState::Activated).unwrap(),
            serde_json::json!("activated")
        );
        assert_eq!(
            serde_json::from_value::<InstallState>(serde_json::json!("installed")).unwrap(),
            InstallState::Installed
        );
    }
}
