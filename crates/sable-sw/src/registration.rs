//! The registration state machine: worker slots and the install, activate,
//! update, and unregister pipelines.
//!
//! Slot moves follow a fixed discipline: a worker evicted from a slot by a
//! successor becomes redundant and stays observable in the `redundant`
//! slot; a worker moving between slots under its own pipeline keeps its
//! identity. Every slot change is persisted after the in-memory move.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use url::Url;

use crate::error::{SwError, SwResult};
use crate::event::ExtendableEvent;
use crate::event_target::{EventTarget, ListenerId};
use crate::factory::{RegistrationFactory, SwServices, WorkerFactory};
use crate::fetch::FetchRequest;
use crate::storage::{RegistrationId, SlotRecord};
use crate::worker::{InstallState, Worker};

/// Callback fired when a new installing worker appears on a registration.
pub type UpdateFoundListener = Arc<dyn Fn(Arc<Worker>) + Send + Sync>;

/// Outcome of `register`: the stub worker, already visible in the
/// `installing` slot, plus a receiver that settles when the whole
/// download/install/activate pipeline finishes.
#[derive(Debug)]
pub struct RegisterOutcome {
    pub worker: Arc<Worker>,
    pub completion: oneshot::Receiver<SwResult<()>>,
}

#[derive(Default)]
struct Slots {
    installing: Option<Arc<Worker>>,
    waiting: Option<Arc<Worker>>,
    active: Option<Arc<Worker>>,
    redundant: Option<Arc<Worker>>,
}

/// A scope's worker slots and the operations that move workers between
/// them.
pub struct Registration {
    id: RegistrationId,
    scope: Url,
    slots: Mutex<Slots>,
    unregistered: AtomicBool,
    events: EventTarget<UpdateFoundListener>,
    services: Arc<SwServices>,
    workers: Arc<WorkerFactory>,
    factory: Weak<RegistrationFactory>,
}

impl Registration {
    pub(crate) fn new(
        id: RegistrationId,
        scope: Url,
        services: Arc<SwServices>,
        workers: Arc<WorkerFactory>,
        factory: Weak<RegistrationFactory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            scope,
            slots: Mutex::new(Slots::default()),
            unregistered: AtomicBool::new(false),
            events: EventTarget::new(),
            services,
            workers,
            factory,
        })
    }

    pub fn id(&self) -> RegistrationId {
        self.id
    }

    pub fn scope(&self) -> &Url {
        &self.scope
    }

    pub fn installing(&self) -> Option<Arc<Worker>> {
        self.slots.lock().installing.clone()
    }

    pub fn waiting(&self) -> Option<Arc<Worker>> {
        self.slots.lock().waiting.clone()
    }

    pub fn active(&self) -> Option<Arc<Worker>> {
        self.slots.lock().active.clone()
    }

    /// The most recently evicted worker, kept observable after it leaves
    /// the live slots.
    pub fn redundant(&self) -> Option<Arc<Worker>> {
        self.slots.lock().redundant.clone()
    }

    pub fn is_unregistered(&self) -> bool {
        self.unregistered.load(Ordering::SeqCst)
    }

    /// Observe new installing workers appearing on this registration.
    pub fn on_updatefound(&self, listener: UpdateFoundListener) -> ListenerId {
        self.events.add_listener("updatefound", listener)
    }

    pub fn remove_updatefound(&self, id: ListenerId) -> bool {
        self.events.remove_listener("updatefound", id)
    }

    pub(crate) fn restore_slots(
        self: &Arc<Self>,
        installing: Option<Arc<Worker>>,
        waiting: Option<Arc<Worker>>,
        active: Option<Arc<Worker>>,
        redundant: Option<Arc<Worker>>,
    ) {
        for worker in [&installing, &waiting, &active, &redundant].into_iter().flatten() {
            worker.attach_registration(self);
        }
        let mut slots = self.slots.lock();
        slots.installing = installing;
        slots.waiting = waiting;
        slots.active = active;
        slots.redundant = redundant;
    }

    fn check_registered(&self) -> SwResult<()> {
        if self.is_unregistered() {
            return Err(SwError::invalid_state("registration was unregistered"));
        }
        Ok(())
    }

    /// Start the register pipeline for `script_url`.
    pub async fn register(self: &Arc<Self>, script_url: Url) -> SwResult<RegisterOutcome> {
        validate_scope(&self.scope, &script_url)?;
        self.check_registered()?;

        let worker = self.workers.create_installing(self.id, &script_url)?;
        self.place_installing(worker.clone()).await?;

        let (tx, rx) = oneshot::channel();
        let registration = self.clone();
        let pipeline_worker = worker.clone();
        tokio::spawn(async move {
            let result = registration.download_and_install(&pipeline_worker).await;
            if let Err(error) = &result {
                debug!(registration = %registration.id, error = %error, "register pipeline failed");
            }
            let _ = tx.send(result);
        });

        Ok(RegisterOutcome {
            worker,
            completion: rx,
        })
    }

    /// Place a new worker into `installing`, evicting any predecessor, and
    /// announce it.
    async fn place_installing(self: &Arc<Self>, worker: Arc<Worker>) -> SwResult<()> {
        worker.attach_registration(self);
        let evicted = {
            let mut slots = self.slots.lock();
            slots.installing.replace(worker.clone())
        };
        if let Some(evicted) = evicted {
            self.retire(evicted).await?;
        }
        self.persist_slots()?;
        for listener in self.events.snapshot("updatefound") {
            listener(worker.clone());
        }
        Ok(())
    }

    /// Eviction-path redundancy: mark the worker redundant, persist its
    /// state, and keep it observable in the `redundant` slot.
    async fn retire(&self, worker: Arc<Worker>) -> SwResult<()> {
        worker.mark_redundant().await;
        self.services
            .storage
            .set_worker_state(worker.id(), InstallState::Redundant)?;
        self.slots.lock().redundant = Some(worker);
        Ok(())
    }

    fn persist_slots(&self) -> SwResult<()> {
        let record = {
            let slots = self.slots.lock();
            SlotRecord {
                installing: slots.installing.as_ref().map(|worker| worker.id()),
                waiting: slots.waiting.as_ref().map(|worker| worker.id()),
                active: slots.active.as_ref().map(|worker| worker.id()),
                redundant: slots.redundant.as_ref().map(|worker| worker.id()),
            }
        };
        self.services.storage.set_registration_slots(self.id, &record)
    }

    async fn download_and_install(self: &Arc<Self>, worker: &Arc<Worker>) -> SwResult<()> {
        let request = FetchRequest::get(worker.script_url().clone());
        let response = match self.services.fetcher.fetch(request).await {
            Ok(response) if response.ok() => response,
            Ok(response) => {
                self.discard_stub(worker)?;
                return Err(SwError::network(format!(
                    "script fetch failed with status {}",
                    response.status
                )));
            }
            Err(error) => {
                self.discard_stub(worker)?;
                return Err(error);
            }
        };
        self.services
            .storage
            .set_script_content(worker.id(), response.body, response.headers)?;
        self.install(worker).await
    }

    /// A stub whose script never arrived leaves no trace: no redundant
    /// transition, no record.
    fn discard_stub(&self, worker: &Arc<Worker>) -> SwResult<()> {
        {
            let mut slots = self.slots.lock();
            if slot_holds(&slots.installing, worker) {
                slots.installing = None;
            }
        }
        self.workers.discard(worker)?;
        self.persist_slots()
    }

    /// Run the install lifecycle event and move the worker to `waiting`.
    /// On success the worker proceeds to activation when it requested
    /// `skipWaiting` or when no active worker exists.
    pub(crate) async fn install(self: &Arc<Self>, worker: &Arc<Worker>) -> SwResult<()> {
        if !slot_holds(&self.slots.lock().installing, worker) {
            return Err(SwError::invalid_state(
                "install: worker does not occupy the installing slot",
            ));
        }
        debug!(registration = %self.id, worker = %worker.id(), "install starting");

        let event = Arc::new(ExtendableEvent::new("install"));
        let install_result = match worker.start().await {
            Ok(_) => worker.dispatch_extendable(event).await,
            Err(error) => Err(error),
        };
        if let Err(error) = install_result {
            self.fail_install(worker).await?;
            return Err(error);
        }

        self.services
            .storage
            .set_worker_state(worker.id(), InstallState::Installed)?;
        worker.set_state(InstallState::Installed);

        // Same identity moves installing -> waiting; no redundant
        // transition for the mover.
        let evicted = {
            let mut slots = self.slots.lock();
            slots.installing = None;
            slots.waiting.replace(worker.clone())
        };
        if let Some(evicted) = evicted {
            self.retire(evicted).await?;
        }
        self.persist_slots()?;
        debug!(registration = %self.id, worker = %worker.id(), "worker installed");

        if worker.skip_waiting_requested() || self.active().is_none() {
            self.activate(worker).await
        } else {
            Ok(())
        }
    }

    async fn fail_install(self: &Arc<Self>, worker: &Arc<Worker>) -> SwResult<()> {
        warn!(registration = %self.id, worker = %worker.id(), "install failed");
        {
            let mut slots = self.slots.lock();
            if slot_holds(&slots.installing, worker) {
                slots.installing = None;
            }
        }
        self.retire(worker.clone()).await?;
        self.persist_slots()
    }

    /// Run the activate lifecycle event and make the worker the
    /// controller. With no predecessor the worker takes the `active` slot
    /// before the event settles; a failure undoes that early placement.
    pub(crate) async fn activate(self: &Arc<Self>, worker: &Arc<Worker>) -> SwResult<()> {
        if !slot_holds(&self.slots.lock().waiting, worker) {
            return Err(SwError::invalid_state(
                "activate: worker does not occupy the waiting slot",
            ));
        }
        debug!(registration = %self.id, worker = %worker.id(), "activate starting");

        let early_controller = {
            let mut slots = self.slots.lock();
            if slots.active.is_none() {
                slots.waiting = None;
                slots.active = Some(worker.clone());
                true
            } else {
                false
            }
        };
        if early_controller {
            self.persist_slots()?;
        }

        self.services
            .storage
            .set_worker_state(worker.id(), InstallState::Activating)?;
        worker.set_state(InstallState::Activating);

        let event = Arc::new(ExtendableEvent::new("activate"));
        if let Err(error) = worker.dispatch_extendable(event).await {
            warn!(registration = %self.id, worker = %worker.id(), "activate failed");
            {
                let mut slots = self.slots.lock();
                if early_controller {
                    if slot_holds(&slots.active, worker) {
                        slots.active = None;
                    }
                } else if slot_holds(&slots.waiting, worker) {
                    slots.waiting = None;
                }
            }
            self.retire(worker.clone()).await?;
            self.persist_slots()?;
            return Err(error);
        }

        self.services
            .storage
            .set_worker_state(worker.id(), InstallState::Activated)?;
        worker.set_state(InstallState::Activated);

        if !early_controller {
            let evicted = {
                let mut slots = self.slots.lock();
                slots.waiting = None;
                slots.active.replace(worker.clone())
            };
            if let Some(evicted) = evicted {
                self.retire(evicted).await?;
            }
            self.persist_slots()?;
        }
        debug!(registration = %self.id, worker = %worker.id(), "worker activated");
        Ok(())
    }

    /// Conditionally refetch the newest worker's script. `Ok(None)` means
    /// no change: a 304 revalidation or byte-identical content.
    pub async fn update(self: &Arc<Self>) -> SwResult<Option<Arc<Worker>>> {
        self.check_registered()?;
        let reference = self
            .active()
            .or_else(|| self.waiting())
            .ok_or_else(|| SwError::invalid_state("no installed worker to update"))?;
        let stored = self
            .services
            .storage
            .script(reference.id())?
            .ok_or_else(|| SwError::invalid_state("reference worker has no stored script"))?;

        let request = FetchRequest::conditional(
            reference.script_url().clone(),
            stored.header("etag"),
            stored.header("last-modified"),
        );
        let response = self.services.fetcher.fetch(request).await?;
        if response.not_modified() {
            debug!(registration = %self.id, "update: script not modified");
            return Ok(None);
        }
        if !response.ok() {
            return Err(SwError::network(format!(
                "update fetch failed with status {}",
                response.status
            )));
        }

        let worker = self.workers.create_installing(self.id, reference.script_url())?;
        let content_hash =
            self.services
                .storage
                .set_script_content(worker.id(), response.body, response.headers)?;
        if stored.content_hash == content_hash {
            // Byte-identical content: discard before the worker ever
            // becomes visible, so no install runs and no slot changes.
            self.workers.discard(&worker)?;
            debug!(registration = %self.id, "update: byte-identical script, skipping install");
            return Ok(None);
        }

        self.place_installing(worker.clone()).await?;
        self.install(&worker).await?;
        Ok(Some(worker))
    }

    /// Mark the registration terminally unregistered and delete its
    /// record. Live worker handles stay inspectable; workers become
    /// redundant through normal eviction, not here.
    pub fn unregister(&self) -> SwResult<bool> {
        if self.unregistered.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        self.services.storage.delete_registration(self.id)?;
        if let Some(factory) = self.factory.upgrade() {
            factory.forget(self);
        }
        debug!(registration = %self.id, scope = %self.scope, "unregistered");
        Ok(true)
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slots = self.slots.lock();
        f.debug_struct("Registration")
            .field("id", &self.id)
            .field("scope", &self.scope.as_str())
            .field("installing", &slots.installing.as_ref().map(|w| w.id()))
            .field("waiting", &slots.waiting.as_ref().map(|w| w.id()))
            .field("active", &slots.active.as_ref().map(|w| w.id()))
            .field("unregistered", &self.is_unregistered())
            .finish()
    }
}

fn slot_holds(slot: &Option<Arc<Worker>>, worker: &Arc<Worker>) -> bool {
    slot.as_ref().is_some_and(|held| Arc::ptr_eq(held, worker))
}

/// Scope for a script registered without one: the script's directory.
pub(crate) fn default_scope(script_url: &Url) -> SwResult<Url> {
    script_url
        .join("./")
        .map_err(|e| SwError::validation(format!("cannot derive a scope from {script_url}: {e}")))
}

/// Resolve a caller-provided scope against the script URL and normalize it
/// to a directory URL.
pub(crate) fn normalize_scope(script_url: &Url, raw: &str) -> SwResult<Url> {
    let mut scope = script_url
        .join(raw)
        .map_err(|e| SwError::validation(format!("invalid scope {raw}: {e}")))?;
    if !scope.path().ends_with('/') {
        let path = format!("{}/", scope.path());
        scope.set_path(&path);
    }
    Ok(scope)
}

/// Same origin plus directory containment: a script may only control
/// scopes at or under its own directory.
pub(crate) fn validate_scope(scope: &Url, script_url: &Url) -> SwResult<()> {
    if scope.origin() != script_url.origin() {
        return Err(SwError::validation(format!(
            "scope {scope} is not same-origin with script {script_url}"
        )));
    }
    let max_scope = default_scope(script_url)?;
    if !scope.path().starts_with(max_scope.path()) {
        return Err(SwError::validation(format!(
            "scope {scope} is outside the script directory {max_scope}"
        )));
    }
    Ok(())
}
