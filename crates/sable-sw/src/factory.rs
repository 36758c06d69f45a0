//! Identity layer: weak caches keyed by id, one authoritative creation
//! path per entity type.
//!
//! Repeated lookups for a live entity return the identical instance;
//! dropped entities are reloaded from storage on the next lookup. Nothing
//! here keeps an entity alive on its own.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;
use url::Url;

use sable_engine::ScriptEngine;

use crate::error::{SwError, SwResult};
use crate::fetch::ScriptFetcher;
use crate::registration::Registration;
use crate::storage::{RegistrationId, RegistrationRecord, SwStorage, WorkerId};
use crate::worker::Worker;

/// Collaborators shared across the runtime.
pub(crate) struct SwServices {
    pub(crate) engine: Arc<dyn ScriptEngine>,
    pub(crate) storage: Arc<dyn SwStorage>,
    pub(crate) fetcher: Arc<dyn ScriptFetcher>,
    pub(crate) registry: WorkerRegistry,
}

/// Weak, id-keyed registry of live workers.
///
/// Doubles as the worker factory's identity cache and as the lookup path
/// script bindings use instead of strong back-references, so a context
/// closure can never keep its worker alive.
#[derive(Clone, Default)]
pub(crate) struct WorkerRegistry {
    inner: Arc<DashMap<WorkerId, Weak<Worker>>>,
}

impl WorkerRegistry {
    pub(crate) fn get(&self, id: WorkerId) -> Option<Arc<Worker>> {
        self.inner.get(&id).and_then(|weak| weak.upgrade())
    }

    fn insert(&self, worker: &Arc<Worker>) {
        self.inner.insert(worker.id(), Arc::downgrade(worker));
    }

    fn remove(&self, id: WorkerId) {
        self.inner.remove(&id);
    }
}

/// Creates and loads workers.
pub(crate) struct WorkerFactory {
    services: Arc<SwServices>,
}

impl WorkerFactory {
    pub(crate) fn new(services: Arc<SwServices>) -> Self {
        Self { services }
    }

    /// Create a worker stub persisted in the `installing` state.
    pub(crate) fn create_installing(
        &self,
        registration_id: RegistrationId,
        script_url: &Url,
    ) -> SwResult<Arc<Worker>> {
        let id = self.services.storage.create_worker(registration_id, script_url)?;
        let worker = Arc::new(Worker::new_installing(
            id,
            registration_id,
            script_url.clone(),
            self.services.clone(),
        ));
        self.services.registry.insert(&worker);
        debug!(worker = %id, url = %script_url, "created installing worker");
        Ok(worker)
    }

    /// Load a worker by id, deduplicating against live instances.
    pub(crate) fn get(&self, id: WorkerId) -> SwResult<Option<Arc<Worker>>> {
        match self.services.registry.inner.entry(id) {
            Entry::Occupied(mut entry) => {
                if let Some(live) = entry.get().upgrade() {
                    return Ok(Some(live));
                }
                match self.load(id)? {
                    Some(worker) => {
                        entry.insert(Arc::downgrade(&worker));
                        Ok(Some(worker))
                    }
                    None => {
                        entry.remove();
                        Ok(None)
                    }
                }
            }
            Entry::Vacant(entry) => match self.load(id)? {
                Some(worker) => {
                    entry.insert(Arc::downgrade(&worker));
                    Ok(Some(worker))
                }
                None => Ok(None),
            },
        }
    }

    fn load(&self, id: WorkerId) -> SwResult<Option<Arc<Worker>>> {
        let Some(record) = self.services.storage.worker(id)? else {
            return Ok(None);
        };
        let script_url = Url::parse(&record.script_url)
            .map_err(|e| SwError::storage(format!("corrupt script URL for worker {id}: {e}")))?;
        Ok(Some(Arc::new(Worker::from_record(
            &record,
            script_url,
            self.services.clone(),
        ))))
    }

    /// Remove a never-installed worker from storage and the registry.
    pub(crate) fn discard(&self, worker: &Arc<Worker>) -> SwResult<()> {
        self.services.registry.remove(worker.id());
        self.services.storage.delete_worker(worker.id())
    }
}

/// Creates and loads registrations, one per scope.
pub(crate) struct RegistrationFactory {
    services: Arc<SwServices>,
    workers: Arc<WorkerFactory>,
    by_id: DashMap<RegistrationId, Weak<Registration>>,
    by_scope: DashMap<String, Weak<Registration>>,
}

impl RegistrationFactory {
    pub(crate) fn new(services: Arc<SwServices>, workers: Arc<WorkerFactory>) -> Arc<Self> {
        Arc::new(Self {
            services,
            workers,
            by_id: DashMap::new(),
            by_scope: DashMap::new(),
        })
    }

    /// The single creation path: the live registration for `scope`, loaded
    /// or created as needed. An unregistered instance lingering in the
    /// cache is replaced, never returned.
    pub(crate) fn get_or_create(self: &Arc<Self>, scope: &Url) -> SwResult<Arc<Registration>> {
        match self.by_scope.entry(scope.as_str().to_string()) {
            Entry::Occupied(mut entry) => {
                if let Some(live) = entry.get().upgrade() {
                    if !live.is_unregistered() {
                        return Ok(live);
                    }
                }
                let registration = self.load_or_create(scope)?;
                entry.insert(Arc::downgrade(&registration));
                Ok(registration)
            }
            Entry::Vacant(entry) => {
                let registration = self.load_or_create(scope)?;
                entry.insert(Arc::downgrade(&registration));
                Ok(registration)
            }
        }
    }

    fn load_or_create(self: &Arc<Self>, scope: &Url) -> SwResult<Arc<Registration>> {
        if let Some(record) = self.services.storage.registration_by_scope(scope)? {
            return self.materialize(record);
        }
        let id = self.services.storage.create_registration(scope)?;
        let registration = Registration::new(
            id,
            scope.clone(),
            self.services.clone(),
            self.workers.clone(),
            Arc::downgrade(self),
        );
        self.by_id.insert(id, Arc::downgrade(&registration));
        debug!(registration = %id, scope = %scope, "created registration");
        Ok(registration)
    }

    /// Rebuild a live registration from its record, resolving slot workers
    /// through the worker factory so identities are preserved.
    fn materialize(self: &Arc<Self>, record: RegistrationRecord) -> SwResult<Arc<Registration>> {
        if let Some(live) = self.by_id.get(&record.id).and_then(|weak| weak.upgrade()) {
            if !live.is_unregistered() {
                return Ok(live);
            }
        }
        let scope = Url::parse(&record.scope).map_err(|e| {
            SwError::storage(format!("corrupt scope for registration {}: {e}", record.id))
        })?;
        let registration = Registration::new(
            record.id,
            scope,
            self.services.clone(),
            self.workers.clone(),
            Arc::downgrade(self),
        );
        let resolve = |slot: Option<WorkerId>| -> SwResult<Option<Arc<Worker>>> {
            match slot {
                Some(id) => self.workers.get(id),
                None => Ok(None),
            }
        };
        registration.restore_slots(
            resolve(record.slots.installing)?,
            resolve(record.slots.waiting)?,
            resolve(record.slots.active)?,
            resolve(record.slots.redundant)?,
        );
        self.by_id.insert(record.id, Arc::downgrade(&registration));
        Ok(registration)
    }

    /// Lookup by exact scope without creating. Unregistered registrations
    /// report as absent.
    pub(crate) fn get_by_scope(self: &Arc<Self>, scope: &Url) -> SwResult<Option<Arc<Registration>>> {
        if let Some(live) = self
            .by_scope
            .get(scope.as_str())
            .and_then(|weak| weak.upgrade())
        {
            if live.is_unregistered() {
                return Ok(None);
            }
            return Ok(Some(live));
        }
        match self.services.storage.registration_by_scope(scope)? {
            Some(record) => {
                let registration = self.materialize(record)?;
                self.by_scope
                    .insert(scope.as_str().to_string(), Arc::downgrade(&registration));
                Ok(Some(registration))
            }
            None => Ok(None),
        }
    }

    /// Every persisted registration.
    pub(crate) fn all(self: &Arc<Self>) -> SwResult<Vec<Arc<Registration>>> {
        let mut registrations = Vec::new();
        for record in self.services.storage.registrations()? {
            registrations.push(self.materialize(record)?);
        }
        Ok(registrations)
    }

    /// Drop an unregistered registration from the identity caches.
    pub(crate) fn forget(&self, registration: &Registration) {
        self.by_id.remove(&registration.id());
        self.by_scope.remove(registration.scope().as_str());
    }
}
