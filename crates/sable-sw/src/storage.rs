//! Persistence records and the storage collaborator seam.
//!
//! Registrations and workers survive process restarts through
//! [`SwStorage`]; live object graphs are rebuilt from these records by the
//! factories. Script content is stored next to the worker record together
//! with the response headers it arrived with, so conditional refetches can
//! replay the original validators.

use std::borrow::Cow;
use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::{SwError, SwResult};
use crate::worker::InstallState;

/// Identifier of a persisted worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(u64);

impl WorkerId {
    pub(crate) const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a persisted registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegistrationId(u64);

impl RegistrationId {
    pub(crate) const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl std::fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Worker-slot references persisted with a registration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotRecord {
    pub installing: Option<WorkerId>,
    pub waiting: Option<WorkerId>,
    pub active: Option<WorkerId>,
    pub redundant: Option<WorkerId>,
}

/// Persisted worker state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: WorkerId,
    pub registration_id: RegistrationId,
    pub script_url: String,
    pub state: InstallState,
    pub headers: Vec<(String, String)>,
    pub content_hash: Option<String>,
}

/// Persisted registration state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationRecord {
    pub id: RegistrationId,
    pub scope: String,
    pub slots: SlotRecord,
}

/// Stored script content plus the response headers it arrived with.
#[derive(Debug, Clone)]
pub struct ScriptSource {
    pub body: Vec<u8>,
    pub headers: Vec<(String, String)>,
    pub content_hash: String,
}

impl ScriptSource {
    pub fn body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header(&self.headers, name)
    }
}

/// Case-insensitive lookup over stored header pairs.
pub(crate) fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(header_name, _)| header_name.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Hex-encoded SHA-256 of script content. This is the identity the update
/// pipeline compares to short-circuit byte-identical fetches.
pub fn content_hash(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    hex::encode(hasher.finalize())
}

/// The persistence collaborator.
///
/// Implementations serialize writes to a given record; the state machine
/// relies on that single-writer discipline rather than layering its own.
pub trait SwStorage: Send + Sync {
    /// Create a worker record in the `installing` state, without content.
    fn create_worker(&self, registration_id: RegistrationId, script_url: &Url)
    -> SwResult<WorkerId>;

    fn worker(&self, id: WorkerId) -> SwResult<Option<WorkerRecord>>;

    fn set_worker_state(&self, id: WorkerId, state: InstallState) -> SwResult<()>;

    /// Store script content for a worker, returning its content hash.
    fn set_script_content(
        &self,
        id: WorkerId,
        body: Vec<u8>,
        headers: Vec<(String, String)>,
    ) -> SwResult<String>;

    fn script(&self, id: WorkerId) -> SwResult<Option<ScriptSource>>;

    fn delete_worker(&self, id: WorkerId) -> SwResult<()>;

    fn create_registration(&self, scope: &Url) -> SwResult<RegistrationId>;

    fn registration(&self, id: RegistrationId) -> SwResult<Option<RegistrationRecord>>;

    fn registration_by_scope(&self, scope: &Url) -> SwResult<Option<RegistrationRecord>>;

    fn registrations(&self) -> SwResult<Vec<RegistrationRecord>>;

    fn set_registration_slots(&self, id: RegistrationId, slots: &SlotRecord) -> SwResult<()>;

    fn delete_registration(&self, id: RegistrationId) -> SwResult<()>;
}

#[derive(Default)]
struct MemoryInner {
    next_id: u64,
    workers: HashMap<WorkerId, WorkerRecord>,
    scripts: HashMap<WorkerId, ScriptSource>,
    registrations: HashMap<RegistrationId, RegistrationRecord>,
}

/// In-memory [`SwStorage`]. The single interior lock gives every operation
/// the transaction boundary the state machine expects from its storage.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SwStorage for MemoryStore {
    fn create_worker(
        &self,
        registration_id: RegistrationId,
        script_url: &Url,
    ) -> SwResult<WorkerId> {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = WorkerId::new(inner.next_id);
        inner.workers.insert(
            id,
            WorkerRecord {
                id,
                registration_id,
                script_url: script_url.as_str().to_string(),
                state: InstallState::Installing,
                headers: Vec::new(),
                content_hash: None,
            },
        );
        Ok(id)
    }

    fn worker(&self, id: WorkerId) -> SwResult<Option<WorkerRecord>> {
        Ok(self.inner.lock().workers.get(&id).cloned())
    }

    fn set_worker_state(&self, id: WorkerId, state: InstallState) -> SwResult<()> {
        let mut inner = self.inner.lock();
        let record = inner
            .workers
            .get_mut(&id)
            .ok_or_else(|| SwError::storage(format!("unknown worker {id}")))?;
        record.state = state;
        Ok(())
    }

    fn set_script_content(
        &self,
        id: WorkerId,
        body: Vec<u8>,
        headers: Vec<(String, String)>,
    ) -> SwResult<String> {
        let hash = content_hash(&body);
        let mut inner = self.inner.lock();
        let record = inner
            .workers
            .get_mut(&id)
            .ok_or_else(|| SwError::storage(format!("unknown worker {id}")))?;
        record.headers = headers.clone();
        record.content_hash = Some(hash.clone());
        inner.scripts.insert(
            id,
            ScriptSource {
                body,
                headers,
                content_hash: hash.clone(),
            },
        );
        Ok(hash)
    }

    fn script(&self, id: WorkerId) -> SwResult<Option<ScriptSource>> {
        Ok(self.inner.lock().scripts.get(&id).cloned())
    }

    fn delete_worker(&self, id: WorkerId) -> SwResult<()> {
        let mut inner = self.inner.lock();
        inner.workers.remove(&id);
        inner.scripts.remove(&id);
        Ok(())
    }

    fn create_registration(&self, scope: &Url) -> SwResult<RegistrationId> {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = RegistrationId::new(inner.next_id);
        inner.registrations.insert(
            id,
            RegistrationRecord {
                id,
                scope: scope.as_str().to_string(),
                slots: SlotRecord::default(),
            },
        );
        Ok(id)
    }

    fn registration(&self, id: RegistrationId) -> SwResult<Option<RegistrationRecord>> {
        Ok(self.inner.lock().registrations.get(&id).cloned())
    }

    fn registration_by_scope(&self, scope: &Url) -> SwResult<Option<RegistrationRecord>> {
        let inner = self.inner.lock();
        Ok(inner
            .registrations
            .values()
            .find(|record| record.scope == scope.as_str())
            .cloned())
    }

    fn registrations(&self) -> SwResult<Vec<RegistrationRecord>> {
        Ok(self.inner.lock().registrations.values().cloned().collect())
    }

    fn set_registration_slots(&self, id: RegistrationId, slots: &SlotRecord) -> SwResult<()> {
        let mut inner = self.inner.lock();
        let record = inner
            .registrations
            .get_mut(&id)
            .ok_or_else(|| SwError::storage(format!("unknown registration {id}")))?;
        record.slots = slots.clone();
        Ok(())
    }

    fn delete_registration(&self, id: RegistrationId) -> SwResult<()> {
        self.inner.lock().registrations.remove(&id);
        Ok(())
    }
}
