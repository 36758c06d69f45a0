//! Per-worker execution environments.
//!
//! Each worker runs on a dedicated lane thread that owns the embedded
//! script context. Contexts are not thread-safe, so every evaluation and
//! dispatch marshals onto the lane through a job queue and replies over a
//! oneshot channel. Between jobs the lane fires due timers, pumps the
//! engine's job queue, and latches uncaught script errors for the next
//! evaluation to report.

use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use parking_lot::Mutex;
use sable_engine::{ScriptContext, ScriptEngine, ScriptException};
use scopeguard::defer;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info_span, warn};
use url::Url;

use crate::error::{SwError, SwResult};
use crate::event::{ExtendableEvent, FetchEvent};
use crate::factory::WorkerRegistry;
use crate::fetch::ScriptFetcher;
use crate::scope::WorkerGlobalScope;
use crate::storage::WorkerId;

/// How long the lane waits for a job before pumping timers and the engine.
const IDLE_TICK: Duration = Duration::from_millis(10);

/// Close hook invoked when a resource is force-closed at teardown.
pub type CloseHook = Box<dyn FnOnce() + Send + 'static>;

struct LedgerEntry {
    label: String,
    close: Option<CloseHook>,
}

/// Open-resource ledger for one worker.
///
/// Bindings register resources they open on the worker's behalf.
/// `ensure_finished` waits for the ledger to drain; teardown force-closes
/// whatever is still open.
pub struct ResourceLedger {
    entries: Mutex<HashMap<u64, LedgerEntry>>,
    next_id: AtomicU64,
    drained: tokio::sync::Notify,
}

impl ResourceLedger {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            drained: tokio::sync::Notify::new(),
        }
    }

    /// Register an open resource. The hook runs if the resource is still
    /// open when the environment is torn down.
    pub fn open(&self, label: &str, close: CloseHook) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().insert(
            id,
            LedgerEntry {
                label: label.to_string(),
                close: Some(close),
            },
        );
        id
    }

    /// Mark a resource settled. Its close hook does not run.
    pub fn close(&self, id: u64) {
        if self.entries.lock().remove(&id).is_some() {
            self.drained.notify_waiters();
        }
    }

    pub fn open_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Wait until no resources remain open.
    pub async fn quiescent(&self) {
        loop {
            let mut drained = std::pin::pin!(self.drained.notified());
            drained.as_mut().enable();
            if self.entries.lock().is_empty() {
                return;
            }
            drained.await;
        }
    }

    /// Run every remaining close hook. Returns how many were forced.
    pub fn force_close_all(&self) -> usize {
        let entries: Vec<LedgerEntry> = {
            let mut locked = self.entries.lock();
            locked.drain().map(|(_, entry)| entry).collect()
        };
        let forced = entries.len();
        for mut entry in entries {
            if let Some(close) = entry.close.take() {
                debug!(resource = %entry.label, "force closing resource");
                close();
            }
        }
        if forced > 0 {
            self.drained.notify_waiters();
        }
        forced
    }
}

/// Event to run on the lane.
pub(crate) enum EventPayload {
    Extendable(Arc<ExtendableEvent>),
    Fetch(Arc<FetchEvent>),
}

enum Job {
    Evaluate {
        source: String,
        location: Option<String>,
        response: oneshot::Sender<SwResult<Value>>,
    },
    Dispatch {
        payload: EventPayload,
        response: oneshot::Sender<SwResult<()>>,
    },
    Shutdown,
}

pub(crate) struct EnvironmentConfig {
    pub(crate) worker_id: WorkerId,
    pub(crate) script_url: Url,
    pub(crate) engine: Arc<dyn ScriptEngine>,
    pub(crate) fetcher: Arc<dyn ScriptFetcher>,
    pub(crate) registry: WorkerRegistry,
    pub(crate) runtime: tokio::runtime::Handle,
}

pub(crate) struct LaneShared {
    exception: Mutex<Option<ScriptException>>,
    ledger: Arc<ResourceLedger>,
    shutdown: AtomicBool,
}

impl LaneShared {
    fn new() -> Self {
        Self {
            exception: Mutex::new(None),
            ledger: Arc::new(ResourceLedger::new()),
            shutdown: AtomicBool::new(false),
        }
    }

    pub(crate) fn latch(&self, exception: ScriptException) {
        warn!(error = %exception, "uncaught script exception latched");
        *self.exception.lock() = Some(exception);
    }

    fn take_exception(&self) -> Option<ScriptException> {
        self.exception.lock().take()
    }
}

/// Handle to one worker's lane.
///
/// Cheap to clone through its `Arc`; dropped handles do not stop the lane.
/// Teardown is explicit and idempotent.
pub struct ExecutionEnvironment {
    worker_id: WorkerId,
    job_tx: Sender<Job>,
    lane: Mutex<Option<thread::JoinHandle<()>>>,
    shared: Arc<LaneShared>,
}

impl ExecutionEnvironment {
    /// Spawn the lane thread and wait for its context and global bindings
    /// to come up. A context-creation failure here fails the whole
    /// environment.
    pub(crate) async fn create(config: EnvironmentConfig) -> SwResult<Arc<Self>> {
        let worker_id = config.worker_id;
        let (job_tx, job_rx) = unbounded();
        let (ready_tx, ready_rx) = oneshot::channel();
        let shared = Arc::new(LaneShared::new());
        let lane_shared = shared.clone();
        let lane = thread::Builder::new()
            .name(format!("sw-lane-{worker_id}"))
            .spawn(move || run_lane(config, job_rx, lane_shared, ready_tx))
            .map_err(|e| SwError::internal(format!("failed to spawn worker lane: {e}")))?;
        ready_rx
            .await
            .map_err(|_| SwError::internal("worker lane exited during startup"))??;
        debug!(worker = %worker_id, "execution environment ready");
        Ok(Arc::new(Self {
            worker_id,
            job_tx,
            lane: Mutex::new(Some(lane)),
            shared,
        }))
    }

    /// Evaluate script source on the worker's lane, returning a JSON
    /// snapshot of the completion value. A previously latched uncaught
    /// error fails the evaluation before any code runs.
    pub async fn evaluate(&self, source: &str, location: Option<&str>) -> SwResult<Value> {
        let (tx, rx) = oneshot::channel();
        self.job_tx
            .send(Job::Evaluate {
                source: source.to_string(),
                location: location.map(str::to_string),
                response: tx,
            })
            .map_err(|_| SwError::invalid_state("worker lane is stopped"))?;
        rx.await
            .map_err(|_| SwError::internal("worker lane dropped its response"))?
    }

    /// Dispatch an event on the worker's lane. Returns after the
    /// synchronous handler phase; extensions settle through the event.
    pub(crate) async fn dispatch(&self, payload: EventPayload) -> SwResult<()> {
        let (tx, rx) = oneshot::channel();
        self.job_tx
            .send(Job::Dispatch {
                payload,
                response: tx,
            })
            .map_err(|_| SwError::invalid_state("worker lane is stopped"))?;
        rx.await
            .map_err(|_| SwError::internal("worker lane dropped its response"))?
    }

    /// The open-resource ledger for embedder bindings.
    pub fn ledger(&self) -> Arc<ResourceLedger> {
        self.shared.ledger.clone()
    }

    /// Wait for worker-opened resources to settle.
    pub async fn ensure_finished(&self) -> SwResult<()> {
        self.shared.ledger.quiescent().await;
        Ok(())
    }

    /// The most recently latched uncaught exception, if any, without
    /// clearing it.
    pub fn latched_exception(&self) -> Option<ScriptException> {
        self.shared.exception.lock().clone()
    }

    /// Stop the lane: pending timers are cancelled, unclosed resources are
    /// force-closed, and the context is released. Idempotent.
    pub(crate) async fn teardown(&self) -> SwResult<()> {
        if self.shared.shutdown.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.job_tx.send(Job::Shutdown);
        let lane = self.lane.lock().take();
        if let Some(handle) = lane {
            tokio::task::spawn_blocking(move || {
                let _ = handle.join();
            })
            .await
            .map_err(|_| SwError::internal("failed to join worker lane"))?;
        }
        debug!(worker = %self.worker_id, "execution environment torn down");
        Ok(())
    }
}

impl Drop for ExecutionEnvironment {
    fn drop(&mut self) {
        // Without an explicit teardown, ask the lane to stop; nobody joins.
        if !self.shared.shutdown.load(Ordering::SeqCst) {
            let _ = self.job_tx.send(Job::Shutdown);
        }
    }
}

impl std::fmt::Debug for ExecutionEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEnvironment")
            .field("worker", &self.worker_id)
            .field("open_resources", &self.shared.ledger.open_count())
            .finish()
    }
}

fn run_lane(
    config: EnvironmentConfig,
    job_rx: Receiver<Job>,
    shared: Arc<LaneShared>,
    ready_tx: oneshot::Sender<SwResult<()>>,
) {
    let span = info_span!("sw_lane", worker = %config.worker_id);
    let _guard = span.enter();

    let ledger = shared.ledger.clone();
    // Close hooks run on every exit path, after the context is released.
    defer! {
        ledger.force_close_all();
    }

    let context = match config.engine.create_context() {
        Ok(context) => context,
        Err(error) => {
            let _ = ready_tx.send(Err(SwError::from(error)));
            return;
        }
    };

    let scope = Rc::new(WorkerGlobalScope::new(&config, shared.ledger.clone()));
    if let Err(error) = scope.install(context.as_ref()) {
        let _ = ready_tx.send(Err(SwError::from(error)));
        return;
    }
    let _ = ready_tx.send(Ok(()));
    debug!("worker lane started");

    loop {
        scope.fire_due_timers(context.as_ref(), &shared);
        let tick = scope
            .next_timer_delay()
            .map_or(IDLE_TICK, |delay| delay.min(IDLE_TICK));
        match job_rx.recv_timeout(tick) {
            Ok(Job::Evaluate {
                source,
                location,
                response,
            }) => {
                let result = run_evaluate(context.as_ref(), &shared, &source, location.as_deref());
                let _ = response.send(result);
            }
            Ok(Job::Dispatch { payload, response }) => {
                let result = scope.dispatch_event(context.as_ref(), &payload);
                let _ = response.send(result);
            }
            Ok(Job::Shutdown) => break,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        pump_engine(context.as_ref(), &shared);
    }

    let stopped = scope.stop_timers();
    if stopped > 0 {
        debug!(stopped, "cancelled pending timers at teardown");
    }
    // Late arrivals are answered, not dropped.
    for job in job_rx.try_iter() {
        reject_job(job);
    }
    debug!("worker lane stopped");
}

fn run_evaluate(
    context: &dyn ScriptContext,
    shared: &LaneShared,
    source: &str,
    location: Option<&str>,
) -> SwResult<Value> {
    pump_engine(context, shared);
    if let Some(exception) = shared.take_exception() {
        return Err(SwError::Script(exception));
    }
    let value = context.evaluate(source, location).map_err(SwError::from)?;
    Ok(context.to_json(&value).unwrap_or(Value::Null))
}

fn pump_engine(context: &dyn ScriptContext, shared: &LaneShared) {
    if let Err(error) = context.run_jobs() {
        shared.latch(error.into_exception());
    }
    if let Some(exception) = context.take_uncaught_exception() {
        shared.latch(exception);
    }
}

fn reject_job(job: Job) {
    match job {
        Job::Evaluate { response, .. } => {
            let _ = response.send(Err(SwError::invalid_state("worker lane is stopped")));
        }
        Job::Dispatch { response, .. } => {
            let _ = response.send(Err(SwError::invalid_state("worker lane is stopped")));
        }
        Job::Shutdown => {}
    }
}
