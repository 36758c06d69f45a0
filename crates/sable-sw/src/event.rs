//! Extendable events and their `waitUntil` aggregation.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::future::try_join_all;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{SwError, SwResult};
use crate::fetch::FetchRequest;

/// A future extending an event's effective duration, supplied through
/// `waitUntil`.
pub type WaitFuture = Pin<Box<dyn Future<Output = SwResult<()>> + Send + 'static>>;

/// Lifetime of an extendable event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventState {
    /// Accepting `waitUntil` extensions.
    Valid,
    /// Dispatch was abandoned; extensions are rejected.
    Invalid,
    /// The event settled; extensions are rejected.
    Resolved,
}

impl std::fmt::Display for EventState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Valid => "valid",
            Self::Invalid => "invalid",
            Self::Resolved => "resolved",
        };
        f.write_str(name)
    }
}

struct EventInner {
    state: EventState,
    pending: Vec<WaitFuture>,
}

/// An event whose handlers may extend its duration with awaited values.
///
/// One instance is created per dispatch. `waitUntil` stays legal from
/// creation until [`resolve`](Self::resolve) flips the state, including
/// after the synchronous handler phase has returned.
pub struct ExtendableEvent {
    event_type: String,
    data: Value,
    inner: Mutex<EventInner>,
}

impl ExtendableEvent {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self::with_data(event_type, Value::Null)
    }

    pub fn with_data(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            inner: Mutex::new(EventInner {
                state: EventState::Valid,
                pending: Vec::new(),
            }),
        }
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn state(&self) -> EventState {
        self.inner.lock().state
    }

    /// Append an extension. Fails with an invalid-state error outside the
    /// `valid` window; callers report that into the script context instead
    /// of failing the dispatch.
    pub fn wait_until(&self, extension: WaitFuture) -> SwResult<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            EventState::Valid => {
                inner.pending.push(extension);
                Ok(())
            }
            state => Err(SwError::invalid_state(format!(
                "waitUntil is not allowed on a {state} event"
            ))),
        }
    }

    /// Record a handler failure so the event settles as failed even though
    /// dispatch itself continues with the remaining listeners.
    pub(crate) fn record_failure(&self, error: SwError) {
        let mut inner = self.inner.lock();
        if inner.state == EventState::Valid {
            inner.pending.push(Box::pin(std::future::ready(Err(error))));
        }
    }

    /// Abandon the event without resolving it. Late extensions are rejected
    /// and already-collected ones are dropped unpolled.
    pub(crate) fn invalidate(&self) {
        let mut inner = self.inner.lock();
        inner.state = EventState::Invalid;
        inner.pending.clear();
    }

    /// Settle the event: wait for every pending extension, failing on the
    /// first rejection. Resolves immediately when nothing is pending.
    /// Callable once; the state flips before any extension is polled, so a
    /// `waitUntil` racing with resolution is rejected rather than lost.
    pub async fn resolve(&self) -> SwResult<()> {
        let pending = {
            let mut inner = self.inner.lock();
            match inner.state {
                EventState::Valid => {
                    inner.state = EventState::Resolved;
                    std::mem::take(&mut inner.pending)
                }
                state => {
                    return Err(SwError::invalid_state(format!(
                        "resolve is not allowed on a {state} event"
                    )));
                }
            }
        };
        debug!(event = %self.event_type, extensions = pending.len(), "resolving event");
        try_join_all(pending).await.map(|_| ())
    }
}

impl std::fmt::Debug for ExtendableEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ExtendableEvent")
            .field("type", &self.event_type)
            .field("state", &inner.state)
            .field("pending", &inner.pending.len())
            .finish()
    }
}

#[derive(Default)]
struct RespondSlot {
    claimed: bool,
    receiver: Option<oneshot::Receiver<SwResult<Value>>>,
}

/// A fetch event: extendable, plus a one-shot `respondWith` slot.
pub struct FetchEvent {
    event: Arc<ExtendableEvent>,
    request: FetchRequest,
    respond: Mutex<RespondSlot>,
}

impl FetchEvent {
    pub fn new(request: FetchRequest) -> Self {
        Self {
            event: Arc::new(ExtendableEvent::new("fetch")),
            request,
            respond: Mutex::new(RespondSlot::default()),
        }
    }

    pub fn request(&self) -> &FetchRequest {
        &self.request
    }

    pub(crate) fn extendable(&self) -> &Arc<ExtendableEvent> {
        &self.event
    }

    pub fn state(&self) -> EventState {
        self.event.state()
    }

    pub fn wait_until(&self, extension: WaitFuture) -> SwResult<()> {
        self.event.wait_until(extension)
    }

    pub async fn resolve(&self) -> SwResult<()> {
        self.event.resolve().await
    }

    pub(crate) fn invalidate(&self) {
        self.event.invalidate();
    }

    /// Claim the `respondWith` slot. Legal once, while the event is valid.
    /// Returns the sender the binding settles with the worker's response.
    pub(crate) fn begin_respond(&self) -> SwResult<oneshot::Sender<SwResult<Value>>> {
        let mut slot = self.respond.lock();
        if slot.claimed {
            return Err(SwError::invalid_state("respondWith was already called"));
        }
        if self.event.state() != EventState::Valid {
            return Err(SwError::invalid_state(format!(
                "respondWith is not allowed on a {} event",
                self.event.state()
            )));
        }
        let (tx, rx) = oneshot::channel();
        slot.claimed = true;
        slot.receiver = Some(rx);
        Ok(tx)
    }

    /// The worker-provided response, or `None` when no handler claimed the
    /// event and the caller falls through to the network.
    pub fn take_response(&self) -> Option<oneshot::Receiver<SwResult<Value>>> {
        self.respond.lock().receiver.take()
    }
}
