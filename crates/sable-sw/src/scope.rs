//! The worker global scope: script-facing bindings and event dispatch.
//!
//! One scope exists per lane and never leaves it. Script listeners are held
//! as engine value handles, so everything here runs on the thread that owns
//! the context; the only crossings are the weak worker registry (for
//! `skipWaiting`) and the async runtime handle (for `importScripts`
//! downloads).

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::bounded;
use sable_engine::{
    EngineError, EngineResult, NativeFunction, NativeResult, ScriptContext, ScriptException,
    ScriptValue, Settlement,
};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::environment::{EnvironmentConfig, EventPayload, LaneShared, ResourceLedger};
use crate::error::{SwError, SwResult};
use crate::event::{ExtendableEvent, FetchEvent, WaitFuture};
use crate::event_target::EventTarget;
use crate::factory::WorkerRegistry;
use crate::fetch::{FetchRequest, ScriptFetcher};
use crate::storage::WorkerId;
use crate::timers::TimerQueue;

pub(crate) struct WorkerGlobalScope {
    worker_id: WorkerId,
    script_url: Url,
    listeners: EventTarget<ScriptValue>,
    timers: RefCell<TimerQueue>,
    registry: WorkerRegistry,
    fetcher: Arc<dyn ScriptFetcher>,
    ledger: Arc<ResourceLedger>,
    runtime: tokio::runtime::Handle,
}

impl WorkerGlobalScope {
    pub(crate) fn new(config: &EnvironmentConfig, ledger: Arc<ResourceLedger>) -> Self {
        Self {
            worker_id: config.worker_id,
            script_url: config.script_url.clone(),
            listeners: EventTarget::new(),
            timers: RefCell::new(TimerQueue::new()),
            registry: config.registry.clone(),
            fetcher: config.fetcher.clone(),
            ledger,
            runtime: config.runtime.clone(),
        }
    }

    /// Install the global bindings scripts see: listener registration,
    /// `skipWaiting`, `importScripts`, timers, and `location`.
    pub(crate) fn install(self: &Rc<Self>, cx: &dyn ScriptContext) -> EngineResult<()> {
        self.bind(cx, "addEventListener", {
            let scope = self.clone();
            Rc::new(move |cx, args| scope.add_event_listener(cx, args))
        })?;
        self.bind(cx, "removeEventListener", {
            let scope = self.clone();
            Rc::new(move |cx, args| scope.remove_event_listener(cx, args))
        })?;
        self.bind(cx, "skipWaiting", {
            let registry = self.registry.clone();
            let worker_id = self.worker_id;
            Rc::new(move |cx, _args| {
                match registry.get(worker_id) {
                    Some(worker) => worker.request_skip_waiting(),
                    // The registry holds the worker weakly; a released
                    // worker makes this a no-op.
                    None => warn!(worker = %worker_id, "skipWaiting on a released worker"),
                }
                Ok(cx.undefined())
            })
        })?;
        self.bind(cx, "importScripts", {
            let scope = self.clone();
            Rc::new(move |cx, args| scope.import_scripts(cx, args))
        })?;
        self.bind(cx, "setTimeout", {
            let scope = self.clone();
            Rc::new(move |cx, args| scope.set_timeout(cx, args))
        })?;
        self.bind(cx, "clearTimeout", {
            let scope = self.clone();
            Rc::new(move |cx, args| scope.clear_timeout(cx, args))
        })?;

        let location = cx.from_json(&serde_json::json!({
            "href": self.script_url.as_str(),
            "origin": self.script_url.origin().ascii_serialization(),
            "pathname": self.script_url.path(),
        }))?;
        cx.set_global("location", location)
    }

    fn bind(&self, cx: &dyn ScriptContext, name: &str, function: NativeFunction) -> EngineResult<()> {
        let value = cx.make_function(name, function)?;
        cx.set_global(name, value)
    }

    fn add_event_listener(&self, cx: &dyn ScriptContext, args: &[ScriptValue]) -> NativeResult {
        let (event_type, listener) = listener_args(cx, args, "addEventListener")?;
        self.listeners.add_listener(&event_type, listener);
        debug!(worker = %self.worker_id, event = %event_type, "script listener added");
        Ok(cx.undefined())
    }

    fn remove_event_listener(&self, cx: &dyn ScriptContext, args: &[ScriptValue]) -> NativeResult {
        let (event_type, listener) = listener_args(cx, args, "removeEventListener")?;
        self.listeners
            .remove_where(&event_type, |registered| registered.ptr_eq(&listener));
        Ok(cx.undefined())
    }

    /// Synchronous from the script's point of view: the lane blocks on a
    /// rendezvous channel while the downloads run on the async runtime,
    /// then the bodies are evaluated here, in request order.
    fn import_scripts(&self, cx: &dyn ScriptContext, args: &[ScriptValue]) -> NativeResult {
        let mut requests = Vec::with_capacity(args.len());
        let mut urls = Vec::with_capacity(args.len());
        for arg in args {
            let raw = cx
                .to_json(arg)
                .ok()
                .and_then(|value| value.as_str().map(str::to_string))
                .ok_or_else(|| {
                    ScriptException::new("TypeError", "importScripts arguments must be strings")
                })?;
            let url = self.script_url.join(&raw).map_err(|e| {
                ScriptException::new("TypeError", format!("invalid importScripts URL {raw}: {e}"))
            })?;
            requests.push(FetchRequest::get(url.clone()));
            urls.push(url);
        }
        if requests.is_empty() {
            return Ok(cx.undefined());
        }

        let expected = requests.len();
        let entry = self.ledger.open("importScripts", Box::new(|| {}));
        let ledger = self.ledger.clone();
        // The entry settles on every path out of this function.
        let _entry_guard = scopeguard::guard((), move |_| ledger.close(entry));

        let (tx, rx) = bounded(1);
        let batch = self.fetcher.fetch_all(requests);
        self.runtime.spawn(async move {
            let _ = tx.send(batch.await);
        });
        let responses = rx
            .recv()
            .map_err(|_| ScriptException::new("NetworkError", "importScripts fetch task dropped"))?
            .map_err(|e| ScriptException::new("NetworkError", e.to_string()))?;
        if responses.len() != expected {
            return Err(ScriptException::new(
                "NetworkError",
                format!(
                    "importScripts delegate returned {} responses for {expected} requests",
                    responses.len()
                ),
            ));
        }
        for (url, response) in urls.iter().zip(responses) {
            if !response.ok() {
                return Err(ScriptException::new(
                    "NetworkError",
                    format!("importScripts {url} failed with status {}", response.status),
                ));
            }
            let body = response.body_text().into_owned();
            cx.evaluate(&body, Some(url.as_str()))
                .map_err(EngineError::into_exception)?;
        }
        debug!(worker = %self.worker_id, scripts = expected, "importScripts completed");
        Ok(cx.undefined())
    }

    fn set_timeout(&self, cx: &dyn ScriptContext, args: &[ScriptValue]) -> NativeResult {
        let callback = args
            .first()
            .cloned()
            .ok_or_else(|| ScriptException::new("TypeError", "setTimeout requires a callback"))?;
        let delay_ms = args
            .get(1)
            .and_then(|value| cx.to_json(value).ok())
            .and_then(|value| value.as_f64())
            .unwrap_or(0.0)
            .max(0.0);
        let id = self
            .timers
            .borrow_mut()
            .schedule(callback, Duration::from_millis(delay_ms as u64));
        cx.from_json(&serde_json::json!(id))
            .map_err(EngineError::into_exception)
    }

    fn clear_timeout(&self, cx: &dyn ScriptContext, args: &[ScriptValue]) -> NativeResult {
        if let Some(id) = args
            .first()
            .and_then(|value| cx.to_json(value).ok())
            .and_then(|value| value.as_u64())
        {
            self.timers.borrow_mut().cancel(id);
        }
        Ok(cx.undefined())
    }

    /// Build the event object and run the listener snapshot. A listener
    /// throw is recorded into the event and logged; it does not stop later
    /// listeners and does not fail the dispatch itself.
    pub(crate) fn dispatch_event(
        &self,
        cx: &dyn ScriptContext,
        payload: &EventPayload,
    ) -> SwResult<()> {
        match payload {
            EventPayload::Extendable(event) => {
                let object = self.build_extendable_object(cx, event)?;
                self.invoke_listeners(cx, event, event.event_type(), object)
            }
            EventPayload::Fetch(event) => {
                let object = self.build_fetch_object(cx, event)?;
                self.invoke_listeners(cx, event.extendable(), "fetch", object)
            }
        }
    }

    fn invoke_listeners(
        &self,
        cx: &dyn ScriptContext,
        event: &ExtendableEvent,
        event_type: &str,
        object: ScriptValue,
    ) -> SwResult<()> {
        let listeners = self.listeners.snapshot(event_type);
        debug!(
            worker = %self.worker_id,
            event = event_type,
            listeners = listeners.len(),
            "dispatching event"
        );
        for listener in listeners {
            if let Err(error) = cx.call(&listener, std::slice::from_ref(&object)) {
                match error {
                    EngineError::Script(exception) => {
                        warn!(
                            worker = %self.worker_id,
                            event = event_type,
                            error = %exception,
                            "event listener raised"
                        );
                        event.record_failure(SwError::Script(exception));
                    }
                    other => return Err(SwError::from(other)),
                }
            }
        }
        Ok(())
    }

    fn build_extendable_object(
        &self,
        cx: &dyn ScriptContext,
        event: &Arc<ExtendableEvent>,
    ) -> SwResult<ScriptValue> {
        let properties = vec![
            (
                "type".to_string(),
                cx.from_json(&Value::String(event.event_type().to_string()))?,
            ),
            ("data".to_string(), cx.from_json(event.data())?),
            (
                "waitUntil".to_string(),
                cx.make_function("waitUntil", wait_until_function(event.clone()))?,
            ),
        ];
        cx.make_object(properties).map_err(SwError::from)
    }

    fn build_fetch_object(
        &self,
        cx: &dyn ScriptContext,
        event: &Arc<FetchEvent>,
    ) -> SwResult<ScriptValue> {
        let properties = vec![
            (
                "type".to_string(),
                cx.from_json(&Value::String("fetch".to_string()))?,
            ),
            (
                "request".to_string(),
                cx.from_json(&event.request().to_event_json())?,
            ),
            (
                "waitUntil".to_string(),
                cx.make_function("waitUntil", wait_until_function(event.extendable().clone()))?,
            ),
            (
                "respondWith".to_string(),
                cx.make_function("respondWith", respond_with_function(event.clone()))?,
            ),
        ];
        cx.make_object(properties).map_err(SwError::from)
    }

    /// Fire every timer due now. Callback errors latch like any other
    /// uncaught exception; a callback scheduling an immediate timer runs on
    /// the next lane tick rather than in this one.
    pub(crate) fn fire_due_timers(&self, cx: &dyn ScriptContext, shared: &LaneShared) {
        let due = self.timers.borrow_mut().take_due(Instant::now());
        for (id, callback) in due {
            if let Err(error) = cx.call(&callback, &[]) {
                warn!(worker = %self.worker_id, timer = id, error = %error, "timer callback raised");
                shared.latch(error.into_exception());
            }
        }
    }

    pub(crate) fn next_timer_delay(&self) -> Option<Duration> {
        self.timers.borrow().next_delay(Instant::now())
    }

    pub(crate) fn stop_timers(&self) -> usize {
        self.timers.borrow_mut().stop_all()
    }
}

fn listener_args(
    cx: &dyn ScriptContext,
    args: &[ScriptValue],
    name: &str,
) -> Result<(String, ScriptValue), ScriptException> {
    let type_value = args
        .first()
        .ok_or_else(|| ScriptException::new("TypeError", format!("{name} requires an event type")))?;
    let event_type = cx
        .to_json(type_value)
        .ok()
        .and_then(|value| value.as_str().map(str::to_string))
        .ok_or_else(|| {
            ScriptException::new("TypeError", format!("{name}: event type must be a string"))
        })?;
    let listener = args
        .get(1)
        .cloned()
        .ok_or_else(|| ScriptException::new("TypeError", format!("{name} requires a listener")))?;
    Ok((event_type, listener))
}

fn wait_until_function(event: Arc<ExtendableEvent>) -> NativeFunction {
    Rc::new(move |cx, args| {
        let value = args.first().cloned().unwrap_or_else(|| cx.undefined());
        let extension = promise_extension(cx, &value)?;
        event
            .wait_until(extension)
            .map_err(|error| ScriptException::new("InvalidStateError", error.to_string()))?;
        Ok(cx.undefined())
    })
}

fn respond_with_function(event: Arc<FetchEvent>) -> NativeFunction {
    Rc::new(move |cx, args| {
        let sender = event
            .begin_respond()
            .map_err(|error| ScriptException::new("InvalidStateError", error.to_string()))?;
        let value = args.first().cloned().unwrap_or_else(|| cx.undefined());
        if cx.is_promise(&value) {
            cx.on_settle(
                &value,
                Box::new(move |settlement| {
                    let result = match settlement {
                        Settlement::Fulfilled(value) => Ok(value),
                        Settlement::Rejected(exception) => Err(SwError::Script(exception)),
                    };
                    let _ = sender.send(result);
                }),
            )
            .map_err(EngineError::into_exception)?;
        } else {
            let snapshot = cx.to_json(&value).map_err(EngineError::into_exception)?;
            let _ = sender.send(Ok(snapshot));
        }
        Ok(cx.undefined())
    })
}

/// Adapt an awaited script value into a native extension future. Values
/// that are not promises count as already settled.
fn promise_extension(
    cx: &dyn ScriptContext,
    value: &ScriptValue,
) -> Result<WaitFuture, ScriptException> {
    if cx.is_promise(value) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        cx.on_settle(
            value,
            Box::new(move |settlement| {
                let _ = tx.send(settlement);
            }),
        )
        .map_err(EngineError::into_exception)?;
        Ok(Box::pin(async move {
            match rx.await {
                Ok(Settlement::Fulfilled(_)) => Ok(()),
                Ok(Settlement::Rejected(exception)) => Err(SwError::Script(exception)),
                Err(_) => Err(SwError::internal("promise settlement channel dropped")),
            }
        }))
    } else {
        Ok(Box::pin(std::future::ready(Ok(()))))
    }
}
