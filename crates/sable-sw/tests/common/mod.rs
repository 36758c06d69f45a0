//! Shared fixtures for the scenario tests: a scripted fetch delegate and
//! script-side helpers that drive the mock engine's global bindings.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use sable_engine::mock::MockEngine;
use sable_engine::{EngineError, NativeFunction, ScriptContext, ScriptException};
use sable_sw::{
    FetchFuture, FetchRequest, FetchResponse, MemoryStore, ScriptFetcher, ServiceWorkerContainer,
};

/// Install a subscriber honoring `RUST_LOG`. Call at the top of a test when
/// debugging a scenario.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Fetch delegate serving canned responses and recording every request.
pub struct ScriptedFetcher {
    routes: Mutex<HashMap<String, FetchResponse>>,
    requests: Mutex<Vec<FetchRequest>>,
}

impl ScriptedFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            routes: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Set the response served for `url`, replacing any previous one.
    /// Unrouted URLs get a 404.
    pub fn route(&self, url: &str, response: FetchResponse) {
        self.routes.lock().insert(url.to_string(), response);
    }

    /// Every request seen so far, in arrival order.
    pub fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

impl ScriptFetcher for ScriptedFetcher {
    fn fetch(&self, request: FetchRequest) -> FetchFuture {
        self.requests.lock().push(request.clone());
        let response = self.routes.lock().get(request.url.as_str()).cloned();
        Box::pin(async move {
            Ok(response.unwrap_or_else(|| FetchResponse::new(404, Vec::new(), Vec::new())))
        })
    }
}

/// A 200 script response, optionally carrying an ETag validator.
pub fn script_response(body: &str, etag: Option<&str>) -> FetchResponse {
    let mut headers = vec![("Content-Type".to_string(), "text/javascript".to_string())];
    if let Some(etag) = etag {
        headers.push(("ETag".to_string(), etag.to_string()));
    }
    FetchResponse::new(200, headers, body.as_bytes().to_vec())
}

/// A container wired to the mock engine and in-memory collaborators, with
/// handles kept for assertions.
pub struct Harness {
    pub engine: Arc<MockEngine>,
    pub fetcher: Arc<ScriptedFetcher>,
    pub store: Arc<MemoryStore>,
    pub container: ServiceWorkerContainer,
}

pub fn harness() -> Harness {
    let engine = Arc::new(MockEngine::new());
    let fetcher = ScriptedFetcher::new();
    let store = Arc::new(MemoryStore::new());
    let container = ServiceWorkerContainer::builder()
        .engine(engine.clone())
        .storage(store.clone())
        .fetcher(fetcher.clone())
        .build()
        .unwrap();
    Harness {
        engine,
        fetcher,
        store,
        container,
    }
}

/// Register a script listener for `event_type` through the global binding,
/// the way worker script would.
pub fn add_listener(
    cx: &dyn ScriptContext,
    event_type: &str,
    listener: NativeFunction,
) -> Result<(), ScriptException> {
    let add = cx
        .global("addEventListener")
        .ok_or_else(|| ScriptException::new("ReferenceError", "addEventListener missing"))?;
    let type_value = cx
        .from_json(&serde_json::json!(event_type))
        .map_err(EngineError::into_exception)?;
    let function = cx
        .make_function("listener", listener)
        .map_err(EngineError::into_exception)?;
    cx.call(&add, &[type_value, function])
        .map_err(EngineError::into_exception)?;
    Ok(())
}

/// Call `waitUntil` on a dispatched event object.
pub fn wait_until(
    cx: &dyn ScriptContext,
    event: &sable_engine::ScriptValue,
    value: sable_engine::ScriptValue,
) -> Result<(), ScriptException> {
    let wait = cx
        .property(event, "waitUntil")
        .map_err(EngineError::into_exception)?
        .ok_or_else(|| ScriptException::new("TypeError", "event has no waitUntil"))?;
    cx.call(&wait, &[value]).map_err(EngineError::into_exception)?;
    Ok(())
}

/// Call the global `skipWaiting`.
pub fn skip_waiting(cx: &dyn ScriptContext) -> Result<(), ScriptException> {
    let skip = cx
        .global("skipWaiting")
        .ok_or_else(|| ScriptException::new("ReferenceError", "skipWaiting missing"))?;
    cx.call(&skip, &[]).map_err(EngineError::into_exception)?;
    Ok(())
}
