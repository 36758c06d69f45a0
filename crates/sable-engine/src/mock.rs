//! A scripted engine for tests.
//!
//! [`MockEngine`] implements the engine traits without interpreting any
//! JavaScript. Tests register *behaviors* keyed by script location; when a
//! script whose location matches is evaluated, the behavior runs against the
//! live context and can exercise the same globals real script would
//! (`addEventListener`, `skipWaiting`, ...). Promises are [`MockPromise`]
//! handles that tests settle explicitly.
//!
//! # Example
//!
//! ```
//! use sable_engine::mock::MockEngine;
//! use sable_engine::ScriptEngine;
//!
//! let engine = MockEngine::new();
//! engine.program().on_evaluate("boot.js", |cx| {
//!     cx.evaluate("nested", Some("nested.js")).map(|_| ()).map_err(|e| e.into_exception())
//! });
//!
//! let context = engine.create_context().unwrap();
//! context.evaluate("...", Some("https://example.com/boot.js")).unwrap();
//! assert_eq!(engine.last_context().unwrap().evaluated().len(), 2);
//! ```

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::engine::{NativeFunction, ScriptContext, ScriptEngine, SettleFn, Settlement};
use crate::error::{EngineError, EngineResult, ScriptException};
use crate::value::ScriptValue;

/// Behavior run when a matching script is evaluated.
pub type ScriptBehavior =
    Arc<dyn Fn(&dyn ScriptContext) -> Result<(), ScriptException> + Send + Sync>;

#[derive(Default)]
struct ProgramInner {
    behaviors: Vec<(String, ScriptBehavior)>,
    fail_context_creation: Option<String>,
}

/// Shared, programmable behavior table for every context a [`MockEngine`]
/// creates.
#[derive(Clone, Default)]
pub struct MockProgram {
    inner: Arc<Mutex<ProgramInner>>,
}

impl MockProgram {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `behavior` whenever a script whose location contains `fragment`
    /// is evaluated. Multiple matching behaviors run in registration order.
    pub fn on_evaluate<F>(&self, fragment: &str, behavior: F)
    where
        F: Fn(&dyn ScriptContext) -> Result<(), ScriptException> + Send + Sync + 'static,
    {
        self.inner
            .lock()
            .behaviors
            .push((fragment.to_string(), Arc::new(behavior)));
    }

    /// Make the next `create_context` call fail.
    pub fn fail_context_creation(&self, message: &str) {
        self.inner.lock().fail_context_creation = Some(message.to_string());
    }

    fn behaviors_for(&self, location: &str) -> Vec<ScriptBehavior> {
        self.inner
            .lock()
            .behaviors
            .iter()
            .filter(|(fragment, _)| location.contains(fragment.as_str()))
            .map(|(_, behavior)| behavior.clone())
            .collect()
    }

    fn take_context_failure(&self) -> Option<String> {
        self.inner.lock().fail_context_creation.take()
    }
}

#[derive(Default)]
struct ContextShared {
    evaluated: Mutex<Vec<String>>,
    uncaught: Mutex<Option<ScriptException>>,
}

/// Thread-safe window into a context created on a worker thread.
#[derive(Clone)]
pub struct MockContextHandle {
    shared: Arc<ContextShared>,
}

impl MockContextHandle {
    /// Locations of every script evaluated so far, in order.
    pub fn evaluated(&self) -> Vec<String> {
        self.shared.evaluated.lock().clone()
    }

    /// Latch an uncaught exception, as an engine would after an unhandled
    /// async error.
    pub fn raise_uncaught(&self, exception: ScriptException) {
        *self.shared.uncaught.lock() = Some(exception);
    }
}

/// Scripted [`ScriptEngine`].
#[derive(Default)]
pub struct MockEngine {
    program: MockProgram,
    contexts: Mutex<Vec<MockContextHandle>>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn program(&self) -> &MockProgram {
        &self.program
    }

    /// Handle onto the most recently created context.
    pub fn last_context(&self) -> Option<MockContextHandle> {
        self.contexts.lock().last().cloned()
    }

    pub fn context_count(&self) -> usize {
        self.contexts.lock().len()
    }
}

impl ScriptEngine for MockEngine {
    fn create_context(&self) -> EngineResult<Box<dyn ScriptContext>> {
        if let Some(message) = self.program.take_context_failure() {
            return Err(EngineError::context_creation(message));
        }
        let shared = Arc::new(ContextShared::default());
        self.contexts.lock().push(MockContextHandle {
            shared: shared.clone(),
        });
        Ok(Box::new(MockContext {
            shared,
            program: self.program.clone(),
            globals: RefCell::new(HashMap::new()),
        }))
    }
}

/// Payload carried by this engine's [`ScriptValue`] handles.
pub enum MockValue {
    Json(serde_json::Value),
    Function(MockFunction),
    Object(HashMap<String, ScriptValue>),
    Promise(MockPromise),
}

pub struct MockFunction {
    pub name: String,
    pub body: NativeFunction,
}

enum PromiseState {
    Pending(Vec<SettleFn>),
    Settled(Settlement),
}

/// A promise handle settled explicitly by the test.
///
/// Settlement callbacks fire eagerly on the settling thread; this engine
/// has no job queue of its own.
#[derive(Clone)]
pub struct MockPromise {
    state: Arc<Mutex<PromiseState>>,
}

impl MockPromise {
    pub fn pending() -> Self {
        Self {
            state: Arc::new(Mutex::new(PromiseState::Pending(Vec::new()))),
        }
    }

    pub fn fulfilled(value: serde_json::Value) -> Self {
        Self {
            state: Arc::new(Mutex::new(PromiseState::Settled(Settlement::Fulfilled(
                value,
            )))),
        }
    }

    pub fn rejected(message: &str) -> Self {
        Self {
            state: Arc::new(Mutex::new(PromiseState::Settled(Settlement::Rejected(
                ScriptException::new("Error", message),
            )))),
        }
    }

    /// Wrap this handle as a context value the runtime will recognize as a
    /// promise.
    pub fn as_value(&self) -> ScriptValue {
        ScriptValue::new(MockValue::Promise(self.clone()))
    }

    pub fn fulfill(&self, value: serde_json::Value) {
        self.settle(Settlement::Fulfilled(value));
    }

    pub fn reject(&self, message: &str) {
        self.reject_with(ScriptException::new("Error", message));
    }

    pub fn reject_with(&self, exception: ScriptException) {
        self.settle(Settlement::Rejected(exception));
    }

    fn settle(&self, settlement: Settlement) {
        let waiters = {
            let mut state = self.state.lock();
            match &mut *state {
                PromiseState::Pending(waiters) => {
                    let waiters = std::mem::take(waiters);
                    *state = PromiseState::Settled(settlement.clone());
                    waiters
                }
                // A promise settles exactly once.
                PromiseState::Settled(_) => return,
            }
        };
        for waiter in waiters {
            waiter(settlement.clone());
        }
    }

    /// Register a settlement callback. Fires immediately when the promise
    /// has already settled.
    pub fn subscribe(&self, on_settled: SettleFn) {
        let settlement = {
            let mut state = self.state.lock();
            match &mut *state {
                PromiseState::Pending(waiters) => {
                    waiters.push(on_settled);
                    return;
                }
                PromiseState::Settled(settlement) => settlement.clone(),
            }
        };
        on_settled(settlement);
    }
}

struct MockContext {
    shared: Arc<ContextShared>,
    program: MockProgram,
    globals: RefCell<HashMap<String, ScriptValue>>,
}

impl MockContext {
    fn payload<'a>(&self, value: &'a ScriptValue) -> EngineResult<&'a MockValue> {
        value
            .payload::<MockValue>()
            .ok_or_else(|| EngineError::internal("value does not belong to a mock context"))
    }
}

impl ScriptContext for MockContext {
    fn evaluate(&self, _source: &str, location: Option<&str>) -> EngineResult<ScriptValue> {
        let location = location.unwrap_or("<anonymous>").to_string();
        self.shared.evaluated.lock().push(location.clone());
        for behavior in self.program.behaviors_for(&location) {
            behavior(self)?;
        }
        Ok(self.undefined())
    }

    fn call(&self, function: &ScriptValue, args: &[ScriptValue]) -> EngineResult<ScriptValue> {
        match self.payload(function)? {
            MockValue::Function(f) => (f.body)(self, args).map_err(EngineError::Script),
            _ => Err(EngineError::script_error(
                "TypeError",
                "value is not a function",
            )),
        }
    }

    fn set_global(&self, name: &str, value: ScriptValue) -> EngineResult<()> {
        self.globals.borrow_mut().insert(name.to_string(), value);
        Ok(())
    }

    fn global(&self, name: &str) -> Option<ScriptValue> {
        self.globals.borrow().get(name).cloned()
    }

    fn undefined(&self) -> ScriptValue {
        ScriptValue::new(MockValue::Json(serde_json::Value::Null))
    }

    fn from_json(&self, value: &serde_json::Value) -> EngineResult<ScriptValue> {
        Ok(ScriptValue::new(MockValue::Json(value.clone())))
    }

    fn to_json(&self, value: &ScriptValue) -> EngineResult<serde_json::Value> {
        match self.payload(value)? {
            MockValue::Json(value) => Ok(value.clone()),
            MockValue::Object(properties) => {
                let mut map = serde_json::Map::new();
                for (name, value) in properties {
                    map.insert(name.clone(), self.to_json(value)?);
                }
                Ok(serde_json::Value::Object(map))
            }
            MockValue::Function(_) | MockValue::Promise(_) => Err(EngineError::script_error(
                "TypeError",
                "value is not JSON serializable",
            )),
        }
    }

    fn make_function(&self, name: &str, function: NativeFunction) -> EngineResult<ScriptValue> {
        Ok(ScriptValue::new(MockValue::Function(MockFunction {
            name: name.to_string(),
            body: function,
        })))
    }

    fn make_object(&self, properties: Vec<(String, ScriptValue)>) -> EngineResult<ScriptValue> {
        Ok(ScriptValue::new(MockValue::Object(
            properties.into_iter().collect(),
        )))
    }

    fn property(&self, object: &ScriptValue, name: &str) -> EngineResult<Option<ScriptValue>> {
        match self.payload(object)? {
            MockValue::Object(properties) => Ok(properties.get(name).cloned()),
            MockValue::Json(serde_json::Value::Object(map)) => Ok(map
                .get(name)
                .map(|value| ScriptValue::new(MockValue::Json(value.clone())))),
            _ => Ok(None),
        }
    }

    fn is_promise(&self, value: &ScriptValue) -> bool {
        matches!(value.payload::<MockValue>(), Some(MockValue::Promise(_)))
    }

    fn on_settle(&self, promise: &ScriptValue, on_settled: SettleFn) -> EngineResult<()> {
        match self.payload(promise)? {
            MockValue::Promise(promise) => {
                promise.subscribe(on_settled);
                Ok(())
            }
            _ => Err(EngineError::internal("value is not a promise")),
        }
    }

    fn run_jobs(&self) -> EngineResult<usize> {
        // Settlement callbacks fire eagerly, so there is never queued work.
        Ok(0)
    }

    fn has_pending_jobs(&self) -> bool {
        false
    }

    fn take_uncaught_exception(&self) -> Option<ScriptException> {
        self.shared.uncaught.lock().take()
    }
}
