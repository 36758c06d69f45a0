//! The capability seam between the worker runtime and a script engine.

use std::rc::Rc;

use crate::error::{EngineResult, ScriptException};
use crate::value::ScriptValue;

/// Outcome of a settled promise, snapshotted as JSON so it can leave the
/// context thread.
#[derive(Debug, Clone)]
pub enum Settlement {
    Fulfilled(serde_json::Value),
    Rejected(ScriptException),
}

/// Callback invoked exactly once when a watched promise settles.
pub type SettleFn = Box<dyn FnOnce(Settlement) + Send + 'static>;

/// Result of a native function invoked from script. An `Err` is thrown back
/// into the calling script code as an exception.
pub type NativeResult = Result<ScriptValue, ScriptException>;

/// A native function exposed to script.
///
/// Installed on the context thread and only ever invoked there; the live
/// context is passed back in so the body can build values or call script
/// functions.
pub type NativeFunction = Rc<dyn Fn(&dyn ScriptContext, &[ScriptValue]) -> NativeResult>;

/// Factory for script contexts.
///
/// Implementations wrap a concrete engine (JavaScriptCore, V8, ...) and are
/// shared across worker threads; the contexts they produce are confined to
/// the thread that created them.
pub trait ScriptEngine: Send + Sync {
    fn create_context(&self) -> EngineResult<Box<dyn ScriptContext>>;
}

/// One isolated script execution context.
///
/// All methods take `&self`; implementations use interior mutability. Every
/// call must happen on the thread that created the context.
pub trait ScriptContext {
    /// Evaluate a script, returning its completion value.
    fn evaluate(&self, source: &str, location: Option<&str>) -> EngineResult<ScriptValue>;

    /// Call a function value with the given arguments.
    fn call(&self, function: &ScriptValue, args: &[ScriptValue]) -> EngineResult<ScriptValue>;

    fn set_global(&self, name: &str, value: ScriptValue) -> EngineResult<()>;
    fn global(&self, name: &str) -> Option<ScriptValue>;

    fn undefined(&self) -> ScriptValue;
    fn from_json(&self, value: &serde_json::Value) -> EngineResult<ScriptValue>;

    /// Snapshot a value as JSON. Fails for values with no JSON form
    /// (functions, promises).
    fn to_json(&self, value: &ScriptValue) -> EngineResult<serde_json::Value>;

    fn make_function(&self, name: &str, function: NativeFunction) -> EngineResult<ScriptValue>;
    fn make_object(&self, properties: Vec<(String, ScriptValue)>) -> EngineResult<ScriptValue>;

    /// Read a property off an object value. `Ok(None)` when the property is
    /// absent or the value has no properties.
    fn property(&self, object: &ScriptValue, name: &str) -> EngineResult<Option<ScriptValue>>;

    fn is_promise(&self, value: &ScriptValue) -> bool;

    /// Register a one-shot callback for a promise's settlement.
    fn on_settle(&self, promise: &ScriptValue, on_settled: SettleFn) -> EngineResult<()>;

    /// Drain the engine's internal job queue (microtasks, settled promise
    /// reactions). Returns the number of jobs run.
    fn run_jobs(&self) -> EngineResult<usize>;
    fn has_pending_jobs(&self) -> bool;

    /// Take the most recent exception raised outside a direct `evaluate` or
    /// `call` (timer callbacks, unhandled rejections).
    fn take_uncaught_exception(&self) -> Option<ScriptException>;
}
