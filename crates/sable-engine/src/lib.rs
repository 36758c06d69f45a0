//! Script engine abstraction for the sable worker runtime.
//!
//! The runtime never talks to a concrete JavaScript engine directly. It
//! drives [`ScriptContext`] handles produced by a [`ScriptEngine`], which an
//! embedder implements over its engine of choice (JavaScriptCore, V8, ...).
//! The `mock` feature ships a scripted engine used by the runtime's own
//! test suite and useful for embedder harnesses.
//!
//! # Example
//!
//! ```ignore
//! use sable_engine::ScriptEngine;
//!
//! let context = engine.create_context()?;
//! let value = context.evaluate("1 + 1", Some("inline.js"))?;
//! assert_eq!(context.to_json(&value)?, serde_json::json!(2));
//! ```
//!
//! # Thread Safety
//!
//! [`ScriptEngine`] implementations are `Send + Sync` and may be shared
//! freely. The [`ScriptContext`] boxes they create are not: a context and
//! every [`ScriptValue`] it produces are confined to the thread that created
//! them. Runtimes that need a thread-safe surface marshal operations onto a
//! dedicated context thread, the way `sable-sw`'s execution environment does.

mod engine;
mod error;
mod value;

#[cfg(feature = "mock")]
pub mod mock;

pub use engine::{NativeFunction, NativeResult, ScriptContext, ScriptEngine, SettleFn, Settlement};
pub use error::{EngineError, EngineResult, ScriptException};
pub use value::ScriptValue;
