//! Service worker runtime core for native hosts.
//!
//! Implements the service worker lifecycle over an embedded script engine:
//! per-worker execution lanes, extendable events with `waitUntil`
//! aggregation, the installing/waiting/active/redundant registration state
//! machine, and identity-preserving factories over a pluggable storage
//! collaborator.
//!
//! The engine itself is a capability. Hosts implement
//! [`engine::ScriptEngine`] over JavaScriptCore, V8, or another runtime,
//! and this crate drives it from dedicated per-worker threads so blocking
//! script APIs such as `importScripts` stay blocking without starving the
//! async runtime.
//!
//! # Example
//!
//! ```ignore
//! use sable_sw::ServiceWorkerContainer;
//!
//! let container = ServiceWorkerContainer::builder()
//!     .engine(engine)
//!     .build()?;
//!
//! let outcome = container.register("https://example.com/app/sw.js", None).await?;
//! outcome.completion.await.expect("pipeline dropped")?;
//!
//! let registration = container
//!     .get_registration("https://example.com/app/")?
//!     .expect("registered");
//! assert!(registration.active().is_some());
//! ```
//!
//! # Thread Safety
//!
//! Script contexts never leave their lane thread. Everything a host holds
//! (containers, registrations, workers) is `Send + Sync`; calls that need
//! the context marshal onto the lane and await the reply.

mod container;
mod environment;
mod error;
mod event;
mod event_target;
mod factory;
mod fetch;
mod registration;
mod scope;
mod storage;
mod timers;
mod worker;

pub use container::{ContainerBuilder, ServiceWorkerContainer};
pub use environment::{CloseHook, ExecutionEnvironment, ResourceLedger};
pub use error::{SwError, SwResult};
pub use event::{EventState, ExtendableEvent, FetchEvent, WaitFuture};
pub use event_target::{EventTarget, ListenerId};
pub use fetch::{BatchFetchFuture, FetchFuture, FetchRequest, FetchResponse, HttpFetcher, ScriptFetcher};
pub use registration::{RegisterOutcome, Registration, UpdateFoundListener};
pub use storage::{
    MemoryStore, RegistrationId, RegistrationRecord, ScriptSource, SlotRecord, SwStorage, WorkerId,
    WorkerRecord, content_hash,
};
pub use worker::{InstallState, StateListener, Worker};

pub use sable_engine as engine;
