//! Opaque handles to engine-owned values.

use std::any::Any;
use std::rc::Rc;

/// A handle to a value owned by a script context.
///
/// The payload type is chosen by the engine implementation; the runtime
/// treats handles as opaque tokens and only moves them between operations on
/// the context that produced them.
///
/// # Thread Safety
///
/// Handles are `!Send` and `!Sync`: engine values are tied to the thread
/// their context lives on. Data that must leave that thread is snapshotted
/// as JSON through [`ScriptContext::to_json`](crate::ScriptContext::to_json).
#[derive(Clone)]
pub struct ScriptValue {
    inner: Rc<dyn Any>,
}

impl ScriptValue {
    /// Wrap an engine-defined payload.
    pub fn new<T: 'static>(payload: T) -> Self {
        Self {
            inner: Rc::new(payload),
        }
    }

    /// Borrow the payload if it is of type `T`.
    pub fn payload<T: 'static>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }

    /// Identity comparison: true when both handles wrap the same payload.
    pub fn ptr_eq(&self, other: &ScriptValue) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for ScriptValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ScriptValue(<opaque>)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_downcast() {
        let value = ScriptValue::new(42_u64);
        assert_eq!(value.payload::<u64>(), Some(&42));
        assert_eq!(value.payload::<String>(), None);
    }

    #[test]
    fn test_ptr_eq_tracks_identity() {
        let a = ScriptValue::new("x".to_string());
        let b = a.clone();
        let c = ScriptValue::new("x".to_string());
        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&c));
    }
}
