//! Tests for the scripted mock engine.

use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde_json::json;

use sable_engine::mock::{MockEngine, MockPromise};
use sable_engine::{EngineError, ScriptEngine, ScriptException, Settlement};

#[test]
fn test_behavior_runs_for_matching_location() {
    let engine = MockEngine::new();
    let hits = Arc::new(AtomicUsize::new(0));
    let counted = hits.clone();
    engine.program().on_evaluate("sw.js", move |_cx| {
        counted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let context = engine.create_context().unwrap();
    context
        .evaluate("...", Some("https://example.com/app/sw.js"))
        .unwrap();
    context
        .evaluate("...", Some("https://example.com/other.js"))
        .unwrap();

    assert_eq!(hits.load(Ordering::SeqCst), 1);
    let evaluated = engine.last_context().unwrap().evaluated();
    assert_eq!(evaluated.len(), 2);
    assert!(evaluated[0].ends_with("sw.js"));
}

#[test]
fn test_behavior_error_is_thrown() {
    let engine = MockEngine::new();
    engine.program().on_evaluate("bad.js", |_cx| {
        Err(ScriptException::new("SyntaxError", "unexpected token"))
    });

    let context = engine.create_context().unwrap();
    let err = context.evaluate("{", Some("bad.js")).unwrap_err();
    match err {
        EngineError::Script(exception) => assert_eq!(exception.name, "SyntaxError"),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_context_creation_failure() {
    let engine = MockEngine::new();
    engine.program().fail_context_creation("no engine available");

    assert!(engine.create_context().is_err());
    // The failure is one-shot.
    assert!(engine.create_context().is_ok());
}

#[test]
fn test_promise_settles_waiters_once() {
    let promise = MockPromise::pending();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let sink = seen.clone();
    promise.subscribe(Box::new(move |settlement| {
        sink.lock().push(settlement);
    }));

    promise.fulfill(json!(7));
    promise.reject("late rejection is ignored");

    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    match &seen[0] {
        Settlement::Fulfilled(value) => assert_eq!(value, &json!(7)),
        Settlement::Rejected(_) => panic!("promise should have stayed fulfilled"),
    }
}

#[test]
fn test_subscribe_after_settlement_fires_immediately() {
    let promise = MockPromise::rejected("boom");
    let seen = Arc::new(Mutex::new(None));

    let sink = seen.clone();
    promise.subscribe(Box::new(move |settlement| {
        *sink.lock() = Some(settlement);
    }));

    match seen.lock().take() {
        Some(Settlement::Rejected(exception)) => assert_eq!(exception.message, "boom"),
        other => panic!("unexpected settlement: {other:?}"),
    }
}

#[test]
fn test_on_settle_through_context() {
    let engine = MockEngine::new();
    let context = engine.create_context().unwrap();

    let promise = MockPromise::pending();
    let value = promise.as_value();
    assert!(context.is_promise(&value));

    let seen = Arc::new(Mutex::new(None));
    let sink = seen.clone();
    context
        .on_settle(
            &value,
            Box::new(move |settlement| {
                *sink.lock() = Some(settlement);
            }),
        )
        .unwrap();

    promise.fulfill(json!({"ok": true}));
    assert!(matches!(
        seen.lock().take(),
        Some(Settlement::Fulfilled(_))
    ));
}

#[test]
fn test_call_non_function_raises_type_error() {
    let engine = MockEngine::new();
    let context = engine.create_context().unwrap();

    let not_a_function = context.from_json(&json!(1)).unwrap();
    let err = context.call(&not_a_function, &[]).unwrap_err();
    match err {
        EngineError::Script(exception) => assert_eq!(exception.name, "TypeError"),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_native_function_roundtrip() {
    let engine = MockEngine::new();
    let context = engine.create_context().unwrap();

    let double = context
        .make_function(
            "double",
            Rc::new(|cx, args| {
                let input = cx
                    .to_json(&args[0])
                    .map_err(EngineError::into_exception)?;
                let n = input.as_i64().unwrap_or(0);
                cx.from_json(&json!(n * 2))
                    .map_err(EngineError::into_exception)
            }),
        )
        .unwrap();
    context.set_global("double", double).unwrap();

    let function = context.global("double").unwrap();
    let arg = context.from_json(&json!(21)).unwrap();
    let result = context.call(&function, &[arg]).unwrap();
    assert_eq!(context.to_json(&result).unwrap(), json!(42));
}

#[test]
fn test_object_snapshot_to_json() {
    let engine = MockEngine::new();
    let context = engine.create_context().unwrap();

    let inner = context.from_json(&json!({"url": "/x"})).unwrap();
    let object = context
        .make_object(vec![
            ("type".to_string(), context.from_json(&json!("fetch")).unwrap()),
            ("request".to_string(), inner),
        ])
        .unwrap();

    let request = context.property(&object, "request").unwrap().unwrap();
    assert_eq!(
        context.to_json(&request).unwrap(),
        json!({"url": "/x"})
    );
    assert!(context.property(&object, "missing").unwrap().is_none());

    let snapshot = context.to_json(&object).unwrap();
    assert_eq!(snapshot["type"], json!("fetch"));
}

#[test]
fn test_uncaught_exception_latch() {
    let engine = MockEngine::new();
    let context = engine.create_context().unwrap();
    let handle = engine.last_context().unwrap();

    assert!(context.take_uncaught_exception().is_none());
    handle.raise_uncaught(ScriptException::new("Error", "async failure"));
    let exception = context.take_uncaught_exception().unwrap();
    assert_eq!(exception.message, "async failure");
    assert!(context.take_uncaught_exception().is_none());
}
