//! Host surface tests: scope handling, registration identity, and
//! unregistration.

mod common;

use std::rc::Rc;
use std::sync::Arc;

use sable_sw::{InstallState, ServiceWorkerContainer, SwError};

use common::{add_listener, harness, script_response, skip_waiting};

const SW_URL: &str = "https://example.com/sw.js";
const SCOPE: &str = "https://example.com/";

#[test]
fn test_builder_requires_an_engine() {
    let error = ServiceWorkerContainer::builder().build().err().unwrap();
    assert!(matches!(error, SwError::Configuration(_)));
}

#[tokio::test]
async fn test_register_invalid_url_is_a_validation_error() {
    let h = harness();
    let error = h.container.register("not a url", None).await.unwrap_err();
    assert!(matches!(error, SwError::Validation(_)));
}

#[tokio::test]
async fn test_register_normalizes_an_explicit_scope() {
    let h = harness();
    h.fetcher.route(
        "https://example.com/app/sw.js",
        script_response("// v1", None),
    );

    let outcome = h
        .container
        .register("https://example.com/app/sw.js", Some("pages"))
        .await
        .unwrap();
    outcome.completion.await.unwrap().unwrap();

    let registration = h
        .container
        .get_registration("https://example.com/app/pages/")
        .unwrap()
        .unwrap();
    assert_eq!(registration.scope().as_str(), "https://example.com/app/pages/");
}

#[tokio::test]
async fn test_get_registration_returns_the_identical_instance() {
    let h = harness();
    h.fetcher.route(SW_URL, script_response("// v1", None));
    let outcome = h.container.register(SW_URL, None).await.unwrap();
    outcome.completion.await.unwrap().unwrap();

    let first = h.container.get_registration(SCOPE).unwrap().unwrap();
    let second = h.container.get_registration(SCOPE).unwrap().unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert!(h
        .container
        .get_registration("https://example.com/elsewhere/")
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_nested_scopes_settle_independently() {
    let h = harness();
    h.fetcher
        .route("https://example.com/a/sw.js", script_response("// a", None));
    h.fetcher.route(
        "https://example.com/a/b/sw.js",
        script_response("// b", None),
    );
    // Both workers call skipWaiting during install.
    h.engine.program().on_evaluate("sw.js", |cx| {
        add_listener(
            cx,
            "install",
            Rc::new(|cx, _args| {
                skip_waiting(cx)?;
                Ok(cx.undefined())
            }),
        )
    });

    let outer = h
        .container
        .register("https://example.com/a/sw.js", None)
        .await
        .unwrap();
    let inner = h
        .container
        .register("https://example.com/a/b/sw.js", None)
        .await
        .unwrap();
    outer.completion.await.unwrap().unwrap();
    inner.completion.await.unwrap().unwrap();

    let outer_reg = h
        .container
        .get_registration("https://example.com/a/")
        .unwrap()
        .unwrap();
    let inner_reg = h
        .container
        .get_registration("https://example.com/a/b/")
        .unwrap()
        .unwrap();
    assert!(Arc::ptr_eq(&outer_reg.active().unwrap(), &outer.worker));
    assert!(Arc::ptr_eq(&inner_reg.active().unwrap(), &inner.worker));
    assert_eq!(outer.worker.state(), InstallState::Activated);
    assert_eq!(inner.worker.state(), InstallState::Activated);
    assert_eq!(h.container.get_registrations().unwrap().len(), 2);
}

#[tokio::test]
async fn test_unregister_hides_the_registration() {
    let h = harness();
    h.fetcher.route(SW_URL, script_response("// v1", None));
    let outcome = h.container.register(SW_URL, None).await.unwrap();
    outcome.completion.await.unwrap().unwrap();

    let registration = h.container.get_registration(SCOPE).unwrap().unwrap();
    assert!(registration.unregister().unwrap());
    assert!(!registration.unregister().unwrap());

    assert!(h.container.get_registration(SCOPE).unwrap().is_none());
    assert!(h.container.get_registrations().unwrap().is_empty());

    // A previously obtained worker handle stays inspectable.
    assert_eq!(outcome.worker.state(), InstallState::Activated);
    assert_eq!(outcome.worker.script_url().as_str(), SW_URL);
}

#[tokio::test]
async fn test_reregister_after_unregister_creates_a_fresh_registration() {
    let h = harness();
    h.fetcher.route(SW_URL, script_response("// v1", None));
    let outcome = h.container.register(SW_URL, None).await.unwrap();
    outcome.completion.await.unwrap().unwrap();
    let old = h.container.get_registration(SCOPE).unwrap().unwrap();
    old.unregister().unwrap();

    let outcome = h.container.register(SW_URL, None).await.unwrap();
    outcome.completion.await.unwrap().unwrap();

    let fresh = h.container.get_registration(SCOPE).unwrap().unwrap();
    assert_ne!(fresh.id(), old.id());
    assert!(Arc::ptr_eq(&fresh.active().unwrap(), &outcome.worker));
}
