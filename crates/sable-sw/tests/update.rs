//! Update pipeline tests: conditional revalidation, the byte-identity
//! short-circuit, and worker replacement.

mod common;

use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use sable_sw::{FetchResponse, InstallState, Registration, SwError, Worker};

use common::{Harness, add_listener, harness, script_response, skip_waiting};

const SW_URL: &str = "https://example.com/sw.js";
const SCOPE: &str = "https://example.com/";

/// Register v1 and drive it to `activated`, returning the registration and
/// its active worker.
async fn registered_v1(h: &Harness) -> (Arc<Registration>, Arc<Worker>) {
    h.fetcher.route(SW_URL, script_response("// v1", Some("\"v1\"")));
    let outcome = h.container.register(SW_URL, None).await.unwrap();
    outcome.completion.await.unwrap().unwrap();
    let registration = h.container.get_registration(SCOPE).unwrap().unwrap();
    assert!(Arc::ptr_eq(&registration.active().unwrap(), &outcome.worker));
    (registration, outcome.worker)
}

#[tokio::test]
async fn test_update_sends_the_stored_validators() {
    let h = harness();
    let (registration, _worker) = registered_v1(&h).await;

    h.fetcher
        .route(SW_URL, FetchResponse::new(304, Vec::new(), Vec::new()));
    registration.update().await.unwrap();

    let requests = h.fetcher.requests();
    let revalidation = requests.last().unwrap();
    assert_eq!(revalidation.header("if-none-match"), Some("\"v1\""));
}

#[tokio::test]
async fn test_update_304_creates_no_worker() {
    let h = harness();
    let (registration, worker) = registered_v1(&h).await;

    h.fetcher
        .route(SW_URL, FetchResponse::new(304, Vec::new(), Vec::new()));
    let updatefound = Arc::new(AtomicUsize::new(0));
    let counter = updatefound.clone();
    registration.on_updatefound(Arc::new(move |_worker| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    assert!(registration.update().await.unwrap().is_none());

    assert!(Arc::ptr_eq(&registration.active().unwrap(), &worker));
    assert!(registration.installing().is_none());
    assert!(registration.waiting().is_none());
    assert_eq!(updatefound.load(Ordering::SeqCst), 0);
    assert_eq!(h.engine.context_count(), 1);
}

#[tokio::test]
async fn test_update_byte_identical_content_skips_reinstall() {
    let h = harness();
    let (registration, worker) = registered_v1(&h).await;

    // A server with weak conditional support: full 200 with the same bytes.
    h.fetcher.route(SW_URL, script_response("// v1", Some("\"v1\"")));
    let updatefound = Arc::new(AtomicUsize::new(0));
    let counter = updatefound.clone();
    registration.on_updatefound(Arc::new(move |_worker| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    assert!(registration.update().await.unwrap().is_none());

    assert!(Arc::ptr_eq(&registration.active().unwrap(), &worker));
    assert!(registration.waiting().is_none());
    assert!(registration.installing().is_none());
    assert_eq!(updatefound.load(Ordering::SeqCst), 0);
    // No install ran: the discarded worker never got a script context.
    assert_eq!(h.engine.context_count(), 1);
}

#[tokio::test]
async fn test_update_changed_content_installs_into_waiting() {
    let h = harness();
    let (registration, old) = registered_v1(&h).await;

    h.fetcher.route(SW_URL, script_response("// v2", Some("\"v2\"")));
    let updatefound = Arc::new(AtomicUsize::new(0));
    let counter = updatefound.clone();
    registration.on_updatefound(Arc::new(move |_worker| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    let new = registration.update().await.unwrap().unwrap();

    assert!(!Arc::ptr_eq(&new, &old));
    assert_eq!(new.state(), InstallState::Installed);
    assert!(Arc::ptr_eq(&registration.waiting().unwrap(), &new));
    assert!(Arc::ptr_eq(&registration.active().unwrap(), &old));
    assert!(registration.installing().is_none());
    assert_eq!(old.state(), InstallState::Activated);
    assert_eq!(updatefound.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_update_with_skip_waiting_replaces_the_active_worker() {
    let h = harness();
    let skip = Arc::new(AtomicBool::new(false));
    let flag = skip.clone();
    h.engine.program().on_evaluate("sw.js", move |cx| {
        let flag = flag.clone();
        add_listener(
            cx,
            "install",
            Rc::new(move |cx, _args| {
                if flag.load(Ordering::SeqCst) {
                    skip_waiting(cx)?;
                }
                Ok(cx.undefined())
            }),
        )
    });
    let (registration, old) = registered_v1(&h).await;

    skip.store(true, Ordering::SeqCst);
    h.fetcher.route(SW_URL, script_response("// v2", Some("\"v2\"")));
    let new = registration.update().await.unwrap().unwrap();

    assert_eq!(new.state(), InstallState::Activated);
    assert!(Arc::ptr_eq(&registration.active().unwrap(), &new));
    assert!(registration.waiting().is_none());
    assert_eq!(old.state(), InstallState::Redundant);
    assert!(Arc::ptr_eq(&registration.redundant().unwrap(), &old));
}

#[tokio::test]
async fn test_update_server_error_creates_no_worker() {
    let h = harness();
    let (registration, worker) = registered_v1(&h).await;

    h.fetcher
        .route(SW_URL, FetchResponse::new(500, Vec::new(), Vec::new()));
    let error = registration.update().await.unwrap_err();
    assert!(matches!(error, SwError::Network(_)));

    assert!(Arc::ptr_eq(&registration.active().unwrap(), &worker));
    assert!(registration.installing().is_none());
    assert!(registration.waiting().is_none());
}

#[tokio::test]
async fn test_update_without_installed_worker_is_invalid() {
    let h = harness();
    // Register fails: the script 404s, the stub is discarded.
    let outcome = h.container.register(SW_URL, None).await.unwrap();
    outcome.completion.await.unwrap().unwrap_err();

    let registration = h.container.get_registration(SCOPE).unwrap().unwrap();
    let error = registration.update().await.unwrap_err();
    assert!(matches!(error, SwError::InvalidState(_)));
    // Only the failed register fetch hit the network.
    assert_eq!(h.fetcher.request_count(), 1);
}

#[tokio::test]
async fn test_update_after_unregister_is_invalid() {
    let h = harness();
    let (registration, _worker) = registered_v1(&h).await;
    assert!(registration.unregister().unwrap());

    let error = registration.update().await.unwrap_err();
    assert!(matches!(error, SwError::InvalidState(_)));
    assert!(error.to_string().contains("unregistered"));
}
