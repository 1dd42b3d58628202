//! Registry, supervisor and proxy behaviour against real worker processes.

mod fixture;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use llama_router::web::error::RouterError;
use llama_router::web::models::ModelStatus;
use llama_router::web::proxy::http_proxy::{ProxyRequest, StopSignal};
use llama_router::web::proxy::pipe::POLL_INTERVAL;

use fixture::{preset, Router};

const LOAD_TIMEOUT: Duration = Duration::from_secs(10);

fn get(path: &str) -> ProxyRequest {
    ProxyRequest {
        method: "GET".into(),
        path: path.into(),
        headers: vec![("accept".into(), "*/*".into())],
        body: Vec::new(),
    }
}

fn never() -> StopSignal {
    Arc::new(|| false)
}

#[test]
fn test_concurrent_ensure_loaded_spawns_once() {
    let router = Router::new(4, vec![preset("a", &[("mock-ready-delay-ms", "300")])]);

    let callers: Vec<_> = (0..4)
        .map(|_| {
            let registry = Arc::clone(&router.registry);
            thread::spawn(move || registry.ensure_loaded("a", true))
        })
        .collect();
    for caller in callers {
        caller.join().unwrap().unwrap();
    }

    assert_eq!(router.status("a"), ModelStatus::Loaded);
    let loading = router
        .trace()
        .iter()
        .filter(|(_, s)| *s == ModelStatus::Loading)
        .count();
    assert_eq!(loading, 1);
    assert!(router.registry.get_meta("a").unwrap().port.is_some());
}

#[test]
fn test_models_max_evicts_before_spawning() {
    let router = Router::new(1, vec![preset("a", &[]), preset("b", &[])]);

    router.registry.ensure_loaded("a", true).unwrap();
    router.registry.ensure_loaded("b", true).unwrap();

    assert_eq!(router.status("a"), ModelStatus::Unloaded);
    assert_eq!(router.status("b"), ModelStatus::Loaded);
    let a_unloaded = router.position("a", ModelStatus::Unloaded).unwrap();
    let b_loading = router.position("b", ModelStatus::Loading).unwrap();
    assert!(a_unloaded < b_loading, "trace: {:?}", router.trace());
    // The evicted worker exited cleanly on the exit command.
    assert_eq!(router.registry.get_meta("a").unwrap().exit_code, Some(0));
}

#[test]
fn test_concurrent_loads_respect_models_max() {
    let names = ["a", "b", "c"];
    let router = Router::new(
        2,
        names.iter().map(|n| preset(n, &[("mock-ready-delay-ms", "100")])).collect(),
    );

    let callers: Vec<_> = names
        .iter()
        .map(|&name| {
            let registry = Arc::clone(&router.registry);
            thread::spawn(move || registry.ensure_loaded(name, true))
        })
        .collect();
    for caller in callers {
        match caller.join().unwrap() {
            // The caller whose model got evicted while loading.
            Ok(()) | Err(RouterError::NotReady(_)) | Err(RouterError::LoadFailed { .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    let loaded = names
        .iter()
        .filter(|n| router.status(n) == ModelStatus::Loaded)
        .count();
    assert_eq!(loaded, 2, "trace: {:?}", router.trace());
    router.assert_valid_transitions();
}

#[test]
fn test_unrenderable_preset_does_not_evict() {
    let router = Router::new(1, vec![preset("a", &[]), preset("b", &[("not-an-option", "1")])]);

    router.registry.ensure_loaded("a", true).unwrap();
    assert!(matches!(
        router.registry.ensure_loaded("b", true),
        Err(RouterError::Config(_))
    ));

    assert_eq!(router.status("a"), ModelStatus::Loaded);
    assert_eq!(router.status("b"), ModelStatus::Unloaded);
    assert_eq!(router.position("a", ModelStatus::Unloading), None);
    router.assert_valid_transitions();
}

#[test]
fn test_lru_evicts_least_recently_used() {
    let router = Router::new(2, vec![preset("a", &[]), preset("b", &[]), preset("c", &[])]);

    router.registry.ensure_loaded("a", true).unwrap();
    router.registry.ensure_loaded("b", true).unwrap();
    // Touch "a" so "b" becomes the least recently used.
    let mut response = router
        .registry
        .route("a", get("/health"), never(), true)
        .unwrap();
    assert_eq!(response.head().status, 200);
    drop(response);

    router.registry.ensure_loaded("c", true).unwrap();
    assert_eq!(router.status("a"), ModelStatus::Loaded);
    assert_eq!(router.status("b"), ModelStatus::Unloaded);
    assert_eq!(router.status("c"), ModelStatus::Loaded);
}

#[test]
fn test_pinned_model_is_never_evicted() {
    let router = Router::new(1, vec![preset("a", &[("pin", "true")]), preset("b", &[])]);

    router.registry.ensure_loaded("a", true).unwrap();
    router.registry.ensure_loaded("b", true).unwrap();

    // Nothing could be evicted, so the limit is exceeded rather than
    // unloading the pinned model.
    assert_eq!(router.status("a"), ModelStatus::Loaded);
    assert_eq!(router.status("b"), ModelStatus::Loaded);
}

#[test]
fn test_graceful_unload() {
    let router = Router::new(4, vec![preset("a", &[])]);
    router.registry.ensure_loaded("a", true).unwrap();

    let start = Instant::now();
    router.registry.unload("a").unwrap();
    assert!(router.wait_for_status("a", ModelStatus::Unloaded, LOAD_TIMEOUT));
    assert!(start.elapsed() < Duration::from_secs(5));

    let meta = router.registry.get_meta("a").unwrap();
    assert_eq!(meta.exit_code, Some(0));
    assert!(!meta.failed());
    assert_eq!(meta.port, None);
    assert_eq!(
        router.trace(),
        vec![
            ("a".to_string(), ModelStatus::Loading),
            ("a".to_string(), ModelStatus::Loaded),
            ("a".to_string(), ModelStatus::Unloading),
            ("a".to_string(), ModelStatus::Unloaded),
        ]
    );
}

#[cfg(unix)]
#[test]
fn test_forced_kill_after_stop_timeout() {
    let router = Router::new(
        4,
        vec![preset("a", &[("mock-ignore-exit", "true"), ("stop-timeout", "1")])],
    );
    router.registry.ensure_loaded("a", true).unwrap();

    let start = Instant::now();
    router.registry.unload("a").unwrap();
    assert_eq!(router.status("a"), ModelStatus::Unloading);

    // Requests for an unloading model fail fast.
    assert!(matches!(
        router.registry.ensure_loaded("a", true),
        Err(RouterError::NotReady(_))
    ));

    assert!(router.wait_for_status("a", ModelStatus::Unloaded, LOAD_TIMEOUT));
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(1), "killed after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(4), "killed after {elapsed:?}");
    assert_eq!(router.registry.get_meta("a").unwrap().exit_code, Some(128 + 9));
}

#[cfg(unix)]
#[test]
fn test_worker_crash_is_recorded() {
    let router = Router::new(4, vec![preset("a", &[("mock-kill-self-after-ms", "200")])]);
    router.registry.ensure_loaded("a", true).unwrap();

    assert!(router.wait_for_status("a", ModelStatus::Unloaded, LOAD_TIMEOUT));
    let meta = router.registry.get_meta("a").unwrap();
    assert_eq!(meta.exit_code, Some(137));
    assert!(meta.failed());
    // Loaded went straight to Unloaded.
    assert_eq!(router.position("a", ModelStatus::Unloading), None);

    // A crashed model can be loaded again.
    router.registry.ensure_loaded("a", true).unwrap();
}

#[test]
fn test_load_failure_reports_exit_code() {
    let router = Router::new(4, vec![preset("a", &[("mock-fail-startup", "3")])]);

    match router.registry.ensure_loaded("a", true) {
        Err(RouterError::LoadFailed { name, exit_code }) => {
            assert_eq!(name, "a");
            assert_eq!(exit_code, 3);
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(router.status("a"), ModelStatus::Unloaded);
    assert!(router.registry.get_meta("a").unwrap().failed());
}

#[test]
fn test_no_autoload_rejects_unloaded_model() {
    let router = Router::new(4, vec![preset("a", &[])]);
    assert!(matches!(
        router.registry.route("a", get("/health"), never(), false),
        Err(RouterError::NotLoaded(_))
    ));
    assert!(router.trace().is_empty());
}

#[test]
fn test_proxy_streams_chunks_in_order() {
    let router = Router::new(4, vec![preset("a", &[])]);

    let mut response = router
        .registry
        .route("a", get("/chunks?n=20&delay_ms=5"), never(), true)
        .unwrap();
    assert_eq!(response.head().status, 200);

    let body: Vec<u8> = response.by_ref().map(|chunk| chunk.unwrap()).flatten().collect();
    let expected: String = (0..20).map(|i| format!("c{i}\n")).collect();
    assert_eq!(String::from_utf8(body).unwrap(), expected);
}

#[test]
fn test_proxy_strips_duplicate_headers() {
    let router = Router::new(4, vec![preset("a", &[])]);

    let mut response = router
        .registry
        .route("a", get("/props"), never(), true)
        .unwrap();
    let head = response.head();
    assert_eq!(head.status, 200);

    let names: Vec<String> = head.headers.iter().map(|(k, _)| k.to_ascii_lowercase()).collect();
    assert!(names.contains(&"x-mock-alias".to_string()), "{names:?}");
    assert_eq!(head.content_type(), Some("application/json"));
    for stripped in ["server", "content-length", "transfer-encoding", "access-control-allow-origin"] {
        assert!(!names.contains(&stripped.to_string()), "{stripped} in {names:?}");
    }

    let body: Vec<u8> = response.by_ref().filter_map(Result::ok).flatten().collect();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["alias"], "a");
}

#[test]
fn test_proxy_forwards_post_body() {
    let router = Router::new(4, vec![preset("a", &[])]);
    let request = ProxyRequest {
        method: "POST".into(),
        path: "/v1/completions".into(),
        headers: vec![("content-type".into(), "application/json".into())],
        body: br#"{"model":"a","prompt":"hi"}"#.to_vec(),
    };

    let mut response = router.registry.route("a", request, never(), true).unwrap();
    let head = response.head();
    assert_eq!(head.status, 200);
    assert!(head
        .headers
        .iter()
        .any(|(k, v)| k.eq_ignore_ascii_case("x-echo-path") && v == "/v1/completions"));
    let body: Vec<u8> = response.by_ref().filter_map(Result::ok).flatten().collect();
    assert_eq!(body, br#"{"model":"a","prompt":"hi"}"#.to_vec());
}

#[test]
fn test_proxy_cancellation_within_poll_interval() {
    let router = Router::new(4, vec![preset("a", &[])]);
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    let should_stop: StopSignal = Arc::new(move || flag.load(Ordering::SeqCst));

    let mut response = router
        .registry
        .route("a", get("/slow"), should_stop, true)
        .unwrap();
    assert_eq!(response.head().status, 200);
    assert!(response.next_chunk().unwrap().is_ok());

    stop.store(true, Ordering::SeqCst);
    let start = Instant::now();
    // Chunks already queued may still arrive, but the stream must end.
    while response.next_chunk().is_some() {}
    assert!(start.elapsed() < POLL_INTERVAL * 2);
    assert!(response.is_cancelled());
}
