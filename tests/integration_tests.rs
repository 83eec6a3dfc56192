use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bucket_dispatch::{
    BucketKey, DispatchError, Dispatcher, DispatcherConfig, Invocation, Response,
    TransportFailure,
};
use http::{HeaderName, HeaderValue, StatusCode};
use tokio::time::Instant;

type Reply = Result<Response, TransportFailure>;

/// Execution log shared by scripted invocations: (label, instant).
#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<(&'static str, Instant)>>>);

impl Recorder {
    fn record(&self, label: &'static str) {
        self.0.lock().unwrap().push((label, Instant::now()));
    }

    fn labels(&self) -> Vec<&'static str> {
        self.0.lock().unwrap().iter().map(|(label, _)| *label).collect()
    }

    fn times(&self, label: &'static str) -> Vec<Instant> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|(l, _)| *l == label)
            .map(|(_, at)| *at)
            .collect()
    }
}

/// An invocation answering with `replies` in order, then with plain 200s.
fn scripted(label: &'static str, recorder: &Recorder, replies: Vec<Reply>) -> impl Invocation {
    let replies = Arc::new(Mutex::new(VecDeque::from(replies)));
    let recorder = recorder.clone();
    move || {
        recorder.record(label);
        let reply = replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(ok()));
        async move { reply }
    }
}

fn ok() -> Response {
    Response::new(StatusCode::OK)
}

fn header(name: &'static str, value: &str) -> (HeaderName, HeaderValue) {
    (
        HeaderName::from_static(name),
        HeaderValue::from_str(value).unwrap(),
    )
}

fn with_headers(mut response: Response, pairs: &[(&'static str, &str)]) -> Response {
    for (name, value) in pairs {
        let (name, value) = header(*name, value);
        response = response.with_header(name, value);
    }
    response
}

fn too_many_requests(pairs: &[(&'static str, &str)], body: &str) -> Response {
    with_headers(Response::new(StatusCode::TOO_MANY_REQUESTS), pairs).with_body(body)
}

fn dispatcher() -> Dispatcher {
    Dispatcher::new(DispatcherConfig::default()).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_same_bucket_resolves_in_submission_order() {
    let dispatcher = dispatcher();
    let recorder = Recorder::default();
    let resolved = Arc::new(Mutex::new(Vec::new()));
    let labels = ["r0", "r1", "r2", "r3", "r4"];

    let handles: Vec<_> = labels
        .iter()
        .enumerate()
        .map(|(index, label)| {
            let handle =
                dispatcher.submit("translate", None, scripted(*label, &recorder, vec![]));
            let resolved = Arc::clone(&resolved);
            handle.on_complete(move |_| resolved.lock().unwrap().push(index));
            handle
        })
        .collect();

    for handle in &handles {
        assert!(handle.wait().await.is_ok());
    }

    assert_eq!(recorder.labels(), labels);
    assert_eq!(*resolved.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    assert_eq!(dispatcher.stats().workers_spawned, 1);
}

#[tokio::test(start_paused = true)]
async fn test_bucket_registered_only_while_queue_non_empty() {
    let dispatcher = dispatcher();
    let key = BucketKey::new("translate").with_major_parameter("doc-1");
    let slow = || async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok::<_, TransportFailure>(ok())
    };

    assert!(!dispatcher.is_active(&key));
    let handles: Vec<_> = (0..3).map(|_| dispatcher.submit_to(key.clone(), slow)).collect();
    assert!(dispatcher.is_active(&key));
    assert_eq!(dispatcher.queue_len(&key), 3);
    assert_eq!(dispatcher.active_buckets(), vec![key.clone()]);

    handles[0].wait().await.unwrap();
    assert!(dispatcher.is_active(&key));
    assert_eq!(dispatcher.queue_len(&key), 2);

    handles[2].wait().await.unwrap();
    assert!(!dispatcher.is_active(&key));
    assert_eq!(dispatcher.queue_len(&key), 0);
    assert_eq!(dispatcher.active_bucket_count(), 0);

    // A later submission re-creates the bucket with a fresh worker
    dispatcher.submit_to(key.clone(), slow).wait().await.unwrap();
    assert_eq!(dispatcher.stats().workers_spawned, 2);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_bucket_waits_for_reset() {
    let dispatcher = dispatcher();
    let recorder = Recorder::default();
    let exhausted = with_headers(
        ok(),
        &[("x-ratelimit-remaining", "0"), ("x-ratelimit-reset", "1.5")],
    );

    let first = dispatcher.submit("translate", None, scripted("first", &recorder, vec![Ok(exhausted)]));
    let second = dispatcher.submit("translate", None, scripted("second", &recorder, vec![]));
    // Other buckets are unaffected
    let other = dispatcher.submit("detect", None, scripted("other", &recorder, vec![]));

    first.wait().await.unwrap();
    other.wait().await.unwrap();
    second.wait().await.unwrap();

    let first_at = recorder.times("first")[0];
    let second_at = recorder.times("second")[0];
    let waited = second_at - first_at;
    assert!(waited >= Duration::from_millis(1500), "waited {waited:?}");
    assert!(waited < Duration::from_millis(1600), "waited {waited:?}");
    assert_eq!(recorder.times("other")[0], first_at);
}

#[tokio::test(start_paused = true)]
async fn test_route_throttle_retries_head_in_place() {
    let dispatcher = dispatcher();
    let recorder = Recorder::default();
    let throttled = too_many_requests(&[("via", "1.1 proxy")], r#"{"retry_after": 0.5}"#);

    let first = dispatcher.submit("translate", None, scripted("first", &recorder, vec![Ok(throttled)]));
    let second = dispatcher.submit("translate", None, scripted("second", &recorder, vec![]));

    let response = first.wait().await.unwrap();
    assert_eq!(response.status, StatusCode::OK);
    second.wait().await.unwrap();

    assert_eq!(recorder.labels(), ["first", "first", "second"]);
    let attempts = recorder.times("first");
    assert!(attempts[1] - attempts[0] >= Duration::from_millis(500));

    let stats = dispatcher.stats();
    assert_eq!(stats.route_throttles, 1);
    assert_eq!(stats.completed, 2);
    assert_eq!(stats.failed, 0);
}

#[tokio::test(start_paused = true)]
async fn test_global_throttle_defers_every_bucket() {
    let dispatcher = dispatcher();
    let recorder = Recorder::default();
    let start = Instant::now();
    let global = too_many_requests(
        &[("via", "1.1 proxy"), ("x-ratelimit-global", "true")],
        r#"{"retry_after": 2.0}"#,
    );

    let first = dispatcher.submit("translate", None, scripted("first", &recorder, vec![Ok(global)]));
    while recorder.times("first").is_empty() {
        tokio::task::yield_now().await;
    }
    assert_eq!(dispatcher.global_resume_in(), Duration::from_secs(2));

    let other = dispatcher.submit(
        "detect",
        Some("doc-9".to_string()),
        scripted("other", &recorder, vec![]),
    );

    first.wait().await.unwrap();
    other.wait().await.unwrap();

    let observed_at = recorder.times("first")[0];
    assert_eq!(observed_at, start);
    assert!(recorder.times("first")[1] - observed_at >= Duration::from_secs(2));
    assert!(recorder.times("other")[0] - observed_at >= Duration::from_secs(2));
    assert_eq!(dispatcher.stats().global_throttles, 1);
}

#[tokio::test(start_paused = true)]
async fn test_edge_ban_fails_request_and_sets_global_throttle() {
    let dispatcher = dispatcher();
    let recorder = Recorder::default();
    let ban = too_many_requests(&[("retry-after", "5")], "");

    let banned = dispatcher.submit("translate", None, scripted("banned", &recorder, vec![Ok(ban)]));
    match banned.wait().await {
        Err(DispatchError::Banned {
            retry_after,
            response,
            ..
        }) => {
            assert_eq!(retry_after, Duration::from_secs(5));
            assert_eq!(response.status, StatusCode::TOO_MANY_REQUESTS);
        }
        other => panic!("expected a ban, got {other:?}"),
    }
    assert!(dispatcher.global_resume_in() >= Duration::from_secs(5));
    assert_eq!(recorder.labels(), ["banned"]);

    let next = dispatcher.submit("detect", None, scripted("next", &recorder, vec![]));
    next.wait().await.unwrap();
    let banned_at = recorder.times("banned")[0];
    assert!(recorder.times("next")[0] - banned_at >= Duration::from_secs(5));

    let stats = dispatcher.stats();
    assert_eq!(stats.bans, 1);
    assert_eq!(stats.failed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_edge_ban_with_huge_retry_after_does_not_block() {
    let dispatcher = dispatcher();
    let recorder = Recorder::default();
    let ban = too_many_requests(&[("retry-after", "1e19")], "");

    let banned = dispatcher.submit("translate", None, scripted("banned", &recorder, vec![Ok(ban)]));
    match banned.wait().await {
        Err(DispatchError::Banned { retry_after, .. }) => {
            assert_eq!(retry_after, Duration::from_secs(10_000_000_000_000_000_000));
        }
        other => panic!("expected a ban, got {other:?}"),
    }
    assert_eq!(dispatcher.global_resume_in(), Duration::ZERO);

    let next = dispatcher.submit("detect", None, scripted("next", &recorder, vec![]));
    assert!(next.wait().await.is_ok());
    assert_eq!(recorder.times("banned"), recorder.times("next"));
}

#[tokio::test(start_paused = true)]
async fn test_transport_failure_still_updates_bucket() {
    let dispatcher = dispatcher();
    let recorder = Recorder::default();
    let failure = TransportFailure::new("internal server error").with_response(with_headers(
        Response::new(StatusCode::INTERNAL_SERVER_ERROR),
        &[("x-ratelimit-remaining", "0"), ("x-ratelimit-reset", "1")],
    ));

    let failed = dispatcher.submit("translate", None, scripted("failed", &recorder, vec![Err(failure)]));
    let next = dispatcher.submit("translate", None, scripted("next", &recorder, vec![]));

    let err = failed.wait().await.unwrap_err();
    assert!(matches!(err, DispatchError::Transport { .. }));
    assert_eq!(
        err.response().map(|r| r.status),
        Some(StatusCode::INTERNAL_SERVER_ERROR)
    );
    assert_eq!(err.request().key, BucketKey::new("translate"));

    next.wait().await.unwrap();
    assert!(recorder.times("next")[0] - recorder.times("failed")[0] >= Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_bounded_retries_give_up() {
    let config = DispatcherConfig {
        max_throttle_retries: Some(2),
        ..DispatcherConfig::default()
    };
    let dispatcher = Dispatcher::new(config).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&calls);
    let always_throttled = move || {
        counter.fetch_add(1, Ordering::SeqCst);
        async {
            Ok::<_, TransportFailure>(too_many_requests(
                &[("via", "1.1 proxy")],
                r#"{"retry_after": 0.1}"#,
            ))
        }
    };

    let handle = dispatcher.submit("translate", None, always_throttled);
    let after = dispatcher.submit("translate", None, || async { Ok::<_, TransportFailure>(ok()) });

    match handle.wait().await {
        Err(DispatchError::RetriesExhausted { attempts, .. }) => assert_eq!(attempts, 3),
        other => panic!("expected retries to run out, got {other:?}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(after.wait().await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_panicking_invocation_does_not_stall_bucket() {
    let dispatcher = dispatcher();
    let panicking = || async {
        if true {
            panic!("serializer exploded");
        }
        Ok::<_, TransportFailure>(ok())
    };

    let broken = dispatcher.submit("translate", None, panicking);
    let next = dispatcher.submit("translate", None, || async { Ok::<_, TransportFailure>(ok()) });

    match broken.wait().await {
        Err(DispatchError::InvocationPanicked { message, .. }) => {
            assert_eq!(message, "serializer exploded")
        }
        other => panic!("expected a caught panic, got {other:?}"),
    }
    assert!(next.wait().await.is_ok());
    assert_eq!(dispatcher.active_bucket_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_fault_while_handling_response_does_not_stall_bucket() {
    let dispatcher = dispatcher();
    let recorder = Recorder::default();
    let unreachable_reset = with_headers(
        ok(),
        &[("x-ratelimit-remaining", "0"), ("x-ratelimit-reset", "1e19")],
    );

    let first = dispatcher.submit_to(
        BucketKey::new("translate"),
        scripted("first", &recorder, vec![Ok(unreachable_reset)]),
    );
    let second = dispatcher.submit_to(
        BucketKey::new("translate"),
        scripted("second", &recorder, vec![]),
    );

    let resolutions = Arc::new(AtomicUsize::new(0));
    first.on_complete(|_| panic!("continuation exploded"));
    let counter = Arc::clone(&resolutions);
    first.on_complete(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let response = first.wait().await.unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert!(second.wait().await.is_ok());

    assert_eq!(resolutions.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.labels(), vec!["first", "second"]);
    assert_eq!(recorder.times("first"), recorder.times("second"));
    assert_eq!(dispatcher.active_bucket_count(), 0);

    let stats = dispatcher.stats();
    assert_eq!(stats.completed, 2);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.cancelled, 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_request_is_skipped() {
    let dispatcher = dispatcher();
    let recorder = Recorder::default();

    let first = dispatcher.submit("translate", None, scripted("first", &recorder, vec![]));
    let second = dispatcher.submit("translate", None, scripted("second", &recorder, vec![]));
    let third = dispatcher.submit("translate", None, scripted("third", &recorder, vec![]));

    assert!(second.cancel());
    assert!(!second.cancel());

    first.wait().await.unwrap();
    third.wait().await.unwrap();
    assert!(matches!(
        second.wait().await,
        Err(DispatchError::Cancelled { .. })
    ));

    assert_eq!(recorder.labels(), ["first", "third"]);
    let stats = dispatcher.stats();
    assert_eq!(stats.cancelled, 1);
    assert_eq!(stats.completed, 2);
    assert_eq!(stats.resolved(), stats.submitted);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_submitters_keep_one_worker_per_bucket() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 25;
    const KEYS: usize = 4;

    let dispatcher = dispatcher();
    let active: Arc<Vec<AtomicUsize>> = Arc::new((0..KEYS).map(|_| AtomicUsize::new(0)).collect());
    let overlap = Arc::new(AtomicBool::new(false));
    let log: Arc<Mutex<HashMap<usize, Vec<(usize, usize)>>>> = Arc::default();

    let submitters: Vec<_> = (0..THREADS)
        .map(|thread| {
            let dispatcher = dispatcher.clone();
            let active = Arc::clone(&active);
            let overlap = Arc::clone(&overlap);
            let log = Arc::clone(&log);
            std::thread::spawn(move || {
                let handles: Vec<_> = (0..PER_THREAD)
                    .map(|seq| {
                        let key = seq % KEYS;
                        let active = Arc::clone(&active);
                        let overlap = Arc::clone(&overlap);
                        let log = Arc::clone(&log);
                        dispatcher.submit(format!("endpoint-{key}"), None, move || {
                            let active = Arc::clone(&active);
                            let overlap = Arc::clone(&overlap);
                            let log = Arc::clone(&log);
                            async move {
                                if active[key].fetch_add(1, Ordering::SeqCst) != 0 {
                                    overlap.store(true, Ordering::SeqCst);
                                }
                                log.lock().unwrap().entry(key).or_default().push((thread, seq));
                                tokio::task::yield_now().await;
                                active[key].fetch_sub(1, Ordering::SeqCst);
                                Ok::<_, TransportFailure>(ok())
                            }
                        })
                    })
                    .collect();

                // Blocking wait from a thread outside the runtime
                for handle in &handles {
                    assert!(handle.wait_blocking().is_ok());
                }
            })
        })
        .collect();

    tokio::task::spawn_blocking(move || {
        for submitter in submitters {
            submitter.join().unwrap();
        }
    })
    .await
    .unwrap();

    assert!(!overlap.load(Ordering::SeqCst), "two workers ran one bucket concurrently");

    let log = log.lock().unwrap();
    let executed: usize = log.values().map(Vec::len).sum();
    assert_eq!(executed, THREADS * PER_THREAD);
    for entries in log.values() {
        for thread in 0..THREADS {
            let seqs: Vec<usize> = entries
                .iter()
                .filter(|(t, _)| *t == thread)
                .map(|(_, seq)| *seq)
                .collect();
            assert!(seqs.windows(2).all(|pair| pair[0] < pair[1]), "out of order: {seqs:?}");
        }
    }

    let stats = dispatcher.stats();
    assert_eq!(stats.submitted, (THREADS * PER_THREAD) as u64);
    assert_eq!(stats.completed, stats.submitted);
    assert_eq!(dispatcher.active_bucket_count(), 0);
}
