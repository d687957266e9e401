//! End-to-end crawl runs: scheduling, injection, retry and cancellation

use crate::{html_page, test_config};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use sumi_harvest::crawler::{RetryNotice, RunState};
use sumi_harvest::{Crawler, HarvestError, ResponseContext, Task};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn ok_page(title: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(html_page(title, ""), "text/html")
}

/// Provider that only counts invocations
fn counting(calls: &Arc<AtomicUsize>) -> impl Fn(ResponseContext) -> std::future::Ready<anyhow::Result<()>> {
    let calls = calls.clone();
    move |_context: ResponseContext| {
        calls.fetch_add(1, Ordering::SeqCst);
        std::future::ready(Ok(()))
    }
}

#[tokio::test]
async fn test_two_seeds_run_to_quiescence() {
    let server = MockServer::start().await;
    for page in ["/one", "/two"] {
        Mock::given(method("GET"))
            .and(path(page))
            .respond_with(ok_page(page))
            .expect(1)
            .mount(&server)
            .await;
    }

    let calls = Arc::new(AtomicUsize::new(0));
    let crawler = Crawler::builder(test_config(1, 0))
        .provider(counting(&calls))
        .build()
        .unwrap();
    let mut errors = crawler.subscribe_errors();
    crawler.seed([format!("{}/one", server.uri()), format!("{}/two", server.uri())]);

    let summary = crawler.run().await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(summary.requests_succeeded, 2);
    assert_eq!(summary.failures, 0);
    assert_eq!(summary.peak_in_flight, 1);
    assert!(crawler.queue().is_empty());
    assert!(errors.try_recv().is_err());
}

#[tokio::test]
async fn test_followed_pages_are_processed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(html_page(
                "Index",
                r#"<a href="/a">a</a><a href="/b">b</a><a href="/c">c</a>"#,
            )),
        )
        .mount(&server)
        .await;
    for page in ["/a", "/b", "/c"] {
        Mock::given(method("GET"))
            .and(path(page))
            .respond_with(ok_page(page))
            .expect(1)
            .mount(&server)
            .await;
    }

    let processed = Arc::new(Mutex::new(Vec::new()));
    let seen = processed.clone();
    let crawler = Crawler::builder(test_config(2, 0))
        .provider(move |context: ResponseContext| {
            let seen = seen.clone();
            async move {
                let links = context.document().links();
                seen.lock().unwrap().push(context.request().url.clone());
                if context.request().url.ends_with('/') {
                    for link in links {
                        assert!(context.follow(link));
                    }
                }
                Ok::<_, anyhow::Error>(())
            }
        })
        .build()
        .unwrap();
    crawler.seed([format!("{}/", server.uri())]);

    let summary = crawler.run().await;

    assert_eq!(processed.lock().unwrap().len(), 4);
    assert_eq!(summary.injected, 3);
    assert_eq!(summary.dispatched, 4);
}

#[tokio::test]
async fn test_follow_sends_origin_as_referer() {
    let server = MockServer::start().await;
    let list_url = format!("{}/list", server.uri());

    Mock::given(method("GET"))
        .and(path("/list"))
        .respond_with(ok_page("List"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/item"))
        .and(header("referer", list_url.as_str()))
        .respond_with(ok_page("Item"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/override"))
        .and(header("referer", "https://search.example/"))
        .respond_with(ok_page("Override"))
        .expect(1)
        .mount(&server)
        .await;

    let base = server.uri();
    let crawler = Crawler::builder(test_config(2, 0))
        .provider(move |context: ResponseContext| {
            let base = base.clone();
            async move {
                if context.request().url.ends_with("/list") {
                    context.follow(format!("{}/item", base));
                    context.follow(
                        sumi_harvest::crawler::RequestTask::get(format!("{}/override", base))
                            .with_header("Referer", "https://search.example/"),
                    );
                }
                Ok::<_, anyhow::Error>(())
            }
        })
        .build()
        .unwrap();
    let mut errors = crawler.subscribe_errors();
    crawler.seed([list_url.clone()]);

    let summary = crawler.run().await;

    assert_eq!(summary.requests_succeeded, 3);
    assert!(errors.try_recv().is_err());
}

#[tokio::test]
async fn test_follow_after_stop_is_noop() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/start"))
        .respond_with(ok_page("Start"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/never"))
        .respond_with(ok_page("Never"))
        .expect(0)
        .mount(&server)
        .await;

    let state: Arc<OnceLock<RunState>> = Arc::new(OnceLock::new());
    let followed = Arc::new(AtomicBool::new(true));

    let run_state = state.clone();
    let flag = followed.clone();
    let base = server.uri();
    let crawler = Crawler::builder(test_config(1, 0))
        .provider(move |context: ResponseContext| {
            let run_state = run_state.clone();
            let flag = flag.clone();
            let base = base.clone();
            async move {
                if let Some(state) = run_state.get() {
                    state.stop();
                }
                flag.store(context.follow(format!("{}/never", base)), Ordering::SeqCst);
                Ok::<_, anyhow::Error>(())
            }
        })
        .build()
        .unwrap();
    let _ = state.set(crawler.run_state().clone());
    crawler.seed([format!("{}/start", server.uri())]);

    crawler.run().await;

    assert!(!followed.load(Ordering::SeqCst));
    assert!(crawler.queue().is_empty());
}

#[tokio::test]
async fn test_explicit_retry_duplicates_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/flaky-content"))
        .respond_with(ok_page("Content"))
        .expect(2)
        .mount(&server)
        .await;

    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    let crawler = Crawler::builder(test_config(1, 0))
        .provider(move |context: ResponseContext| {
            let first = seen.fetch_add(1, Ordering::SeqCst) == 0;
            async move {
                if first {
                    assert!(context.retry());
                }
                Ok::<_, anyhow::Error>(())
            }
        })
        .build()
        .unwrap();
    crawler.seed([format!("{}/flaky-content", server.uri())]);

    let summary = crawler.run().await;

    // The callback ran for both the original and the replayed request
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(summary.requests_succeeded, 2);
}

#[tokio::test]
async fn test_exhausted_retries_reported_once() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/down"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/up"))
        .respond_with(ok_page("Up"))
        .expect(1)
        .mount(&server)
        .await;

    let notices: Arc<Mutex<Vec<RetryNotice>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = notices.clone();
    let calls = Arc::new(AtomicUsize::new(0));
    let crawler = Crawler::builder(test_config(1, 2))
        .provider(counting(&calls))
        .on_retry(move |notice| sink.lock().unwrap().push(notice.clone()))
        .build()
        .unwrap();
    let mut errors = crawler.subscribe_errors();
    let down = format!("{}/down", server.uri());
    crawler.seed([down.clone(), format!("{}/up", server.uri())]);

    let summary = crawler.run().await;

    let notices = notices.lock().unwrap();
    assert_eq!(notices.len(), 2);
    assert_eq!((notices[0].attempt, notices[0].remaining), (1, 2));
    assert_eq!((notices[1].attempt, notices[1].remaining), (2, 1));

    let event = errors.try_recv().unwrap();
    assert_eq!(event.task.url(), down);
    assert!(matches!(
        *event.error,
        HarvestError::Exhausted { attempts: 3, .. }
    ));
    assert!(errors.try_recv().is_err());

    // The scheduler kept going after the failure
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(summary.failures, 1);
}

#[tokio::test]
async fn test_provider_error_does_not_stop_other_tasks() {
    let server = MockServer::start().await;
    for page in ["/bad", "/good"] {
        Mock::given(method("GET"))
            .and(path(page))
            .respond_with(ok_page(page))
            .expect(1)
            .mount(&server)
            .await;
    }

    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    let crawler = Crawler::builder(test_config(1, 3))
        .provider(move |context: ResponseContext| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                if context.url().ends_with("/bad") {
                    anyhow::bail!("missing price field");
                }
                Ok(())
            }
        })
        .build()
        .unwrap();
    let mut errors = crawler.subscribe_errors();
    crawler.seed([format!("{}/bad", server.uri()), format!("{}/good", server.uri())]);

    let summary = crawler.run().await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(summary.provider_errors, 1);

    let event = errors.try_recv().unwrap();
    assert!(matches!(event.task, Task::Request(ref r) if r.url.ends_with("/bad")));
    match &*event.error {
        HarvestError::Provider { source, .. } => {
            assert_eq!(source.to_string(), "missing price field");
        }
        other => panic!("expected provider error, got {:?}", other),
    }
    assert!(errors.try_recv().is_err());
}

#[tokio::test]
async fn test_provider_panic_is_reported() {
    let server = MockServer::start().await;
    for page in ["/crash", "/fine"] {
        Mock::given(method("GET"))
            .and(path(page))
            .respond_with(ok_page(page))
            .expect(1)
            .mount(&server)
            .await;
    }

    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    let crawler = Crawler::builder(test_config(1, 0))
        .provider(move |context: ResponseContext| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                if context.url().ends_with("/crash") {
                    panic!("layout changed");
                }
                Ok::<_, anyhow::Error>(())
            }
        })
        .build()
        .unwrap();
    let mut errors = crawler.subscribe_errors();
    crawler.seed([format!("{}/crash", server.uri()), format!("{}/fine", server.uri())]);

    let summary = crawler.run().await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(summary.requests_succeeded, 2);
    assert_eq!(summary.provider_errors, 1);

    let event = errors.try_recv().unwrap();
    assert!(matches!(event.task, Task::Request(ref r) if r.url.ends_with("/crash")));
    match &*event.error {
        HarvestError::Provider { source, .. } => {
            assert!(source.to_string().contains("layout changed"));
        }
        other => panic!("expected provider error, got {:?}", other),
    }
    assert!(errors.try_recv().is_err());
}

#[tokio::test]
async fn test_overlapping_runs_share_one_ceiling() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ok_page("Slow").set_delay(Duration::from_millis(100)))
        .expect(6)
        .mount(&server)
        .await;

    let crawler = Crawler::builder(test_config(2, 0)).build().unwrap();
    crawler.seed((0..6).map(|i| format!("{}/page/{}", server.uri(), i)));

    let (first, second) = tokio::join!(crawler.run(), crawler.run());

    assert_eq!(first.peak_in_flight, 2);
    assert_eq!(second.peak_in_flight, 2);
    assert_eq!(second.requests_succeeded, 6);
    assert!(crawler.queue().is_empty());
}

#[tokio::test]
async fn test_concurrency_ceiling_holds() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ok_page("Slow").set_delay(Duration::from_millis(100)))
        .expect(6)
        .mount(&server)
        .await;

    let crawler = Crawler::builder(test_config(2, 0)).build().unwrap();
    crawler.seed((0..6).map(|i| format!("{}/page/{}", server.uri(), i)));

    let summary = crawler.run().await;

    assert_eq!(summary.requests_succeeded, 6);
    assert_eq!(summary.peak_in_flight, 2);
}

#[tokio::test]
async fn test_interval_spaces_dispatch_starts() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ok_page("Page"))
        .mount(&server)
        .await;

    let starts: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = starts.clone();
    let mut config = test_config(3, 0);
    config.crawler.interval = 150;

    let crawler = Crawler::builder(config)
        .pre_request(move |_request| sink.lock().unwrap().push(Instant::now()))
        .build()
        .unwrap();
    crawler.seed((0..3).map(|i| format!("{}/p{}", server.uri(), i)));

    crawler.run().await;

    let starts = starts.lock().unwrap();
    assert_eq!(starts.len(), 3);
    for pair in starts.windows(2) {
        // Hook timing adds a little jitter on top of the dispatch start
        assert!(pair[1] - pair[0] >= Duration::from_millis(130));
    }
}

#[tokio::test]
async fn test_cancel_aborts_in_flight_and_halts_dispatch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ok_page("Slow").set_delay(Duration::from_secs(10)))
        .mount(&server)
        .await;

    let calls = Arc::new(AtomicUsize::new(0));
    let mut config = test_config(2, 3);
    config.crawler.timeout = 30_000;
    let crawler = Crawler::builder(config)
        .provider(counting(&calls))
        .build()
        .unwrap();
    let mut errors = crawler.subscribe_errors();
    crawler.seed((0..5).map(|i| format!("{}/slow/{}", server.uri(), i)));

    let state = crawler.run_state().clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        state.cancel();
    });

    let started = Instant::now();
    let summary = crawler.run().await;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(summary.dispatched, 2);
    assert_eq!(crawler.queue().len(), 3);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    for _ in 0..2 {
        let event = errors.try_recv().unwrap();
        assert!(event.error.is_cancelled());
    }
    assert!(errors.try_recv().is_err());
}
