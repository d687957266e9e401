//! Download tasks queued and executed from extraction callbacks

use crate::{html_page, test_config};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use sumi_harvest::crawler::{DownloadOptions, RetryNotice};
use sumi_harvest::{Crawler, HarvestError, ResponseContext, Task};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn test_queued_download_inherits_headers_without_accept() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/gallery"))
        .and(header("accept", "text/html"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(html_page("Gallery", r#"<a href="/files/photo.bin">photo</a>"#)),
        )
        .expect(1)
        .mount(&server)
        .await;
    // reqwest falls back to `*/*` once the inherited Accept is gone
    Mock::given(method("GET"))
        .and(path("/files/photo.bin"))
        .and(header("accept", "*/*"))
        .and(header("x-session", "abc"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![42u8; 2048]))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let target_dir = dir.path().to_path_buf();

    let mut config = test_config(2, 0);
    config.headers.insert("Accept".to_string(), "text/html".to_string());
    config.headers.insert("X-Session".to_string(), "abc".to_string());

    let crawler = Crawler::builder(config)
        .provider(move |context: ResponseContext| {
            let target_dir = target_dir.clone();
            async move {
                let links = context.document().links();
                for link in links {
                    let name = link.rsplit('/').next().unwrap_or("file").to_string();
                    assert!(context.queue_download(link, target_dir.join("media").join(name), DownloadOptions::default()));
                }
                Ok::<_, anyhow::Error>(())
            }
        })
        .build()
        .unwrap();
    let mut errors = crawler.subscribe_errors();
    crawler.seed([format!("{}/gallery", server.uri())]);

    let summary = crawler.run().await;

    assert!(errors.try_recv().is_err());
    assert_eq!(summary.requests_succeeded, 1);
    assert_eq!(summary.downloads_succeeded, 1);
    assert_eq!(
        std::fs::read(dir.path().join("media/photo.bin")).unwrap(),
        vec![42u8; 2048]
    );
}

#[tokio::test]
async fn test_inline_download_completes_before_callback_returns() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/report"))
        .respond_with(ResponseTemplate::new(200).set_body_string(html_page("Report", "")))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/report.csv"))
        .respond_with(ResponseTemplate::new(200).set_body_string("a,b\n1,2\n"))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("report.csv");
    let observed: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

    let sink = observed.clone();
    let file = target.clone();
    let base = server.uri();
    let crawler = Crawler::builder(test_config(1, 0))
        .provider(move |context: ResponseContext| {
            let sink = sink.clone();
            let file = file.clone();
            let base = base.clone();
            async move {
                let written = context
                    .download(format!("{}/report.csv", base), &file, DownloadOptions::default())
                    .await?;
                assert_eq!(written, 8);
                *sink.lock().unwrap() = Some(std::fs::read_to_string(&file)?);
                Ok::<_, anyhow::Error>(())
            }
        })
        .build()
        .unwrap();
    crawler.seed([format!("{}/report", server.uri())]);

    let summary = crawler.run().await;

    assert_eq!(observed.lock().unwrap().as_deref(), Some("a,b\n1,2\n"));
    // Inline downloads bypass the queue
    assert_eq!(summary.dispatched, 1);
    assert_eq!(summary.injected, 0);
}

#[tokio::test]
async fn test_failed_download_is_reported_with_its_task() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/index"))
        .respond_with(ResponseTemplate::new(200).set_body_string(html_page("Index", "")))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/missing.zip"))
        .respond_with(ResponseTemplate::new(404))
        .expect(3)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let target: PathBuf = dir.path().join("missing.zip");
    let file = target.clone();
    let base = server.uri();
    let notices: Arc<Mutex<Vec<RetryNotice>>> = Arc::new(Mutex::new(Vec::new()));
    let recorded = notices.clone();

    let crawler = Crawler::builder(test_config(1, 2))
        .provider(move |context: ResponseContext| {
            context.queue_download(
                format!("{}/missing.zip", base),
                file.clone(),
                DownloadOptions::default(),
            );
            async { Ok::<_, anyhow::Error>(()) }
        })
        .on_retry(move |notice: &RetryNotice| recorded.lock().unwrap().push(notice.clone()))
        .build()
        .unwrap();
    let mut errors = crawler.subscribe_errors();
    crawler.seed([format!("{}/index", server.uri())]);

    let summary = crawler.run().await;

    assert_eq!(summary.failures, 1);
    let event = errors.try_recv().unwrap();
    match &event.task {
        Task::Download(download) => assert_eq!(download.filepath, target),
        other => panic!("expected download task, got {:?}", other),
    }
    match &*event.error {
        HarvestError::Exhausted { attempts, last, .. } => {
            assert_eq!(*attempts, 3);
            assert!(matches!(**last, HarvestError::Status { status: 404, .. }));
        }
        other => panic!("expected exhausted error, got {:?}", other),
    }
    assert!(errors.try_recv().is_err());

    let notices = notices.lock().unwrap();
    let progress: Vec<_> = notices.iter().map(|n| (n.attempt, n.remaining)).collect();
    assert_eq!(progress, vec![(1, 2), (2, 1)]);
    assert!(!target.exists());
}
