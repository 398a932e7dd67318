use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;
use url::Url;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use report_harvester::crawl::Stage;
use report_harvester::{
    AuthenticationError, Backoff, BrowserCookie, DownloadEngine, DownloadError, DownloadOutcome,
    EventDispatcher, EventHandler, FileSink, HarvestEvent, ItemId, OverviewEndpoint, ProxyManager,
    ReportSink, RetryPolicy, Session, SessionOptions, SessionRefresher,
};

struct CountingRefresher {
    scope: Url,
    calls: AtomicUsize,
}

impl CountingRefresher {
    fn new(server: &MockServer) -> Arc<Self> {
        Arc::new(Self {
            scope: Url::parse(&server.uri()).unwrap(),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionRefresher for CountingRefresher {
    async fn refresh_session(&self) -> Result<Session, AuthenticationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Session::from_cookies(
            &[BrowserCookie::new("sid", "fresh")],
            &[self.scope.clone()],
            None,
            SessionOptions::default(),
        )?)
    }
}

/// Sink that counts writes on top of a real file sink.
struct CountingSink {
    inner: FileSink,
    writes: AtomicUsize,
}

#[async_trait]
impl ReportSink for CountingSink {
    async fn persist(&self, item: &ItemId, payload: Bytes) -> std::io::Result<PathBuf> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.persist(item, payload).await
    }
}

#[derive(Default)]
struct Recorder(Mutex<Vec<HarvestEvent>>);

impl EventHandler for Recorder {
    fn handle(&self, event: &HarvestEvent) {
        self.0.lock().unwrap().push(event.clone());
    }
}

fn session_for(server: &MockServer) -> Session {
    Session::from_cookies(
        &[BrowserCookie::new("sid", "stale")],
        &[Url::parse(&server.uri()).unwrap()],
        None,
        SessionOptions::default(),
    )
    .unwrap()
}

fn endpoint(server: &MockServer) -> OverviewEndpoint {
    OverviewEndpoint::parse(&format!("{}/report", server.uri())).unwrap()
}

fn counting_sink(dir: &tempfile::TempDir) -> Arc<CountingSink> {
    Arc::new(CountingSink {
        inner: FileSink::new(dir.path()),
        writes: AtomicUsize::new(0),
    })
}

async fn mount_payload(server: &MockServer, body: &'static [u8]) {
    Mock::given(method("GET"))
        .and(path("/files/r1.pdf"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
        .mount(server)
        .await;
}

fn overview_with_url(server: &MockServer) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "data": {"downloadUrl": format!("{}/files/r1.pdf", server.uri())}
    }))
}

#[tokio::test]
async fn missing_download_url_reauthenticates_once() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/report/r1/pdf"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {}})))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/report/r1/pdf"))
        .respond_with(overview_with_url(&server))
        .mount(&server)
        .await;
    mount_payload(&server, b"%PDF-1.4 report").await;

    let dir = tempfile::tempdir().unwrap();
    let sink = counting_sink(&dir);
    let refresher = CountingRefresher::new(&server);
    let engine = DownloadEngine::new(endpoint(&server), refresher.clone(), sink.clone())
        .with_retry_policy(RetryPolicy::new(3, Backoff::None));

    let mut session = session_for(&server);
    let outcome = engine
        .download_item(&mut session, &ItemId::new("r1"))
        .await
        .unwrap();

    match outcome {
        DownloadOutcome::Saved { path, attempts } => {
            assert_eq!(attempts, 2);
            assert_eq!(path, dir.path().join("r1.pdf"));
            assert_eq!(std::fs::read(path).unwrap(), b"%PDF-1.4 report");
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(refresher.calls(), 1);
    assert_eq!(sink.writes.load(Ordering::SeqCst), 1);

    let api = Url::parse(&server.uri()).unwrap();
    assert_eq!(session.cookie_header(&api).as_deref(), Some("sid=fresh"));
}

#[tokio::test]
async fn repeated_missing_url_fails_without_second_refresh() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/report/r1/pdf"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"downloadUrl": null}})))
        .expect(2)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let sink = counting_sink(&dir);
    let refresher = CountingRefresher::new(&server);
    let engine = DownloadEngine::new(endpoint(&server), refresher.clone(), sink.clone())
        .with_retry_policy(RetryPolicy::new(3, Backoff::None));

    let outcome = engine
        .download_item(&mut session_for(&server), &ItemId::new("r1"))
        .await
        .unwrap();

    assert!(matches!(
        outcome,
        DownloadOutcome::Failed {
            attempts: 2,
            error: DownloadError::MissingDownloadUrl
        }
    ));
    assert_eq!(refresher.calls(), 1);
    assert_eq!(sink.writes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn single_attempt_policy_does_not_reauthenticate() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/report/r1/pdf"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {}})))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let sink = counting_sink(&dir);
    let refresher = CountingRefresher::new(&server);
    let engine = DownloadEngine::new(endpoint(&server), refresher.clone(), sink.clone())
        .with_retry_policy(RetryPolicy::single_attempt());

    let mut session = session_for(&server);
    let outcome = engine
        .download_item(&mut session, &ItemId::new("r1"))
        .await
        .unwrap();

    assert!(matches!(
        outcome,
        DownloadOutcome::Failed {
            attempts: 1,
            error: DownloadError::MissingDownloadUrl
        }
    ));
    assert_eq!(refresher.calls(), 0);
    let api = Url::parse(&server.uri()).unwrap();
    assert_eq!(session.cookie_header(&api).as_deref(), Some("sid=stale"));
}

#[tokio::test]
async fn payload_on_sibling_host_receives_domain_cookie() {
    let api = MockServer::start().await;
    let files = MockServer::start().await;
    let api_port = api.address().port();
    let files_port = files.address().port();

    Mock::given(method("GET"))
        .and(path("/report/r1/pdf"))
        .and(header("cookie", "sid=abc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"downloadUrl": format!("http://static.example.test:{files_port}/files/r1.pdf")}
        })))
        .expect(1)
        .mount(&api)
        .await;
    Mock::given(method("GET"))
        .and(path("/files/r1.pdf"))
        .and(header("cookie", "sid=abc"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"%PDF-sibling".as_slice()))
        .expect(1)
        .mount(&files)
        .await;

    let login = Url::parse(&format!("http://robo.example.test:{api_port}/login")).unwrap();
    let overview = format!("http://gw.example.test:{api_port}/report");
    let options = SessionOptions::default()
        .with_resolved("robo.example.test", *api.address())
        .with_resolved("gw.example.test", *api.address())
        .with_resolved("static.example.test", *files.address());
    let mut session = Session::from_cookies(
        &[BrowserCookie::new("sid", "abc").with_domain(".example.test")],
        &[login, Url::parse(&overview).unwrap()],
        None,
        options,
    )
    .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let sink = counting_sink(&dir);
    let refresher = CountingRefresher::new(&api);
    let engine = DownloadEngine::new(
        OverviewEndpoint::parse(&overview).unwrap(),
        refresher.clone(),
        sink.clone(),
    )
    .with_retry_policy(RetryPolicy::single_attempt());

    let outcome = engine
        .download_item(&mut session, &ItemId::new("r1"))
        .await
        .unwrap();

    assert!(outcome.is_saved(), "unexpected outcome {outcome:?}");
    assert_eq!(
        std::fs::read(dir.path().join("r1.pdf")).unwrap(),
        b"%PDF-sibling"
    );
    assert_eq!(refresher.calls(), 0);
}

#[tokio::test]
async fn server_errors_exhaust_the_budget() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/report/r1/pdf"))
        .respond_with(ResponseTemplate::new(502))
        .expect(3)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let sink = counting_sink(&dir);
    let recorder = Arc::new(Recorder::default());
    let mut events = EventDispatcher::new();
    events.register_handler(recorder.clone());

    let engine = DownloadEngine::new(endpoint(&server), CountingRefresher::new(&server), sink.clone())
        .with_retry_policy(RetryPolicy::new(3, Backoff::None))
        .with_events(Arc::new(events));

    let outcome = engine
        .download_item(&mut session_for(&server), &ItemId::new("r1"))
        .await
        .unwrap();

    assert!(matches!(
        outcome,
        DownloadOutcome::Failed {
            attempts: 3,
            error: DownloadError::Status {
                stage: Stage::Overview,
                status: 502
            }
        }
    ));
    assert_eq!(sink.writes.load(Ordering::SeqCst), 0);

    let retries = recorder
        .0
        .lock()
        .unwrap()
        .iter()
        .filter(|event| matches!(event, HarvestEvent::Retry(_)))
        .count();
    assert_eq!(retries, 2);
}

#[tokio::test]
async fn payload_failure_recovers_on_next_attempt() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/report/r1/pdf"))
        .respond_with(overview_with_url(&server))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/files/r1.pdf"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_payload(&server, b"%PDF").await;

    let dir = tempfile::tempdir().unwrap();
    let engine = DownloadEngine::new(
        endpoint(&server),
        CountingRefresher::new(&server),
        counting_sink(&dir),
    )
    .with_retry_policy(RetryPolicy::new(3, Backoff::None));

    let outcome = engine
        .download_item(&mut session_for(&server), &ItemId::new("r1"))
        .await
        .unwrap();
    assert!(matches!(outcome, DownloadOutcome::Saved { attempts: 2, .. }));
}

#[tokio::test]
async fn slow_payload_is_a_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/report/r1/pdf"))
        .respond_with(overview_with_url(&server))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/files/r1.pdf"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_secs(2))
                .set_body_bytes(b"%PDF".as_slice()),
        )
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let engine = DownloadEngine::new(
        endpoint(&server),
        CountingRefresher::new(&server),
        counting_sink(&dir),
    )
    .with_retry_policy(RetryPolicy::single_attempt())
    .with_timeouts(Duration::from_secs(5), Duration::from_millis(200));

    let outcome = engine
        .download_item(&mut session_for(&server), &ItemId::new("r1"))
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        DownloadOutcome::Failed {
            attempts: 1,
            error: DownloadError::Timeout {
                stage: Stage::Payload
            }
        }
    ));
}

#[tokio::test]
async fn malformed_download_url_is_terminal() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/report/r1/pdf"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"data": {"downloadUrl": "::nope::"}})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let engine = DownloadEngine::new(
        endpoint(&server),
        CountingRefresher::new(&server),
        counting_sink(&dir),
    )
    .with_retry_policy(RetryPolicy::new(3, Backoff::None));

    let outcome = engine
        .download_item(&mut session_for(&server), &ItemId::new("r1"))
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        DownloadOutcome::Failed {
            attempts: 1,
            error: DownloadError::InvalidUrl(_)
        }
    ));
}

#[tokio::test]
async fn network_failure_marks_the_session_proxy() {
    let dead = "http://127.0.0.1:9".to_string();
    let pool = ProxyManager::default();
    pool.add_proxy(dead.clone());

    let recorder = Arc::new(Recorder::default());
    let mut events = EventDispatcher::new();
    events.register_handler(recorder.clone());

    let server = MockServer::start().await;
    let session = Session::from_cookies(
        &[BrowserCookie::new("sid", "x")],
        &[Url::parse(&server.uri()).unwrap()],
        Some(dead.clone()),
        SessionOptions::default(),
    )
    .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let engine = DownloadEngine::new(
        endpoint(&server),
        CountingRefresher::new(&server),
        counting_sink(&dir),
    )
    .with_retry_policy(RetryPolicy::single_attempt())
    .with_timeouts(Duration::from_secs(2), Duration::from_secs(2))
    .with_proxy_pool(pool.clone())
    .with_events(Arc::new(events));

    let mut session = session;
    let outcome = engine
        .download_item(&mut session, &ItemId::new("r1"))
        .await
        .unwrap();

    assert!(!outcome.is_saved());
    assert_eq!(pool.status().failure_counts.get(&dead), Some(&1));
    assert_eq!(session.proxy(), Some(dead.as_str()));
    assert!(recorder
        .0
        .lock()
        .unwrap()
        .iter()
        .any(|event| matches!(event, HarvestEvent::ProxyRotated(_))));
}
