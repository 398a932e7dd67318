use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::json;
use url::Url;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use report_harvester::{
    AppConfig, BrowserAutomation, BrowserCookie, BrowserError, DateWindow, HarvestError,
    HarvesterBuilder, RuntimeConfig,
};

struct FakeBrowser {
    logins: AtomicUsize,
}

#[async_trait]
impl BrowserAutomation for FakeBrowser {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn capture_cookies(
        &self,
        _url: &Url,
        _settle: Duration,
    ) -> Result<Vec<BrowserCookie>, BrowserError> {
        let login = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(vec![BrowserCookie::new("sid", format!("login-{login}"))])
    }
}

fn quiet_runtime(output: &std::path::Path) -> RuntimeConfig {
    RuntimeConfig {
        output_dir: output.to_path_buf(),
        settle_delay_secs: 0,
        page_delay_secs: 0,
        backoff_step_secs: 0,
        batch_pause_secs: 0,
        item_pause_secs: 0,
        ..RuntimeConfig::default()
    }
}

fn config_for(server: &MockServer) -> AppConfig {
    let uri = server.uri();
    AppConfig::from_json_str(&format!(
        r#"{{
            "baseUrl_login": "{uri}/login",
            "baseUrl_industry": "{uri}/search",
            "params": {{"pageSize": 2, "reportType": "INDUSTRY"}},
            "report_overview_url": "{uri}/report"
        }}"#
    ))
    .unwrap()
}

async fn mount_report(server: &MockServer, id: &str, payload: &'static [u8]) {
    Mock::given(method("GET"))
        .and(path(format!("/report/{id}/pdf")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"downloadUrl": format!("{}/files/{id}.pdf", server.uri())}
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/files/{id}.pdf")))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(payload))
        .expect(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn harvests_every_listed_report() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .and(query_param("pageNow", "1"))
        .and(query_param("reportType", "INDUSTRY"))
        .and(header("cookie", "sid=login-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"pageCount": 2, "list": [
                {"type": "EXTERNAL_REPORT", "data": {"id": 101}},
                {"type": "EXTERNAL_REPORT", "data": {"id": 102}}
            ]}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .and(query_param("pageNow", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"pageCount": 2, "list": [
                {"type": "EXTERNAL_REPORT", "data": {"id": 102}},
                {"type": "EXTERNAL_REPORT", "data": {"id": 103}},
                {"type": "ANNOUNCEMENT", "data": {"id": 900}}
            ]}
        })))
        .mount(&server)
        .await;
    mount_report(&server, "101", b"%PDF-101").await;
    mount_report(&server, "102", b"%PDF-102").await;
    // 103 keeps failing and is skipped after three attempts.
    Mock::given(method("GET"))
        .and(path("/report/103/pdf"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let browser = Arc::new(FakeBrowser {
        logins: AtomicUsize::new(0),
    });
    let harvester = HarvesterBuilder::new(config_for(&server).site)
        .with_runtime(quiet_runtime(dir.path()))
        .with_browser(browser.clone())
        .with_window(DateWindow::ending_on(NaiveDate::from_ymd_opt(2024, 6, 3).unwrap()))
        .build()
        .unwrap();

    let summary = harvester.run().await.unwrap();

    assert_eq!(summary.discovered, 3);
    assert_eq!(summary.attempted, 3);
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(browser.logins.load(Ordering::SeqCst), 1);
    assert_eq!(std::fs::read(dir.path().join("101.pdf")).unwrap(), b"%PDF-101");
    assert_eq!(std::fs::read(dir.path().join("102.pdf")).unwrap(), b"%PDF-102");
    assert!(!dir.path().join("103.pdf").exists());
}

#[tokio::test]
async fn expired_session_logs_in_again() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"pageCount": 1, "list": [
                {"type": "EXTERNAL_REPORT", "data": {"id": "r-7"}}
            ]}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/report/r-7/pdf"))
        .and(header("cookie", "sid=login-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {}})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/report/r-7/pdf"))
        .and(header("cookie", "sid=login-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"downloadUrl": format!("{}/files/r-7.pdf", server.uri())}
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/files/r-7.pdf"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"%PDF".as_slice()))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let browser = Arc::new(FakeBrowser {
        logins: AtomicUsize::new(0),
    });
    let harvester = HarvesterBuilder::new(config_for(&server).site)
        .with_runtime(quiet_runtime(dir.path()))
        .with_browser(browser.clone())
        .build()
        .unwrap();

    let summary = harvester.run().await.unwrap();
    assert_eq!(summary.succeeded, 1);
    assert_eq!(browser.logins.load(Ordering::SeqCst), 2);
    assert!(dir.path().join("r-7.pdf").exists());
}

#[tokio::test]
async fn listing_failure_aborts_the_run() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let harvester = HarvesterBuilder::new(config_for(&server).site)
        .with_runtime(quiet_runtime(dir.path()))
        .with_browser(Arc::new(FakeBrowser {
            logins: AtomicUsize::new(0),
        }))
        .build()
        .unwrap();

    let err = harvester.run().await.unwrap_err();
    assert!(matches!(err, HarvestError::Listing(_)));
}
