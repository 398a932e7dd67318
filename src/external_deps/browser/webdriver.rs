//! W3C WebDriver adapter.
//!
//! Talks to a locally running `msedgedriver`/`chromedriver` over its HTTP
//! wire protocol. A fresh browser session is created for every capture and
//! always deleted afterwards, even when navigation fails.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::time::sleep;
use url::Url;

use super::{BrowserAutomation, BrowserCookie, BrowserError};

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Browser flavour driven through WebDriver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrowserKind {
    #[default]
    Edge,
    Chrome,
}

impl BrowserKind {
    fn browser_name(self) -> &'static str {
        match self {
            BrowserKind::Edge => "MicrosoftEdge",
            BrowserKind::Chrome => "chrome",
        }
    }

    fn options_key(self) -> &'static str {
        match self {
            BrowserKind::Edge => "ms:edgeOptions",
            BrowserKind::Chrome => "goog:chromeOptions",
        }
    }
}

/// Headless browser reachable through a WebDriver endpoint.
#[derive(Debug, Clone)]
pub struct WebDriverBrowser {
    endpoint: String,
    kind: BrowserKind,
    args: Vec<String>,
    client: Client,
}

impl WebDriverBrowser {
    pub fn new(endpoint: &str, kind: BrowserKind) -> Result<Self, BrowserError> {
        Self::with_timeout(endpoint, kind, DEFAULT_COMMAND_TIMEOUT)
    }

    /// Every driver command is bounded by `command_timeout`.
    pub fn with_timeout(
        endpoint: &str,
        kind: BrowserKind,
        command_timeout: Duration,
    ) -> Result<Self, BrowserError> {
        let parsed = Url::parse(endpoint)?;
        let client = Client::builder()
            .timeout(command_timeout)
            .build()
            .map_err(|err| BrowserError::Transport {
                command: "init",
                message: err.to_string(),
            })?;

        Ok(Self {
            endpoint: parsed.as_str().trim_end_matches('/').to_string(),
            kind,
            args: vec![
                "--headless".into(),
                "--ignore-certificate-errors".into(),
                "--ignore-ssl-errors".into(),
            ],
            client,
        })
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    async fn new_session(&self) -> Result<String, BrowserError> {
        let mut options = serde_json::Map::new();
        options.insert(self.kind.options_key().into(), json!({ "args": self.args }));
        options.insert("browserName".into(), json!(self.kind.browser_name()));
        options.insert("acceptInsecureCerts".into(), json!(true));

        let body = json!({ "capabilities": { "alwaysMatch": Value::Object(options) } });
        let created: NewSession = self
            .command("new_session", Method::POST, "session", Some(body))
            .await?;
        Ok(created.session_id)
    }

    async fn navigate_and_collect(
        &self,
        session_id: &str,
        url: &Url,
        settle: Duration,
    ) -> Result<Vec<BrowserCookie>, BrowserError> {
        let _: Value = self
            .command(
                "navigate",
                Method::POST,
                &format!("session/{session_id}/url"),
                Some(json!({ "url": url.as_str() })),
            )
            .await?;

        if !settle.is_zero() {
            sleep(settle).await;
        }

        self.command(
            "get_cookies",
            Method::GET,
            &format!("session/{session_id}/cookie"),
            None,
        )
        .await
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), BrowserError> {
        let _: Value = self
            .command(
                "delete_session",
                Method::DELETE,
                &format!("session/{session_id}"),
                None,
            )
            .await?;
        Ok(())
    }

    async fn command<T: DeserializeOwned>(
        &self,
        command: &'static str,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<T, BrowserError> {
        let url = format!("{}/{}", self.endpoint, path);
        let mut builder = self.client.request(method, url);
        if let Some(body) = body {
            builder = builder.json(&body);
        }

        let response = builder.send().await.map_err(|err| {
            if err.is_timeout() {
                BrowserError::Timeout { command }
            } else {
                BrowserError::Transport {
                    command,
                    message: err.to_string(),
                }
            }
        })?;

        let status = response.status();
        let payload: Option<Envelope<Value>> = response.json().await.ok();

        if !status.is_success() {
            let failure = payload
                .and_then(|envelope| serde_json::from_value::<DriverFailure>(envelope.value).ok());
            return Err(match failure {
                Some(failure) => BrowserError::Driver {
                    command,
                    error: failure.error,
                    message: failure.message,
                },
                None => BrowserError::Status {
                    command,
                    status: status.as_u16(),
                },
            });
        }

        let envelope = payload.ok_or_else(|| BrowserError::Decode {
            command,
            message: "response body is not a WebDriver envelope".into(),
        })?;
        serde_json::from_value(envelope.value).map_err(|err| BrowserError::Decode {
            command,
            message: err.to_string(),
        })
    }
}

#[async_trait]
impl BrowserAutomation for WebDriverBrowser {
    fn name(&self) -> &'static str {
        "webdriver"
    }

    async fn capture_cookies(
        &self,
        url: &Url,
        settle: Duration,
    ) -> Result<Vec<BrowserCookie>, BrowserError> {
        let session_id = self.new_session().await?;
        log::debug!("webdriver session {session_id} opened for {url}");

        let result = self.navigate_and_collect(&session_id, url, settle).await;

        if let Err(err) = self.delete_session(&session_id).await {
            log::warn!("failed to close webdriver session {session_id}: {err}");
        }

        result
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    value: T,
}

#[derive(Debug, Deserialize)]
struct NewSession {
    #[serde(rename = "sessionId")]
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct DriverFailure {
    error: String,
    #[serde(default)]
    message: String,
}
