//! Per-report download state machine.
//!
//! Each attempt resolves the download URL through the overview endpoint,
//! fetches the payload and hands it to the sink. A missing download URL on
//! the first attempt is read as an expired session: when the policy allows
//! another attempt, the session is replaced once through the
//! [`SessionRefresher`] and the item is retried without a backoff. Network failures back off according to the retry policy. When
//! the budget is spent the item is reported as failed and never re-queued.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tokio::time::sleep;
use url::Url;

use super::auth::{AuthenticationError, SessionRefresher};
use super::retry::RetryPolicy;
use super::session::Session;
use super::sink::ReportSink;
use super::types::ItemId;
use crate::modules::events::{
    EventDispatcher, HarvestEvent, ProxyRotationEvent, ReauthEvent, RetryEvent,
};
use crate::modules::proxy::ProxyManager;

const DEFAULT_OVERVIEW_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_PAYLOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// Request stage an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Overview,
    Payload,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Overview => f.write_str("overview"),
            Stage::Payload => f.write_str("payload"),
        }
    }
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("{stage} request timed out")]
    Timeout { stage: Stage },
    #[error("{stage} request failed: {source}")]
    Transport {
        stage: Stage,
        #[source]
        source: reqwest::Error,
    },
    #[error("{stage} request returned status {status}")]
    Status { stage: Stage, status: u16 },
    #[error("overview response is not JSON: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("overview response has no download url")]
    MissingDownloadUrl,
    #[error("invalid url {0}")]
    InvalidUrl(String),
    #[error("failed to persist report: {0}")]
    Persist(#[source] std::io::Error),
}

impl DownloadError {
    /// Failures that back off and retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DownloadError::Timeout { .. }
                | DownloadError::Transport { .. }
                | DownloadError::Status { .. }
                | DownloadError::Decode(_)
        )
    }

    fn from_reqwest(stage: Stage, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            DownloadError::Timeout { stage }
        } else {
            DownloadError::Transport { stage, source }
        }
    }
}

/// Final state of one item.
#[derive(Debug)]
pub enum DownloadOutcome {
    Saved { path: PathBuf, attempts: u32 },
    Failed { attempts: u32, error: DownloadError },
}

impl DownloadOutcome {
    pub fn is_saved(&self) -> bool {
        matches!(self, DownloadOutcome::Saved { .. })
    }
}

/// Where the per-report overview lives.
///
/// A `{id}` placeholder is substituted; otherwise `/<id>/pdf` is appended to
/// the base.
#[derive(Debug, Clone)]
pub enum OverviewEndpoint {
    Template(String),
    Base(Url),
}

impl OverviewEndpoint {
    pub fn parse(raw: &str) -> Result<Self, url::ParseError> {
        if raw.contains("{id}") {
            Url::parse(&raw.replace("{id}", "id"))?;
            Ok(OverviewEndpoint::Template(raw.to_string()))
        } else {
            Ok(OverviewEndpoint::Base(Url::parse(raw)?))
        }
    }

    /// URL on the overview host, for scoping session cookies.
    pub fn scope(&self) -> Option<Url> {
        match self {
            OverviewEndpoint::Template(template) => Url::parse(&template.replace("{id}", "id")).ok(),
            OverviewEndpoint::Base(base) => Some(base.clone()),
        }
    }

    pub fn url_for(&self, item: &ItemId) -> Result<Url, DownloadError> {
        match self {
            OverviewEndpoint::Template(template) => {
                let encoded: String =
                    url::form_urlencoded::byte_serialize(item.as_str().as_bytes()).collect();
                let raw = template.replace("{id}", &encoded);
                Url::parse(&raw).map_err(|_| DownloadError::InvalidUrl(raw))
            }
            OverviewEndpoint::Base(base) => {
                let mut url = base.clone();
                url.path_segments_mut()
                    .map_err(|_| DownloadError::InvalidUrl(base.to_string()))?
                    .pop_if_empty()
                    .push(item.as_str())
                    .push("pdf");
                Ok(url)
            }
        }
    }
}

/// Downloads reports one at a time.
pub struct DownloadEngine {
    overview: OverviewEndpoint,
    refresher: Arc<dyn SessionRefresher>,
    sink: Arc<dyn ReportSink>,
    retry: RetryPolicy,
    overview_timeout: Duration,
    payload_timeout: Duration,
    proxy_pool: Option<ProxyManager>,
    events: Arc<EventDispatcher>,
}

impl DownloadEngine {
    pub fn new(
        overview: OverviewEndpoint,
        refresher: Arc<dyn SessionRefresher>,
        sink: Arc<dyn ReportSink>,
    ) -> Self {
        Self {
            overview,
            refresher,
            sink,
            retry: RetryPolicy::default(),
            overview_timeout: DEFAULT_OVERVIEW_TIMEOUT,
            payload_timeout: DEFAULT_PAYLOAD_TIMEOUT,
            proxy_pool: None,
            events: Arc::new(EventDispatcher::new()),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeouts(mut self, overview: Duration, payload: Duration) -> Self {
        self.overview_timeout = overview;
        self.payload_timeout = payload;
        self
    }

    /// Report proxy health to `pool` and re-route on network failures.
    pub fn with_proxy_pool(mut self, pool: ProxyManager) -> Self {
        self.proxy_pool = Some(pool);
        self
    }

    pub fn with_events(mut self, events: Arc<EventDispatcher>) -> Self {
        self.events = events;
        self
    }

    /// Drive one item to completion.
    ///
    /// `session` may be replaced by a refreshed or re-routed session. Only a
    /// failed re-authentication escapes as an error; everything else ends up
    /// in the outcome.
    pub async fn download_item(
        &self,
        session: &mut Session,
        item: &ItemId,
    ) -> Result<DownloadOutcome, AuthenticationError> {
        let max_attempts = self.retry.max_attempts();
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            let error = match self.attempt(session, item).await {
                Ok(path) => {
                    if let (Some(pool), Some(proxy)) = (&self.proxy_pool, session.proxy()) {
                        pool.mark_success(proxy);
                    }
                    return Ok(DownloadOutcome::Saved {
                        path,
                        attempts: attempt,
                    });
                }
                Err(error) => error,
            };

            match error {
                DownloadError::MissingDownloadUrl
                    if attempt == 1 && self.retry.allows_retry_after(attempt) =>
                {
                    self.events.dispatch(HarvestEvent::Reauthenticated(ReauthEvent {
                        item: item.clone(),
                        timestamp: Utc::now(),
                    }));
                    *session = self.refresher.refresh_session().await?;
                    last_error = Some(DownloadError::MissingDownloadUrl);
                }
                error if error.is_retryable() => {
                    self.reroute_after_failure(session);
                    if self.retry.allows_retry_after(attempt) {
                        let delay = self.retry.delay_after(attempt);
                        self.events.dispatch(HarvestEvent::Retry(RetryEvent {
                            item: item.clone(),
                            attempt,
                            max_attempts,
                            reason: error.to_string(),
                            scheduled_after: delay,
                            timestamp: Utc::now(),
                        }));
                        if !delay.is_zero() {
                            sleep(delay).await;
                        }
                    }
                    last_error = Some(error);
                }
                error => {
                    return Ok(DownloadOutcome::Failed {
                        attempts: attempt,
                        error,
                    });
                }
            }
        }

        Ok(DownloadOutcome::Failed {
            attempts: max_attempts,
            error: last_error.unwrap_or(DownloadError::MissingDownloadUrl),
        })
    }

    async fn attempt(&self, session: &Session, item: &ItemId) -> Result<PathBuf, DownloadError> {
        let download_url = self.resolve_download_url(session, item).await?;
        let payload = self.fetch_payload(session, download_url).await?;
        self.sink
            .persist(item, payload)
            .await
            .map_err(DownloadError::Persist)
    }

    async fn resolve_download_url(
        &self,
        session: &Session,
        item: &ItemId,
    ) -> Result<Url, DownloadError> {
        let url = self.overview.url_for(item)?;
        let response = session
            .client()
            .get(url)
            .timeout(self.overview_timeout)
            .send()
            .await
            .map_err(|err| DownloadError::from_reqwest(Stage::Overview, err))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Status {
                stage: Stage::Overview,
                status: status.as_u16(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|err| DownloadError::from_reqwest(Stage::Overview, err))?;
        let overview: Value = serde_json::from_slice(&body).map_err(DownloadError::Decode)?;

        let raw = overview
            .get("data")
            .and_then(|data| data.get("downloadUrl"))
            .and_then(Value::as_str)
            .filter(|raw| !raw.is_empty())
            .ok_or(DownloadError::MissingDownloadUrl)?;

        Url::parse(raw).map_err(|_| DownloadError::InvalidUrl(raw.to_string()))
    }

    async fn fetch_payload(&self, session: &Session, url: Url) -> Result<Bytes, DownloadError> {
        let response = session
            .client()
            .get(url)
            .timeout(self.payload_timeout)
            .send()
            .await
            .map_err(|err| DownloadError::from_reqwest(Stage::Payload, err))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Status {
                stage: Stage::Payload,
                status: status.as_u16(),
            });
        }

        response
            .bytes()
            .await
            .map_err(|err| DownloadError::from_reqwest(Stage::Payload, err))
    }

    fn reroute_after_failure(&self, session: &mut Session) {
        let Some(pool) = &self.proxy_pool else {
            return;
        };
        let Some(current) = session.proxy().map(str::to_string) else {
            return;
        };

        pool.mark_failure(&current);
        pool.rotate();
        let next = pool.select().map(|record| record.address);

        match session.reroute(next.clone()) {
            Ok(rerouted) => {
                self.events.dispatch(HarvestEvent::ProxyRotated(ProxyRotationEvent {
                    from: current,
                    to: next,
                    timestamp: Utc::now(),
                }));
                *session = rerouted;
            }
            Err(err) => log::warn!("keeping proxy {current}: {err}"),
        }
    }
}
