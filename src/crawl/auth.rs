//! Credential bootstrap.
//!
//! The browser capability visits the login page and hands back whatever
//! cookies it collected; those seed a fresh [`Session`]. This is the only way
//! a session is created, both at start-up and when a download detects that
//! the previous session expired.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use url::Url;

use super::session::{Session, SessionError, SessionOptions};
use crate::external_deps::{BrowserAutomation, BrowserError};
use crate::modules::events::{EventDispatcher, HarvestEvent, SessionEvent};
use crate::modules::proxy::ProxyManager;

const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum AuthenticationError {
    #[error("browser automation failed: {0}")]
    Browser(#[from] BrowserError),
    #[error("login page {url} produced no cookies")]
    NoCookies { url: Url },
    #[error("could not build session: {0}")]
    Session(#[from] SessionError),
}

/// Capability used by the download engine to replace an expired session.
#[async_trait]
pub trait SessionRefresher: Send + Sync {
    async fn refresh_session(&self) -> Result<Session, AuthenticationError>;
}

/// Turns a login page visit into an authenticated [`Session`].
pub struct CredentialBootstrapper {
    browser: Arc<dyn BrowserAutomation>,
    settle_delay: Duration,
    extra_scopes: Vec<Url>,
    proxy_pool: Option<ProxyManager>,
    events: Arc<EventDispatcher>,
}

impl CredentialBootstrapper {
    pub fn new(browser: Arc<dyn BrowserAutomation>) -> Self {
        Self {
            browser,
            settle_delay: DEFAULT_SETTLE_DELAY,
            extra_scopes: Vec::new(),
            proxy_pool: None,
            events: Arc::new(EventDispatcher::new()),
        }
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Additional URLs whose hosts should receive the login cookies.
    pub fn with_scope(mut self, url: Url) -> Self {
        self.extra_scopes.push(url);
        self
    }

    /// Route every new session through a proxy picked from `pool`.
    pub fn with_proxy_pool(mut self, pool: ProxyManager) -> Self {
        self.proxy_pool = Some(pool);
        self
    }

    pub fn with_events(mut self, events: Arc<EventDispatcher>) -> Self {
        self.events = events;
        self
    }

    pub async fn acquire_session(&self, login_url: &Url) -> Result<Session, AuthenticationError> {
        log::info!("logging in through {} at {login_url}", self.browser.name());
        let cookies = self
            .browser
            .capture_cookies(login_url, self.settle_delay)
            .await
            .inspect_err(|err| log::error!("login failed: {err}"))?;

        if cookies.is_empty() {
            log::error!("login failed: no cookies returned for {login_url}");
            return Err(AuthenticationError::NoCookies {
                url: login_url.clone(),
            });
        }

        let mut scopes = Vec::with_capacity(self.extra_scopes.len() + 1);
        scopes.push(login_url.clone());
        scopes.extend(self.extra_scopes.iter().cloned());

        let proxy = self
            .proxy_pool
            .as_ref()
            .and_then(|pool| pool.select())
            .map(|record| record.address);

        let session = Session::from_cookies(
            &cookies,
            &scopes,
            proxy,
            SessionOptions::browser_like(login_url),
        )?;

        self.events.dispatch(HarvestEvent::SessionAcquired(SessionEvent {
            cookies: session.cookie_count(),
            proxy: session.proxy().map(str::to_string),
            timestamp: Utc::now(),
        }));
        Ok(session)
    }
}

/// [`SessionRefresher`] that logs in again through a bootstrapper.
pub struct LoginRefresher {
    bootstrapper: Arc<CredentialBootstrapper>,
    login_url: Url,
}

impl LoginRefresher {
    pub fn new(bootstrapper: Arc<CredentialBootstrapper>, login_url: Url) -> Self {
        Self {
            bootstrapper,
            login_url,
        }
    }
}

#[async_trait]
impl SessionRefresher for LoginRefresher {
    async fn refresh_session(&self) -> Result<Session, AuthenticationError> {
        self.bootstrapper.acquire_session(&self.login_url).await
    }
}
