//! Browser automation integrations.
//!
//! Credential acquisition needs a real browser to run the site's login
//! scripts. The harvester only cares about the cookies the browser ends up
//! holding, so the capability is reduced to a single call that visits a URL
//! and reports the resulting cookie set.

mod webdriver;

pub use webdriver::{BrowserKind, WebDriverBrowser};

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Cookie as reported by the browser after navigation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowserCookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}

impl BrowserCookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: None,
            path: None,
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    /// `name=value` pair suitable for a cookie jar.
    pub fn pair(&self) -> String {
        format!("{}={}", self.name, self.value)
    }
}

/// Shared interface implemented by browser drivers.
#[async_trait]
pub trait BrowserAutomation: Send + Sync {
    fn name(&self) -> &'static str;

    /// Navigate headlessly to `url`, wait `settle` for scripts to finish and
    /// return every cookie the browser holds afterwards.
    async fn capture_cookies(
        &self,
        url: &Url,
        settle: Duration,
    ) -> Result<Vec<BrowserCookie>, BrowserError>;
}

/// Failures produced by browser drivers.
#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("invalid driver endpoint: {0}")]
    Endpoint(#[from] url::ParseError),
    #[error("driver command `{command}` timed out")]
    Timeout { command: &'static str },
    #[error("driver transport error during `{command}`: {message}")]
    Transport {
        command: &'static str,
        message: String,
    },
    #[error("driver rejected `{command}`: {error} ({message})")]
    Driver {
        command: &'static str,
        error: String,
        message: String,
    },
    #[error("driver returned status {status} for `{command}`")]
    Status { command: &'static str, status: u16 },
    #[error("unexpected driver payload for `{command}`: {message}")]
    Decode {
        command: &'static str,
        message: String,
    },
}
