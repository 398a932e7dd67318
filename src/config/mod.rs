//! Settings and configuration module
//!
//! The site section names the endpoints to harvest; the optional `runtime`
//! section tunes pacing, timeouts, retries and proxy usage. Everything is
//! loaded from a single JSON document.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use url::Url;

use crate::crawl::{Backoff, OverviewEndpoint, RetryPolicy, Throttle};
use crate::external_deps::BrowserKind;

/// Environment variable overriding the configuration path.
pub const CONFIG_PATH_ENV: &str = "HARVESTER_CONFIG";

/// Default configuration path, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "configs/sites.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid url for `{field}`: {source}")]
    Url {
        field: &'static str,
        #[source]
        source: url::ParseError,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Endpoints of the harvested site.
#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    #[serde(rename = "baseUrl_login")]
    pub base_url_login: String,
    #[serde(rename = "baseUrl_industry")]
    pub base_url_industry: String,
    #[serde(default)]
    pub params: Map<String, Value>,
    pub report_overview_url: String,
}

impl SiteConfig {
    pub fn login_url(&self) -> Result<Url, ConfigError> {
        parse_url("baseUrl_login", &self.base_url_login)
    }

    pub fn listing_url(&self) -> Result<Url, ConfigError> {
        parse_url("baseUrl_industry", &self.base_url_industry)
    }

    /// `{id}` in the overview setting is substituted; a bare base gets
    /// `/<id>/pdf` appended.
    pub fn overview_endpoint(&self) -> Result<OverviewEndpoint, ConfigError> {
        OverviewEndpoint::parse(&self.report_overview_url).map_err(|source| ConfigError::Url {
            field: "report_overview_url",
            source,
        })
    }
}

/// Tunables for a harvest run. Every field has a default.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub output_dir: PathBuf,
    pub webdriver_url: String,
    pub browser: BrowserKind,
    pub settle_delay_secs: u64,
    pub page_delay_secs: u64,
    pub listing_timeout_secs: u64,
    pub overview_timeout_secs: u64,
    pub payload_timeout_secs: u64,
    pub max_attempts: u32,
    pub backoff_step_secs: u64,
    pub batch_size: usize,
    pub batch_pause_secs: u64,
    pub item_pause_secs: u64,
    pub proxies_file: Option<PathBuf>,
    pub max_proxy_failures: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("reports"),
            webdriver_url: "http://localhost:9515".into(),
            browser: BrowserKind::Edge,
            settle_delay_secs: 5,
            page_delay_secs: 1,
            listing_timeout_secs: 30,
            overview_timeout_secs: 30,
            payload_timeout_secs: 60,
            max_attempts: 3,
            backoff_step_secs: 10,
            batch_size: 5,
            batch_pause_secs: 10,
            item_pause_secs: 3,
            proxies_file: None,
            max_proxy_failures: 3,
        }
    }
}

impl RuntimeConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_delay_secs)
    }

    pub fn page_delay(&self) -> Duration {
        Duration::from_secs(self.page_delay_secs)
    }

    pub fn listing_timeout(&self) -> Duration {
        Duration::from_secs(self.listing_timeout_secs)
    }

    pub fn overview_timeout(&self) -> Duration {
        Duration::from_secs(self.overview_timeout_secs)
    }

    pub fn payload_timeout(&self) -> Duration {
        Duration::from_secs(self.payload_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Backoff::Linear(Duration::from_secs(self.backoff_step_secs)),
        )
    }

    pub fn throttle(&self) -> Throttle {
        Throttle::new(
            self.batch_size,
            Duration::from_secs(self.batch_pause_secs),
            Duration::from_secs(self.item_pause_secs),
        )
    }
}

/// Complete configuration document.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(flatten)]
    pub site: SiteConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl AppConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    /// Load from `$HARVESTER_CONFIG`, falling back to `configs/sites.json`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let path = std::env::var_os(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::from_path(path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.site.login_url()?;
        self.site.listing_url()?;
        self.site.overview_endpoint()?;
        parse_url("runtime.webdriver_url", &self.runtime.webdriver_url)?;

        if self.runtime.max_attempts == 0 {
            return Err(ConfigError::Invalid("runtime.max_attempts must be at least 1".into()));
        }
        if self.runtime.batch_size == 0 {
            return Err(ConfigError::Invalid("runtime.batch_size must be at least 1".into()));
        }
        if self.runtime.max_proxy_failures == 0 {
            return Err(ConfigError::Invalid(
                "runtime.max_proxy_failures must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn parse_url(field: &'static str, raw: &str) -> Result<Url, ConfigError> {
    Url::parse(raw).map_err(|source| ConfigError::Url { field, source })
}
