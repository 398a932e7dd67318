//! # report-harvester
//!
//! Harvests research reports from an authenticated web portal.
//!
//! A headless browser logs in once and hands its cookies to an HTTP
//! [`Session`]. The paged listing endpoint is walked for the publication
//! window ending today, and every report id found is downloaded sequentially
//! with bounded retries, a single re-login when the session looks expired and
//! fixed-rate pacing. Requests can optionally be routed through a rotating
//! proxy pool, which the `refresh-proxies` binary discovers and validates.
//!
//! ## Example
//!
//! ```no_run
//! use report_harvester::{AppConfig, Harvester};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let harvester = Harvester::from_config(AppConfig::from_env()?)?;
//!     let summary = harvester.run().await?;
//!     println!("saved {} of {} reports", summary.succeeded, summary.attempted);
//!     Ok(())
//! }
//! ```

mod harvester;

pub mod config;
pub mod crawl;
pub mod external_deps;
pub mod logging;
pub mod modules;

pub use crate::harvester::{
    HarvestError,
    HarvestResult,
    HarvestSummary,
    Harvester,
    HarvesterBuilder,
};

pub use crate::config::{AppConfig, ConfigError, RuntimeConfig, SiteConfig};

pub use crate::crawl::{
    AuthenticationError,
    Backoff,
    BaseQuery,
    CredentialBootstrapper,
    DateWindow,
    DownloadEngine,
    DownloadError,
    DownloadOutcome,
    FileSink,
    ItemId,
    ListingError,
    ListingPaginator,
    LoginRefresher,
    OverviewEndpoint,
    ReportSink,
    RetryPolicy,
    Session,
    SessionError,
    SessionOptions,
    SessionRefresher,
    Throttle,
};

pub use crate::external_deps::{
    BrowserAutomation,
    BrowserCookie,
    BrowserError,
    BrowserKind,
    WebDriverBrowser,
};

pub use crate::modules::{
    EventDispatcher,
    EventHandler,
    HarvestEvent,
    HttpProbe,
    LoggingHandler,
    ProxyConfig,
    ProxyDiscovery,
    ProxyManager,
    ProxyProbe,
    ProxyProbeError,
    ProxySource,
    ProxyValidator,
    refresh_proxies,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
