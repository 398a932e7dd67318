//! Crawl pipeline stages.
//!
//! Credential bootstrap, listing pagination and per-report downloads, plus
//! the retry, throttle and persistence pieces they share.

pub mod auth;
pub mod download;
pub mod listing;
pub mod retry;
pub mod session;
pub mod sink;
pub mod throttle;
pub mod types;

pub use auth::{AuthenticationError, CredentialBootstrapper, LoginRefresher, SessionRefresher};
pub use download::{DownloadEngine, DownloadError, DownloadOutcome, OverviewEndpoint, Stage};
pub use listing::{BaseQuery, ListingError, ListingPaginator, REPORT_ENTRY_TYPE};
pub use retry::{Backoff, RetryPolicy};
pub use session::{Session, SessionError, SessionOptions};
pub use sink::{FileSink, ReportSink};
pub use throttle::Throttle;
pub use types::{DateWindow, ItemId, PageState};
