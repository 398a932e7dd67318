//! Listing pagination.
//!
//! Walks the paged listing endpoint for the current publication window and
//! collects the ids of every report entry. Any failure aborts the whole
//! enumeration; partial id sets are never returned.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::time::sleep;
use url::Url;

use super::retry::RetryPolicy;
use super::session::Session;
use super::types::{DateWindow, ItemId, PageState};
use crate::modules::events::{EventDispatcher, HarvestEvent, PageEvent};

/// Entry type that marks a downloadable report.
pub const REPORT_ENTRY_TYPE: &str = "EXTERNAL_REPORT";

const DEFAULT_PAGE_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_LISTING_TIMEOUT: Duration = Duration::from_secs(30);

/// Configured query parameters, merged with the date window and page number.
pub type BaseQuery = Map<String, Value>;

#[derive(Debug, Error)]
pub enum ListingError {
    #[error("listing page {page} timed out")]
    Timeout { page: u32 },
    #[error("listing page {page} request failed: {source}")]
    Transport {
        page: u32,
        #[source]
        source: reqwest::Error,
    },
    #[error("listing page {page} returned status {status}")]
    Status { page: u32, status: u16 },
    #[error("listing page {page} is malformed: {source}")]
    Decode {
        page: u32,
        #[source]
        source: serde_json::Error,
    },
    #[error("listing page {page} has a report entry without an id")]
    MissingId { page: u32 },
}

impl ListingError {
    /// Network-level failures worth another try under a retry policy.
    pub fn is_transient(&self) -> bool {
        match self {
            ListingError::Timeout { .. } | ListingError::Transport { .. } => true,
            ListingError::Status { status, .. } => *status >= 500 || *status == 429,
            ListingError::Decode { .. } | ListingError::MissingId { .. } => false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListingEnvelope {
    data: ListingData,
}

#[derive(Debug, Deserialize)]
struct ListingData {
    #[serde(default)]
    list: Vec<ListingEntry>,
    #[serde(rename = "pageCount")]
    page_count: u32,
}

#[derive(Debug, Deserialize)]
struct ListingEntry {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Option<EntryData>,
}

#[derive(Debug, Deserialize)]
struct EntryData {
    #[serde(default)]
    id: Option<ItemId>,
}

/// One decoded listing page.
#[derive(Debug)]
struct ListingPage {
    page_count: u32,
    items: Vec<ItemId>,
}

/// Enumerates report ids from the paged listing endpoint.
pub struct ListingPaginator {
    listing_url: Url,
    entry_type: String,
    page_delay: Duration,
    request_timeout: Duration,
    retry: RetryPolicy,
    window: Option<DateWindow>,
    events: Arc<EventDispatcher>,
}

impl ListingPaginator {
    pub fn new(listing_url: Url) -> Self {
        Self {
            listing_url,
            entry_type: REPORT_ENTRY_TYPE.into(),
            page_delay: DEFAULT_PAGE_DELAY,
            request_timeout: DEFAULT_LISTING_TIMEOUT,
            retry: RetryPolicy::single_attempt(),
            window: None,
            events: Arc::new(EventDispatcher::new()),
        }
    }

    pub fn with_entry_type(mut self, entry_type: impl Into<String>) -> Self {
        self.entry_type = entry_type.into();
        self
    }

    pub fn with_page_delay(mut self, delay: Duration) -> Self {
        self.page_delay = delay;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Pin the publication window instead of deriving it from today's date.
    pub fn with_window(mut self, window: DateWindow) -> Self {
        self.window = Some(window);
        self
    }

    pub fn with_events(mut self, events: Arc<EventDispatcher>) -> Self {
        self.events = events;
        self
    }

    /// Collect every report id across all pages.
    pub async fn enumerate_items(
        &self,
        session: &Session,
        base_query: &BaseQuery,
    ) -> Result<HashSet<ItemId>, ListingError> {
        let window = self.window.unwrap_or_else(DateWindow::ending_today);
        let mut state = PageState::new(window);
        let mut items = HashSet::new();

        loop {
            let page = self
                .retry
                .run(
                    |_| self.fetch_page(session, base_query, &state),
                    ListingError::is_transient,
                )
                .await
                .inspect_err(|err| log::error!("failed to fetch report list: {err}"))?;

            state.record_page_count(page.page_count);
            let matched = page.items.len();
            items.extend(page.items);

            self.events.dispatch(HarvestEvent::PageFetched(PageEvent {
                page: state.page_number,
                page_count: page.page_count,
                matched,
                timestamp: Utc::now(),
            }));

            state.advance();
            if state.is_exhausted() {
                break;
            }
            if !self.page_delay.is_zero() {
                sleep(self.page_delay).await;
            }
        }

        log::info!(
            "listing {} - {}: {} unique reports",
            window.start_param(),
            window.end_param(),
            items.len()
        );
        Ok(items)
    }

    /// Listing URL for the page `state` points at.
    pub fn page_url(&self, base_query: &BaseQuery, state: &PageState) -> Url {
        let mut url = self.listing_url.clone();
        {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in base_query {
                if matches!(key.as_str(), "pubTimeStart" | "pubTimeEnd" | "pageNow") {
                    continue;
                }
                pairs.append_pair(key, &query_value(value));
            }
            pairs.append_pair("pubTimeStart", &state.window.start_param());
            pairs.append_pair("pubTimeEnd", &state.window.end_param());
            pairs.append_pair("pageNow", &state.page_number.to_string());
        }
        url
    }

    async fn fetch_page(
        &self,
        session: &Session,
        base_query: &BaseQuery,
        state: &PageState,
    ) -> Result<ListingPage, ListingError> {
        let page = state.page_number;
        let url = self.page_url(base_query, state);
        log::debug!("fetching listing page {page}: {url}");

        let response = session
            .client()
            .get(url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|source| {
                if source.is_timeout() {
                    ListingError::Timeout { page }
                } else {
                    ListingError::Transport { page, source }
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ListingError::Status {
                page,
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await.map_err(|source| {
            if source.is_timeout() {
                ListingError::Timeout { page }
            } else {
                ListingError::Transport { page, source }
            }
        })?;
        let envelope: ListingEnvelope =
            serde_json::from_slice(&body).map_err(|source| ListingError::Decode { page, source })?;

        let mut items = Vec::new();
        for entry in envelope.data.list {
            if entry.kind != self.entry_type {
                continue;
            }
            let id = entry
                .data
                .and_then(|data| data.id)
                .ok_or(ListingError::MissingId { page })?;
            items.push(id);
        }

        Ok(ListingPage {
            page_count: envelope.data.page_count,
            items,
        })
    }
}

fn query_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
