//! Event system for the harvesting pipeline.
//!
//! Provides hooks for logging and custom reactions around pagination,
//! downloads, re-authentication and proxy rotation.

use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::crawl::ItemId;

#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub cookies: usize,
    pub proxy: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PageEvent {
    pub page: u32,
    pub page_count: u32,
    pub matched: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ItemSavedEvent {
    pub item: ItemId,
    pub path: PathBuf,
    pub sequence: usize,
    pub total: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ItemFailedEvent {
    pub item: ItemId,
    pub attempts: u32,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RetryEvent {
    pub item: ItemId,
    pub attempt: u32,
    pub max_attempts: u32,
    pub reason: String,
    pub scheduled_after: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ReauthEvent {
    pub item: ItemId,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ProxyRotationEvent {
    pub from: String,
    pub to: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum HarvestEvent {
    SessionAcquired(SessionEvent),
    PageFetched(PageEvent),
    ItemSaved(ItemSavedEvent),
    ItemFailed(ItemFailedEvent),
    Retry(RetryEvent),
    Reauthenticated(ReauthEvent),
    ProxyRotated(ProxyRotationEvent),
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &HarvestEvent);
}

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    /// Dispatcher preloaded with [`LoggingHandler`].
    pub fn with_logging() -> Self {
        let mut dispatcher = Self::new();
        dispatcher.register_handler(Arc::new(LoggingHandler));
        dispatcher
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn dispatch(&self, event: HarvestEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &HarvestEvent) {
        match event {
            HarvestEvent::SessionAcquired(session) => {
                log::info!(
                    "session acquired with {} cookies (proxy: {})",
                    session.cookies,
                    session.proxy.as_deref().unwrap_or("direct")
                );
            }
            HarvestEvent::PageFetched(page) => {
                log::debug!(
                    "listing page {}/{} -> {} reports",
                    page.page,
                    page.page_count,
                    page.matched
                );
            }
            HarvestEvent::ItemSaved(saved) => {
                log::info!(
                    "saved report {} -> {} ({}/{})",
                    saved.item,
                    saved.path.display(),
                    saved.sequence,
                    saved.total
                );
            }
            HarvestEvent::ItemFailed(failed) => {
                log::error!(
                    "report {} failed after {} attempts: {}",
                    failed.item,
                    failed.attempts,
                    failed.error
                );
            }
            HarvestEvent::Retry(retry) => {
                log::warn!(
                    "report {} attempt {}/{} failed: {}; retrying after {:.0}s",
                    retry.item,
                    retry.attempt,
                    retry.max_attempts,
                    retry.reason,
                    retry.scheduled_after.as_secs_f64()
                );
            }
            HarvestEvent::Reauthenticated(reauth) => {
                log::warn!("report {} has no download url, refreshing session", reauth.item);
            }
            HarvestEvent::ProxyRotated(rotation) => {
                log::info!(
                    "rotating proxy {} -> {}",
                    rotation.from,
                    rotation.to.as_deref().unwrap_or("none")
                );
            }
        }
    }
}
