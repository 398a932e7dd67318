//! Proxy rotation and health tracking utilities.
//!
//! Tracks per-proxy failure counts, skips proxies that crossed the failure
//! threshold, and picks the next candidate uniformly at random. When every
//! proxy is exhausted the counts are reset so the pool never locks up.
//!
//! [`ProxyManager`] is a cheap cloneable handle; every operation runs under a
//! single mutex, so selection and the implicit reset are never interleaved
//! with mutations from another task.

mod sources;
mod store;
mod validator;

pub use sources::{
    HtmlTableSource, JsonApiSource, ProxyDiscovery, ProxySource, SourceError, StaticSource,
};
pub use store::{ProxyStoreError, load_proxies, save_proxies};
pub use validator::{DEFAULT_CONCURRENCY, HttpProbe, ProxyProbe, ProxyProbeError, ProxyValidator};

use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Failure count at which a proxy stops being handed out.
pub const DEFAULT_MAX_FAILURES: u32 = 3;

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub max_failures: u32,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            max_failures: DEFAULT_MAX_FAILURES,
        }
    }
}

/// Proxy address together with its failure count at selection time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRecord {
    pub address: String,
    pub failure_count: u32,
}

/// Read-only snapshot of the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyPoolStatus {
    pub total: usize,
    pub current: Option<String>,
    pub failure_counts: HashMap<String, u32>,
    pub available: usize,
}

#[derive(Debug, Default)]
struct ProxyTable {
    proxies: Vec<String>,
    failures: HashMap<String, u32>,
    current: Option<String>,
}

impl ProxyTable {
    fn failure_count(&self, proxy: &str) -> u32 {
        self.failures.get(proxy).copied().unwrap_or(0)
    }

    fn available_indices(&self, max_failures: u32) -> Vec<usize> {
        self.proxies
            .iter()
            .enumerate()
            .filter(|(_, proxy)| self.failure_count(proxy) < max_failures)
            .map(|(idx, _)| idx)
            .collect()
    }
}

/// Proxy pool with failure-threshold rotation.
#[derive(Debug, Clone)]
pub struct ProxyManager {
    config: ProxyConfig,
    table: Arc<Mutex<ProxyTable>>,
}

impl ProxyManager {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config,
            table: Arc::new(Mutex::new(ProxyTable::default())),
        }
    }

    /// Build a pool from a JSON array written by [`save_proxies`].
    pub fn from_file(path: impl AsRef<Path>, config: ProxyConfig) -> Result<Self, ProxyStoreError> {
        let mut proxies: Vec<String> = load_proxies(path)?.into_iter().collect();
        proxies.sort();
        let manager = Self::new(config);
        manager.load(proxies);
        Ok(manager)
    }

    pub fn load<I>(&self, proxies: I)
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let mut table = self.lock();
        *table = ProxyTable::default();
        for proxy in proxies {
            let proxy = proxy.into();
            if !table.proxies.contains(&proxy) {
                table.proxies.push(proxy);
            }
        }
    }

    pub fn add_proxy(&self, proxy: impl Into<String>) {
        let proxy = proxy.into();
        let mut table = self.lock();
        if table.proxies.contains(&proxy) {
            return;
        }
        log::info!("added proxy {proxy}");
        table.proxies.push(proxy);
    }

    pub fn remove_proxy(&self, proxy: &str) {
        let mut table = self.lock();
        let before = table.proxies.len();
        table.proxies.retain(|entry| entry != proxy);
        table.failures.remove(proxy);
        if table.current.as_deref() == Some(proxy) {
            table.current = None;
        }
        if table.proxies.len() != before {
            log::info!("removed proxy {proxy}");
        }
    }

    /// Pick a random proxy below the failure threshold.
    ///
    /// If every proxy is at or above the threshold, all failure counts are
    /// cleared first and the pick is made among the whole pool. Returns
    /// `None` only for an empty pool.
    pub fn select(&self) -> Option<ProxyRecord> {
        let mut table = self.lock();
        if table.proxies.is_empty() {
            return None;
        }

        let mut candidates = table.available_indices(self.config.max_failures);
        if candidates.is_empty() {
            log::warn!(
                "all {} proxies reached {} failures, resetting failure counts",
                table.proxies.len(),
                self.config.max_failures
            );
            table.failures.clear();
            candidates = (0..table.proxies.len()).collect();
        }

        let index = *candidates.choose(&mut rand::thread_rng())?;
        let address = table.proxies[index].clone();
        let failure_count = table.failure_count(&address);
        table.current = Some(address.clone());
        log::debug!("using proxy {address}");

        Some(ProxyRecord {
            address,
            failure_count,
        })
    }

    pub fn mark_failure(&self, proxy: &str) {
        let mut table = self.lock();
        let count = table.failures.entry(proxy.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        log::warn!("proxy {proxy} failed, failure count {count}");
    }

    pub fn mark_success(&self, proxy: &str) {
        let mut table = self.lock();
        if let Some(count) = table.failures.get_mut(proxy) {
            *count = count.saturating_sub(1);
            log::debug!("proxy {proxy} succeeded, failure count {count}");
        }
    }

    /// Record a failure against the current selection, if any.
    pub fn mark_current_failure(&self) {
        if let Some(current) = self.current() {
            self.mark_failure(&current);
        }
    }

    /// Record a success against the current selection, if any.
    pub fn mark_current_success(&self) {
        if let Some(current) = self.current() {
            self.mark_success(&current);
        }
    }

    /// Forget the current selection so the next [`select`](Self::select)
    /// starts fresh.
    pub fn rotate(&self) {
        let mut table = self.lock();
        if let Some(current) = table.current.take() {
            log::info!("rotating away from proxy {current}");
        }
    }

    pub fn current(&self) -> Option<String> {
        self.lock().current.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn addresses(&self) -> HashSet<String> {
        self.lock().proxies.iter().cloned().collect()
    }

    pub fn status(&self) -> ProxyPoolStatus {
        let table = self.lock();
        ProxyPoolStatus {
            total: table.proxies.len(),
            current: table.current.clone(),
            failure_counts: table.failures.clone(),
            available: table.available_indices(self.config.max_failures).len(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ProxyTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ProxyManager {
    fn default() -> Self {
        Self::new(ProxyConfig::default())
    }
}

/// Discover candidates from every source, keep the reachable ones and cap the
/// result at `limit` addresses.
pub async fn refresh_proxies(
    discovery: &ProxyDiscovery,
    validator: &ProxyValidator,
    concurrency: usize,
    limit: usize,
) -> HashSet<String> {
    let candidates = discovery.discover().await;
    if candidates.is_empty() {
        log::warn!("no proxy candidates discovered");
        return HashSet::new();
    }

    let total = candidates.len();
    let mut reachable: Vec<String> = validator
        .validate_batch(candidates, concurrency)
        .await
        .into_iter()
        .collect();
    log::info!("proxy validation finished: {}/{} reachable", reachable.len(), total);

    reachable.sort();
    reachable.truncate(limit);
    reachable.into_iter().collect()
}
