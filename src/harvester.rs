//! High level harvest orchestration.
//!
//! Wires the credential bootstrapper, listing paginator, download engine and
//! optional proxy pool into a single sequential run: log in, enumerate the
//! report ids, then download them one at a time under the configured pacing.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use thiserror::Error;
use url::Url;

use crate::config::{AppConfig, ConfigError, RuntimeConfig, SiteConfig};
use crate::crawl::{
	AuthenticationError, BaseQuery, CredentialBootstrapper, DateWindow, DownloadEngine,
	DownloadOutcome, FileSink, ItemId, ListingError, ListingPaginator, LoginRefresher,
	ReportSink, SessionRefresher, Throttle,
};
use crate::external_deps::{BrowserAutomation, BrowserError, WebDriverBrowser};
use crate::modules::events::{
	EventDispatcher, EventHandler, HarvestEvent, ItemFailedEvent, ItemSavedEvent,
};
use crate::modules::proxy::{ProxyConfig, ProxyManager, ProxyStoreError};

/// Result alias used across the orchestration layer.
pub type HarvestResult<T> = Result<T, HarvestError>;

/// Unrecoverable failure of a harvest run.
#[derive(Debug, Error)]
pub enum HarvestError {
	#[error("configuration error: {0}")]
	Config(#[from] ConfigError),
	#[error("browser setup failed: {0}")]
	Browser(#[from] BrowserError),
	#[error("authentication failed: {0}")]
	Authentication(#[from] AuthenticationError),
	#[error("report listing failed: {0}")]
	Listing(#[from] ListingError),
	#[error("proxy pool unavailable: {0}")]
	ProxyStore(#[from] ProxyStoreError),
}

/// Counters reported at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HarvestSummary {
	pub discovered: usize,
	pub attempted: usize,
	pub succeeded: usize,
	pub failed: usize,
	pub elapsed: Duration,
}

/// Fluent construction of a [`Harvester`].
///
/// Every collaborator falls back to the production implementation: a
/// WebDriver browser, a file sink under `runtime.output_dir`, a login-based
/// session refresher and the proxy file named by `runtime.proxies_file`.
pub struct HarvesterBuilder {
	site: SiteConfig,
	runtime: RuntimeConfig,
	browser: Option<Arc<dyn BrowserAutomation>>,
	sink: Option<Arc<dyn ReportSink>>,
	refresher: Option<Arc<dyn SessionRefresher>>,
	proxy_pool: Option<ProxyManager>,
	window: Option<DateWindow>,
	handlers: Vec<Arc<dyn EventHandler>>,
}

impl HarvesterBuilder {
	pub fn new(site: SiteConfig) -> Self {
		Self {
			site,
			runtime: RuntimeConfig::default(),
			browser: None,
			sink: None,
			refresher: None,
			proxy_pool: None,
			window: None,
			handlers: Vec::new(),
		}
	}

	pub fn with_runtime(mut self, runtime: RuntimeConfig) -> Self {
		self.runtime = runtime;
		self
	}

	pub fn with_browser(mut self, browser: Arc<dyn BrowserAutomation>) -> Self {
		self.browser = Some(browser);
		self
	}

	pub fn with_sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
		self.sink = Some(sink);
		self
	}

	/// Replace the login-based refresher used when a session expires.
	pub fn with_refresher(mut self, refresher: Arc<dyn SessionRefresher>) -> Self {
		self.refresher = Some(refresher);
		self
	}

	pub fn with_proxy_pool(mut self, pool: ProxyManager) -> Self {
		self.proxy_pool = Some(pool);
		self
	}

	/// Pin the publication window instead of using the day ending today.
	pub fn with_window(mut self, window: DateWindow) -> Self {
		self.window = Some(window);
		self
	}

	pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
		self.handlers.push(handler);
		self
	}

	pub fn build(self) -> HarvestResult<Harvester> {
		let login_url = self.site.login_url()?;
		let listing_url = self.site.listing_url()?;
		let overview = self.site.overview_endpoint()?;
		let runtime = self.runtime;

		let mut dispatcher = EventDispatcher::with_logging();
		for handler in self.handlers {
			dispatcher.register_handler(handler);
		}
		let events = Arc::new(dispatcher);

		let browser: Arc<dyn BrowserAutomation> = match self.browser {
			Some(browser) => browser,
			None => Arc::new(WebDriverBrowser::new(&runtime.webdriver_url, runtime.browser)?),
		};

		let proxy_pool = match (self.proxy_pool, &runtime.proxies_file) {
			(Some(pool), _) => Some(pool),
			(None, Some(path)) => {
				Some(ProxyManager::from_file(
					path,
					ProxyConfig {
						max_failures: runtime.max_proxy_failures,
					},
				)?)
			}
			(None, None) => None,
		};

		let mut bootstrapper = CredentialBootstrapper::new(browser)
			.with_settle_delay(runtime.settle_delay())
			.with_scope(listing_url.clone())
			.with_events(events.clone());
		if let Some(scope) = overview.scope() {
			bootstrapper = bootstrapper.with_scope(scope);
		}
		if let Some(pool) = &proxy_pool {
			bootstrapper = bootstrapper.with_proxy_pool(pool.clone());
		}
		let bootstrapper = Arc::new(bootstrapper);

		let refresher = self.refresher.unwrap_or_else(|| {
			Arc::new(LoginRefresher::new(bootstrapper.clone(), login_url.clone()))
		});
		let sink = self
			.sink
			.unwrap_or_else(|| Arc::new(FileSink::new(runtime.output_dir.clone())));

		let mut paginator = ListingPaginator::new(listing_url)
			.with_page_delay(runtime.page_delay())
			.with_request_timeout(runtime.listing_timeout())
			.with_events(events.clone());
		if let Some(window) = self.window {
			paginator = paginator.with_window(window);
		}

		let mut engine = DownloadEngine::new(overview, refresher, sink)
			.with_retry_policy(runtime.retry_policy())
			.with_timeouts(runtime.overview_timeout(), runtime.payload_timeout())
			.with_events(events.clone());
		if let Some(pool) = proxy_pool {
			engine = engine.with_proxy_pool(pool);
		}

		Ok(Harvester {
			login_url,
			base_query: self.site.params,
			bootstrapper,
			paginator,
			engine,
			throttle: runtime.throttle(),
			events,
		})
	}
}

/// Sequential harvest pipeline.
pub struct Harvester {
	login_url: Url,
	base_query: BaseQuery,
	bootstrapper: Arc<CredentialBootstrapper>,
	paginator: ListingPaginator,
	engine: DownloadEngine,
	throttle: Throttle,
	events: Arc<EventDispatcher>,
}

impl Harvester {
	pub fn builder(site: SiteConfig) -> HarvesterBuilder {
		HarvesterBuilder::new(site)
	}

	/// Production wiring straight from a configuration document.
	pub fn from_config(config: AppConfig) -> HarvestResult<Self> {
		HarvesterBuilder::new(config.site)
			.with_runtime(config.runtime)
			.build()
	}

	/// Log in, enumerate and download every report.
	///
	/// Authentication and listing failures abort the run; a report that
	/// exhausts its attempts is counted as failed and skipped.
	pub async fn run(&self) -> HarvestResult<HarvestSummary> {
		let started = Instant::now();
		let mut session = self.bootstrapper.acquire_session(&self.login_url).await?;

		let mut items: Vec<ItemId> = self
			.paginator
			.enumerate_items(&session, &self.base_query)
			.await?
			.into_iter()
			.collect();
		items.sort();

		let total = items.len();
		log::info!("found {total} reports to download");

		let mut summary = HarvestSummary {
			discovered: total,
			..HarvestSummary::default()
		};

		for (index, item) in items.iter().enumerate() {
			let sequence = index + 1;
			log::debug!("processing report {item} ({sequence}/{total})");
			summary.attempted += 1;

			match self.engine.download_item(&mut session, item).await? {
				DownloadOutcome::Saved { path, .. } => {
					summary.succeeded += 1;
					self.events.dispatch(HarvestEvent::ItemSaved(ItemSavedEvent {
						item: item.clone(),
						path,
						sequence,
						total,
						timestamp: Utc::now(),
					}));
				}
				DownloadOutcome::Failed { attempts, error } => {
					summary.failed += 1;
					self.events.dispatch(HarvestEvent::ItemFailed(ItemFailedEvent {
						item: item.clone(),
						attempts,
						error: error.to_string(),
						timestamp: Utc::now(),
					}));
				}
			}

			if sequence < total {
				self.throttle.wait(sequence).await;
			}
		}

		summary.elapsed = started.elapsed();
		log::info!(
			"harvest finished: {}/{} reports saved, {} failed, in {:.1}s",
			summary.succeeded,
			summary.attempted,
			summary.failed,
			summary.elapsed.as_secs_f64()
		);
		Ok(summary)
	}
}
