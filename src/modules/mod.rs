//! Cross-cutting services module
//!
//! Event hooks shared by every stage, plus the outbound proxy pool.

pub mod events;
pub mod proxy;

pub use events::{
    EventDispatcher, EventHandler, HarvestEvent, ItemFailedEvent, ItemSavedEvent, LoggingHandler,
    PageEvent, ProxyRotationEvent, ReauthEvent, RetryEvent, SessionEvent,
};
pub use proxy::{
    HtmlTableSource, HttpProbe, JsonApiSource, ProxyConfig, ProxyDiscovery, ProxyManager,
    ProxyPoolStatus, ProxyProbe, ProxyProbeError, ProxyRecord, ProxySource, ProxyStoreError,
    ProxyValidator, SourceError, StaticSource, load_proxies, refresh_proxies, save_proxies,
};
