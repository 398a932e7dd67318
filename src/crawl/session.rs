//! Authenticated HTTP session.
//!
//! A [`Session`] couples a cookie jar seeded from the browser with a reqwest
//! client, optionally routed through one outbound proxy. Sessions are values:
//! re-authentication and proxy rotation produce a new session instead of
//! mutating an existing one.

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use http::header::{ACCEPT, ACCEPT_LANGUAGE, HeaderMap, HeaderValue, ORIGIN, REFERER, USER_AGENT};
use reqwest::Client;
use reqwest::cookie::{CookieStore, Jar};
use thiserror::Error;
use url::Url;

use crate::external_deps::BrowserCookie;

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to build http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("invalid proxy address {address}: {source}")]
    InvalidProxy {
        address: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Headers attached to every request issued through a session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub headers: HeaderMap,
    /// Host names pinned to fixed addresses, bypassing DNS.
    pub resolve: Vec<(String, SocketAddr)>,
}

impl SessionOptions {
    /// Browser-like headers with `Referer`/`Origin` pointing at `origin`.
    pub fn browser_like(origin: &Url) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/json, text/plain, */*"),
        );
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_static("zh-CN,zh;q=0.9,en;q=0.8"),
        );

        let origin = origin.origin().ascii_serialization();
        if let Ok(value) = HeaderValue::from_str(&format!("{origin}/")) {
            headers.insert(REFERER, value);
        }
        if let Ok(value) = HeaderValue::from_str(&origin) {
            headers.insert(ORIGIN, value);
        }

        Self {
            headers,
            resolve: Vec::new(),
        }
    }

    /// Send requests for `host` to `addr` instead of resolving it.
    pub fn with_resolved(mut self, host: impl Into<String>, addr: SocketAddr) -> Self {
        self.resolve.push((host.into(), addr));
        self
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));
        Self {
            headers,
            resolve: Vec::new(),
        }
    }
}

/// Cookie-bearing HTTP context.
#[derive(Debug, Clone)]
pub struct Session {
    client: Client,
    jar: Arc<Jar>,
    options: SessionOptions,
    proxy: Option<String>,
    cookie_count: usize,
    acquired_at: DateTime<Utc>,
}

impl Session {
    /// Seed a jar with `cookies` for every URL in `scopes`.
    ///
    /// A cookie the browser reported with a domain keeps its `Domain` and
    /// `Path`, so sibling hosts such as a file server under the same parent
    /// domain receive it. Scopes outside that domain, and cookies without
    /// one, get a host-only copy with `Path=/`.
    pub fn from_cookies(
        cookies: &[BrowserCookie],
        scopes: &[Url],
        proxy: Option<String>,
        options: SessionOptions,
    ) -> Result<Self, SessionError> {
        let jar = Arc::new(Jar::default());
        for cookie in cookies {
            let domain = cookie.domain.as_deref().map(|d| d.trim_start_matches('.'));
            let anchor = domain.and_then(|domain| {
                scopes
                    .iter()
                    .find(|scope| scope.host_str().is_some_and(|host| domain_matches(host, domain)))
            });

            if let (Some(domain), Some(anchor)) = (domain, anchor) {
                let path = cookie.path.as_deref().unwrap_or("/");
                jar.add_cookie_str(
                    &format!("{}; Domain={domain}; Path={path}", cookie.pair()),
                    anchor,
                );
            }

            for scope in scopes {
                let covered = anchor.is_some()
                    && domain.is_some_and(|domain| {
                        scope.host_str().is_some_and(|host| domain_matches(host, domain))
                    });
                if !covered {
                    jar.add_cookie_str(&format!("{}; Path=/", cookie.pair()), scope);
                }
            }
        }

        let client = build_client(&jar, proxy.as_deref(), &options)?;
        Ok(Self {
            client,
            jar,
            options,
            proxy,
            cookie_count: cookies.len(),
            acquired_at: Utc::now(),
        })
    }

    /// Same cookie jar, different outbound route.
    pub fn reroute(&self, proxy: Option<String>) -> Result<Self, SessionError> {
        let client = build_client(&self.jar, proxy.as_deref(), &self.options)?;
        Ok(Self {
            client,
            jar: self.jar.clone(),
            options: self.options.clone(),
            proxy,
            cookie_count: self.cookie_count,
            acquired_at: self.acquired_at,
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Proxy this session routes through, if any.
    pub fn proxy(&self) -> Option<&str> {
        self.proxy.as_deref()
    }

    pub fn cookie_count(&self) -> usize {
        self.cookie_count
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// `Cookie` header value the jar would send to `url`.
    pub fn cookie_header(&self, url: &Url) -> Option<String> {
        self.jar
            .cookies(url)
            .and_then(|value| value.to_str().ok().map(str::to_string))
    }
}

/// RFC 6265 domain match of a request host against a cookie domain.
fn domain_matches(host: &str, domain: &str) -> bool {
    let host = host.to_ascii_lowercase();
    let domain = domain.to_ascii_lowercase();
    host == domain || host.ends_with(&format!(".{domain}"))
}

fn build_client(
    jar: &Arc<Jar>,
    proxy: Option<&str>,
    options: &SessionOptions,
) -> Result<Client, SessionError> {
    let mut builder = Client::builder()
        .cookie_provider(jar.clone())
        .default_headers(options.headers.clone());
    for (host, addr) in &options.resolve {
        builder = builder.resolve(host, *addr);
    }

    if let Some(address) = proxy {
        let proxy = reqwest::Proxy::all(address).map_err(|source| SessionError::InvalidProxy {
            address: address.to_string(),
            source,
        })?;
        builder = builder.proxy(proxy);
    }

    builder.build().map_err(SessionError::Client)
}
