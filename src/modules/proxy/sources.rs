//! Proxy candidate sources.
//!
//! A source yields raw `scheme://ip:port` strings; [`ProxyDiscovery`] merges
//! every configured source into one deduplicated candidate set. Published
//! lists come as HTML tables ([`HtmlTableSource`]) or JSON APIs
//! ([`JsonApiSource`]). New sources are added by implementing [`ProxySource`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use scraper::{Html, Selector};
use serde_json::Value;
use thiserror::Error;
use tokio::time::sleep;

const SOURCE_TIMEOUT: Duration = Duration::from_secs(10);
const SOURCE_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request to {source_name} failed: {message}")]
    Request {
        source_name: String,
        message: String,
    },
    #[error("{source_name} answered with status {status}")]
    Status { source_name: String, status: u16 },
    #[error("invalid selector `{0}`")]
    Selector(String),
    #[error("{source_name} returned an unexpected payload: {message}")]
    Decode {
        source_name: String,
        message: String,
    },
}

/// Anything that can produce proxy candidates.
#[async_trait]
pub trait ProxySource: Send + Sync {
    fn name(&self) -> &str;
    async fn fetch_candidates(&self) -> Result<HashSet<String>, SourceError>;
}

/// Fixed list of candidates, e.g. from configuration.
#[derive(Debug, Clone)]
pub struct StaticSource {
    name: String,
    candidates: HashSet<String>,
}

impl StaticSource {
    pub fn new<I, S>(name: impl Into<String>, candidates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            candidates: candidates.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl ProxySource for StaticSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_candidates(&self) -> Result<HashSet<String>, SourceError> {
        Ok(self.candidates.clone())
    }
}

/// Free proxy list published as an HTML table with ip and port columns.
#[derive(Debug, Clone)]
pub struct HtmlTableSource {
    name: String,
    url: String,
    table_selector: String,
    ip_column: usize,
    port_column: usize,
    client: Client,
}

impl HtmlTableSource {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        table_selector: impl Into<String>,
        ip_column: usize,
        port_column: usize,
    ) -> Result<Self, SourceError> {
        let name = name.into();
        let client = source_client(&name)?;

        Ok(Self {
            name,
            url: url.into(),
            table_selector: table_selector.into(),
            ip_column,
            port_column,
            client,
        })
    }

    pub fn kuaidaili() -> Result<Self, SourceError> {
        Self::new(
            "kuaidaili",
            "https://www.kuaidaili.com/free/inha/",
            "table.table.table-bordered.table-striped",
            0,
            1,
        )
    }

    pub fn ip89() -> Result<Self, SourceError> {
        Self::new("89ip", "https://www.89ip.cn/", "table.layui-table", 0, 1)
    }

    pub fn xicidaili() -> Result<Self, SourceError> {
        Self::new("xicidaili", "https://www.xicidaili.com/nn/", "table#ip_list", 1, 2)
    }

    pub fn ip3366() -> Result<Self, SourceError> {
        Self::new(
            "ip3366",
            "http://www.ip3366.net/free/",
            "table.table.table-bordered.table-striped",
            0,
            1,
        )
    }

    /// Every built-in free list.
    pub fn presets() -> Result<Vec<Arc<dyn ProxySource>>, SourceError> {
        Ok(vec![
            Arc::new(Self::kuaidaili()?),
            Arc::new(Self::ip89()?),
            Arc::new(Self::xicidaili()?),
            Arc::new(Self::ip3366()?),
        ])
    }

    /// Extract `http://ip:port` candidates from a proxy table page. Rows whose
    /// cells do not look like an IPv4 address and port are skipped.
    pub fn parse_table(
        html: &str,
        table_selector: &str,
        ip_column: usize,
        port_column: usize,
    ) -> Result<HashSet<String>, SourceError> {
        let table_sel = Selector::parse(table_selector)
            .map_err(|_| SourceError::Selector(table_selector.to_string()))?;
        let document = Html::parse_document(html);

        let mut proxies = HashSet::new();
        let Some(table) = document.select(&table_sel).next() else {
            return Ok(proxies);
        };

        for row in table.select(&ROW_SELECTOR) {
            let cells: Vec<String> = row
                .select(&CELL_SELECTOR)
                .map(|cell| cell.text().collect::<String>().trim().to_string())
                .collect();
            let (Some(ip), Some(port)) = (cells.get(ip_column), cells.get(port_column)) else {
                continue;
            };
            if let Some(proxy) = normalize_address(ip, port) {
                proxies.insert(proxy);
            }
        }
        Ok(proxies)
    }
}

#[async_trait]
impl ProxySource for HtmlTableSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_candidates(&self) -> Result<HashSet<String>, SourceError> {
        let body = fetch_body(&self.client, &self.name, &self.url).await?;
        let proxies =
            Self::parse_table(&body, &self.table_selector, self.ip_column, self.port_column)?;
        log::info!("{} listed {} proxies", self.name, proxies.len());
        Ok(proxies)
    }
}

/// Free proxy list published as a JSON API.
///
/// `entries` is a JSON pointer (`/data`, `/result/list`, or empty for the
/// document root) to an array of objects carrying the ip and port fields.
/// Ports may be strings or numbers.
#[derive(Debug, Clone)]
pub struct JsonApiSource {
    name: String,
    url: String,
    entries: String,
    ip_field: String,
    port_field: String,
    client: Client,
}

impl JsonApiSource {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        entries: impl Into<String>,
        ip_field: impl Into<String>,
        port_field: impl Into<String>,
    ) -> Result<Self, SourceError> {
        let name = name.into();
        let client = source_client(&name)?;

        Ok(Self {
            name,
            url: url.into(),
            entries: entries.into(),
            ip_field: ip_field.into(),
            port_field: port_field.into(),
            client,
        })
    }

    /// Kuaidaili's `getproxy` API: `{"data": [{"ip": .., "port": ..}]}`.
    pub fn kuaidaili_api() -> Result<Self, SourceError> {
        Self::new(
            "kuaidaili-api",
            "https://www.kuaidaili.com/api/getproxy/",
            "/data",
            "ip",
            "port",
        )
    }

    pub fn geonode() -> Result<Self, SourceError> {
        Self::new(
            "geonode",
            "https://proxylist.geonode.com/api/proxy-list?limit=100&page=1&sort_by=lastChecked&sort_type=desc&protocols=http%2Chttps",
            "/data",
            "ip",
            "port",
        )
    }

    /// Every built-in JSON API.
    pub fn presets() -> Result<Vec<Arc<dyn ProxySource>>, SourceError> {
        Ok(vec![Arc::new(Self::kuaidaili_api()?), Arc::new(Self::geonode()?)])
    }

    /// Extract `http://ip:port` candidates from an API document. Entries
    /// without a usable ip and port are skipped; a missing or non-array
    /// `entries` location is an error.
    pub fn parse_entries(
        document: &Value,
        entries: &str,
        ip_field: &str,
        port_field: &str,
    ) -> Result<HashSet<String>, String> {
        let list = document
            .pointer(entries)
            .and_then(Value::as_array)
            .ok_or_else(|| format!("no array at `{entries}`"))?;

        Ok(list
            .iter()
            .filter_map(|entry| {
                let ip = entry.get(ip_field)?.as_str()?.trim();
                let port = match entry.get(port_field)? {
                    Value::String(port) => port.trim().to_string(),
                    Value::Number(port) => port.to_string(),
                    _ => return None,
                };
                normalize_address(ip, &port)
            })
            .collect())
    }
}

#[async_trait]
impl ProxySource for JsonApiSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_candidates(&self) -> Result<HashSet<String>, SourceError> {
        let body = fetch_body(&self.client, &self.name, &self.url).await?;
        let decode = |message: String| SourceError::Decode {
            source_name: self.name.clone(),
            message,
        };
        let document: Value =
            serde_json::from_str(&body).map_err(|err| decode(err.to_string()))?;
        let proxies =
            Self::parse_entries(&document, &self.entries, &self.ip_field, &self.port_field)
                .map_err(decode)?;
        log::info!("{} listed {} proxies", self.name, proxies.len());
        Ok(proxies)
    }
}

fn source_client(name: &str) -> Result<Client, SourceError> {
    Client::builder()
        .user_agent(SOURCE_USER_AGENT)
        .timeout(SOURCE_TIMEOUT)
        .build()
        .map_err(|err| SourceError::Request {
            source_name: name.to_string(),
            message: err.to_string(),
        })
}

async fn fetch_body(client: &Client, name: &str, url: &str) -> Result<String, SourceError> {
    let request_error = |err: reqwest::Error| SourceError::Request {
        source_name: name.to_string(),
        message: err.to_string(),
    };

    let response = client.get(url).send().await.map_err(request_error)?;
    let status = response.status();
    if !status.is_success() {
        return Err(SourceError::Status {
            source_name: name.to_string(),
            status: status.as_u16(),
        });
    }
    response.text().await.map_err(request_error)
}

/// Merges candidates from several sources, pausing between them.
#[derive(Clone)]
pub struct ProxyDiscovery {
    sources: Vec<Arc<dyn ProxySource>>,
    pause: Duration,
}

impl ProxyDiscovery {
    pub fn new(sources: Vec<Arc<dyn ProxySource>>) -> Self {
        Self {
            sources,
            pause: Duration::from_secs(2),
        }
    }

    pub fn with_pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }

    /// Union of every source's candidates. A failing source is logged and
    /// skipped.
    pub async fn discover(&self) -> HashSet<String> {
        let mut all = HashSet::new();
        for (index, source) in self.sources.iter().enumerate() {
            if index > 0 && !self.pause.is_zero() {
                sleep(self.pause).await;
            }
            match source.fetch_candidates().await {
                Ok(candidates) => all.extend(candidates),
                Err(err) => log::error!("proxy source {} failed: {err}", source.name()),
            }
        }
        log::info!("discovered {} unique proxy candidates", all.len());
        all
    }
}

fn normalize_address(ip: &str, port: &str) -> Option<String> {
    if !IPV4_RE.is_match(ip) || !PORT_RE.is_match(port) {
        return None;
    }
    let port: u16 = port.parse().ok()?;
    (port != 0).then(|| format!("http://{ip}:{port}"))
}

static IPV4_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(25[0-5]|2[0-4]\d|1?\d?\d)(\.(25[0-5]|2[0-4]\d|1?\d?\d)){3}$")
        .expect("invalid ipv4 regex")
});

static PORT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{1,5}$").expect("invalid port regex"));

static ROW_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("tr").expect("row selector"));

static CELL_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("td").expect("cell selector"));

#[cfg(test)]
mod tests {
    use super::*;

    const KUAIDAILI_PAGE: &str = r#"
        <html><body>
        <table class="table table-bordered table-striped">
          <thead><tr><th>IP</th><th>PORT</th><th>TYPE</th></tr></thead>
          <tbody>
            <tr><td> 117.69.232.11 </td><td>8089</td><td>HTTP</td></tr>
            <tr><td>36.6.145.212</td><td>8089</td><td>HTTP</td></tr>
            <tr><td>36.6.145.212</td><td>8089</td><td>HTTP</td></tr>
            <tr><td>999.1.1.1</td><td>80</td><td>HTTP</td></tr>
            <tr><td>1.2.3.4</td><td>port</td><td>HTTP</td></tr>
          </tbody>
        </table>
        </body></html>"#;

    #[test]
    fn parses_proxy_rows() {
        let proxies = HtmlTableSource::parse_table(
            KUAIDAILI_PAGE,
            "table.table.table-bordered.table-striped",
            0,
            1,
        )
        .unwrap();
        let expected: HashSet<String> = ["http://117.69.232.11:8089", "http://36.6.145.212:8089"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(proxies, expected);
    }

    #[test]
    fn shifted_columns() {
        let html = r#"<table id="ip_list">
            <tr><th>country</th><th>ip</th><th>port</th></tr>
            <tr><td>cn</td><td>10.1.2.3</td><td>3128</td></tr>
        </table>"#;
        let proxies = HtmlTableSource::parse_table(html, "table#ip_list", 1, 2).unwrap();
        assert!(proxies.contains("http://10.1.2.3:3128"));
    }

    #[test]
    fn missing_table_yields_nothing() {
        let proxies = HtmlTableSource::parse_table("<p>maintenance</p>", "table.layui-table", 0, 1)
            .unwrap();
        assert!(proxies.is_empty());
    }

    #[test]
    fn rejects_bad_selector() {
        assert!(matches!(
            HtmlTableSource::parse_table("", "table[", 0, 1),
            Err(SourceError::Selector(_))
        ));
    }

    #[test]
    fn normalizes_addresses() {
        assert_eq!(normalize_address("1.2.3.4", "80").as_deref(), Some("http://1.2.3.4:80"));
        assert_eq!(normalize_address("1.2.3.4", "0"), None);
        assert_eq!(normalize_address("1.2.3.4", "70000"), None);
        assert_eq!(normalize_address("example.com", "80"), None);
    }

    #[test]
    fn parses_api_entries_with_mixed_port_types() {
        let document = serde_json::json!({
            "code": 0,
            "data": [
                {"ip": "117.69.232.11", "port": "8089"},
                {"ip": "36.6.145.212", "port": 3128},
                {"ip": "36.6.145.212", "port": 3128},
                {"ip": "localhost", "port": 80},
                {"ip": "1.2.3.4"},
                {"ip": "5.6.7.8", "port": true}
            ]
        });
        let proxies = JsonApiSource::parse_entries(&document, "/data", "ip", "port").unwrap();
        let expected: HashSet<String> = ["http://117.69.232.11:8089", "http://36.6.145.212:3128"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(proxies, expected);
    }

    #[test]
    fn root_array_and_custom_fields() {
        let document = serde_json::json!([{"host": "10.1.2.3", "p": 8080}]);
        let proxies = JsonApiSource::parse_entries(&document, "", "host", "p").unwrap();
        assert!(proxies.contains("http://10.1.2.3:8080"));
    }

    #[test]
    fn missing_entry_array_is_an_error() {
        let document = serde_json::json!({"data": {"msg": "quota exceeded"}});
        assert!(JsonApiSource::parse_entries(&document, "/data", "ip", "port").is_err());
    }

    struct FailingSource;

    #[async_trait]
    impl ProxySource for FailingSource {
        fn name(&self) -> &str {
            "failing"
        }

        async fn fetch_candidates(&self) -> Result<HashSet<String>, SourceError> {
            Err(SourceError::Status {
                source_name: "failing".into(),
                status: 503,
            })
        }
    }

    #[tokio::test]
    async fn discovery_merges_and_skips_failures() {
        let discovery = ProxyDiscovery::new(vec![
            Arc::new(StaticSource::new("a", ["http://1.1.1.1:80", "http://2.2.2.2:80"])),
            Arc::new(FailingSource),
            Arc::new(StaticSource::new("b", ["http://2.2.2.2:80", "http://3.3.3.3:80"])),
        ])
        .with_pause(Duration::ZERO);

        let merged = discovery.discover().await;
        assert_eq!(merged.len(), 3);
    }
}
