//! Discover, validate and persist a fresh proxy list.

use std::error::Error;
use std::path::PathBuf;

use report_harvester::logging;
use report_harvester::modules::proxy::{
    DEFAULT_CONCURRENCY, HtmlTableSource, JsonApiSource, ProxyDiscovery, ProxyValidator,
    refresh_proxies, save_proxies,
};

/// Output path override.
const OUTPUT_ENV: &str = "HARVESTER_PROXIES_FILE";
const DEFAULT_OUTPUT: &str = "valid_proxies.json";
const MAX_PROXIES: usize = 30;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    logging::init(logging::level_from_env());

    let output = std::env::var_os(OUTPUT_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT));

    let mut sources = HtmlTableSource::presets()?;
    sources.extend(JsonApiSource::presets()?);
    let discovery = ProxyDiscovery::new(sources);
    let validator = ProxyValidator::default();
    let proxies = refresh_proxies(&discovery, &validator, DEFAULT_CONCURRENCY, MAX_PROXIES).await;

    if proxies.is_empty() {
        log::warn!("no reachable proxies found, {} left untouched", output.display());
        return Ok(());
    }

    save_proxies(&output, &proxies).inspect_err(|err| log::error!("{err}"))?;
    Ok(())
}
