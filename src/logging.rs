//! Terminal logger installation for the binaries.

use std::str::FromStr;

use log::LevelFilter;
use simplelog::{ColorChoice, ConfigBuilder, TermLogger, TerminalMode};

/// Environment variable holding the log level (`error` .. `trace`).
pub const LOG_LEVEL_ENV: &str = "HARVESTER_LOG";

/// Level named by `$HARVESTER_LOG`, `info` when unset or unrecognised.
pub fn level_from_env() -> LevelFilter {
    std::env::var(LOG_LEVEL_ENV)
        .ok()
        .and_then(|raw| parse_level(&raw))
        .unwrap_or(LevelFilter::Info)
}

fn parse_level(raw: &str) -> Option<LevelFilter> {
    LevelFilter::from_str(raw.trim()).ok()
}

/// Install a terminal logger. Returns `false` when a logger was already set.
pub fn init(level: LevelFilter) -> bool {
    let config = ConfigBuilder::new()
        .set_time_format_rfc3339()
        .set_target_level(LevelFilter::Error)
        .add_filter_allow_str("report_harvester")
        .add_filter_allow_str("refresh_proxies")
        .build();

    match TermLogger::init(level, config, TerminalMode::Mixed, ColorChoice::Auto) {
        Ok(()) => true,
        Err(err) => {
            log::debug!("terminal logger not installed: {err}");
            false
        }
    }
}
