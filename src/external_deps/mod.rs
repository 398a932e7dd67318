//! Integrations that rely on third-party processes.
//!
//! Groups the browser automation adapters that bridge the harvester with a
//! real browser for credential acquisition.

pub mod browser;

pub use browser::{BrowserAutomation, BrowserCookie, BrowserError, BrowserKind, WebDriverBrowser};
