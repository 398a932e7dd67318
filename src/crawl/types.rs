//! Value types shared by the paginator and the download engine.

use std::fmt;

use chrono::{Days, Local, NaiveDate};
use serde::{Deserialize, Deserializer};

const DATE_FORMAT: &str = "%Y%m%d";

/// Opaque identifier of a downloadable report.
///
/// Listing payloads carry ids either as strings or as bare numbers; both are
/// normalised to their textual form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemId(String);

impl ItemId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filesystem-safe stem derived from the id.
    ///
    /// ASCII alphanumerics, `-`, `_` and non-leading `.` are kept; every
    /// other byte is written as `%XX`, so distinct ids never share a stem.
    pub fn file_stem(&self) -> String {
        if self.0.is_empty() {
            return "%".into();
        }
        let mut stem = String::with_capacity(self.0.len());
        for (index, byte) in self.0.bytes().enumerate() {
            let keep = byte.is_ascii_alphanumeric()
                || byte == b'-'
                || byte == b'_'
                || (byte == b'.' && index > 0);
            if keep {
                stem.push(char::from(byte));
            } else {
                stem.push_str(&format!("%{byte:02X}"));
            }
        }
        stem
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl<'de> Deserialize<'de> for ItemId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawId {
            Text(String),
            Number(serde_json::Number),
        }

        Ok(match RawId::deserialize(deserializer)? {
            RawId::Text(text) => ItemId(text),
            RawId::Number(number) => ItemId(number.to_string()),
        })
    }
}

/// Publication window sent with every listing request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    /// One-day window ending on `end`.
    pub fn ending_on(end: NaiveDate) -> Self {
        let start = end.checked_sub_days(Days::new(1)).unwrap_or(end);
        Self { start, end }
    }

    /// One-day window ending today, local time.
    pub fn ending_today() -> Self {
        Self::ending_on(Local::now().date_naive())
    }

    pub fn start_param(&self) -> String {
        self.start.format(DATE_FORMAT).to_string()
    }

    pub fn end_param(&self) -> String {
        self.end.format(DATE_FORMAT).to_string()
    }
}

/// Cursor over the listing pages.
#[derive(Debug, Clone)]
pub struct PageState {
    pub page_number: u32,
    pub page_count: Option<u32>,
    pub window: DateWindow,
}

impl PageState {
    pub fn new(window: DateWindow) -> Self {
        Self {
            page_number: 1,
            page_count: None,
            window,
        }
    }

    pub fn record_page_count(&mut self, page_count: u32) {
        self.page_count = Some(page_count);
    }

    pub fn advance(&mut self) {
        self.page_number = self.page_number.saturating_add(1);
    }

    /// True once the cursor has moved past the last known page.
    pub fn is_exhausted(&self) -> bool {
        matches!(self.page_count, Some(count) if self.page_number > count)
    }
}
