//! Wall-clock access and the date/weekday/time stamps attached to readings
//! and log rows.

use serde::{Deserialize, Serialize};
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

const DATE_FORMAT: &[FormatItem<'static>] = format_description!("[day]-[month]-[year]");
const TIME_FORMAT: &[FormatItem<'static>] = format_description!("[hour]:[minute]:[second]");
const OFFSET_FORMAT: &[FormatItem<'static>] =
    format_description!("[offset_hour sign:mandatory]:[offset_minute]");

/// Placeholder shown before anything has been stamped.
pub const UNSET: &str = "-";

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Source of "now". The scheduler and stamping go through this so tests can
/// drive time by hand.
pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

/// Real wall-clock at a fixed UTC offset.
pub struct SystemClock {
    offset: UtcOffset,
}

impl SystemClock {
    pub fn new(offset: UtcOffset) -> Self {
        Self { offset }
    }

    pub fn offset(&self) -> UtcOffset {
        self.offset
    }
}

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc().to_offset(self.offset)
    }
}

/// Parse a `+HH:MM` / `-HH:MM` offset string.
pub fn parse_utc_offset(s: &str) -> Result<UtcOffset, time::error::Parse> {
    UtcOffset::parse(s.trim(), OFFSET_FORMAT)
}

// ---------------------------------------------------------------------------
// Timestamp
// ---------------------------------------------------------------------------

/// Human-facing stamp in the shape the dashboard and log table expect:
/// `DD-MM-YYYY`, English weekday, `HH:MM:SS`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    #[serde(rename = "tanggal")]
    pub date: String,
    #[serde(rename = "hari")]
    pub weekday: String,
    #[serde(rename = "waktu")]
    pub time: String,
}

impl Timestamp {
    pub fn from_datetime(dt: OffsetDateTime) -> Self {
        // Formatting with a static description only fails for components the
        // value lacks, which an OffsetDateTime always has.
        Self {
            date: dt.format(DATE_FORMAT).unwrap_or_else(|_| UNSET.to_string()),
            weekday: dt.weekday().to_string(),
            time: dt.format(TIME_FORMAT).unwrap_or_else(|_| UNSET.to_string()),
        }
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Self {
            date: UNSET.to_string(),
            weekday: UNSET.to_string(),
            time: UNSET.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Test clock
// ---------------------------------------------------------------------------


// ===========================================================================
// Tests
// ===========================================================================
