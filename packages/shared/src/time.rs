//! Time-related utilities with clock abstraction for testability.

use chrono::{DateTime, FixedOffset, Offset, Utc};

/// Display format used for every timestamp that goes over the wire (`18-10-26 14:05`).
pub const DISPLAY_FORMAT: &str = "%d-%m-%y %H:%M";

/// Largest UTC offset (in seconds) accepted from a client: UTC+14:00 / UTC-14:00.
pub const MAX_UTC_OFFSET_SECS: i32 = 14 * 3600;

/// Clock trait for dependency injection and testing
pub trait Clock: Send + Sync {
    /// Get the current instant in UTC
    fn now(&self) -> DateTime<Utc>;
}

/// System clock implementation (uses actual system time)
#[derive(Debug, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Fixed clock implementation for testing (returns a fixed time)
#[derive(Debug, Clone, Copy)]
pub struct FixedClock {
    fixed_time: DateTime<Utc>,
}

impl FixedClock {
    /// Create a new fixed clock with the given instant
    pub fn new(fixed_time: DateTime<Utc>) -> Self {
        Self { fixed_time }
    }

    /// Create a new fixed clock from a Unix timestamp in milliseconds
    pub fn from_millis(millis: i64) -> Option<Self> {
        DateTime::<Utc>::from_timestamp_millis(millis).map(Self::new)
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.fixed_time
    }
}

/// A client-supplied UTC offset, validated to lie within ±14 hours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UtcOffset(FixedOffset);

impl UtcOffset {
    /// Build an offset from seconds east of UTC. Returns `None` when out of range.
    pub fn from_seconds(seconds: i32) -> Option<Self> {
        if seconds.abs() > MAX_UTC_OFFSET_SECS {
            return None;
        }
        FixedOffset::east_opt(seconds).map(Self)
    }

    pub fn seconds(&self) -> i32 {
        self.0.local_minus_utc()
    }

    pub fn as_fixed_offset(&self) -> FixedOffset {
        self.0
    }

    pub fn utc() -> Self {
        Self(Utc.fix())
    }
}

impl Default for UtcOffset {
    fn default() -> Self {
        Self::utc()
    }
}

/// Renders persisted timestamps into the strings shown to users.
///
/// Implementations must be pure: the same input always yields the same output.
pub trait TimestampFormatter: Send + Sync {
    /// Format `timestamp` for an identity whose offset is `utc_offset` (if it sent one).
    fn format(&self, timestamp: DateTime<Utc>, utc_offset: Option<UtcOffset>) -> String;
}

/// Default formatter: renders [`DISPLAY_FORMAT`] in the identity's offset,
/// falling back to the server-wide default offset.
#[derive(Debug, Clone, Copy)]
pub struct OffsetFormatter {
    default_offset: UtcOffset,
}

impl OffsetFormatter {
    pub fn new(default_offset: UtcOffset) -> Self {
        Self { default_offset }
    }

    /// Formatter that renders in UTC unless the identity sent its own offset
    pub fn utc() -> Self {
        Self::new(UtcOffset::utc())
    }
}

impl Default for OffsetFormatter {
    fn default() -> Self {
        Self::utc()
    }
}

impl TimestampFormatter for OffsetFormatter {
    fn format(&self, timestamp: DateTime<Utc>, utc_offset: Option<UtcOffset>) -> String {
        let offset = utc_offset.unwrap_or(self.default_offset).as_fixed_offset();
        timestamp
            .with_timezone(&offset)
            .format(DISPLAY_FORMAT)
            .to_string()
    }
}
