//! Time utilities and constants for rate aggregation.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};

/// Aggregation timing constants.
pub mod constants {
    use std::time::Duration;

    /// Maximum spread between the oldest and newest quote in a window (3 seconds).
    pub const DEFAULT_MAX_TIME_SKEW_MS: i64 = 3_000;

    /// Window entries older than this multiple of the skew threshold are swept.
    pub const DEFAULT_STALE_MULTIPLIER: i64 = 10;

    /// Stale-window sweep interval (60 seconds).
    pub fn sweep_interval() -> Duration {
        Duration::from_secs(60)
    }

    /// Wall-clock budget for one pipeline run before a warning is logged.
    pub fn pipeline_run_budget() -> Duration {
        Duration::from_millis(500)
    }
}

/// A timestamp with timezone (always UTC).
pub type Timestamp = DateTime<Utc>;

/// Current time as epoch milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Convert epoch milliseconds to a UTC timestamp.
///
/// Out-of-range values clamp to the Unix epoch.
pub fn from_millis(millis: i64) -> Timestamp {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_default()
}

/// RFC 3339 with millisecond precision and a `Z` suffix.
pub fn to_iso(millis: i64) -> String {
    from_millis(millis).to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Max-minus-min across a set of timestamps. Zero for fewer than two.
pub fn skew_millis<I>(timestamps: I) -> i64
where
    I: IntoIterator<Item = i64>,
{
    let mut iter = timestamps.into_iter();
    let Some(first) = iter.next() else {
        return 0;
    };
    let (min, max) = iter.fold((first, first), |(lo, hi), ts| (lo.min(ts), hi.max(ts)));
    max - min
}
