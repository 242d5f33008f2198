//! Wall-clock helpers shared by the registry, the rate limiter, and the
//! user index.

use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{SecondsFormat, Utc};

/// Seconds since the Unix epoch, with sub-second precision.
pub fn epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Milliseconds since the Unix epoch.
pub fn epoch_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

/// Current time as an ISO-8601 UTC string, for snapshot stamps.
pub fn iso8601_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Render a remaining duration as `"{m}m {s}s"` (or `"{s}s"` under a
/// minute) for user-facing denial messages.
pub fn format_remaining(seconds: f64) -> String {
    let total = seconds.max(0.0).ceil() as u64;
    let minutes = total / 60;
    let secs = total % 60;
    if minutes > 0 {
        format!("{minutes}m {secs}s")
    } else {
        format!("{secs}s")
    }
}
