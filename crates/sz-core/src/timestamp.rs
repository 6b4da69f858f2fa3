//! Canonical timestamp encoding for device log values.
//!
//! Values are RFC 3339 strings in UTC with a `Z` suffix. The fractional part
//! keeps whatever precision the instant carries, so a value read back compares
//! equal to the instant that was appended.

use chrono::{DateTime, SecondsFormat, Utc};

/// Formats an instant as a device log value.
pub fn format(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Parses a device log value.
///
/// Any RFC 3339 offset is accepted and normalized to UTC. Anything else is an
/// error; there is no fallback instant.
pub fn parse(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(value).map(|dt| dt.with_timezone(&Utc))
}
