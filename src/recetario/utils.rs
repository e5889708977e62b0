use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer};

/// Parses a timestamp as delivered by the platform.
///
/// Rows come back with an offset (`2024-05-01T10:00:00.123456+00:00`) while change
/// payloads for `timestamp` columns carry none; offset-less values are taken as UTC.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f%#z"]
        .iter()
        .find_map(|format| {
            DateTime::parse_from_str(value, format)
                .ok()
                .map(|parsed| parsed.with_timezone(&Utc))
                .or_else(|| {
                    NaiveDateTime::parse_from_str(value, format)
                        .ok()
                        .map(|naive| naive.and_utc())
                })
        })
}

pub fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {}", raw)))
}

/// Display name for an email address: the part before `@`.
pub fn email_local_part(email: &str) -> &str {
    email.split('@').next().unwrap_or(email)
}
