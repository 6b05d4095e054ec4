//! Serde adapter for human-readable durations: `"500ms"`, `"5s"`, `"1m"`.
//!
//! Use with `#[serde(with = "hsu_common::duration_serde")]`.

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    if duration.subsec_millis() == 0 {
        serializer.serialize_str(&format!("{}s", duration.as_secs()))
    } else {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_duration(&s).map_err(serde::de::Error::custom)
}

/// Parses `"<n>ms"`, `"<n>s"` or `"<n>m"`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    // "ms" before "s" since "ms" ends with 's'
    if let Some(num) = s.strip_suffix("ms") {
        let millis: u64 = num.parse().map_err(|_| format!("Invalid duration: {}", s))?;
        Ok(Duration::from_millis(millis))
    } else if let Some(num) = s.strip_suffix('s') {
        let secs: u64 = num.parse().map_err(|_| format!("Invalid duration: {}", s))?;
        Ok(Duration::from_secs(secs))
    } else if let Some(num) = s.strip_suffix('m') {
        let mins: u64 = num.parse().map_err(|_| format!("Invalid duration: {}", s))?;
        let secs = mins
            .checked_mul(60)
            .ok_or_else(|| format!("Duration out of range: {}", s))?;
        Ok(Duration::from_secs(secs))
    } else {
        Err(format!("Duration must end with 's', 'ms', or 'm': {}", s))
    }
}
