//! Serde support for duration attribute values, kept in the suffixed string
//! form they appear in pipeline sources (`250ms`, `900s`, `15m`, `2h`, `1d`).

use serde::{self, Deserialize, Deserializer, Serializer};
use std::time::Duration;

pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format_duration(*duration))
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_duration(&s).map_err(serde::de::Error::custom)
}

/// Render a duration with the coarsest exact suffix.
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms == 0 {
        return "0s".to_string();
    }
    if ms % 86_400_000 == 0 {
        return format!("{}d", ms / 86_400_000);
    }
    if ms % 3_600_000 == 0 {
        return format!("{}h", ms / 3_600_000);
    }
    if ms % 60_000 == 0 {
        return format!("{}m", ms / 60_000);
    }
    if ms % 1000 == 0 {
        return format!("{}s", ms / 1000);
    }
    format!("{ms}ms")
}

pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let parse_num = |val: &str| -> Result<u64, String> {
        val.parse()
            .map_err(|e| format!("invalid duration '{s}': {e}"))
    };
    if let Some(val) = s.strip_suffix("ms") {
        return Ok(Duration::from_millis(parse_num(val)?));
    }
    if let Some(val) = s.strip_suffix('s') {
        return Ok(Duration::from_secs(parse_num(val)?));
    }
    if let Some(val) = s.strip_suffix('m') {
        return Ok(Duration::from_secs(parse_num(val)? * 60));
    }
    if let Some(val) = s.strip_suffix('h') {
        return Ok(Duration::from_secs(parse_num(val)? * 3600));
    }
    if let Some(val) = s.strip_suffix('d') {
        return Ok(Duration::from_secs(parse_num(val)? * 86_400));
    }
    Err(format!("unknown duration format: '{s}'"))
}
