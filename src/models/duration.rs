//! Go-style duration strings (`90s`, `1h30m`, `168h`, `500ms`) used by the
//! rotation settings in the configuration file.

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DurationError {
    #[error("empty duration")]
    Empty,

    #[error("invalid duration '{0}'")]
    Invalid(String),

    #[error("unknown unit '{unit}' in duration '{input}'")]
    UnknownUnit { input: String, unit: String },
}

/// Parse a duration such as `48h`, `1h30m` or `2.5s`.
/// A bare `0` is accepted; any other number needs a unit.
pub fn parse(input: &str) -> Result<Duration, DurationError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(DurationError::Empty);
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if num_len == 0 {
            return Err(DurationError::Invalid(input.to_string()));
        }
        let value: f64 = rest[..num_len]
            .parse()
            .map_err(|_| DurationError::Invalid(input.to_string()))?;
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        let seconds_per_unit = match unit {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            "" => return Err(DurationError::Invalid(input.to_string())),
            other => {
                return Err(DurationError::UnknownUnit {
                    input: input.to_string(),
                    unit: other.to_string(),
                })
            }
        };
        total += value * seconds_per_unit;
    }

    Duration::try_from_secs_f64(total).map_err(|_| DurationError::Invalid(input.to_string()))
}

/// Render a duration the way [`parse`] reads it, e.g. `26h0m0s`.
pub fn format(d: Duration) -> String {
    let secs = d.as_secs();
    let millis = d.subsec_millis();
    if secs == 0 {
        return format!("{}ms", millis);
    }
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    match (h, m) {
        (0, 0) => format!("{}s", s),
        (0, _) => format!("{}m{}s", m, s),
        _ => format!("{}h{}m{}s", h, m, s),
    }
}

pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format(*d))
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let raw = String::deserialize(deserializer)?;
    parse(&raw).map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_compound() {
        assert_eq!(parse("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse("168h").unwrap(), Duration::from_secs(168 * 3600));
        assert_eq!(parse("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse("0").unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(parse("  "), Err(DurationError::Empty));
        assert!(matches!(parse("10"), Err(DurationError::Invalid(_))));
        assert!(matches!(parse("h"), Err(DurationError::Invalid(_))));
        assert!(matches!(
            parse("7d"),
            Err(DurationError::UnknownUnit { unit, .. }) if unit == "d"
        ));
    }

    #[test]
    fn test_format_reads_back() {
        let d = Duration::from_secs(26 * 3600 + 5);
        assert_eq!(format(d), "26h0m5s");
        assert_eq!(parse(&format(d)).unwrap(), d);
        assert_eq!(format(Duration::from_millis(50)), "50ms");
    }
}
