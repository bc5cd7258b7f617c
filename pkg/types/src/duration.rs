//! ISO-8601 durations (`PT30M`, `PT1H30M`, `P1DT2H`).
//!
//! Only fixed-length units are accepted: weeks and days in the date part,
//! hours, minutes and (fractional) seconds in the time part. Years and months
//! have no fixed length and are rejected.

use std::fmt::Write;
use std::time::Duration;

use crate::error::ConfigError;

/// Parse an ISO-8601 duration string.
pub fn parse_iso8601(input: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::duration(format!("'{}' is not an ISO-8601 duration", input));
    let rest = input.strip_prefix('P').ok_or_else(invalid)?;

    let mut total_secs = 0f64;
    let mut number = String::new();
    let mut in_time = false;
    let mut components = 0usize;
    let mut time_components = 0usize;

    for c in rest.chars() {
        match c {
            '0'..='9' | '.' => number.push(c),
            ',' => number.push('.'),
            'T' if !in_time && number.is_empty() => in_time = true,
            unit => {
                if number.is_empty() {
                    return Err(invalid());
                }
                let value: f64 = number.parse().map_err(|_| invalid())?;
                if value.fract() != 0.0 && !(in_time && unit == 'S') {
                    return Err(invalid());
                }
                let factor = match (in_time, unit) {
                    (false, 'W') => 604_800.0,
                    (false, 'D') => 86_400.0,
                    (true, 'H') => 3_600.0,
                    (true, 'M') => 60.0,
                    (true, 'S') => 1.0,
                    _ => return Err(invalid()),
                };
                total_secs += value * factor;
                number.clear();
                components += 1;
                if in_time {
                    time_components += 1;
                }
            }
        }
    }

    if !number.is_empty() || components == 0 || (in_time && time_components == 0) {
        return Err(invalid());
    }
    if !total_secs.is_finite() {
        return Err(invalid());
    }
    Duration::try_from_secs_f64(total_secs).map_err(|_| invalid())
}

/// Render a duration in canonical ISO-8601 form (`PT0S` for zero).
pub fn format_iso8601(duration: Duration) -> String {
    let secs = duration.as_secs();
    let nanos = duration.subsec_nanos();
    if secs == 0 && nanos == 0 {
        return "PT0S".to_string();
    }

    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3_600;
    let minutes = (secs % 3_600) / 60;
    let seconds = secs % 60;

    let mut out = String::from("P");
    if days > 0 {
        let _ = write!(out, "{}D", days);
    }
    if hours > 0 || minutes > 0 || seconds > 0 || nanos > 0 {
        out.push('T');
        if hours > 0 {
            let _ = write!(out, "{}H", hours);
        }
        if minutes > 0 {
            let _ = write!(out, "{}M", minutes);
        }
        if nanos > 0 {
            let fraction = format!("{:09}", nanos);
            let _ = write!(out, "{}.{}S", seconds, fraction.trim_end_matches('0'));
        } else if seconds > 0 {
            let _ = write!(out, "{}S", seconds);
        }
    }
    out
}

/// `#[serde(with = "iso8601")]` adapter for `std::time::Duration` fields.
pub mod iso8601 {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_iso8601(*duration))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_iso8601(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_forms() {
        assert_eq!(parse_iso8601("PT30M").unwrap(), Duration::from_secs(1800));
        assert_eq!(parse_iso8601("PT1H30M").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_iso8601("PT0S").unwrap(), Duration::ZERO);
        assert_eq!(parse_iso8601("P1DT2H").unwrap(), Duration::from_secs(93_600));
        assert_eq!(parse_iso8601("P1W").unwrap(), Duration::from_secs(604_800));
        assert_eq!(
            parse_iso8601("PT1.5S").unwrap(),
            Duration::from_millis(1500)
        );
    }

    #[test]
    fn rejects_malformed_input() {
        for bad in ["", "30M", "P", "PT", "P1DT", "PT5", "P1M", "P1Y", "PT1.5M", "PTM", "PT5X"] {
            assert!(parse_iso8601(bad).is_err(), "{} should be rejected", bad);
        }
    }

    #[test]
    fn rejects_values_too_large_for_a_duration() {
        assert!(matches!(
            parse_iso8601("PT99999999999999999999S"),
            Err(ConfigError::InvalidDuration(_))
        ));
        assert!(parse_iso8601("P99999999999999999999W").is_err());
        assert!(parse_iso8601(&format!("PT{}S", "9".repeat(400))).is_err());
    }

    #[test]
    fn oversized_duration_in_yaml_is_a_parse_error() {
        #[derive(Debug, serde::Deserialize)]
        struct Holder {
            #[serde(with = "iso8601")]
            #[allow(dead_code)]
            pause: Duration,
        }
        let result = serde_yaml::from_str::<Holder>("pause: P99999999999999999999W");
        assert!(result.is_err());
    }

    #[test]
    fn formats_canonically() {
        assert_eq!(format_iso8601(Duration::ZERO), "PT0S");
        assert_eq!(format_iso8601(Duration::from_secs(1800)), "PT30M");
        assert_eq!(format_iso8601(Duration::from_secs(5400)), "PT1H30M");
        assert_eq!(format_iso8601(Duration::from_secs(93_600)), "P1DT2H");
        assert_eq!(format_iso8601(Duration::from_millis(1500)), "PT1.5S");
    }
}
