//! Human-readable magnitudes: `"512m"`, `"2g"`, `"10M"`, `"30s"`.
//!
//! A magnitude is a decimal number followed by zero or more single-letter
//! unit modifiers. Modifiers are stripped right to left and multiplied
//! together, so `"1kk"` is a mebibyte and `"10ms"` is ten milliseconds.
//!
//! Memory modifiers are case-insensitive. Time modifiers are not: `m` is a
//! millisecond and `M` a minute.

use std::time::Duration;

use crate::error::{CoreError, CoreResult};

const MEMORY_MODIFIERS: &[(char, f64)] = &[
    ('b', 1.0),
    ('k', 1024.0),
    ('m', 1024.0 * 1024.0),
    ('g', 1024.0 * 1024.0 * 1024.0),
    ('t', 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ('p', 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
];

const TIME_MODIFIERS: &[(char, f64)] = &[
    ('n', 1e-9),
    ('u', 1e-6),
    ('µ', 1e-6),
    ('m', 1e-3),
    ('s', 1.0),
    ('M', 60.0),
    ('h', 3600.0),
    ('d', 86400.0),
];

fn parse_with_modifiers(
    input: &str,
    modifiers: &[(char, f64)],
    kind: &'static str,
) -> CoreResult<f64> {
    let mut rest = input.trim();
    let mut factor = 1.0;
    while let Some(last) = rest.chars().last() {
        match modifiers.iter().find(|(c, _)| *c == last) {
            Some((_, m)) => {
                factor *= m;
                rest = &rest[..rest.len() - last.len_utf8()];
            }
            None => break,
        }
    }
    let number: f64 = rest
        .trim()
        .parse()
        .map_err(|_| CoreError::parse(kind, input))?;
    let value = number * factor;
    if !value.is_finite() || value < 0.0 {
        return Err(CoreError::parse(kind, input));
    }
    Ok(value)
}

/// Parse a memory size into bytes.
pub fn parse_memory(input: &str) -> CoreResult<u64> {
    let lowered = input.to_lowercase();
    let bytes = parse_with_modifiers(&lowered, MEMORY_MODIFIERS, "memory")?;
    Ok(bytes.round() as u64)
}

/// Parse a time span.
pub fn parse_time(input: &str) -> CoreResult<Duration> {
    let secs = parse_with_modifiers(input, TIME_MODIFIERS, "time")?;
    Duration::try_from_secs_f64(secs).map_err(|_| CoreError::parse("time", input))
}

/// Canonical memory form: bytes with a `b` suffix.
pub fn unparse_memory(bytes: u64) -> String {
    format!("{bytes}b")
}

/// Canonical time form: seconds with an `s` suffix.
pub fn unparse_time(duration: Duration) -> String {
    format!("{}s", duration.as_secs_f64())
}

/// Parse a boolean the way config files spell it.
pub fn parse_bool(input: &str) -> CoreResult<bool> {
    match input.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(CoreError::parse("boolean", input)),
    }
}

/// Serde adapters for optional suffixed magnitudes.
///
/// Deserialization accepts either a string with modifiers or a bare JSON
/// number in base units.
pub mod serde_magnitude {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }

    pub mod memory {
        use super::*;

        pub fn serialize<S: Serializer>(value: &Option<u64>, s: S) -> Result<S::Ok, S::Error> {
            match value {
                Some(bytes) => s.serialize_str(&crate::parse::unparse_memory(*bytes)),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
            match Option::<Raw>::deserialize(d)? {
                None => Ok(None),
                Some(Raw::Number(n)) if n >= 0.0 => Ok(Some(n.round() as u64)),
                Some(Raw::Number(n)) => Err(serde::de::Error::custom(format!(
                    "negative memory size: {n}"
                ))),
                Some(Raw::Text(text)) => crate::parse::parse_memory(&text)
                    .map(Some)
                    .map_err(serde::de::Error::custom),
            }
        }
    }

    pub mod time {
        use super::*;

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            s: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(duration) => s.serialize_str(&crate::parse::unparse_time(*duration)),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            d: D,
        ) -> Result<Option<Duration>, D::Error> {
            match Option::<Raw>::deserialize(d)? {
                None => Ok(None),
                Some(Raw::Number(n)) => Duration::try_from_secs_f64(n)
                    .map(Some)
                    .map_err(|_| serde::de::Error::custom(format!("invalid time: {n}"))),
                Some(Raw::Text(text)) => crate::parse::parse_time(&text)
                    .map(Some)
                    .map_err(serde::de::Error::custom),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_suffixes() {
        assert_eq!(parse_memory("512").unwrap(), 512);
        assert_eq!(parse_memory("512b").unwrap(), 512);
        assert_eq!(parse_memory("1k").unwrap(), 1024);
        assert_eq!(parse_memory("512m").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_memory("2G").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_memory("1.5k").unwrap(), 1536);
    }

    #[test]
    fn memory_compound_suffixes_multiply() {
        assert_eq!(parse_memory("1kk").unwrap(), 1024 * 1024);
        assert_eq!(parse_memory("3kb").unwrap(), 3 * 1024);
    }

    #[test]
    fn time_suffixes_are_case_sensitive() {
        assert_eq!(parse_time("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_time("10M").unwrap(), Duration::from_secs(600));
        let ten_ms = parse_time("10ms").unwrap().as_secs_f64();
        assert!((ten_ms - 0.01).abs() < 1e-9);
        assert_eq!(parse_time("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_time("1.5").unwrap(), Duration::from_millis(1500));
    }

    #[test]
    fn rejects_garbage_and_negatives() {
        assert!(parse_memory("lots").is_err());
        assert!(parse_memory("").is_err());
        assert!(parse_memory("-5m").is_err());
        assert!(parse_time("soon").is_err());
    }

    #[test]
    fn out_of_range_time_is_an_error() {
        assert!(parse_time("1e300s").is_err());
        assert!(parse_time("1e300d").is_err());
        let limits: Result<crate::ResourceLimits, _> = serde_json::from_str(r#"{"time":1e300}"#);
        assert!(limits.is_err());
        let limits: Result<crate::ResourceLimits, _> = serde_json::from_str(r#"{"time":-1}"#);
        assert!(limits.is_err());
    }

    #[test]
    fn unparse_is_canonical() {
        assert_eq!(unparse_memory(1024), "1024b");
        assert_eq!(unparse_time(Duration::from_secs(10)), "10s");
        assert_eq!(unparse_time(Duration::from_millis(1500)), "1.5s");
        assert_eq!(parse_memory(&unparse_memory(4096)).unwrap(), 4096);
    }

    #[test]
    fn booleans() {
        assert!(parse_bool("yes").unwrap());
        assert!(!parse_bool("False").unwrap());
        assert!(parse_bool("maybe").is_err());
    }
}
