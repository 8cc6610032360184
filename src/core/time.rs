//! Permissive timestamp parsing.
//!
//! Remote servers hand back "last modified" stamps in a handful of near-ISO
//! shapes (`2015-12-09 12:42:00`, `2015-12-09T12:42:00Z`, trailing zone
//! names, numeric offsets). All of them are accepted and normalized to UTC;
//! the trailing offset/name is ignored, matching what the servers intend.

use chrono::{DateTime, NaiveDate, Utc};
use lazy_static::lazy_static;
use regex::Regex;

use crate::core::{Result, SessionError};

lazy_static! {
    // Ranges of minutes/seconds etc. are left to chrono to validate.
    static ref ISOTIME_RE: Regex = Regex::new(
        r"(?x)^
        (\d{4})            # year
        \D?
        (\d{2})            # month
        \D?
        (\d{2})            # day
        \D?                # a 'T' or space
        (\d{2})            # hours
        \D?
        (\d{2})            # minutes
        \D?
        (\d{2})            # seconds
        (?:\.(\d{1,6}))?   # microseconds
        \D?                # a 'Z' or space
        (?:
            [+-]?\d{4} |   # numeric offset
            \D{3,}         # named zone
        )?                 # ignored
        $"
    )
    .expect("timestamp pattern is valid");
}

/// Parse a timestamp string into a UTC datetime.
///
/// The grammar is deliberately loose about separators and silently ignores
/// any trailing offset or zone name. Out-of-range components are an error.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let caps = ISOTIME_RE
        .captures(raw)
        .ok_or_else(|| SessionError::ParseTimestamp(raw.to_string()))?;

    let num = |i: usize| -> u32 {
        caps.get(i)
            .map(|m| m.as_str().parse().unwrap_or(0))
            .unwrap_or(0)
    };

    let year: i32 = caps[1].parse().unwrap_or(0);
    let micros = caps
        .get(7)
        .map(|m| format!("{:0<6}", m.as_str()).parse().unwrap_or(0))
        .unwrap_or(0u32);

    let date = NaiveDate::from_ymd_opt(year, num(2), num(3))
        .ok_or_else(|| SessionError::ParseTimestamp(raw.to_string()))?;
    let naive = date
        .and_hms_micro_opt(num(4), num(5), num(6), micros)
        .ok_or_else(|| SessionError::ParseTimestamp(raw.to_string()))?;

    Ok(DateTime::from_naive_utc_and_offset(naive, Utc))
}
