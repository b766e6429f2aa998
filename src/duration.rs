//! Reset-duration strings.
//!
//! Budgets and rate limits express their reset windows as `<n><unit>` where
//! the unit extends the usual seconds/minutes/hours with calendar-ish spans:
//! `s`, `m`, `h`, `d` (24 h), `w` (7 d), `M` (~30 d), `Y` (~365 d).

use std::time::Duration;

const SECOND: u64 = 1;
const MINUTE: u64 = 60;
const HOUR: u64 = 3_600;
const DAY: u64 = 86_400;
const WEEK: u64 = 7 * DAY;
const MONTH: u64 = 30 * DAY;
const YEAR: u64 = 365 * DAY;

/// Parse an extended duration string such as `30s`, `12h`, `1d`, `2w`, `1M`.
///
/// Returns a human-readable message on malformed input; callers surface it
/// as a validation error.
pub fn parse_extended_duration(input: &str) -> Result<Duration, String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err("duration string is empty".to_string());
    }

    let (number, unit) = trimmed.split_at(trimmed.len() - 1);
    let count: u64 = number
        .parse()
        .map_err(|_| format!("invalid duration {:?}: expected <n><s|m|h|d|w|M|Y>", input))?;
    if count == 0 {
        return Err(format!("invalid duration {:?}: count must be positive", input));
    }

    let unit_seconds = match unit {
        "s" => SECOND,
        "m" => MINUTE,
        "h" => HOUR,
        "d" => DAY,
        "w" => WEEK,
        "M" => MONTH,
        "Y" => YEAR,
        other => {
            return Err(format!(
                "invalid duration unit {:?} in {:?}: expected one of s, m, h, d, w, M, Y",
                other, input
            ))
        }
    };

    count
        .checked_mul(unit_seconds)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("duration {:?} overflows", input))
}

/// Validate a duration string without needing the parsed value.
pub fn validate_extended_duration(input: &str) -> Result<(), String> {
    parse_extended_duration(input).map(|_| ())
}
