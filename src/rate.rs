//! Rate strings: `"<count>/<period><unit>"`.
//!
//! The count is a positive integer without leading zeros. The period number is
//! optional (defaults to `1`), may carry a decimal fraction, and is followed by
//! one of the units `ms`, `s`, `m`, `h`, `d`.
//!
//! ```rust
//! use relimit::Rate;
//! use std::time::Duration;
//!
//! let rate: Rate = "5/1.5h".parse().unwrap();
//! assert_eq!(rate.count(), 5);
//! assert_eq!(rate.period(), Duration::from_secs(5400));
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

const NANOS_PER_MILLI: u128 = 1_000_000;

/// Unit suffixes and their length in milliseconds. `ms` must precede `m` and `s`.
const UNITS: [(&str, u128); 5] =
    [("ms", 1), ("s", 1_000), ("m", 60_000), ("h", 3_600_000), ("d", 86_400_000)];

/// Errors produced while parsing a rate string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateParseError {
    /// The string does not match `<count>/<period><unit>`.
    #[error("invalid rate `{0}`: expected `<count>/<period><unit>` with unit ms|s|m|h|d")]
    Malformed(String),
    /// The count or period does not fit the supported range.
    #[error("rate `{0}` is out of range")]
    OutOfRange(String),
}

/// An admission rate: at most `count` items per `period`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rate {
    count: u32,
    period: Duration,
}

impl Rate {
    /// Build a rate from its parts. Both the count and the period must be non-zero.
    pub fn new(count: u32, period: Duration) -> Option<Self> {
        if count == 0 || period.is_zero() {
            return None;
        }
        Some(Self { count, period })
    }

    /// Admissions allowed per period.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Length of the sliding window.
    pub fn period(&self) -> Duration {
        self.period
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:?}", self.count, self.period)
    }
}

impl FromStr for Rate {
    type Err = RateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_rate(s)
    }
}

/// Parse `"<count>/<period><unit>"` into a [`Rate`].
pub fn parse_rate(input: &str) -> Result<Rate, RateParseError> {
    let malformed = || RateParseError::Malformed(input.to_string());
    let out_of_range = || RateParseError::OutOfRange(input.to_string());

    let (count, period) = input.split_once('/').ok_or_else(malformed)?;

    if !is_positive_integer(count) {
        return Err(malformed());
    }
    let count: u32 = count.parse().map_err(|_| out_of_range())?;

    let (number, unit_millis) = UNITS
        .iter()
        .find_map(|(suffix, millis)| period.strip_suffix(suffix).map(|rest| (rest, *millis)))
        .ok_or_else(malformed)?;

    let unit_nanos = unit_millis * NANOS_PER_MILLI;
    let nanos = if number.is_empty() {
        unit_nanos
    } else {
        let (whole, fraction) = match number.split_once('.') {
            Some((whole, fraction)) => {
                if fraction.is_empty() || !fraction.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(malformed());
                }
                (whole, fraction)
            }
            None => (number, ""),
        };
        if !is_positive_integer(whole) {
            return Err(malformed());
        }

        let digits = format!("{whole}{fraction}");
        let mantissa: u128 = digits.parse().map_err(|_| out_of_range())?;
        let scale = u32::try_from(fraction.len())
            .ok()
            .and_then(|exp| 10u128.checked_pow(exp))
            .ok_or_else(out_of_range)?;
        mantissa.checked_mul(unit_nanos).ok_or_else(out_of_range)? / scale
    };

    let nanos = u64::try_from(nanos).map_err(|_| out_of_range())?;
    Rate::new(count, Duration::from_nanos(nanos)).ok_or_else(out_of_range)
}

fn is_positive_integer(s: &str) -> bool {
    let mut bytes = s.bytes();
    matches!(bytes.next(), Some(b'1'..=b'9')) && bytes.all(|b| b.is_ascii_digit())
}
