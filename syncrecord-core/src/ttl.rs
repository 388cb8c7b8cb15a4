//! Time-to-live for materialized views.
//!
//! A TTL tells the sync backend how long to keep a view's data around after
//! its last listener goes away. TTLs are written as short strings in
//! configuration: `"none"`, `"forever"`, or a number with a unit suffix
//! (`ms`, `s`, `m`, `h`, `d`), e.g. `"30s"` or `"5m"`.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::RecordError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Ttl {
    /// Evict as soon as the view is destroyed.
    None,
    /// Never evict.
    Forever,
    /// Keep for the given duration after destruction.
    Duration(Duration),
}

impl Ttl {
    pub const fn seconds(secs: u64) -> Self {
        Ttl::Duration(Duration::from_secs(secs))
    }

    /// Saturates at `u64::MAX` seconds.
    pub const fn minutes(mins: u64) -> Self {
        Ttl::Duration(Duration::from_secs(mins.saturating_mul(60)))
    }

    /// Saturates at `u64::MAX` seconds.
    pub const fn hours(hours: u64) -> Self {
        Ttl::Duration(Duration::from_secs(hours.saturating_mul(60 * 60)))
    }

    /// The retention as a duration; `None` for `Forever`.
    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Ttl::None => Some(Duration::ZERO),
            Ttl::Forever => None,
            Ttl::Duration(d) => Some(*d),
        }
    }
}

impl Default for Ttl {
    fn default() -> Self {
        Ttl::minutes(5)
    }
}

impl FromStr for Ttl {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s {
            "none" => return Ok(Ttl::None),
            "forever" => return Ok(Ttl::Forever),
            _ => {}
        }

        let split = s
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| RecordError::invalid_query(format!("ttl {s:?} is missing a unit")))?;
        let (digits, unit) = s.split_at(split);
        let amount: u64 = digits
            .parse()
            .map_err(|_| RecordError::invalid_query(format!("ttl {s:?} has no amount")))?;

        let seconds_per = match unit {
            "ms" => return Ok(Ttl::Duration(Duration::from_millis(amount))),
            "s" => 1,
            "m" => 60,
            "h" => 60 * 60,
            "d" => 60 * 60 * 24,
            other => {
                return Err(RecordError::invalid_query(format!(
                    "ttl {s:?} has unknown unit {other:?}"
                )))
            }
        };
        let secs = amount
            .checked_mul(seconds_per)
            .ok_or_else(|| RecordError::invalid_query(format!("ttl {s:?} is out of range")))?;
        let duration = Duration::from_secs(secs);
        Ok(Ttl::Duration(duration))
    }
}

impl TryFrom<String> for Ttl {
    type Error = RecordError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Ttl> for String {
    fn from(ttl: Ttl) -> Self {
        ttl.to_string()
    }
}

impl fmt::Display for Ttl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ttl::None => f.write_str("none"),
            Ttl::Forever => f.write_str("forever"),
            Ttl::Duration(d) => {
                let millis = d.as_millis();
                const UNITS: [(u128, &str); 4] = [
                    (24 * 60 * 60 * 1000, "d"),
                    (60 * 60 * 1000, "h"),
                    (60 * 1000, "m"),
                    (1000, "s"),
                ];
                for (size, suffix) in UNITS {
                    if millis >= size && millis % size == 0 {
                        return write!(f, "{}{}", millis / size, suffix);
                    }
                }
                write!(f, "{millis}ms")
            }
        }
    }
}
