use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

use super::CacheError;

const UNITS: &[(char, u64)] = &[
    ('y', 365 * 24 * 60 * 60),
    ('w', 7 * 24 * 60 * 60),
    ('d', 24 * 60 * 60),
    ('h', 60 * 60),
    ('m', 60),
    ('s', 1),
];

/// How long a cached asset stays fresh.
///
/// Written as `<integer><unit>` with a unit out of `s`, `m`, `h`, `d`, `w` (7 days) and `y`
/// (365 days), or `*` for an entry that never expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheDuration {
    Forever,
    Finite(Duration),
}

impl CacheDuration {
    /// One day.
    pub const DEFAULT: Self = Self::Finite(Duration::from_secs(24 * 60 * 60));

    /// Whether something cached at `cached_at` is still fresh at `now`.
    ///
    /// An entry is fresh while its age is strictly below the duration. Timestamps from the future
    /// count as age zero.
    pub fn is_fresh(&self, cached_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self {
            Self::Forever => true,
            Self::Finite(duration) => {
                let age = (now - cached_at).to_std().unwrap_or(Duration::ZERO);
                age < *duration
            }
        }
    }
}

impl Default for CacheDuration {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl FromStr for CacheDuration {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "*" {
            return Ok(Self::Forever);
        }

        let invalid = || CacheError::InvalidDuration(s.to_owned());

        let unit = s.chars().last().ok_or_else(invalid)?;
        let multiplier = UNITS
            .iter()
            .find_map(|(u, m)| (*u == unit).then_some(*m))
            .ok_or_else(invalid)?;

        let value = &s[..s.len() - unit.len_utf8()];
        if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let seconds = value
            .parse::<u64>()
            .ok()
            .and_then(|v| v.checked_mul(multiplier))
            .ok_or_else(invalid)?;

        Ok(Self::Finite(Duration::from_secs(seconds)))
    }
}

impl fmt::Display for CacheDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Forever => f.write_str("*"),
            Self::Finite(duration) => {
                let secs = duration.as_secs();
                if secs == 0 {
                    return f.write_str("0s");
                }
                let (unit, multiplier) = UNITS
                    .iter()
                    .find(|(_, m)| secs % m == 0)
                    .copied()
                    .unwrap_or(('s', 1));
                write!(f, "{}{unit}", secs / multiplier)
            }
        }
    }
}

impl Serialize for CacheDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CacheDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}
