//! Durations as written in deployment descriptors: `"500ms"`, `"10s"`, `"2m"`, `"1h"`.
//! A bare integer is a number of seconds.
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpecDuration(pub Duration);

impl SpecDuration {
    pub const fn from_secs(secs: u64) -> Self {
        SpecDuration(Duration::from_secs(secs))
    }

    pub const fn from_millis(millis: u64) -> Self {
        SpecDuration(Duration::from_millis(millis))
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }
}

impl From<Duration> for SpecDuration {
    fn from(value: Duration) -> Self {
        SpecDuration(value)
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("invalid duration {0:?}: expected <n>ms, <n>s, <n>m or <n>h")]
pub struct ParseSpecDurationError(String);

impl FromStr for SpecDuration {
    type Err = ParseSpecDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let split = trimmed
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(trimmed.len());
        let (digits, unit) = trimmed.split_at(split);
        let value = digits
            .parse::<u64>()
            .map_err(|_| ParseSpecDurationError(s.to_owned()))?;

        let duration = match unit.trim() {
            "" | "s" => Duration::from_secs(value),
            "ms" => Duration::from_millis(value),
            "m" => Duration::from_secs(value.saturating_mul(60)),
            "h" => Duration::from_secs(value.saturating_mul(3600)),
            _ => return Err(ParseSpecDurationError(s.to_owned())),
        };

        Ok(SpecDuration(duration))
    }
}

impl fmt::Display for SpecDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let millis = self.0.as_millis();
        if millis == 0 {
            write!(f, "0s")
        } else if millis % 3_600_000 == 0 {
            write!(f, "{}h", millis / 3_600_000)
        } else if millis % 60_000 == 0 {
            write!(f, "{}m", millis / 60_000)
        } else if millis % 1000 == 0 {
            write!(f, "{}s", millis / 1000)
        } else {
            write!(f, "{}ms", millis)
        }
    }
}

impl Serialize for SpecDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SpecDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Seconds(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Seconds(secs) => Ok(SpecDuration::from_secs(secs)),
            Raw::Text(text) => text.parse().map_err(serde::de::Error::custom),
        }
    }
}
