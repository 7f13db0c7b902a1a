//! Timestamps on the model time grid

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// A point on a time grid, in whole seconds since the Unix epoch (UTC).
///
/// Member files may write timestamps as integers, as integral floats (`1672531200.0`) or as
/// RFC 3339 strings; all are normalised to seconds. Grids have one-second resolution: a
/// timestamp with a non-zero fraction of a second is rejected rather than truncated, so that
/// distinct sub-second steps never collapse onto one. Timestamps always serialise as integers.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(try_from = "TimeRepr", into = "i64")]
pub struct Timestamp(i64);

/// Accepted on-disk representations of a timestamp.
#[derive(Deserialize)]
#[serde(untagged)]
enum TimeRepr {
    Seconds(i64),
    Float(f64),
    Text(String),
}

impl TryFrom<TimeRepr> for Timestamp {
    type Error = String;

    fn try_from(repr: TimeRepr) -> Result<Self, Self::Error> {
        match repr {
            TimeRepr::Seconds(seconds) => Ok(Timestamp(seconds)),
            TimeRepr::Float(seconds) => Timestamp::from_float_seconds(seconds),
            TimeRepr::Text(text) => Timestamp::parse_rfc3339(&text),
        }
    }
}

impl From<Timestamp> for i64 {
    fn from(timestamp: Timestamp) -> Self {
        timestamp.0
    }
}

impl Timestamp {
    /// Return a new Timestamp from seconds since the Unix epoch.
    pub const fn from_seconds(seconds: i64) -> Self {
        Timestamp(seconds)
    }

    /// Return the current time, truncated to whole seconds.
    pub fn now() -> Self {
        Timestamp(OffsetDateTime::now_utc().unix_timestamp())
    }

    /// Return a new Timestamp from a whole number of seconds held in a float.
    pub fn from_float_seconds(seconds: f64) -> Result<Self, String> {
        // i64::MAX is not representable; 2^63 is the first float beyond it.
        let in_range = seconds >= i64::MIN as f64 && seconds < i64::MAX as f64;
        if !seconds.is_finite() || !in_range {
            return Err(format!("timestamp {} is out of range", seconds));
        }
        if seconds.fract() != 0.0 {
            return Err(format!(
                "timestamp {} has a fraction of a second; grids have one-second resolution",
                seconds
            ));
        }
        Ok(Timestamp(seconds as i64))
    }

    /// Parse an RFC 3339 date-time, such as `2023-01-01T00:00:00.000-05:00`.
    ///
    /// A non-zero fraction of a second is an error.
    pub fn parse_rfc3339(text: &str) -> Result<Self, String> {
        let datetime = OffsetDateTime::parse(text, &Rfc3339)
            .map_err(|err| format!("invalid timestamp '{}': {}", text, err))?;
        if datetime.nanosecond() != 0 {
            return Err(format!(
                "timestamp '{}' has a fraction of a second; grids have one-second resolution",
                text
            ));
        }
        Ok(Timestamp(datetime.unix_timestamp()))
    }

    /// Seconds since the Unix epoch.
    pub fn seconds(self) -> i64 {
        self.0
    }

    /// Return this timestamp shifted by a signed number of seconds.
    pub fn offset(self, seconds: i64) -> Self {
        Timestamp(self.0.saturating_add(seconds))
    }

    /// Format as RFC 3339 (UTC), falling back to the raw seconds when out of range.
    pub fn to_rfc3339(self) -> String {
        OffsetDateTime::from_unix_timestamp(self.0)
            .ok()
            .and_then(|datetime| datetime.format(&Rfc3339).ok())
            .unwrap_or_else(|| self.0.to_string())
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_rfc3339())
    }
}
