//! Query options for window and session multi-fetch operations

use crate::clock::Clock;
use crate::error::{StoreError, StoreResult};

/// Option name for the inclusive lower time bound
pub const TIMESTAMP_FROM: &str = "timestamp.from";
/// Option name for the upper time bound
pub const TIMESTAMP_TO: &str = "timestamp.to";

/// Time bounds for a fetch; unset bounds default to `0` and the current time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryOptions {
    pub time_from: Option<i64>,
    pub time_to: Option<i64>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from(mut self, time_from: i64) -> Self {
        self.time_from = Some(time_from);
        self
    }

    pub fn to(mut self, time_to: i64) -> Self {
        self.time_to = Some(time_to);
        self
    }

    /// Parse `(name, value)` option pairs
    ///
    /// Recognised names are `timestamp.from` and `timestamp.to`; any other
    /// name, or a value that is not an integer, is a configuration error.
    pub fn parse<'a, I>(options: I) -> StoreResult<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut parsed = QueryOptions::default();
        for (name, value) in options {
            let millis: i64 = value.trim().parse().map_err(|_| {
                StoreError::configuration(format!(
                    "query option '{}' expects an integer timestamp, got '{}'",
                    name, value
                ))
            })?;
            match name {
                TIMESTAMP_FROM => parsed.time_from = Some(millis),
                TIMESTAMP_TO => parsed.time_to = Some(millis),
                other => {
                    return Err(StoreError::configuration(format!(
                        "unknown query option '{}'",
                        other
                    )))
                }
            }
        }
        Ok(parsed)
    }

    /// Resolve defaults against `clock` and check `from <= to`
    pub fn resolve(&self, clock: &dyn Clock) -> StoreResult<(i64, i64)> {
        let from = self.time_from.unwrap_or(0);
        let to = self.time_to.unwrap_or_else(|| clock.now_millis());
        check_time_range(from, to)?;
        Ok((from, to))
    }
}

pub(crate) fn check_time_range(time_from: i64, time_to: i64) -> StoreResult<()> {
    if time_from > time_to {
        return Err(StoreError::invalid_range(format!(
            "time from {} is after time to {}",
            time_from, time_to
        )));
    }
    Ok(())
}

pub(crate) fn check_key_range(from: &[u8], to: &[u8]) -> StoreResult<()> {
    if from > to {
        return Err(StoreError::invalid_range(format!(
            "from key {:?} is after to key {:?}",
            from, to
        )));
    }
    Ok(())
}
