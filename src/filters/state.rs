//! # Filter states.
//!
//! Every filter answers with one [`FilterState`]. The numeric codes are stable
//! and used in telemetry:
//!
//! | state        | code |
//! |--------------|------|
//! | `Disabled`   | -3   |
//! | `Session`    | -2   |
//! | `Pass`       | -1   |
//! | `Fail`       | 0    |
//! | `Retry(N)`   | N>0  |

use std::fmt;
use std::time::Duration;

use serde::{Serialize, Serializer};

/// Answer of a filter, and the outcome of a filter decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterState {
    /// The filter takes no part in the decision.
    Disabled,
    /// Admission is deferred until a one-time session trigger fires.
    Session,
    /// Run now.
    Pass,
    /// Do not run.
    Fail,
    /// Ask again after the given delay.
    Retry(Duration),
}

impl FilterState {
    /// Builds a retry state, clamping zero to 1ms so it stays a valid retry.
    pub fn retry_ms(ms: u64) -> Self {
        FilterState::Retry(Duration::from_millis(ms.max(1)))
    }

    /// Returns the stable numeric code.
    pub fn code(self) -> i64 {
        match self {
            FilterState::Disabled => -3,
            FilterState::Session => -2,
            FilterState::Pass => -1,
            FilterState::Fail => 0,
            FilterState::Retry(d) => d.as_millis().clamp(1, i64::MAX as u128) as i64,
        }
    }

    /// Parses a numeric code. Unknown negative codes read as `Fail`.
    pub fn from_code(code: i64) -> Self {
        match code {
            -3 => FilterState::Disabled,
            -2 => FilterState::Session,
            -1 => FilterState::Pass,
            n if n > 0 => FilterState::retry_ms(n as u64),
            _ => FilterState::Fail,
        }
    }

    /// Returns the retry delay, if this is a retry.
    pub fn retry_after(self) -> Option<Duration> {
        match self {
            FilterState::Retry(d) => Some(d),
            _ => None,
        }
    }
}

impl fmt::Display for FilterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterState::Disabled => f.write_str("disabled"),
            FilterState::Session => f.write_str("session"),
            FilterState::Pass => f.write_str("pass"),
            FilterState::Fail => f.write_str("fail"),
            FilterState::Retry(d) => write!(f, "retry({}ms)", d.as_millis()),
        }
    }
}

impl Serialize for FilterState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_match_table() {
        assert_eq!(FilterState::Disabled.code(), -3);
        assert_eq!(FilterState::Session.code(), -2);
        assert_eq!(FilterState::Pass.code(), -1);
        assert_eq!(FilterState::Fail.code(), 0);
        assert_eq!(FilterState::retry_ms(250).code(), 250);
        assert_eq!(FilterState::retry_ms(0).code(), 1);
    }

    #[test]
    fn test_from_code_edges() {
        assert_eq!(FilterState::from_code(-9), FilterState::Fail);
        assert_eq!(FilterState::from_code(40), FilterState::retry_ms(40));
        assert_eq!(FilterState::from_code(-2), FilterState::Session);
    }
}
