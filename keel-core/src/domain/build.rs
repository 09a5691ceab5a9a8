//! Build identifier domain types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Immutable identifier of one release attempt
///
/// Allocated once per invocation, strictly increasing per service. Its
/// decimal form doubles as the image tag and as the correlation key in
/// logs, commit messages and the final report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildId(u64);

impl BuildId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    /// The image tag for this build
    pub fn tag(self) -> String {
        self.0.to_string()
    }
}

impl fmt::Display for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for BuildId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u64>().map(BuildId)
    }
}

impl From<u64> for BuildId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_is_decimal() {
        assert_eq!(BuildId::new(42).tag(), "42");
    }

    #[test]
    fn test_parse_trims_whitespace() {
        let id: BuildId = " 17\n".parse().unwrap();
        assert_eq!(id, BuildId::new(17));
        assert!("abc".parse::<BuildId>().is_err());
    }

    #[test]
    fn test_ordering_follows_value() {
        assert!(BuildId::new(41) < BuildId::new(42));
    }
}
