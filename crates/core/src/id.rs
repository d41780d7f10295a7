//! Strongly-typed identifiers used across the queue.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Identifier of a job row.
///
/// Assigned by the store, strictly increasing in insertion order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(i64);

/// Identifier of the work item a job operates on (e.g. an attachment).
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct SubjectId(i64);

impl JobId {
    pub fn from_raw(raw: i64) -> Self {
        Self(raw)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl SubjectId {
    /// Create a subject identifier. Only strictly positive ids are accepted.
    pub fn new(raw: i64) -> DomainResult<Self> {
        if raw <= 0 {
            return Err(DomainError::invalid_id(format!(
                "SubjectId: must be positive, got {raw}"
            )));
        }
        Ok(Self(raw))
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

macro_rules! impl_int_newtype {
    ($t:ty, $name:literal) => {
        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<$t> for i64 {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let raw = i64::from_str(s.trim())
                    .map_err(|e| DomainError::invalid_id(format!("{}: {}", $name, e)))?;
                <$t>::try_from(raw)
            }
        }
    };
}

impl TryFrom<i64> for JobId {
    type Error = DomainError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        if value <= 0 {
            return Err(DomainError::invalid_id(format!(
                "JobId: must be positive, got {value}"
            )));
        }
        Ok(Self(value))
    }
}

impl TryFrom<i64> for SubjectId {
    type Error = DomainError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl_int_newtype!(JobId, "JobId");
impl_int_newtype!(SubjectId, "SubjectId");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_id_rejects_non_positive() {
        assert!(SubjectId::new(0).is_err());
        assert!(SubjectId::new(-7).is_err());
        assert_eq!(SubjectId::new(42).unwrap().as_i64(), 42);
    }

    #[test]
    fn parse_from_str() {
        let id: SubjectId = " 17 ".parse().unwrap();
        assert_eq!(id.as_i64(), 17);

        let err = "abc".parse::<JobId>().unwrap_err();
        assert!(matches!(err, DomainError::InvalidId(_)));
        assert!("0".parse::<SubjectId>().is_err());
    }

    #[test]
    fn subject_id_deserialize_validates() {
        let ok: SubjectId = serde_json::from_str("5").unwrap();
        assert_eq!(ok.to_string(), "5");
        assert!(serde_json::from_str::<SubjectId>("0").is_err());
    }
}
