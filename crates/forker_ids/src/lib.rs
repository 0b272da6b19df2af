//! Opaque identifier types shared across the replication engine's crates.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Error returned when parsing an identifier fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdParseError {
    message: String,
}

impl IdParseError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<String> for IdParseError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl fmt::Display for IdParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for IdParseError {}

macro_rules! define_uuid_id {
    ($name:ident, $label:expr) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn parse(value: &str) -> Result<Self, IdParseError> {
                Uuid::parse_str(value)
                    .map_err(|e| IdParseError::new(format!("invalid {}: {}", $label, e)))?;
                Ok(Self(value.to_string()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }
    };
}

// Globally unique, server-generated identifiers (§3).
define_uuid_id!(JobId, "job ID");
define_uuid_id!(QuarantineEntryId, "quarantine entry ID");

/// A configuration-named destination slot, e.g. `"TargetA"` / `"TargetB"`.
///
/// Unlike [`JobId`], target ids are not generated: they come straight out of
/// `directories.targetA` / `directories.targetB` style configuration keys and
/// are compared for equality against the job's `RequiredTargets` list.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(String);

impl TargetId {
    pub fn parse(value: impl Into<String>) -> Result<Self, IdParseError> {
        let value = value.into();
        if value.is_empty() {
            return Err(IdParseError::new("target id must not be empty"));
        }
        if !value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(IdParseError::new(format!(
                "target id '{value}' contains characters other than alphanumerics, '_', '-'"
            )));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TargetId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_round_trips_through_string() {
        let id = JobId::new();
        let parsed: JobId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn job_id_rejects_garbage() {
        assert!(JobId::parse("not-a-uuid").is_err());
    }

    #[test]
    fn target_id_accepts_configured_names() {
        assert_eq!(TargetId::parse("TargetA").unwrap().as_str(), "TargetA");
        assert_eq!(TargetId::parse("target_b-2").unwrap().as_str(), "target_b-2");
    }

    #[test]
    fn target_id_rejects_empty_and_invalid() {
        assert!(TargetId::parse("").is_err());
        assert!(TargetId::parse("has space").is_err());
    }
}
