//! Strongly-typed identifiers for corehost records.
//!
//! Job and history-entry IDs are ULIDs, so their string form sorts by
//! creation time. Storage listings rely on that to return records in order.
//! Instance IDs are assigned by the instance directory and are plain integers.
//!
//! # Example
//!
//! ```rust
//! use corehost_core::id::{HistoryEntryId, JobId};
//!
//! let job = JobId::generate();
//! let entry = HistoryEntryId::generate();
//!
//! // IDs are different types - this won't compile:
//! // let wrong: JobId = entry;
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::{Error, Result};

macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Ulid);

        impl $name {
            /// Generates a new unique ID.
            #[must_use]
            pub fn generate() -> Self {
                Self(Ulid::new())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Ulid::from_string(s).map(Self).map_err(|e| Error::InvalidId {
                    message: format!(concat!("invalid ", $label, " '{}': {}"), s, e),
                })
            }
        }
    };
}

ulid_id!(
    /// Identifies one deployment job.
    JobId,
    "job ID"
);

ulid_id!(
    /// Identifies one entry in an instance's version history.
    ///
    /// Entries for the same instance sort by this ID in creation order.
    HistoryEntryId,
    "history entry ID"
);

/// Identifier of a hosted instance, as assigned by the instance directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(u64);

impl InstanceId {
    /// Wraps a raw instance number.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw instance number.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for InstanceId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for InstanceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.trim().parse::<u64>().map(Self).map_err(|e| Error::InvalidId {
            message: format!("invalid instance ID '{s}': {e}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_parses_its_display_form() {
        let id = JobId::generate();
        let parsed: JobId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn history_ids_sort_by_creation() {
        let first = HistoryEntryId::generate();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = HistoryEntryId::generate();
        assert!(first.to_string() < second.to_string());
        assert!(first < second);
    }

    #[test]
    fn invalid_ids_return_errors() {
        assert!("not-a-valid-ulid".parse::<JobId>().is_err());
        assert!("abc".parse::<InstanceId>().is_err());
        assert_eq!("42".parse::<InstanceId>().unwrap(), InstanceId::new(42));
    }
}
