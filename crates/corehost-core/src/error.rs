//! Error types and result aliases shared by corehost crates.
//!
//! These errors describe failures of the primitives in this crate (storage,
//! leases, identifier parsing). Domain crates wrap them in their own error
//! types with richer taxonomy.

/// The result type used throughout corehost primitives.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in corehost primitives.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An identifier could not be parsed.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of what made the ID invalid.
        message: String,
    },

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A filesystem operation failed.
    #[error("io error: {message}")]
    Io {
        /// What was being attempted.
        message: String,
        /// The underlying io error.
        #[source]
        source: std::io::Error,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An object was not found at a storage path.
    #[error("not found: {0}")]
    NotFound(String),

    /// A lease is currently held by another holder.
    #[error("lock {path} is held by {holder}")]
    LockHeld {
        /// Lock path.
        path: String,
        /// Current holder ID.
        holder: String,
    },

    /// A precondition for the operation was not met.
    #[error("precondition failed: {message}")]
    PreconditionFailed {
        /// Description of the failed precondition.
        message: String,
    },

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source cause.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates an io error with context about the attempted operation.
    #[must_use]
    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source,
        }
    }

    /// Returns true if this error means the object or resource does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            message: value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_variants_are_detected() {
        assert!(Error::NotFound("x".into()).is_not_found());
        assert!(!Error::storage("boom").is_not_found());
    }
}
