//! Error types for version registry, deployment, and instance tracking.

use thiserror::Error;

/// Result type alias for release operations.
pub type Result<T> = std::result::Result<T, ReleaseError>;

/// Errors that can occur during release operations.
#[derive(Debug, Error)]
pub enum ReleaseError {
    /// Malformed input, bad version format, or a missing required field.
    #[error("validation error: {message}")]
    Validation {
        /// What was wrong with the input.
        message: String,
    },

    /// An instance, version, user, job, or file does not exist.
    #[error("{entity} not found: {name}")]
    NotFound {
        /// Kind of thing that was looked up.
        entity: &'static str,
        /// The identifier that was looked up.
        name: String,
    },

    /// The acting principal lacks the role required for the operation.
    #[error("forbidden: {message}")]
    Forbidden {
        /// Why the principal was rejected.
        message: String,
    },

    /// The request is well-formed but violates a business rule.
    #[error("{message}")]
    InvalidOperation {
        /// Explanation for the caller.
        message: String,
    },

    /// Another writer holds the resource or won a concurrent update.
    #[error("conflict: {message}")]
    Conflict {
        /// Description of the conflict.
        message: String,
    },

    /// The upstream manifest could not be fetched.
    #[error("upstream unavailable: {message}")]
    UpstreamUnavailable {
        /// Description of the transport or status failure.
        message: String,
    },

    /// The upstream answered with something that is not a valid manifest.
    #[error("malformed upstream response: {message}")]
    MalformedResponse {
        /// Description of the parse or validation failure.
        message: String,
    },

    /// A file copy, hash, or source synchronization failed.
    #[error("io error: {message}")]
    Io {
        /// What was being attempted and why it failed.
        message: String,
    },

    /// Metadata storage failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
    },

    /// A persisted record could not be encoded or decoded.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// Should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl ReleaseError {
    /// Creates a validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates a not-found error for `entity` named `name`.
    #[must_use]
    pub fn not_found(entity: &'static str, name: impl std::fmt::Display) -> Self {
        Self::NotFound {
            entity,
            name: name.to_string(),
        }
    }

    /// Creates a forbidden error.
    #[must_use]
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden {
            message: message.into(),
        }
    }

    /// Creates a business-rule violation.
    #[must_use]
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates a conflict error.
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Creates an upstream-unavailable error.
    #[must_use]
    pub fn upstream(message: impl Into<String>) -> Self {
        Self::UpstreamUnavailable {
            message: message.into(),
        }
    }

    /// Creates a malformed-response error.
    #[must_use]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedResponse {
            message: message.into(),
        }
    }

    /// Creates an io error with context.
    #[must_use]
    pub fn io(context: impl std::fmt::Display, source: impl std::fmt::Display) -> Self {
        Self::Io {
            message: format!("{context}: {source}"),
        }
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Short label for metrics and job records.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::NotFound { .. } => "not_found",
            Self::Forbidden { .. } => "forbidden",
            Self::InvalidOperation { .. } => "invalid_operation",
            Self::Conflict { .. } => "conflict",
            Self::UpstreamUnavailable { .. } => "upstream_unavailable",
            Self::MalformedResponse { .. } => "malformed_response",
            Self::Io { .. } => "io",
            Self::Storage { .. } => "storage",
            Self::Serialization { .. } => "serialization",
            Self::Internal { .. } => "internal",
        }
    }
}

impl From<corehost_core::Error> for ReleaseError {
    fn from(value: corehost_core::Error) -> Self {
        use corehost_core::Error as Core;
        match value {
            Core::InvalidId { message } => Self::Validation { message },
            Core::InvalidInput(message) => Self::Validation { message },
            Core::NotFound(path) => Self::NotFound {
                entity: "object",
                name: path,
            },
            Core::LockHeld { path, holder } => Self::Conflict {
                message: format!("{path} is held by {holder}"),
            },
            Core::PreconditionFailed { message } => Self::Conflict { message },
            Core::Io { message, source } => Self::Io {
                message: format!("{message}: {source}"),
            },
            Core::Serialization { message } => Self::Serialization { message },
            err @ Core::Storage { .. } => Self::Storage {
                message: err.to_string(),
            },
            Core::Internal { message } => Self::Internal { message },
        }
    }
}

impl From<serde_json::Error> for ReleaseError {
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
    fn held_lock_maps_to_conflict() {
        let err: ReleaseError = corehost_core::Error::LockHeld {
            path: "locks/deploy.lock.json".into(),
            holder: "abc".into(),
        }
        .into();
        assert_eq!(err.kind(), "conflict");
    }

    #[test]
    fn invalid_input_maps_to_validation() {
        let err: ReleaseError = corehost_core::Error::InvalidInput("bad".into()).into();
        assert!(matches!(err, ReleaseError::Validation { .. }));
    }

    #[test]
    fn not_found_names_the_entity() {
        let err = ReleaseError::not_found("version", "v9.9.9");
        assert_eq!(err.to_string(), "version not found: v9.9.9");
    }
}
