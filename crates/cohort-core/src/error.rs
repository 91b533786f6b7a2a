//! Error types for Cohort Core

use thiserror::Error;

/// Result type alias using the cohort Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for the cohort engine
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from storage or network operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Persisted worker storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Import / bucket assembly errors
    #[error("Import error: {0}")]
    Import(String),

    /// Dictionary errors (duplicate entries, unknown ids)
    #[error("Dictionary error: {0}")]
    Dictionary(String),

    /// Concept tree configuration errors
    #[error("Concept error: {0}")]
    Concept(String),

    /// Query validation errors, rejected at submission
    #[error("Validation error [{code}]: {message}")]
    Validation {
        /// Stable machine-readable error code
        code: &'static str,
        /// Human-readable message
        message: String,
    },

    /// Query plan execution errors
    #[error("Execution error: {0}")]
    Execution(String),

    /// Job manager errors
    #[error("Job error: {0}")]
    Job(String),

    /// Cluster protocol errors
    #[error("Cluster error: {0}")]
    Cluster(String),

    /// Type mismatch when reading a column store
    #[error("Type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        /// Expected store kind
        expected: &'static str,
        /// Actual store kind
        actual: &'static str,
    },

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create an import error
    pub fn import(msg: impl Into<String>) -> Self {
        Self::Import(msg.into())
    }

    /// Create a dictionary error
    pub fn dictionary(msg: impl Into<String>) -> Self {
        Self::Dictionary(msg.into())
    }

    /// Create a concept error
    pub fn concept(msg: impl Into<String>) -> Self {
        Self::Concept(msg.into())
    }

    /// Create a validation error with a stable code
    pub fn validation(code: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            code,
            message: message.into(),
        }
    }

    /// Create an execution error
    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution(msg.into())
    }

    /// Create a job error
    pub fn job(msg: impl Into<String>) -> Self {
        Self::Job(msg.into())
    }

    /// Create a cluster error
    pub fn cluster(msg: impl Into<String>) -> Self {
        Self::Cluster(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Stable code for user-visible status reporting.
    ///
    /// Failed executions expose this next to the message so clients can
    /// react without parsing text.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Io(_) => "IO",
            Self::Storage(_) => "STORAGE",
            Self::Import(_) => "IMPORT",
            Self::Dictionary(_) => "DICTIONARY",
            Self::Concept(_) => "CONCEPT",
            Self::Validation { code, .. } => code,
            Self::Execution(_) => "EXECUTION",
            Self::Job(_) => "JOB",
            Self::Cluster(_) => "CLUSTER",
            Self::TypeMismatch { .. } => "TYPE_MISMATCH",
            Self::Internal(_) => "INTERNAL",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_helper_constructors() {
        let err = Error::storage("bad header");
        assert!(matches!(err, Error::Storage(_)));
        assert_eq!(err.code(), "STORAGE");
    }

    #[test]
    fn test_validation_code() {
        let err = Error::validation("UNKNOWN_CONCEPT", "no such concept: icd.a00");
        assert_eq!(err.code(), "UNKNOWN_CONCEPT");
        assert!(err.to_string().contains("UNKNOWN_CONCEPT"));
    }
}
