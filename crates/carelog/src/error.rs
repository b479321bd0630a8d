//! Error types for carelog.
//!
//! This module defines all error types used throughout the carelog crate,
//! providing detailed context for debugging and user-friendly error messages.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for carelog operations.
#[derive(Error, Debug)]
pub enum Error {
    // === Sync Errors ===
    /// The remote credential is missing, expired, or was rejected.
    #[error("authentication failed: {message}")]
    Auth {
        /// Description of what went wrong.
        message: String,
    },

    /// The remote store could not be reached.
    #[error("remote store unreachable: {message}")]
    Network {
        /// Description of what went wrong.
        message: String,
    },

    /// A remote blob could not be decrypted (wrong key, or tampered data).
    #[error("could not decrypt remote data: {message}")]
    Integrity {
        /// Description of what went wrong.
        message: String,
    },

    /// A named remote blob does not exist.
    #[error("remote blob '{name}' not found")]
    NotFound {
        /// Name of the missing blob.
        name: String,
    },

    // === Storage Errors ===
    /// Failed to open or create the database.
    #[error("failed to open database at {path}: {source}")]
    DatabaseOpen {
        /// Path to the database file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: rusqlite::Error,
    },

    /// A database query failed.
    #[error("database query failed: {0}")]
    DatabaseQuery(#[from] rusqlite::Error),

    /// Failed to run database migrations.
    #[error("database migration failed: {message}")]
    DatabaseMigration {
        /// Description of what went wrong.
        message: String,
    },

    // === Configuration Errors ===
    /// Failed to load configuration.
    #[error("failed to load configuration: {0}")]
    ConfigLoad(Box<figment::Error>),

    /// Configuration validation failed.
    #[error("invalid configuration: {message}")]
    ConfigValidation {
        /// Description of the validation failure.
        message: String,
    },

    // === I/O Errors ===
    /// File system operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to create a required directory.
    #[error("failed to create directory {path}: {source}")]
    DirectoryCreate {
        /// Path that couldn't be created.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    // === Serialization Errors ===
    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Generic Errors ===
    /// An internal error occurred (bug).
    #[error("internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for carelog operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::ConfigLoad(Box::new(err))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        // An HTTP 401/403 means the bearer credential was rejected; everything
        // else from the network layer is a transport failure.
        match err.status() {
            Some(status) if status == reqwest::StatusCode::UNAUTHORIZED
                || status == reqwest::StatusCode::FORBIDDEN =>
            {
                Self::Auth {
                    message: err.to_string(),
                }
            }
            _ => Self::Network {
                message: err.to_string(),
            },
        }
    }
}

impl Error {
    /// Create a new authentication error.
    #[must_use]
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth {
            message: message.into(),
        }
    }

    /// Create a new network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Create a new integrity error.
    #[must_use]
    pub fn integrity(message: impl Into<String>) -> Self {
        Self::Integrity {
            message: message.into(),
        }
    }

    /// Create a new not-found error for the named blob.
    #[must_use]
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound { name: name.into() }
    }

    /// Create a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Check if this error means the credential should be refreshed.
    #[must_use]
    pub fn is_auth_error(&self) -> bool {
        matches!(self, Self::Auth { .. })
    }

    /// Check if this error means remote data could not be decrypted.
    ///
    /// Integrity failures are not automatically recoverable; the documented
    /// remediation is a full re-link with a fresh key.
    #[must_use]
    pub fn is_integrity_error(&self) -> bool {
        matches!(self, Self::Integrity { .. })
    }

    /// Check if this error is a missing remote blob.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
