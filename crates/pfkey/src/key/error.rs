//! Error types for key engine operations.

use std::io;

/// Result type for key engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// A single field-level validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationErrorInfo {
    /// Field that failed validation.
    pub field: String,
    /// Description of the failure.
    pub message: String,
}

impl ValidationErrorInfo {
    /// Create a new validation failure record.
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Errors that can occur while processing key management requests.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error from socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Envelope or extension record failed validation.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// Message was shorter than its declared length.
    #[error("message truncated: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Expected message length.
        expected: usize,
        /// Actual bytes received.
        actual: usize,
    },

    /// Selector and proxy do not resolve to a usable direction.
    #[error("selector does not resolve to a usable direction")]
    InvalidDirection,

    /// Referenced SAIdx, SA, policy or listener is absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate create.
    #[error("already exists: {0}")]
    Exists(String),

    /// The SPI allocator exhausted its retries.
    #[error("no SPI available after {attempts} attempts")]
    NoSpiAvailable {
        /// Number of random draws consumed.
        attempts: u32,
    },

    /// A node could not be allocated.
    #[error("out of memory")]
    OutOfMemory,

    /// Unknown message type or unimplemented satype combination.
    #[error("operation not supported: {0}")]
    Unsupported(String),

    /// Key length or algorithm/flag combination failed maturity checks.
    #[error("algorithm rejected: {0}")]
    AlgorithmRejected(String),

    /// A dump found nothing to report.
    #[error("no entries")]
    NoEntries,

    /// Configuration validation failed.
    #[error("validation failed: {}", format_validation_errors(.0))]
    Validation(Vec<ValidationErrorInfo>),

    /// An internal bookkeeping invariant was violated.
    #[error("internal inconsistency: {0}")]
    Corrupted(&'static str),

    /// The manager task is gone.
    #[error("key manager has shut down")]
    ManagerClosed,

    /// A peer answered with a non-zero errno.
    #[error("peer error: {message} (errno {errno})")]
    Remote {
        /// The errno carried in the reply header.
        errno: i32,
        /// Human-readable error message.
        message: String,
    },
}

fn format_validation_errors(errors: &[ValidationErrorInfo]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Create an error from an errno found in a reply header.
    pub fn from_errno(errno: i32) -> Self {
        let message = io::Error::from_raw_os_error(errno).to_string();
        Self::Remote { errno, message }
    }

    /// Shorthand for [`Error::Malformed`].
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    /// Shorthand for [`Error::NotFound`].
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Shorthand for [`Error::Exists`].
    pub fn exists(what: impl Into<String>) -> Self {
        Self::Exists(what.into())
    }

    /// The errno placed in a reply header for this error.
    pub fn errno(&self) -> i32 {
        match self {
            Self::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Self::Malformed(_)
            | Self::Truncated { .. }
            | Self::InvalidDirection
            | Self::AlgorithmRejected(_)
            | Self::Validation(_)
            | Self::Corrupted(_) => libc::EINVAL,
            Self::NotFound(_) | Self::NoEntries => libc::ENOENT,
            Self::Exists(_) => libc::EEXIST,
            Self::NoSpiAvailable { .. } => libc::EAGAIN,
            Self::OutOfMemory | Self::ManagerClosed => libc::ENOBUFS,
            Self::Unsupported(_) => libc::EOPNOTSUPP,
            Self::Remote { errno, .. } => *errno,
        }
    }

    /// Check if this is a "not found" error.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) | Self::NoEntries => true,
            Self::Remote { errno, .. } => *errno == libc::ENOENT,
            _ => false,
        }
    }

    /// Check if this is an "already exists" error.
    pub fn is_already_exists(&self) -> bool {
        match self {
            Self::Exists(_) => true,
            Self::Remote { errno, .. } => *errno == libc::EEXIST,
            _ => false,
        }
    }

    /// Check if this error was caused by the request contents rather than
    /// by database state.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            Self::Malformed(_) | Self::Truncated { .. } | Self::InvalidDirection
        )
    }
}
