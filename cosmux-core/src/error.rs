//! Error types for cosmux
//!
//! One taxonomy for the whole client: input validation, service responses,
//! transfer integrity, cancellation and local I/O.

use std::sync::Arc;
use thiserror::Error;

/// Primary error type for all cosmux operations
///
/// The enum is `Clone` so the worker pool can hand the first failure to every
/// caller that asks for it.
#[derive(Debug, Clone, Error)]
pub enum TransferError {
    // ========== Input Errors ==========

    /// File identifier was empty after normalization
    #[error("invalid file id: {raw:?}")]
    InvalidFileId { raw: String },

    /// Caller supplied an unusable argument
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    // ========== Service Errors ==========

    /// Object (or multipart session) does not exist
    #[error("object not found: {key}")]
    NotFound { key: String },

    /// Service answered with a non-2xx status other than 404
    #[error("status code is {status}, method is {method}, path is {path}, body is {body}")]
    Http {
        status: u16,
        method: String,
        path: String,
        body: String,
    },

    /// Connection or protocol failure below HTTP status handling
    #[error("transport error: {message}")]
    Transport { message: String },

    /// Control-plane payload could not be encoded or decoded
    #[error("malformed xml: {message}")]
    Xml { message: String },

    // ========== Integrity Errors ==========

    /// Ranged GET returned a different number of bytes than the range length
    #[error("part size not match, actual is {actual}, expected is {expected}, offset is {offset}, end is {end}")]
    PartSizeMismatch {
        offset: u64,
        end: u64,
        expected: u64,
        actual: u64,
    },

    /// Source reader ended before the declared content length
    #[error("source ended early: expected {expected} bytes, read {actual}")]
    SourceTruncated { expected: u64, actual: u64 },

    // ========== Runtime Errors ==========

    /// Caller cancelled the operation or it timed out
    #[error("operation cancelled")]
    Cancelled,

    /// Local I/O failure (source reader, destination writer, spill file)
    #[error("I/O error: {0}")]
    Io(#[source] Arc<std::io::Error>),

    /// Internal error (task panic, closed channel)
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl TransferError {
    /// Returns true if the service reported the object missing
    pub fn is_not_found(&self) -> bool {
        matches!(self, TransferError::NotFound { .. })
    }

    /// Returns true if this error came from cancellation or a timeout
    pub fn is_cancelled(&self) -> bool {
        match self {
            TransferError::Cancelled => true,
            TransferError::Io(e) => e.kind() == std::io::ErrorKind::Interrupted,
            _ => false,
        }
    }

    /// Returns true if retrying the same request might succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            TransferError::Transport { .. } => true,
            TransferError::Http { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Returns true if bytes on the wire did not match what was promised
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            TransferError::PartSizeMismatch { .. } | TransferError::SourceTruncated { .. }
        )
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        TransferError::Internal {
            message: message.into(),
        }
    }

    /// Convert into an `io::Error` for `AsyncRead` surfaces
    pub(crate) fn into_io(self) -> std::io::Error {
        match self {
            TransferError::Io(e) => std::io::Error::new(e.kind(), e.to_string()),
            // Not `Interrupted`: std read loops retry those forever
            other => std::io::Error::other(other),
        }
    }
}

impl From<std::io::Error> for TransferError {
    fn from(e: std::io::Error) -> Self {
        // Errors that already carry a TransferError (from our own readers) are unwrapped
        if e.get_ref().is_some_and(|inner| inner.is::<TransferError>()) {
            if let Some(inner) = e.into_inner() {
                if let Ok(err) = inner.downcast::<TransferError>() {
                    return *err;
                }
            }
            return TransferError::internal("unwrapping nested transfer error");
        }
        TransferError::Io(Arc::new(e))
    }
}

impl From<reqwest::Error> for TransferError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return TransferError::Cancelled;
        }
        TransferError::Transport {
            message: e.to_string(),
        }
    }
}

impl From<quick_xml::DeError> for TransferError {
    fn from(e: quick_xml::DeError) -> Self {
        TransferError::Xml {
            message: e.to_string(),
        }
    }
}

impl From<quick_xml::SeError> for TransferError {
    fn from(e: quick_xml::SeError) -> Self {
        TransferError::Xml {
            message: e.to_string(),
        }
    }
}

/// Result type alias for cosmux operations
pub type Result<T> = std::result::Result<T, TransferError>;
