//! Centralized error types for attachflow.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// The two long-running operations an attachment can be busy with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Load,
    Save,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Load => f.write_str("load"),
            Operation::Save => f.write_str("save"),
        }
    }
}

/// All errors produced by the attachflow library.
#[derive(Error, Debug)]
pub enum AttachError {
    /// Another load or save is already running on the same record.
    #[error("A {0} operation is already in progress")]
    Busy(Operation),

    /// The record lacks what the operation needs (no source, no content).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation was cancelled through the record's token.
    #[error("Operation was cancelled")]
    Cancelled,

    /// I/O error with the associated path.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Packing a directory or unpacking an archive failed.
    #[error("Archive error: {0}")]
    Archive(String),

    /// The payload could not be decoded from its transfer encoding.
    #[error("Decoding error: {0}")]
    Decode(String),
}

/// Convenience alias for `Result<T, AttachError>`.
pub type Result<T> = std::result::Result<T, AttachError>;

impl AttachError {
    /// Create an `Io` variant from a path and an `io::Error`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// `true` for the silent, expected outcome of a user cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// `true` when an exclusive create hit an existing file.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == std::io::ErrorKind::AlreadyExists)
    }

    /// `true` when the path does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

impl From<std::io::Error> for AttachError {
    fn from(source: std::io::Error) -> Self {
        Self::Io {
            path: PathBuf::from("<unknown>"),
            source,
        }
    }
}

impl From<zip::result::ZipError> for AttachError {
    fn from(err: zip::result::ZipError) -> Self {
        Self::Archive(err.to_string())
    }
}

/// A user-facing description of a failed load or save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureNotice {
    /// Headline, e.g. `Could not save 'report.pdf'`.
    pub primary: String,
    /// The underlying error message.
    pub secondary: String,
}

impl fmt::Display for FailureNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.primary, self.secondary)
    }
}

/// Build the message shown to the user after a failed operation.
///
/// Returns `None` for cancellations, which are never presented.
pub fn failure_notice(
    op: Operation,
    display_name: Option<&str>,
    err: &AttachError,
) -> Option<FailureNotice> {
    if err.is_cancelled() {
        return None;
    }

    let primary = match display_name {
        Some(name) if !name.is_empty() => format!("Could not {op} '{name}'"),
        _ => format!("Could not {op} the attachment"),
    };

    Some(FailureNotice {
        primary,
        secondary: err.to_string(),
    })
}
