//! Error handling.

use std::error::Error as StdError;

use displaydoc::Display;

pub type ArrearsResult<T> = Result<T, ArrearsError>;

/// An error.
#[derive(Debug, Display)]
pub enum ArrearsError {
    /// Invalid hash "{hash}": {reason}
    InvalidHash { hash: String, reason: &'static str },

    /// Unsupported hash algorithm: {0}
    UnsupportedHashAlgorithm(String),

    /// Unknown report kind "{0}"
    UnknownReportKind(String),
}

impl StdError for ArrearsError {}
