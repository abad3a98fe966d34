use std::time::Duration;

use thiserror::Error;

/// Failure reported by an [`HttpTransport`](crate::http::HttpTransport).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

/// Failure of a single detection attempt. Always contained to that attempt.
#[derive(Debug, Error)]
pub enum DetectionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("attempt exceeded its {0:?} budget")]
    AttemptTimeout(Duration),
    #[error("comparison skipped: {0}")]
    Comparison(#[from] ComparisonError),
    #[error("parameter index {0} is out of range")]
    ParameterIndex(usize),
    #[error("scan was stopped")]
    Cancelled,
}

/// Inputs the comparison engine refuses to score.
#[derive(Debug, Error, PartialEq)]
pub enum ComparisonError {
    #[error("inputs too large for edit distance ({0} cells)")]
    Oversized(usize),
}
