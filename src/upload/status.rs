//! Stream status codes
//!
//! Terminal status of one stream instance. The code set mirrors the usual
//! RPC status codes; only the retry predicate cares about specific values.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status code reported when a stream instance terminates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    Ok,
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl StatusCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::Cancelled => "CANCELLED",
            StatusCode::Unknown => "UNKNOWN",
            StatusCode::InvalidArgument => "INVALID_ARGUMENT",
            StatusCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            StatusCode::NotFound => "NOT_FOUND",
            StatusCode::AlreadyExists => "ALREADY_EXISTS",
            StatusCode::PermissionDenied => "PERMISSION_DENIED",
            StatusCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            StatusCode::FailedPrecondition => "FAILED_PRECONDITION",
            StatusCode::Aborted => "ABORTED",
            StatusCode::OutOfRange => "OUT_OF_RANGE",
            StatusCode::Unimplemented => "UNIMPLEMENTED",
            StatusCode::Internal => "INTERNAL",
            StatusCode::Unavailable => "UNAVAILABLE",
            StatusCode::DataLoss => "DATA_LOSS",
            StatusCode::Unauthenticated => "UNAUTHENTICATED",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Code plus optional human-readable description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStatus {
    pub code: StatusCode,
    pub description: Option<String>,
}

impl StreamStatus {
    pub fn ok() -> Self {
        StreamStatus {
            code: StatusCode::Ok,
            description: None,
        }
    }

    pub fn new(code: StatusCode, description: impl Into<String>) -> Self {
        StreamStatus {
            code,
            description: Some(description.into()),
        }
    }

    pub fn unavailable(description: impl Into<String>) -> Self {
        Self::new(StatusCode::Unavailable, description)
    }

    pub fn failed_precondition(description: impl Into<String>) -> Self {
        Self::new(StatusCode::FailedPrecondition, description)
    }

    pub fn cancelled(description: impl Into<String>) -> Self {
        Self::new(StatusCode::Cancelled, description)
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }
}

impl fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.description {
            Some(desc) => write!(f, "{}: {}", self.code, desc),
            None => write!(f, "{}", self.code),
        }
    }
}

/// Whether a failure status reported by the remote side may be retried.
///
/// `InvalidArgument` and `FailedPrecondition` from the server mean the client
/// sent something the server will never accept, so retrying cannot help.
pub fn is_retryable(status: &StreamStatus) -> bool {
    !matches!(
        status.code,
        StatusCode::Ok | StatusCode::InvalidArgument | StatusCode::FailedPrecondition
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_predicate() {
        assert!(is_retryable(&StreamStatus::unavailable("down")));
        assert!(is_retryable(&StreamStatus::new(StatusCode::Internal, "boom")));
        assert!(is_retryable(&StreamStatus::new(StatusCode::DeadlineExceeded, "slow")));
        assert!(!is_retryable(&StreamStatus::new(StatusCode::InvalidArgument, "bad")));
        assert!(!is_retryable(&StreamStatus::failed_precondition("bad")));
    }

    #[test]
    fn test_display() {
        assert_eq!(StreamStatus::ok().to_string(), "OK");
        assert_eq!(
            StreamStatus::unavailable("connection reset").to_string(),
            "UNAVAILABLE: connection reset"
        );
    }
}
