//! Upload Errors
//!
//! Every way an upload can end badly. `UploadError` travels through the
//! shared completion signal, so it (and everything it wraps) is `Clone`.

use crate::upload::status::StreamStatus;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Failure bucket reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// A referenced local file could not be staged
    LocalFileUpload,
    /// The stream failed permanently or retries ran out
    Transport,
    /// The close timeout expired before the upload finished
    Timeout,
    /// The worker was interrupted for a reason other than the close timeout
    Interrupted,
    /// A logic defect (worker vanished, impossible command sequence, ...)
    Internal,
}

/// Staging a referenced local file failed or was cancelled
#[derive(Debug, Clone)]
pub struct LocalFileUploadError {
    message: String,
    source: Option<Arc<dyn StdError + Send + Sync>>,
    cancelled: bool,
}

impl LocalFileUploadError {
    pub fn new(message: impl Into<String>) -> Self {
        LocalFileUploadError {
            message: message.into(),
            source: None,
            cancelled: false,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        LocalFileUploadError {
            message: message.into(),
            source: Some(Arc::new(source)),
            cancelled: false,
        }
    }

    pub fn cancelled() -> Self {
        LocalFileUploadError {
            message: "local file upload was cancelled".to_string(),
            source: None,
            cancelled: true,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}

impl fmt::Display for LocalFileUploadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(source) => write!(f, "{}: {}", self.message, source),
            None => write!(f, "{}", self.message),
        }
    }
}

impl StdError for LocalFileUploadError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

/// Event could not be turned into a wire message
#[derive(Debug, Clone)]
pub struct SerializeError {
    pub sequence_number: u64,
    pub message: String,
}

impl fmt::Display for SerializeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "failed to serialize event {}: {}",
            self.sequence_number, self.message
        )
    }
}

impl StdError for SerializeError {}

/// Terminal failure of an upload, as seen through the completion signal
#[derive(Debug, Clone)]
pub enum UploadError {
    /// A referenced local file failed to stage; never retried at this layer
    LocalFileUpload(LocalFileUploadError),
    /// Stream failure that was not retryable, or retryable with no attempts left
    Transport {
        status: StreamStatus,
        retries_exhausted: bool,
    },
    /// Close timeout expired before completion
    Timeout { after: Duration },
    /// Worker interrupted for any other reason
    Interrupted,
    /// Logic defect
    Internal(String),
}

impl UploadError {
    pub fn kind(&self) -> FailureKind {
        match self {
            UploadError::LocalFileUpload(_) => FailureKind::LocalFileUpload,
            UploadError::Transport { .. } => FailureKind::Transport,
            UploadError::Timeout { .. } => FailureKind::Timeout,
            UploadError::Interrupted => FailureKind::Interrupted,
            UploadError::Internal(_) => FailureKind::Internal,
        }
    }

    /// Final stream status, for transport failures
    pub fn status(&self) -> Option<&StreamStatus> {
        match self {
            UploadError::Transport { status, .. } => Some(status),
            _ => None,
        }
    }
}

impl fmt::Display for UploadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadError::LocalFileUpload(e) => write!(f, "local file upload failed: {}", e),
            UploadError::Transport {
                status,
                retries_exhausted: true,
            } => write!(f, "build event upload failed after retries: {}", status),
            UploadError::Transport { status, .. } => {
                write!(f, "build event upload failed: {}", status)
            }
            UploadError::Timeout { after } => {
                write!(f, "build event upload timed out after {:?}", after)
            }
            UploadError::Interrupted => write!(f, "build event upload was interrupted"),
            UploadError::Internal(msg) => write!(f, "build event upload internal error: {}", msg),
        }
    }
}

impl StdError for UploadError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            UploadError::LocalFileUpload(e) => Some(e),
            _ => None,
        }
    }
}

impl From<LocalFileUploadError> for UploadError {
    fn from(e: LocalFileUploadError) -> Self {
        UploadError::LocalFileUpload(e)
    }
}

impl From<SerializeError> for UploadError {
    fn from(e: SerializeError) -> Self {
        UploadError::Internal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::status::StatusCode;

    #[test]
    fn test_kind_classification() {
        let local = UploadError::from(LocalFileUploadError::new("disk gone"));
        assert_eq!(local.kind(), FailureKind::LocalFileUpload);

        let transport = UploadError::Transport {
            status: StreamStatus::unavailable("down"),
            retries_exhausted: true,
        };
        assert_eq!(transport.kind(), FailureKind::Transport);
        assert_eq!(transport.status().map(|s| s.code), Some(StatusCode::Unavailable));

        let timeout = UploadError::Timeout {
            after: Duration::from_millis(100),
        };
        assert_eq!(timeout.kind(), FailureKind::Timeout);
        assert_eq!(UploadError::Interrupted.kind(), FailureKind::Interrupted);
    }

    #[test]
    fn test_local_file_error_keeps_cause() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing.log");
        let err = LocalFileUploadError::with_source("uploading test log", io);
        assert!(err.to_string().contains("missing.log"));
        assert!(err.source().is_some());

        let wrapped = UploadError::from(err);
        assert!(wrapped.source().is_some());
        assert!(wrapped.to_string().starts_with("local file upload failed"));
    }

    #[test]
    fn test_serialize_error_is_internal() {
        let err = UploadError::from(SerializeError {
            sequence_number: 7,
            message: "bad payload".to_string(),
        });
        assert_eq!(err.kind(), FailureKind::Internal);
        assert!(err.to_string().contains("event 7"));
    }
}
