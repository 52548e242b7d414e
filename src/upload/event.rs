//! Build events, envelopes and wire messages

use crate::upload::clock::EventTimestamp;
use crate::upload::local_files::{LocalFile, LocalFileUpload};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// One application-level unit of build progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildEvent {
    /// Event name, e.g. "target_completed"
    pub name: String,
    /// Event body; opaque to the pipeline
    pub payload: serde_json::Value,
    /// Files that must be staged before the event is sent
    #[serde(default)]
    pub local_files: Vec<LocalFile>,
    /// Set on the terminal build-finished event
    #[serde(default)]
    pub exit_code: Option<i32>,
}

impl BuildEvent {
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        BuildEvent {
            name: name.into(),
            payload,
            local_files: Vec::new(),
            exit_code: None,
        }
    }

    /// Terminal event carrying the build's exit code
    pub fn build_finished(exit_code: i32) -> Self {
        BuildEvent {
            name: "build_finished".to_string(),
            payload: serde_json::json!({ "exit_code": exit_code }),
            local_files: Vec::new(),
            exit_code: Some(exit_code),
        }
    }

    pub fn with_file(mut self, file: LocalFile) -> Self {
        self.local_files.push(file);
        self
    }
}

/// Overall build outcome, derived once from the build-finished event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BuildStatus {
    #[default]
    Unknown,
    Succeeded,
    Failed,
}

impl BuildStatus {
    pub fn from_exit_code(exit_code: i32) -> Self {
        if exit_code == 0 {
            BuildStatus::Succeeded
        } else {
            BuildStatus::Failed
        }
    }
}

/// A build event with its assigned sequence number and upload handle
#[derive(Debug)]
pub struct EventEnvelope {
    pub sequence_number: u64,
    pub timestamp: EventTimestamp,
    pub event: BuildEvent,
    pub local_files: LocalFileUpload,
}

impl EventEnvelope {
    pub fn new(
        sequence_number: u64,
        timestamp: EventTimestamp,
        event: BuildEvent,
        local_files: LocalFileUpload,
    ) -> Self {
        EventEnvelope {
            sequence_number,
            timestamp,
            event,
            local_files,
        }
    }
}

/// Which build/invocation a stream belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId {
    pub build_id: String,
    pub invocation_id: String,
}

/// Payload of a publish request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestBody {
    /// Serialized build event
    Event(Bytes),
    /// Marks the end of the event sequence
    StreamFinished,
}

/// One message sent over the stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    pub stream_id: StreamId,
    pub sequence_number: u64,
    pub timestamp: EventTimestamp,
    pub body: RequestBody,
}

impl PublishRequest {
    pub fn event(
        stream_id: StreamId,
        sequence_number: u64,
        timestamp: EventTimestamp,
        payload: Bytes,
    ) -> Self {
        PublishRequest {
            stream_id,
            sequence_number,
            timestamp,
            body: RequestBody::Event(payload),
        }
    }

    pub fn last(stream_id: StreamId, sequence_number: u64, timestamp: EventTimestamp) -> Self {
        PublishRequest {
            stream_id,
            sequence_number,
            timestamp,
            body: RequestBody::StreamFinished,
        }
    }

    pub fn is_last(&self) -> bool {
        matches!(self.body, RequestBody::StreamFinished)
    }
}

/// Server confirmation that an event was durably accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishAck {
    pub sequence_number: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_status_from_exit_code() {
        assert_eq!(BuildStatus::from_exit_code(0), BuildStatus::Succeeded);
        assert_eq!(BuildStatus::from_exit_code(1), BuildStatus::Failed);
        assert_eq!(BuildStatus::from_exit_code(-9), BuildStatus::Failed);
        assert_eq!(BuildStatus::default(), BuildStatus::Unknown);
    }

    #[test]
    fn test_build_finished_event() {
        let event = BuildEvent::build_finished(3);
        assert_eq!(event.exit_code, Some(3));
        assert_eq!(event.payload["exit_code"], 3);
    }

    #[test]
    fn test_event_deserializes_without_optional_fields() {
        let event: BuildEvent =
            serde_json::from_str(r#"{"name":"progress","payload":{"line":"ok"}}"#).unwrap();
        assert!(event.local_files.is_empty());
        assert_eq!(event.exit_code, None);
    }
}
