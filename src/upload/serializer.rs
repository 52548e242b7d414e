//! Event serialization
//!
//! Turns an envelope plus the path converter from its file upload into a
//! wire-ready `PublishRequest`.

use crate::upload::error::SerializeError;
use crate::upload::event::{EventEnvelope, PublishRequest, StreamId};
use crate::upload::local_files::{LocalFileType, PathConverter};
use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, trace};

/// Converts build events into publish requests. Must be deterministic.
pub trait EventSerializer: Send + Sync + 'static {
    fn serialize(
        &self,
        stream_id: &StreamId,
        envelope: &EventEnvelope,
        converter: &dyn PathConverter,
    ) -> Result<PublishRequest, SerializeError>;
}

#[derive(Serialize)]
struct WireFile {
    uri: String,
    file_type: LocalFileType,
}

#[derive(Serialize)]
struct WireEvent<'a> {
    sequence_number: u64,
    timestamp_ms: u64,
    name: &'a str,
    payload: &'a serde_json::Value,
    files: Vec<WireFile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    exit_code: Option<i32>,
}

/// Renders events as JSON
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEventSerializer;

impl EventSerializer for JsonEventSerializer {
    fn serialize(
        &self,
        stream_id: &StreamId,
        envelope: &EventEnvelope,
        converter: &dyn PathConverter,
    ) -> Result<PublishRequest, SerializeError> {
        let event = &envelope.event;
        let mut files = Vec::with_capacity(event.local_files.len());
        for file in &event.local_files {
            match converter.apply(&file.path) {
                Some(uri) => files.push(WireFile {
                    uri,
                    file_type: file.file_type,
                }),
                // Not staged: the event is still useful without the reference.
                None => debug!(
                    sequence = envelope.sequence_number,
                    path = %file.path.display(),
                    "Dropping reference to unstaged file"
                ),
            }
        }

        let wire = WireEvent {
            sequence_number: envelope.sequence_number,
            timestamp_ms: envelope.timestamp.as_millis(),
            name: &event.name,
            payload: &event.payload,
            files,
            exit_code: event.exit_code,
        };
        let body = serde_json::to_vec(&wire).map_err(|e| SerializeError {
            sequence_number: envelope.sequence_number,
            message: e.to_string(),
        })?;
        trace!(
            sequence = envelope.sequence_number,
            bytes = body.len(),
            name = %event.name,
            "Serialized build event"
        );

        Ok(PublishRequest::event(
            stream_id.clone(),
            envelope.sequence_number,
            envelope.timestamp,
            Bytes::from(body),
        ))
    }
}
