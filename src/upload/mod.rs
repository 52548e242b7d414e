//! Build Event Upload Pipeline
//!
//! Streams an ordered series of build events to a remote build event
//! service over a bidirectional stream, with acknowledgements, retries and
//! local file staging.
//!
//! ## Architecture
//!
//! ```text
//! producers ──enqueue/close──► EventQueue ◄──acks/status── StreamSession
//!                                  │                            ▲
//!                                  ▼                            │
//!                             UploadLoop ──send/half-close──────┘
//!                                  │
//!                            AckTracker (sent, unacked)
//! ```
//!
//! ## Key Properties
//!
//! - **Ordered**: events reach the service in sequence-number order
//! - **At-least-once**: unacknowledged events are re-sent on a new stream
//! - **Backpressure**: an event is sent only after its files are staged
//! - **Single resolution**: the completion signal resolves exactly once

pub mod ack_tracker;
pub mod clock;
pub mod config;
pub mod dst;
pub mod error;
pub mod event;
pub mod local_files;
pub mod queue;
pub mod retry;
pub mod sequencer;
pub mod serializer;
pub mod session;
pub mod simulated_transport;
pub mod stats;
pub mod status;
pub mod transport;
mod upload_loop;
pub mod uploader;

pub use ack_tracker::{AckMismatch, AckTracker, PendingEvent};
pub use clock::{EventTimestamp, ProductionClock, SimulatedClock, UploadClock};
pub use config::{ConfigError, RetryConfig, UploaderConfig};
pub use dst::{run_dst_batch, summarize_batch, UploadDSTConfig, UploadDSTHarness, UploadDSTResult};
pub use error::{FailureKind, LocalFileUploadError, SerializeError, UploadError};
pub use event::{
    BuildEvent, BuildStatus, EventEnvelope, PublishAck, PublishRequest, RequestBody, StreamId,
};
pub use local_files::{
    IdentityPathConverter, InMemoryFileUploader, LocalFile, LocalFileType, LocalFileUpload,
    LocalFileUploadCoordinator, LocalFileUploader, MappedPathConverter, PathConverter,
};
pub use queue::{Command, EventQueue};
pub use retry::{RetryDecision, RetryState};
pub use sequencer::Sequencer;
pub use serializer::{EventSerializer, JsonEventSerializer};
pub use session::SessionId;
pub use simulated_transport::{
    SessionRecord, SessionScript, SimulatedStreamClient, SimulatedTransportConfig,
    SimulatedTransportStats, Transmission,
};
pub use stats::UploadStats;
pub use status::{is_retryable, StatusCode, StreamStatus};
pub use transport::{AckCallback, StatusFuture, StreamClient, StreamHandle};
pub use uploader::{BuildEventUploader, CompletionSignal};
