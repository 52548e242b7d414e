//! Upload Loop
//!
//! The single worker that owns the stream. It drains the event queue one
//! command at a time, so the pending-ack list, the session and the retry
//! counters need no locking.
//!
//! ```text
//! OpenStream ──► Streaming ──StreamComplete(OK, all acked)──► Finished
//!                   │
//!                   └─StreamComplete(error)──► retryable? ──yes──► backoff,
//!                                                  │              re-queue unacked,
//!                                                  no             OpenStream
//!                                                  ▼
//!                                               Failed
//! ```
//!
//! Suspension points: taking the next command, waiting for an event's local
//! files, and the retry back-off. Each also watches the interrupt token.

use crate::upload::ack_tracker::{AckTracker, PendingEvent};
use crate::upload::clock::EventTimestamp;
use crate::upload::config::RetryConfig;
use crate::upload::error::UploadError;
use crate::upload::event::{EventEnvelope, PublishRequest, StreamId};
use crate::upload::queue::{Command, EventQueue};
use crate::upload::retry::{RetryDecision, RetryState};
use crate::upload::serializer::EventSerializer;
use crate::upload::session::{SessionId, StreamSession};
use crate::upload::stats::StatsRecorder;
use crate::upload::status::{is_retryable, StreamStatus};
use crate::upload::transport::StreamClient;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Whether the loop keeps going after a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Finished,
}

/// State owned by the loop for the lifetime of one upload
#[derive(Debug, Default)]
struct LoopState {
    session: Option<StreamSession>,
    sessions_opened: u64,
    acks: AckTracker,
    last_sent: bool,
    /// Sequence number and stamp of the last event, once sent
    last_event: Option<(u64, EventTimestamp)>,
    retry: RetryState,
}

pub(crate) struct UploadLoop {
    pub(crate) queue: Arc<EventQueue>,
    pub(crate) client: Arc<dyn StreamClient>,
    pub(crate) serializer: Arc<dyn EventSerializer>,
    pub(crate) retry: RetryConfig,
    pub(crate) stream_id: StreamId,
    pub(crate) interrupt: CancellationToken,
    pub(crate) stats: Arc<StatsRecorder>,
}

impl UploadLoop {
    /// Run until terminal success or failure. Cleanup (session abort,
    /// upload cancellation, queue drain) has happened by the time this
    /// returns.
    pub(crate) async fn run(self) -> Result<(), UploadError> {
        let mut state = LoopState::default();
        let result = self.process(&mut state).await;
        self.teardown(&mut state, &result);
        result
    }

    async fn process(&self, state: &mut LoopState) -> Result<(), UploadError> {
        loop {
            let command = tokio::select! {
                biased;
                _ = self.interrupt.cancelled() => return Err(UploadError::Interrupted),
                command = self.queue.take() => command,
            };

            match command {
                Command::OpenStream => self.open_stream(state),
                Command::SendRegular(envelope) => self.send_regular(state, envelope).await?,
                Command::SendLast {
                    sequence_number,
                    timestamp,
                } => self.send_last(state, sequence_number, timestamp)?,
                Command::AckReceived {
                    session,
                    sequence_number,
                } => self.ack_received(state, session, sequence_number),
                Command::StreamComplete { session, status } => {
                    if self.stream_complete(state, session, status).await? == Flow::Finished {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn open_stream(&self, state: &mut LoopState) {
        if let Some(mut previous) = state.session.take() {
            warn!(session = %previous.id(), "Replacing a stream that never completed");
            previous.abort(StreamStatus::cancelled("superseded by a new stream"));
        }
        state.sessions_opened += 1;
        let id = SessionId(state.sessions_opened);
        state.session = Some(StreamSession::open(self.client.as_ref(), id, &self.queue));
        self.stats.stream_opened();
        info!(session = %id, pending = state.acks.len(), "Opened build event stream");
    }

    async fn send_regular(
        &self,
        state: &mut LoopState,
        mut envelope: EventEnvelope,
    ) -> Result<(), UploadError> {
        // Backpressure: the event goes out only once its files are staged.
        // If interrupted here the envelope is dropped, which aborts its upload.
        let converter = tokio::select! {
            biased;
            _ = self.interrupt.cancelled() => return Err(UploadError::Interrupted),
            result = envelope.local_files.wait() => match result {
                Ok(converter) => converter,
                Err(e) => {
                    error!(sequence = envelope.sequence_number, error = %e, "Local file upload failed");
                    return Err(UploadError::LocalFileUpload(e));
                }
            },
        };

        let request = self
            .serializer
            .serialize(&self.stream_id, &envelope, converter.as_ref())?;
        let session = state.session.as_mut().ok_or_else(|| {
            UploadError::Internal(format!(
                "no open stream to send event {}",
                envelope.sequence_number
            ))
        })?;
        state.acks.record_sent(PendingEvent::Regular(envelope));
        self.transmit(session, request);
        Ok(())
    }

    fn send_last(
        &self,
        state: &mut LoopState,
        sequence_number: u64,
        timestamp: EventTimestamp,
    ) -> Result<(), UploadError> {
        let session = state.session.as_mut().ok_or_else(|| {
            UploadError::Internal(format!(
                "no open stream to send last event {}",
                sequence_number
            ))
        })?;
        state.acks.record_sent(PendingEvent::Last {
            sequence_number,
            timestamp,
        });
        state.last_sent = true;
        state.last_event = Some((sequence_number, timestamp));
        self.transmit(
            session,
            PublishRequest::last(self.stream_id.clone(), sequence_number, timestamp),
        );
        session.half_close();
        debug!(session = %session.id(), sequence = sequence_number, "Sent last event, half-closed stream");
        Ok(())
    }

    fn transmit(&self, session: &mut StreamSession, request: PublishRequest) {
        let sequence = request.sequence_number;
        self.stats.transmission();
        if let Err(status) = session.send(request) {
            // The stream is already broken; its StreamComplete decides what happens next.
            debug!(session = %session.id(), sequence, %status, "Send on broken stream");
        }
    }

    fn ack_received(&self, state: &mut LoopState, session_id: SessionId, sequence_number: u64) {
        let session = match state.session.as_mut() {
            Some(session) if session.id() == session_id && !session.aborted_locally() => session,
            _ => {
                debug!(session = %session_id, sequence = sequence_number, "Ignoring ack from a closed stream");
                return;
            }
        };

        match state.acks.on_ack(sequence_number) {
            Ok(_) => {
                state.retry.record_ack();
                self.stats.ack_received();
            }
            Err(mismatch) => {
                warn!(
                    session = %session_id,
                    expected = ?mismatch.expected,
                    actual = mismatch.actual,
                    "Protocol violation: acknowledgement out of sequence"
                );
                self.stats.protocol_violation();
                session.abort_for_violation(StreamStatus::failed_precondition(mismatch.to_string()));
            }
        }
    }

    async fn stream_complete(
        &self,
        state: &mut LoopState,
        session_id: SessionId,
        status: StreamStatus,
    ) -> Result<Flow, UploadError> {
        let session = match state.session.take() {
            Some(session) if session.id() == session_id => session,
            other => {
                state.session = other;
                debug!(session = %session_id, %status, "Ignoring completion of a replaced stream");
                return Ok(Flow::Continue);
            }
        };

        let all_acked = state.last_sent && state.acks.is_empty();
        let (status, retryable) = if status.is_ok() {
            if all_acked {
                info!(session = %session_id, "All build events acknowledged");
                return Ok(Flow::Finished);
            }
            let description = if !state.last_sent {
                "Stream closed with OK status before all events were sent".to_string()
            } else {
                format!(
                    "Stream closed with OK status while {} events were unacknowledged",
                    state.acks.len()
                )
            };
            warn!(session = %session_id, last_sent = state.last_sent, "{}", description);
            (StreamStatus::failed_precondition(description), true)
        } else {
            let retryable = session.aborted_locally() || is_retryable(&status);
            (status, retryable)
        };

        if !retryable {
            error!(session = %session_id, %status, "Build event stream failed with non-retryable status");
            return Err(UploadError::Transport {
                status,
                retries_exhausted: false,
            });
        }

        match state.retry.next(&self.retry) {
            RetryDecision::Exhausted => {
                error!(
                    session = %session_id,
                    %status,
                    attempts = state.retry.attempt,
                    "Build event stream failed, no retries left"
                );
                Err(UploadError::Transport {
                    status,
                    retries_exhausted: true,
                })
            }
            RetryDecision::Backoff(delay) => {
                warn!(
                    session = %session_id,
                    %status,
                    attempt = state.retry.attempt,
                    delay_ms = delay.as_millis() as u64,
                    unacked = state.acks.len(),
                    "Build event stream failed, retrying"
                );
                self.stats.retry();
                tokio::select! {
                    biased;
                    _ = self.interrupt.cancelled() => return Err(UploadError::Interrupted),
                    _ = tokio::time::sleep(delay) => {}
                }

                let mut unacked: Vec<Command> = state
                    .acks
                    .drain()
                    .into_iter()
                    .map(PendingEvent::into_command)
                    .collect();
                if all_acked {
                    // Nothing left to replay; the new stream still needs a last event to close on.
                    if let Some((sequence_number, timestamp)) = state.last_event {
                        unacked.push(Command::SendLast {
                            sequence_number,
                            timestamp,
                        });
                    }
                }
                // The last event, if it was sent, is among the re-queued ones.
                state.last_sent = false;
                self.queue.push_front_all(unacked);
                self.queue.push_front(Command::OpenStream);
                Ok(Flow::Continue)
            }
        }
    }

    fn teardown(&self, state: &mut LoopState, result: &Result<(), UploadError>) {
        if let Some(mut session) = state.session.take() {
            let reason = match result {
                Ok(()) => "upload finished".to_string(),
                Err(e) => e.to_string(),
            };
            session.abort(StreamStatus::cancelled(reason));
        }

        let mut cancelled = 0usize;
        for pending in state.acks.drain() {
            if let PendingEvent::Regular(envelope) = &pending {
                envelope.local_files.cancel();
                cancelled += 1;
            }
        }
        for command in self.queue.drain() {
            if let Command::SendRegular(_) = &command {
                command.cancel_upload();
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            debug!(cancelled, "Cancelled local file uploads of undelivered events");
        }
    }
}
