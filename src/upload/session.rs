//! Stream Session
//!
//! One instance of the bidirectional stream. Asynchronous notifications
//! from the transport (acks, terminal status) are turned into queue commands
//! tagged with the session id; nothing else crosses back into the loop.
//!
//! ```text
//! transport thread ──on_ack──────────► AckReceived { session, seq }  ─┐
//! listener task ─────status.await────► StreamComplete { session, .. } ─┼─► EventQueue
//! ```

use crate::upload::event::{PublishAck, PublishRequest};
use crate::upload::queue::{Command, EventQueue};
use crate::upload::status::StreamStatus;
use crate::upload::transport::{AckCallback, StreamClient, StreamHandle};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

/// Identifies one stream instance within an upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

/// Open stream owned by the upload loop
pub struct StreamSession {
    id: SessionId,
    handle: Box<dyn StreamHandle>,
    /// Set when the loop aborted this instance after a protocol violation
    aborted_locally: bool,
}

impl StreamSession {
    /// Open a stream and wire its callbacks to `queue`. Must run inside the
    /// tokio runtime: the status listener is a spawned task.
    pub fn open(client: &dyn StreamClient, id: SessionId, queue: &Arc<EventQueue>) -> Self {
        let ack_queue = Arc::clone(queue);
        let on_ack: AckCallback = Arc::new(move |ack: PublishAck| {
            trace!(session = %id, sequence = ack.sequence_number, "Ack received");
            ack_queue.push_back(Command::AckReceived {
                session: id,
                sequence_number: ack.sequence_number,
            });
        });

        let (handle, status) = client.open_stream(on_ack);

        let status_queue = Arc::clone(queue);
        tokio::spawn(async move {
            let status = status.await;
            debug!(session = %id, %status, "Stream completed");
            status_queue.push_back(Command::StreamComplete {
                session: id,
                status,
            });
        });

        StreamSession {
            id,
            handle,
            aborted_locally: false,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn send(&mut self, request: PublishRequest) -> Result<(), StreamStatus> {
        self.handle.send(request)
    }

    pub fn half_close(&mut self) {
        self.handle.half_close();
    }

    /// Abort after a protocol violation; the resulting failure is retryable
    pub fn abort_for_violation(&mut self, status: StreamStatus) {
        self.aborted_locally = true;
        self.handle.abort(status);
    }

    pub fn abort(&mut self, status: StreamStatus) {
        self.handle.abort(status);
    }

    pub fn aborted_locally(&self) -> bool {
        self.aborted_locally
    }
}

impl fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSession")
            .field("id", &self.id)
            .field("aborted_locally", &self.aborted_locally)
            .finish()
    }
}
