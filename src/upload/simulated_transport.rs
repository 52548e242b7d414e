//! Simulated Build Event Service with Fault Injection
//!
//! In-process server for tests and deterministic simulation. Every stream
//! instance ("session", numbered from 1) records what it received. The
//! server acks accepted requests in order, right away, and completes the
//! stream with OK once the client half-closes.
//!
//! Sessions follow a `SessionScript` when one is registered for their
//! number; unscripted sessions draw faults from the seeded RNG according to
//! `SimulatedTransportConfig`.

use crate::io::{Rng, SimulatedRng};
use crate::upload::event::{PublishAck, PublishRequest};
use crate::upload::status::{StatusCode, StreamStatus};
use crate::upload::transport::{AckCallback, StatusFuture, StreamClient, StreamHandle};
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// Scripted behavior for one session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionScript {
    /// Ack everything, complete OK on half-close
    Healthy,
    /// Accept `requests` requests, then fail the stream with `status` when
    /// the next one arrives
    FailAfter {
        requests: usize,
        status: StreamStatus,
    },
    /// After `after` correct acks, ack `sequence_number` in place of the
    /// request actually received
    AckOutOfSequence { after: usize, sequence_number: u64 },
    /// Fail the stream as soon as it opens
    Reject(StreamStatus),
    /// Record requests but never ack or complete
    Stall,
    /// Ack everything, then fail the stream with this status on half-close
    FailOnHalfClose(StreamStatus),
}

/// Configuration for random fault injection on unscripted sessions
#[derive(Debug, Clone)]
pub struct SimulatedTransportConfig {
    /// Probability a stream fails with UNAVAILABLE when it opens
    pub open_fail_prob: f64,
    /// Probability a request breaks the stream with UNAVAILABLE
    pub send_fail_prob: f64,
    /// Probability a request makes the server close the stream with OK early
    pub early_ok_prob: f64,
    /// Probability an accepted request is acked with the wrong number
    pub ack_skew_prob: f64,
}

impl Default for SimulatedTransportConfig {
    fn default() -> Self {
        SimulatedTransportConfig {
            open_fail_prob: 0.02, // 2%
            send_fail_prob: 0.03, // 3%
            early_ok_prob: 0.005, // 0.5%
            ack_skew_prob: 0.005, // 0.5%
        }
    }
}

impl SimulatedTransportConfig {
    /// High chaos configuration for stress testing
    pub fn high_chaos() -> Self {
        SimulatedTransportConfig {
            open_fail_prob: 0.1,
            send_fail_prob: 0.1,
            early_ok_prob: 0.02,
            ack_skew_prob: 0.02,
        }
    }

    /// No faults - for baseline testing
    pub fn no_faults() -> Self {
        SimulatedTransportConfig {
            open_fail_prob: 0.0,
            send_fail_prob: 0.0,
            early_ok_prob: 0.0,
            ack_skew_prob: 0.0,
        }
    }
}

/// One request as seen by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transmission {
    pub session: usize,
    pub sequence_number: u64,
    pub is_last: bool,
}

/// What happened to one session
#[derive(Debug, Clone, Default)]
pub struct SessionRecord {
    pub received: Vec<u64>,
    pub half_closed: bool,
    /// Status the client aborted the stream with
    pub aborted_with: Option<StreamStatus>,
    /// Status the server completed the stream with
    pub completed_with: Option<StreamStatus>,
}

/// Counters for fault injection and traffic
#[derive(Debug, Clone, Default)]
pub struct SimulatedTransportStats {
    pub streams_opened: u64,
    pub requests: u64,
    pub acks_sent: u64,
    pub duplicates: u64,
    /// Requests that skipped ahead of the server's accepted log
    pub sequence_gaps: u64,
    pub injected_open_failures: u64,
    pub injected_send_failures: u64,
    pub injected_early_oks: u64,
    pub injected_ack_skews: u64,
    pub half_closes: u64,
    pub aborts: u64,
}

struct ServerState<R: Rng> {
    rng: R,
    scripts: HashMap<usize, SessionScript>,
    sessions: Vec<SessionRecord>,
    /// Sequence numbers accepted across all sessions, in acceptance order
    accepted: Vec<u64>,
    transmissions: Vec<Transmission>,
    stats: SimulatedTransportStats,
}

impl<R: Rng> ServerState<R> {
    fn session_mut(&mut self, session: usize) -> &mut SessionRecord {
        // Sessions are numbered from 1 and created by open_stream.
        &mut self.sessions[session - 1]
    }
}

/// What the server does with one request
enum Reaction {
    Accept,
    AcceptAckingAs(u64),
    Fail(StreamStatus),
    Ignore,
}

/// Simulated stream client that injects faults
pub struct SimulatedStreamClient<R: Rng = SimulatedRng> {
    config: SimulatedTransportConfig,
    state: Arc<Mutex<ServerState<R>>>,
}

impl SimulatedStreamClient<SimulatedRng> {
    /// Fault-free server
    pub fn healthy() -> Self {
        Self::new(SimulatedRng::new(0), SimulatedTransportConfig::no_faults())
    }
}

impl<R: Rng + 'static> SimulatedStreamClient<R> {
    pub fn new(rng: R, config: SimulatedTransportConfig) -> Self {
        SimulatedStreamClient {
            config,
            state: Arc::new(Mutex::new(ServerState {
                rng,
                scripts: HashMap::new(),
                sessions: Vec::new(),
                accepted: Vec::new(),
                transmissions: Vec::new(),
                stats: SimulatedTransportStats::default(),
            })),
        }
    }

    /// Script the session with this number (1-based)
    pub fn with_script(self, session: usize, script: SessionScript) -> Self {
        self.set_script(session, script);
        self
    }

    pub fn set_script(&self, session: usize, script: SessionScript) {
        self.state.lock().scripts.insert(session, script);
    }

    pub fn sessions_opened(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// Sequence numbers the given session received, in order
    pub fn received(&self, session: usize) -> Vec<u64> {
        self.session(session)
            .map(|record| record.received)
            .unwrap_or_default()
    }

    pub fn session(&self, session: usize) -> Option<SessionRecord> {
        let state = self.state.lock();
        session
            .checked_sub(1)
            .and_then(|idx| state.sessions.get(idx))
            .cloned()
    }

    /// Every request received, across sessions
    pub fn transmissions(&self) -> Vec<Transmission> {
        self.state.lock().transmissions.clone()
    }

    /// Server-side log of accepted sequence numbers
    pub fn accepted(&self) -> Vec<u64> {
        self.state.lock().accepted.clone()
    }

    pub fn stats(&self) -> SimulatedTransportStats {
        self.state.lock().stats.clone()
    }
}

impl<R: Rng + 'static> StreamClient for SimulatedStreamClient<R> {
    fn open_stream(&self, on_ack: AckCallback) -> (Box<dyn StreamHandle>, StatusFuture) {
        let (status_tx, status_rx) = oneshot::channel();
        let status: StatusFuture = status_rx
            .map(|result| {
                result.unwrap_or_else(|_| StreamStatus::cancelled("stream handle dropped"))
            })
            .boxed();

        let (session, script) = {
            let mut state = self.state.lock();
            state.sessions.push(SessionRecord::default());
            state.stats.streams_opened += 1;
            let session = state.sessions.len();
            let script = match state.scripts.get(&session).cloned() {
                Some(script) => Some(script),
                None if state.rng.gen_bool(self.config.open_fail_prob) => {
                    state.stats.injected_open_failures += 1;
                    Some(SessionScript::Reject(StreamStatus::unavailable(
                        "simulated: server unavailable",
                    )))
                }
                None => None,
            };
            (session, script)
        };
        debug!(session, ?script, "Simulated stream opened");

        let mut handle = SimulatedStreamHandle {
            session,
            script,
            config: self.config.clone(),
            state: Arc::clone(&self.state),
            on_ack,
            status_tx: Some(status_tx),
            received: 0,
            acks: 0,
            skewed: false,
            broken: None,
        };
        if let Some(SessionScript::Reject(status)) = handle.script.clone() {
            handle.complete(status);
        }
        (Box::new(handle), status)
    }
}

/// Server side of one simulated session
struct SimulatedStreamHandle<R: Rng> {
    session: usize,
    /// None means random faults
    script: Option<SessionScript>,
    config: SimulatedTransportConfig,
    state: Arc<Mutex<ServerState<R>>>,
    on_ack: AckCallback,
    status_tx: Option<oneshot::Sender<StreamStatus>>,
    received: usize,
    acks: usize,
    skewed: bool,
    broken: Option<StreamStatus>,
}

impl<R: Rng> SimulatedStreamHandle<R> {
    /// Resolve the status future once; later calls are ignored
    fn complete(&mut self, status: StreamStatus) {
        if self.broken.is_none() {
            self.broken = Some(status.clone());
        }
        if let Some(tx) = self.status_tx.take() {
            self.state.lock().session_mut(self.session).completed_with = Some(status.clone());
            let _ = tx.send(status);
        }
    }

    fn react(&mut self, state: &mut ServerState<R>, request: &PublishRequest) -> Reaction {
        match &self.script {
            Some(SessionScript::Healthy) | Some(SessionScript::FailOnHalfClose(_)) => {
                Reaction::Accept
            }
            Some(SessionScript::FailAfter { requests, status }) => {
                if self.received > *requests {
                    Reaction::Fail(status.clone())
                } else {
                    Reaction::Accept
                }
            }
            Some(SessionScript::AckOutOfSequence {
                after,
                sequence_number,
            }) => {
                if !self.skewed && self.acks == *after {
                    self.skewed = true;
                    Reaction::AcceptAckingAs(*sequence_number)
                } else {
                    Reaction::Accept
                }
            }
            Some(SessionScript::Reject(status)) => Reaction::Fail(status.clone()),
            Some(SessionScript::Stall) => Reaction::Ignore,
            None => {
                if state.rng.gen_bool(self.config.send_fail_prob) {
                    state.stats.injected_send_failures += 1;
                    Reaction::Fail(StreamStatus::unavailable("simulated: connection reset"))
                } else if state.rng.gen_bool(self.config.early_ok_prob) {
                    state.stats.injected_early_oks += 1;
                    Reaction::Fail(StreamStatus::ok())
                } else if state.rng.gen_bool(self.config.ack_skew_prob) {
                    state.stats.injected_ack_skews += 1;
                    let skew = 1 + state.rng.gen_range(0, 3);
                    Reaction::AcceptAckingAs(request.sequence_number + skew)
                } else {
                    Reaction::Accept
                }
            }
        }
    }
}

impl<R: Rng> StreamHandle for SimulatedStreamHandle<R> {
    fn send(&mut self, request: PublishRequest) -> Result<(), StreamStatus> {
        if let Some(status) = &self.broken {
            return Err(status.clone());
        }
        self.received += 1;
        let sequence_number = request.sequence_number;

        let server = Arc::clone(&self.state);
        let reaction = {
            let mut guard = server.lock();
            let state = &mut *guard;
            state.stats.requests += 1;
            state.transmissions.push(Transmission {
                session: self.session,
                sequence_number,
                is_last: request.is_last(),
            });
            state.session_mut(self.session).received.push(sequence_number);

            let reaction = self.react(state, &request);
            if matches!(reaction, Reaction::Accept | Reaction::AcceptAckingAs(_)) {
                let next = state.accepted.len() as u64 + 1;
                if sequence_number == next {
                    state.accepted.push(sequence_number);
                } else if sequence_number < next {
                    state.stats.duplicates += 1;
                } else {
                    state.stats.sequence_gaps += 1;
                    let status = StreamStatus::new(
                        StatusCode::FailedPrecondition,
                        format!("expected sequence {}, received {}", next, sequence_number),
                    );
                    drop(guard);
                    self.complete(status.clone());
                    return Err(status);
                }
                state.stats.acks_sent += 1;
            }
            reaction
        };

        match reaction {
            Reaction::Accept => {
                self.acks += 1;
                trace!(session = self.session, sequence_number, "Simulated ack");
                (self.on_ack)(PublishAck { sequence_number });
                Ok(())
            }
            Reaction::AcceptAckingAs(acked) => {
                self.acks += 1;
                debug!(session = self.session, sequence_number, acked, "Simulated skewed ack");
                (self.on_ack)(PublishAck {
                    sequence_number: acked,
                });
                Ok(())
            }
            Reaction::Fail(status) => {
                debug!(session = self.session, sequence_number, %status, "Simulated stream failure");
                self.complete(status.clone());
                Err(status)
            }
            Reaction::Ignore => Ok(()),
        }
    }

    fn half_close(&mut self) {
        {
            let mut state = self.state.lock();
            state.stats.half_closes += 1;
            state.session_mut(self.session).half_closed = true;
        }
        if self.broken.is_some() {
            return;
        }
        match self.script.clone() {
            Some(SessionScript::Stall) => {}
            Some(SessionScript::FailOnHalfClose(status)) => self.complete(status),
            _ => self.complete(StreamStatus::ok()),
        }
    }

    fn abort(&mut self, status: StreamStatus) {
        {
            let mut state = self.state.lock();
            state.stats.aborts += 1;
            state.session_mut(self.session).aborted_with = Some(status.clone());
        }
        self.complete(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::clock::EventTimestamp;
    use crate::upload::event::StreamId;
    use bytes::Bytes;

    fn stream_id() -> StreamId {
        StreamId {
            build_id: "b".to_string(),
            invocation_id: "i".to_string(),
        }
    }

    fn request(sequence_number: u64) -> PublishRequest {
        PublishRequest::event(
            stream_id(),
            sequence_number,
            EventTimestamp::ZERO,
            Bytes::from_static(b"{}"),
        )
    }

    fn ack_log() -> (AckCallback, Arc<Mutex<Vec<u64>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let callback: AckCallback = Arc::new(move |ack: PublishAck| {
            sink.lock().push(ack.sequence_number);
        });
        (callback, log)
    }

    #[tokio::test]
    async fn test_healthy_session_acks_and_completes() {
        let client = SimulatedStreamClient::healthy();
        let (on_ack, acks) = ack_log();
        let (mut handle, status) = client.open_stream(on_ack);

        handle.send(request(1)).unwrap();
        handle.send(request(2)).unwrap();
        handle
            .send(PublishRequest::last(stream_id(), 3, EventTimestamp::ZERO))
            .unwrap();
        handle.half_close();

        assert!(status.await.is_ok());
        assert_eq!(*acks.lock(), vec![1, 2, 3]);
        assert_eq!(client.accepted(), vec![1, 2, 3]);
        assert_eq!(client.received(1), vec![1, 2, 3]);
        assert!(client.transmissions()[2].is_last);
        assert_eq!(client.stats().half_closes, 1);
    }

    #[tokio::test]
    async fn test_fail_after_breaks_stream() {
        let client = SimulatedStreamClient::healthy().with_script(
            1,
            SessionScript::FailAfter {
                requests: 1,
                status: StreamStatus::unavailable("gone"),
            },
        );
        let (on_ack, acks) = ack_log();
        let (mut handle, status) = client.open_stream(on_ack);

        assert!(handle.send(request(1)).is_ok());
        assert!(handle.send(request(2)).is_err());
        assert!(handle.send(request(3)).is_err());

        assert_eq!(status.await.code, StatusCode::Unavailable);
        assert_eq!(*acks.lock(), vec![1]);
        // The failing request reached the server; later ones did not.
        assert_eq!(client.received(1), vec![1, 2]);
        assert_eq!(client.accepted(), vec![1]);
    }

    #[tokio::test]
    async fn test_duplicates_across_sessions() {
        let client = SimulatedStreamClient::healthy();
        let (on_ack, _) = ack_log();
        let (mut first, _status) = client.open_stream(Arc::clone(&on_ack));
        first.send(request(1)).unwrap();
        first.abort(StreamStatus::cancelled("test"));

        let (mut second, _status) = client.open_stream(on_ack);
        second.send(request(1)).unwrap();
        second.send(request(2)).unwrap();

        assert_eq!(client.accepted(), vec![1, 2]);
        assert_eq!(client.stats().duplicates, 1);
        assert!(client.session(1).unwrap().aborted_with.is_some());
    }

    #[tokio::test]
    async fn test_gap_fails_stream() {
        let client = SimulatedStreamClient::healthy();
        let (on_ack, _) = ack_log();
        let (mut handle, status) = client.open_stream(on_ack);

        assert!(handle.send(request(2)).is_err());
        assert_eq!(status.await.code, StatusCode::FailedPrecondition);
        assert_eq!(client.stats().sequence_gaps, 1);
    }

    #[tokio::test]
    async fn test_reject_on_open() {
        let client = SimulatedStreamClient::healthy().with_script(
            1,
            SessionScript::Reject(StreamStatus::new(StatusCode::InvalidArgument, "bad build")),
        );
        let (on_ack, _) = ack_log();
        let (mut handle, status) = client.open_stream(on_ack);

        assert!(handle.send(request(1)).is_err());
        assert_eq!(status.await.code, StatusCode::InvalidArgument);
        assert!(client.received(1).is_empty());
    }

    #[tokio::test]
    async fn test_stall_never_completes_until_aborted() {
        let client = SimulatedStreamClient::healthy().with_script(1, SessionScript::Stall);
        let (on_ack, acks) = ack_log();
        let (mut handle, status) = client.open_stream(on_ack);

        handle.send(request(1)).unwrap();
        handle.half_close();
        assert!(acks.lock().is_empty());

        handle.abort(StreamStatus::cancelled("giving up"));
        assert_eq!(status.await.code, StatusCode::Cancelled);
    }

    #[tokio::test]
    async fn test_fail_on_half_close_acks_first() {
        let client = SimulatedStreamClient::healthy().with_script(
            1,
            SessionScript::FailOnHalfClose(StreamStatus::unavailable("lost on close")),
        );
        let (on_ack, acks) = ack_log();
        let (mut handle, status) = client.open_stream(on_ack);

        handle.send(request(1)).unwrap();
        handle.send(request(2)).unwrap();
        assert_eq!(*acks.lock(), vec![1, 2]);

        handle.half_close();
        assert_eq!(status.await.code, StatusCode::Unavailable);
        assert_eq!(client.accepted(), vec![1, 2]);
    }

    #[test]
    fn test_random_faults_deterministic() {
        fn run(seed: u64) -> SimulatedTransportStats {
            let client = SimulatedStreamClient::new(
                SimulatedRng::new(seed),
                SimulatedTransportConfig::high_chaos(),
            );
            for _ in 0..20 {
                let (on_ack, _) = ack_log();
                let (mut handle, _status) = client.open_stream(on_ack);
                for seq in 1..=5 {
                    let _ = handle.send(request(seq));
                }
            }
            client.stats()
        }

        let a = run(7);
        let b = run(7);
        assert_eq!(a.requests, b.requests);
        assert_eq!(a.injected_send_failures, b.injected_send_failures);
        assert_eq!(a.injected_open_failures, b.injected_open_failures);
    }
}
