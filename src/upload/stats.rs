//! Upload statistics

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of the upload counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadStats {
    /// Events accepted by `enqueue`
    pub events_enqueued: u64,
    /// Events dropped because close had already been requested
    pub events_dropped: u64,
    /// Requests written to a stream, re-sends included
    pub transmissions: u64,
    pub acks_received: u64,
    pub streams_opened: u64,
    pub retries: u64,
    pub protocol_violations: u64,
}

/// Shared counters, updated by the controller and the upload loop
#[derive(Debug, Default)]
pub(crate) struct StatsRecorder {
    events_enqueued: AtomicU64,
    events_dropped: AtomicU64,
    transmissions: AtomicU64,
    acks_received: AtomicU64,
    streams_opened: AtomicU64,
    retries: AtomicU64,
    protocol_violations: AtomicU64,
}

impl StatsRecorder {
    pub fn event_enqueued(&self) {
        self.events_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn event_dropped(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transmission(&self) {
        self.transmissions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ack_received(&self) {
        self.acks_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stream_opened(&self) {
        self.streams_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn protocol_violation(&self) {
        self.protocol_violations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> UploadStats {
        UploadStats {
            events_enqueued: self.events_enqueued.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            transmissions: self.transmissions.load(Ordering::Relaxed),
            acks_received: self.acks_received.load(Ordering::Relaxed),
            streams_opened: self.streams_opened.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            protocol_violations: self.protocol_violations.load(Ordering::Relaxed),
        }
    }
}
