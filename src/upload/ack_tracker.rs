//! Acknowledgement Tracker
//!
//! Events are acknowledged strictly in the order they were sent. The tracker
//! holds sent-but-unacked entries; an ack must name the head's sequence
//! number, anything else is a protocol violation.

use crate::upload::clock::EventTimestamp;
use crate::upload::event::EventEnvelope;
use crate::upload::queue::Command;
use std::collections::VecDeque;
use std::fmt;

/// Sent, awaiting acknowledgement
#[derive(Debug)]
pub enum PendingEvent {
    Regular(EventEnvelope),
    Last {
        sequence_number: u64,
        timestamp: EventTimestamp,
    },
}

impl PendingEvent {
    pub fn sequence_number(&self) -> u64 {
        match self {
            PendingEvent::Regular(envelope) => envelope.sequence_number,
            PendingEvent::Last {
                sequence_number, ..
            } => *sequence_number,
        }
    }

    /// Back into the command that produced it, for re-sending on retry
    pub fn into_command(self) -> Command {
        match self {
            PendingEvent::Regular(envelope) => Command::SendRegular(envelope),
            PendingEvent::Last {
                sequence_number,
                timestamp,
            } => Command::SendLast {
                sequence_number,
                timestamp,
            },
        }
    }
}

/// Ack did not match the head of the pending list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckMismatch {
    /// Head of the pending list, `None` if nothing was pending
    pub expected: Option<u64>,
    pub actual: u64,
}

impl fmt::Display for AckMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.expected {
            Some(expected) => write!(
                f,
                "Expected ack with sequence number {} but received ack with sequence number {}",
                expected, self.actual
            ),
            None => write!(
                f,
                "Received ack with sequence number {} but no events were awaiting acknowledgement",
                self.actual
            ),
        }
    }
}

impl std::error::Error for AckMismatch {}

/// Ordered list of in-flight events
#[derive(Debug, Default)]
pub struct AckTracker {
    pending: VecDeque<PendingEvent>,
}

impl AckTracker {
    pub fn new() -> Self {
        AckTracker {
            pending: VecDeque::new(),
        }
    }

    pub fn record_sent(&mut self, event: PendingEvent) {
        debug_assert!(
            self.pending
                .back()
                .map_or(true, |last| last.sequence_number() < event.sequence_number()),
            "events must be sent in sequence order"
        );
        self.pending.push_back(event);
    }

    /// Match an ack against the head. On mismatch nothing is removed.
    pub fn on_ack(&mut self, sequence_number: u64) -> Result<PendingEvent, AckMismatch> {
        match self.pending.front() {
            Some(head) if head.sequence_number() == sequence_number => {
                self.pending.pop_front().ok_or(AckMismatch {
                    expected: None,
                    actual: sequence_number,
                })
            }
            head => Err(AckMismatch {
                expected: head.map(PendingEvent::sequence_number),
                actual: sequence_number,
            }),
        }
    }

    /// Remove all unacknowledged entries, oldest first
    pub fn drain(&mut self) -> Vec<PendingEvent> {
        self.pending.drain(..).collect()
    }

    pub fn head(&self) -> Option<u64> {
        self.pending.front().map(PendingEvent::sequence_number)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn last(sequence_number: u64) -> PendingEvent {
        PendingEvent::Last {
            sequence_number,
            timestamp: EventTimestamp::ZERO,
        }
    }

    fn tracker_with(seqs: &[u64]) -> AckTracker {
        let mut tracker = AckTracker::new();
        for &seq in seqs {
            tracker.record_sent(last(seq));
        }
        tracker
    }

    #[test]
    fn test_in_order_acks() {
        let mut tracker = tracker_with(&[1, 2, 3]);
        assert_eq!(tracker.on_ack(1).unwrap().sequence_number(), 1);
        assert_eq!(tracker.on_ack(2).unwrap().sequence_number(), 2);
        assert_eq!(tracker.head(), Some(3));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_out_of_order_ack_is_violation() {
        let mut tracker = tracker_with(&[3, 4, 5]);
        let err = tracker.on_ack(5).unwrap_err();
        assert_eq!(
            err,
            AckMismatch {
                expected: Some(3),
                actual: 5
            }
        );
        let message = err.to_string();
        assert!(message.contains('3') && message.contains('5'));
        // Nothing matched, nothing removed
        assert_eq!(tracker.len(), 3);
        assert_eq!(tracker.head(), Some(3));
    }

    #[test]
    fn test_ack_with_nothing_pending() {
        let mut tracker = AckTracker::new();
        let err = tracker.on_ack(1).unwrap_err();
        assert_eq!(err.expected, None);
        assert!(err.to_string().contains("no events were awaiting"));
    }

    #[test]
    fn test_duplicate_ack_rejected() {
        let mut tracker = tracker_with(&[1, 2]);
        tracker.on_ack(1).unwrap();
        assert!(tracker.on_ack(1).is_err());
        assert_eq!(tracker.head(), Some(2));
    }

    #[test]
    fn test_drain_preserves_order() {
        let mut tracker = tracker_with(&[7, 8, 9]);
        tracker.on_ack(7).unwrap();
        let drained: Vec<u64> = tracker
            .drain()
            .into_iter()
            .map(|p| p.into_command().sequence_number().unwrap_or(0))
            .collect();
        assert_eq!(drained, vec![8, 9]);
        assert!(tracker.is_empty());
    }
}
