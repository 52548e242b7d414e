//! Event Queue
//!
//! Unbounded double-ended queue of commands for the upload loop. Producers
//! and transport callbacks push; the upload loop is the only consumer.
//! Retries push unacknowledged events back onto the front.

use crate::upload::clock::EventTimestamp;
use crate::upload::event::EventEnvelope;
use crate::upload::session::SessionId;
use crate::upload::status::StreamStatus;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;

/// Work item for the upload loop
#[derive(Debug)]
pub enum Command {
    /// Open a new stream instance
    OpenStream,
    /// Transmit a build event once its local files are staged
    SendRegular(EventEnvelope),
    /// Transmit the end-of-stream marker, then half-close
    SendLast {
        sequence_number: u64,
        timestamp: EventTimestamp,
    },
    /// The server acknowledged `sequence_number` on stream `session`
    AckReceived {
        session: SessionId,
        sequence_number: u64,
    },
    /// Stream `session` terminated with `status`
    StreamComplete {
        session: SessionId,
        status: StreamStatus,
    },
}

impl Command {
    /// Sequence number for send commands
    pub fn sequence_number(&self) -> Option<u64> {
        match self {
            Command::SendRegular(envelope) => Some(envelope.sequence_number),
            Command::SendLast {
                sequence_number, ..
            } => Some(*sequence_number),
            _ => None,
        }
    }

    /// Cancel the local-file upload this command owns, if any
    pub fn cancel_upload(&self) {
        if let Command::SendRegular(envelope) = self {
            envelope.local_files.cancel();
        }
    }
}

/// Blocking (async) double-ended command queue
#[derive(Debug, Default)]
pub struct EventQueue {
    commands: Mutex<VecDeque<Command>>,
    available: Notify,
}

impl EventQueue {
    pub fn new() -> Self {
        EventQueue {
            commands: Mutex::new(VecDeque::new()),
            available: Notify::new(),
        }
    }

    pub fn push_back(&self, command: Command) {
        self.commands.lock().push_back(command);
        self.available.notify_one();
    }

    pub fn push_front(&self, command: Command) {
        self.commands.lock().push_front(command);
        self.available.notify_one();
    }

    /// Put `commands` at the front, keeping their relative order
    pub fn push_front_all(&self, commands: Vec<Command>) {
        if commands.is_empty() {
            return;
        }
        {
            let mut queue = self.commands.lock();
            for command in commands.into_iter().rev() {
                queue.push_front(command);
            }
        }
        self.available.notify_one();
    }

    /// Take the next command, waiting while the queue is empty. Cancel-safe.
    pub async fn take(&self) -> Command {
        loop {
            let notified = self.available.notified();
            if let Some(command) = self.commands.lock().pop_front() {
                return command;
            }
            notified.await;
        }
    }

    /// Remove everything, front to back
    pub fn drain(&self) -> Vec<Command> {
        self.commands.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.commands.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn last(sequence_number: u64) -> Command {
        Command::SendLast {
            sequence_number,
            timestamp: EventTimestamp::ZERO,
        }
    }

    fn sequences(commands: &[Command]) -> Vec<Option<u64>> {
        commands.iter().map(Command::sequence_number).collect()
    }

    #[test]
    fn test_fifo_order() {
        let queue = EventQueue::new();
        queue.push_back(last(1));
        queue.push_back(last(2));
        queue.push_back(last(3));
        assert_eq!(queue.len(), 3);
        assert_eq!(sequences(&queue.drain()), vec![Some(1), Some(2), Some(3)]);
    }

    #[test]
    fn test_push_front_all_keeps_order() {
        let queue = EventQueue::new();
        queue.push_back(last(5));
        queue.push_front_all(vec![last(2), last(3), last(4)]);
        queue.push_front(Command::OpenStream);

        let drained = queue.drain();
        assert_eq!(
            sequences(&drained),
            vec![None, Some(2), Some(3), Some(4), Some(5)]
        );
        assert!(matches!(drained[0], Command::OpenStream));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_take_waits_for_producer() {
        let queue = Arc::new(EventQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.take().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!consumer.is_finished());

        let producer = Arc::clone(&queue);
        std::thread::spawn(move || producer.push_back(last(9)))
            .join()
            .unwrap();

        let command = consumer.await.unwrap();
        assert_eq!(command.sequence_number(), Some(9));
    }

    #[tokio::test]
    async fn test_take_is_cancel_safe() {
        let queue = EventQueue::new();
        let timed_out = tokio::time::timeout(Duration::from_millis(10), queue.take()).await;
        assert!(timed_out.is_err());

        queue.push_back(last(1));
        let command = tokio::time::timeout(Duration::from_millis(100), queue.take())
            .await
            .unwrap();
        assert_eq!(command.sequence_number(), Some(1));
    }
}
