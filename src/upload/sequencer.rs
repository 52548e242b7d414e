//! Sequence number assignment
//!
//! Regular events and the last-event marker draw from the same counter, so
//! the marker always carries the highest sequence number of the upload.

use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe monotonic counter starting at 1
#[derive(Debug, Default)]
pub struct Sequencer {
    last: AtomicU64,
}

impl Sequencer {
    pub fn new() -> Self {
        Sequencer {
            last: AtomicU64::new(0),
        }
    }

    pub fn next(&self) -> u64 {
        self.last.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_starts_at_one() {
        let seq = Sequencer::new();
        assert_eq!(seq.next(), 1);
        assert_eq!(seq.next(), 2);
    }

    #[test]
    fn test_unique_across_threads() {
        let seq = Arc::new(Sequencer::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let seq = Arc::clone(&seq);
                std::thread::spawn(move || (0..1000).map(|_| seq.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for n in handle.join().unwrap() {
                assert!(seen.insert(n), "duplicate sequence number {}", n);
            }
        }
        assert_eq!(seen.len(), 8000);
        assert_eq!(seq.next(), 8001);
    }
}
