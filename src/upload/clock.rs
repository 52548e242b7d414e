//! Clock Abstraction for Event Timestamps
//!
//! Envelopes and the last-event marker are stamped through this trait so
//! simulation runs can use virtual time and still produce stable output.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Wall-clock timestamp in milliseconds since the Unix epoch
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct EventTimestamp(pub u64);

impl EventTimestamp {
    pub const ZERO: EventTimestamp = EventTimestamp(0);

    pub fn from_millis(ms: u64) -> Self {
        EventTimestamp(ms)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }
}

/// Clock trait for stamping events
///
/// Implementations:
/// - `ProductionClock`: real system time
/// - `SimulatedClock`: virtual time that only moves when told to
pub trait UploadClock: Send + Sync + Clone + 'static {
    fn now(&self) -> EventTimestamp;
}

/// Production clock using real system time
#[derive(Clone)]
pub struct ProductionClock {
    start: Instant,
    start_millis: u64,
}

impl Default for ProductionClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ProductionClock {
    pub fn new() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        // A clock set before 1970 stamps events with zero rather than failing the build.
        let start_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        ProductionClock {
            start: Instant::now(),
            start_millis,
        }
    }
}

impl UploadClock for ProductionClock {
    fn now(&self) -> EventTimestamp {
        let elapsed = self.start.elapsed().as_millis() as u64;
        EventTimestamp(self.start_millis.saturating_add(elapsed))
    }
}

/// Simulated clock for deterministic testing
///
/// Time only advances via `advance_ms()` or `set()`. Clones share state.
#[derive(Clone)]
pub struct SimulatedClock {
    time_ms: Arc<AtomicU64>,
}

impl Default for SimulatedClock {
    fn default() -> Self {
        Self::new(0)
    }
}

impl SimulatedClock {
    pub fn new(start_ms: u64) -> Self {
        SimulatedClock {
            time_ms: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    pub fn advance_ms(&self, ms: u64) {
        self.time_ms.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, time_ms: u64) {
        self.time_ms.store(time_ms, Ordering::SeqCst);
    }
}

impl UploadClock for SimulatedClock {
    fn now(&self) -> EventTimestamp {
        EventTimestamp(self.time_ms.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_production_clock_advances() {
        let clock = ProductionClock::new();
        let t1 = clock.now();
        std::thread::sleep(std::time::Duration::from_millis(10));
        let t2 = clock.now();

        assert!(t2 > t1);
        assert!(t2.as_millis() - t1.as_millis() >= 10);
    }

    #[test]
    fn test_simulated_clock_is_manual() {
        let clock = SimulatedClock::new(1000);
        assert_eq!(clock.now(), clock.now());

        clock.advance_ms(100);
        assert_eq!(clock.now().as_millis(), 1100);

        clock.set(5000);
        assert_eq!(clock.now(), EventTimestamp::from_millis(5000));
    }

    #[test]
    fn test_simulated_clock_shared_between_clones() {
        let clock = SimulatedClock::new(0);
        let other = clock.clone();
        clock.advance_ms(250);
        assert_eq!(other.now().as_millis(), 250);
    }
}
