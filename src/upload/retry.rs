//! Retry bookkeeping for the upload loop
//!
//! Loop-local; threaded through each iteration rather than kept on the
//! uploader.

use crate::upload::config::RetryConfig;
use std::time::Duration;

/// Outcome of asking for another attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep this long, then reopen the stream
    Backoff(Duration),
    /// Attempt budget spent without progress
    Exhausted,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryState {
    /// Consecutive retries without an acknowledgement in between
    pub attempt: u32,
    /// Acks received since the last retry
    pub acks_since_retry: u64,
}

impl RetryState {
    pub fn record_ack(&mut self) {
        self.acks_since_retry += 1;
    }

    /// Decide what to do after a retryable failure and advance the state.
    ///
    /// Any ack since the previous retry means the server made progress, so
    /// the attempt budget starts over.
    pub fn next(&mut self, config: &RetryConfig) -> RetryDecision {
        if self.acks_since_retry > 0 {
            self.attempt = 0;
        }
        if self.attempt >= config.max_attempts {
            return RetryDecision::Exhausted;
        }
        let delay = config.delay_for_attempt(self.attempt);
        self.attempt += 1;
        self.acks_since_retry = 0;
        RetryDecision::Backoff(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay: Duration::from_millis(100),
        }
    }

    #[test]
    fn test_exhausts_after_max_attempts() {
        let config = config(4);
        let mut state = RetryState::default();
        let mut delays = Vec::new();
        while let RetryDecision::Backoff(delay) = state.next(&config) {
            delays.push(delay.as_millis());
        }
        assert_eq!(delays, vec![100, 160, 256, 409]);
        assert_eq!(state.next(&config), RetryDecision::Exhausted);
    }

    #[test]
    fn test_progress_resets_attempts() {
        let config = config(2);
        let mut state = RetryState::default();
        assert!(matches!(state.next(&config), RetryDecision::Backoff(_)));
        assert!(matches!(state.next(&config), RetryDecision::Backoff(_)));

        state.record_ack();
        assert_eq!(
            state.next(&config),
            RetryDecision::Backoff(Duration::from_millis(100))
        );
        assert_eq!(state.attempt, 1);
        assert_eq!(state.acks_since_retry, 0);
    }

    #[test]
    fn test_zero_attempts_never_retries() {
        let mut state = RetryState::default();
        assert_eq!(state.next(&config(0)), RetryDecision::Exhausted);
    }
}
