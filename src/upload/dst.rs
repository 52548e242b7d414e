//! Deterministic Simulation Testing for the Build Event Uploader
//!
//! Drives a full uploader against the fault-injecting simulated service:
//! - Seeded workload of build events, some referencing local files
//! - Random stream failures, early OK closes, bad acks
//! - Invariant checking against the server's accepted log
//! - Seed-based reproducibility for debugging
//!
//! ```text
//! for seed in 0..1000 {
//!     let mut harness = UploadDSTHarness::new(UploadDSTConfig::chaos(seed));
//!     harness.run().await;
//!     assert!(harness.result().is_success(), "seed {}", seed);
//! }
//! ```

use crate::io::{Rng, SimulatedRng};
use crate::upload::clock::SimulatedClock;
use crate::upload::config::{RetryConfig, UploaderConfig};
use crate::upload::error::FailureKind;
use crate::upload::event::BuildEvent;
use crate::upload::local_files::{InMemoryFileUploader, LocalFile, LocalFileType};
use crate::upload::serializer::JsonEventSerializer;
use crate::upload::simulated_transport::{
    SimulatedStreamClient, SimulatedTransportConfig, SimulatedTransportStats,
};
use crate::upload::stats::UploadStats;
use crate::upload::uploader::BuildEventUploader;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for upload DST
#[derive(Debug, Clone)]
pub struct UploadDSTConfig {
    /// Random seed for reproducibility
    pub seed: u64,
    /// Simulated service fault configuration
    pub transport: SimulatedTransportConfig,
    /// Regular events per run, not counting the final build-finished event
    pub events: usize,
    /// Probability an event references a local file
    pub file_probability: f64,
    pub retry: RetryConfig,
    /// Upper bound on a run; exceeding it is reported as a violation
    pub close_timeout: Duration,
}

impl Default for UploadDSTConfig {
    fn default() -> Self {
        UploadDSTConfig {
            seed: 0,
            transport: SimulatedTransportConfig::default(),
            events: 50,
            file_probability: 0.2,
            retry: RetryConfig {
                max_attempts: 6,
                base_delay: Duration::from_millis(1),
            },
            close_timeout: Duration::from_secs(30),
        }
    }
}

impl UploadDSTConfig {
    pub fn new(seed: u64) -> Self {
        UploadDSTConfig {
            seed,
            ..Default::default()
        }
    }

    /// Calm mode - no fault injection
    pub fn calm(seed: u64) -> Self {
        UploadDSTConfig {
            seed,
            transport: SimulatedTransportConfig::no_faults(),
            ..Default::default()
        }
    }

    /// Moderate fault injection
    pub fn moderate(seed: u64) -> Self {
        UploadDSTConfig {
            seed,
            transport: SimulatedTransportConfig::default(),
            ..Default::default()
        }
    }

    /// Chaos mode - aggressive fault injection
    pub fn chaos(seed: u64) -> Self {
        UploadDSTConfig {
            seed,
            transport: SimulatedTransportConfig::high_chaos(),
            file_probability: 0.4,
            ..Default::default()
        }
    }
}

/// Result of a DST run
#[derive(Debug, Clone)]
pub struct UploadDSTResult {
    /// Seed used
    pub seed: u64,
    /// Regular events enqueued
    pub events: usize,
    /// Whether the completion signal reported success
    pub upload_succeeded: bool,
    /// Failure kind, when the upload failed
    pub failure: Option<FailureKind>,
    pub upload_stats: UploadStats,
    pub transport_stats: SimulatedTransportStats,
    /// Invariant violations found
    pub invariant_violations: Vec<String>,
}

impl UploadDSTResult {
    pub fn new(seed: u64) -> Self {
        UploadDSTResult {
            seed,
            events: 0,
            upload_succeeded: false,
            failure: None,
            upload_stats: UploadStats::default(),
            transport_stats: SimulatedTransportStats::default(),
            invariant_violations: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.invariant_violations.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "Seed {}: {} events, {}, {} streams, {} retries, {} transmissions, {} violations",
            self.seed,
            self.events,
            match self.failure {
                None => "uploaded".to_string(),
                Some(kind) => format!("failed ({:?})", kind),
            },
            self.upload_stats.streams_opened,
            self.upload_stats.retries,
            self.upload_stats.transmissions,
            self.invariant_violations.len()
        )
    }
}

/// Main DST harness for the uploader
pub struct UploadDSTHarness {
    config: UploadDSTConfig,
    rng: SimulatedRng,
    client: Arc<SimulatedStreamClient>,
    files: Arc<InMemoryFileUploader>,
    result: UploadDSTResult,
}

impl UploadDSTHarness {
    pub fn new(config: UploadDSTConfig) -> Self {
        let rng = SimulatedRng::new(config.seed);
        // Different seed for the service
        let client = Arc::new(SimulatedStreamClient::new(
            SimulatedRng::new(config.seed.wrapping_add(1)),
            config.transport.clone(),
        ));
        let result = UploadDSTResult::new(config.seed);

        UploadDSTHarness {
            config,
            rng,
            client,
            files: Arc::new(InMemoryFileUploader::default()),
            result,
        }
    }

    /// Enqueue the workload, close, wait for the outcome, then check
    /// invariants
    pub async fn run(&mut self) {
        let uploader_config = UploaderConfig {
            build_id: format!("dst-build-{}", self.config.seed),
            invocation_id: format!("dst-invocation-{}", self.config.seed),
            close_timeout: self.config.close_timeout,
            retry: self.config.retry.clone(),
        };
        let clock = SimulatedClock::new(1_000);
        let uploader = match BuildEventUploader::with_parts(
            uploader_config,
            self.client.clone(),
            self.files.clone(),
            Arc::new(JsonEventSerializer),
            clock.clone(),
        ) {
            Ok(uploader) => uploader,
            Err(e) => {
                self.result
                    .invariant_violations
                    .push(format!("uploader construction failed: {}", e));
                return;
            }
        };

        let mut file_events = 0usize;
        for index in 0..self.config.events {
            let mut event = BuildEvent::new("progress", serde_json::json!({ "index": index }));
            if self.rng.gen_bool(self.config.file_probability) {
                event = event.with_file(LocalFile::new(
                    format!("/out/{}/{}.log", self.config.seed, index),
                    LocalFileType::Log,
                ));
                file_events += 1;
            }
            clock.advance_ms(self.rng.gen_range(1, 50));
            uploader.enqueue(event);
        }
        uploader.enqueue(BuildEvent::build_finished(0));
        self.result.events = self.config.events + 1;

        let outcome = uploader.close().wait().await;
        self.result.upload_succeeded = outcome.is_ok();
        self.result.failure = outcome.err().map(|e| e.kind());
        self.result.upload_stats = uploader.stats();
        self.result.transport_stats = self.client.stats();

        self.check_invariants(file_events);
    }

    /// Check protocol invariants against what the service saw
    fn check_invariants(&mut self, file_events: usize) {
        let mut violations = Vec::new();
        // Regular events plus the final "stream finished" request
        let total = self.result.events as u64 + 1;

        let accepted = self.client.accepted();
        for (idx, seq) in accepted.iter().enumerate() {
            if *seq != idx as u64 + 1 {
                violations.push(format!(
                    "accepted log out of order at {}: {:?}",
                    idx, accepted
                ));
                break;
            }
        }
        if self.result.transport_stats.sequence_gaps > 0 {
            violations.push(format!(
                "{} requests skipped ahead of the accepted log",
                self.result.transport_stats.sequence_gaps
            ));
        }

        for session in 1..=self.client.sessions_opened() {
            let received = self.client.received(session);
            if received.windows(2).any(|w| w[0] >= w[1]) {
                violations.push(format!(
                    "session {} received out of order: {:?}",
                    session, received
                ));
            }
        }

        let sessions = self.client.sessions_opened() as u64;
        if self.result.upload_stats.streams_opened != sessions {
            violations.push(format!(
                "uploader opened {} streams, service saw {}",
                self.result.upload_stats.streams_opened, sessions
            ));
        }

        match self.result.failure {
            None => {
                if accepted.len() as u64 != total {
                    violations.push(format!(
                        "upload succeeded but service accepted {} of {} requests",
                        accepted.len(),
                        total
                    ));
                }
                if self.files.uploaded().len() != file_events {
                    violations.push(format!(
                        "{} files staged, {} events referenced files",
                        self.files.uploaded().len(),
                        file_events
                    ));
                }
            }
            Some(FailureKind::Transport) => {}
            Some(kind) => {
                violations.push(format!("unexpected failure kind {:?}", kind));
            }
        }

        if !self.files.is_shut_down() {
            violations.push("file uploader not shut down after completion".to_string());
        }

        self.result.invariant_violations.extend(violations);
    }

    pub fn client(&self) -> &SimulatedStreamClient {
        &self.client
    }

    /// Get the result
    pub fn result(&self) -> &UploadDSTResult {
        &self.result
    }

    /// Consume and return the result
    pub fn into_result(self) -> UploadDSTResult {
        self.result
    }
}

/// Run a batch of DST runs with consecutive seeds
pub async fn run_dst_batch(
    base_seed: u64,
    count: usize,
    config_fn: impl Fn(u64) -> UploadDSTConfig,
) -> Vec<UploadDSTResult> {
    let mut results = Vec::with_capacity(count);

    for i in 0..count {
        let seed = base_seed + i as u64;
        let mut harness = UploadDSTHarness::new(config_fn(seed));
        harness.run().await;
        results.push(harness.into_result());
    }

    results
}

/// Summary of batch results
pub fn summarize_batch(results: &[UploadDSTResult]) -> String {
    let total = results.len();
    let passed = results.iter().filter(|r| r.is_success()).count();
    let uploaded = results.iter().filter(|r| r.upload_succeeded).count();
    let failed_seeds: Vec<u64> = results
        .iter()
        .filter(|r| !r.is_success())
        .map(|r| r.seed)
        .collect();

    let total_retries: u64 = results.iter().map(|r| r.upload_stats.retries).sum();
    let total_violations: u64 = results
        .iter()
        .map(|r| r.upload_stats.protocol_violations)
        .sum();

    let mut summary = format!(
        "Batch: {}/{} passed, {}/{} uploaded, {} retries, {} protocol violations",
        passed, total, uploaded, total, total_retries, total_violations
    );

    if !failed_seeds.is_empty() {
        summary.push_str(&format!("\nFailed seeds: {:?}", failed_seeds));
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dst_harness_calm() {
        let mut harness = UploadDSTHarness::new(UploadDSTConfig::calm(42));
        harness.run().await;

        let result = harness.result();
        assert!(
            result.is_success(),
            "Calm mode should not have invariant violations: {:?}",
            result.invariant_violations
        );
        assert!(result.upload_succeeded);
        assert_eq!(result.upload_stats.streams_opened, 1);
        assert_eq!(result.upload_stats.retries, 0);
        assert_eq!(harness.client().accepted().len(), 52);
    }

    #[tokio::test]
    async fn test_dst_harness_with_faults() {
        let mut harness = UploadDSTHarness::new(UploadDSTConfig::moderate(123));
        harness.run().await;

        let result = harness.result();
        assert!(
            result.is_success(),
            "{}: {:?}",
            result.summary(),
            result.invariant_violations
        );
        println!("{}", result.summary());
    }

    #[tokio::test]
    async fn test_dst_deterministic() {
        let mut first = UploadDSTHarness::new(UploadDSTConfig::calm(12345));
        first.run().await;
        let mut second = UploadDSTHarness::new(UploadDSTConfig::calm(12345));
        second.run().await;

        assert_eq!(first.client().transmissions(), second.client().transmissions());
        assert_eq!(
            first.result().upload_stats,
            second.result().upload_stats,
            "Same seed should produce same results"
        );
    }

    #[tokio::test]
    async fn test_dst_batch_calm() {
        let results = run_dst_batch(1000, 10, UploadDSTConfig::calm).await;

        let summary = summarize_batch(&results);
        println!("{}", summary);

        assert!(
            results.iter().all(|r| r.is_success() && r.upload_succeeded),
            "All calm runs should upload"
        );
    }
}
