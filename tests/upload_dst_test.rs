//! Build Event Upload DST Tests
//!
//! Deterministic simulation tests (FoundationDB-style, seed-based) for the
//! uploader. These tests run many seeds to find edge cases.
//!
//! ## Test Categories
//!
//! - **Calm tests**: No faults, verify basic correctness
//! - **Moderate tests**: Some faults, verify resilience
//! - **Chaos tests**: Many faults, stress test

use bes_uploader::upload::{
    run_dst_batch, summarize_batch, FailureKind, UploadDSTConfig, UploadDSTHarness,
};

// =============================================================================
// Single Seed Tests
// =============================================================================

#[tokio::test]
async fn test_upload_dst_single_calm() {
    let mut harness = UploadDSTHarness::new(UploadDSTConfig::calm(12345));
    harness.run().await;

    let result = harness.result();
    println!("{}", result.summary());

    assert!(
        result.is_success(),
        "Calm mode should not violate invariants: {:?}",
        result.invariant_violations
    );
    assert!(result.upload_succeeded);
    assert_eq!(result.upload_stats.protocol_violations, 0);
}

#[tokio::test]
async fn test_upload_dst_single_chaos() {
    let config = UploadDSTConfig {
        events: 200,
        ..UploadDSTConfig::chaos(54321)
    };
    let mut harness = UploadDSTHarness::new(config);
    harness.run().await;

    let result = harness.result();
    println!("{}", result.summary());

    assert!(
        result.is_success(),
        "Invariant violations: {:?}",
        result.invariant_violations
    );
    if let Some(kind) = result.failure {
        assert_eq!(kind, FailureKind::Transport);
    }
}

// =============================================================================
// Multi-Seed Batches
// =============================================================================

#[tokio::test]
async fn test_upload_dst_batch_calm() {
    let results = run_dst_batch(0, 20, UploadDSTConfig::calm).await;
    println!("{}", summarize_batch(&results));

    assert!(results.iter().all(|r| r.is_success() && r.upload_succeeded));
}

#[tokio::test]
async fn test_upload_dst_batch_moderate() {
    let results = run_dst_batch(100, 30, UploadDSTConfig::moderate).await;
    println!("{}", summarize_batch(&results));

    let failed: Vec<_> = results.iter().filter(|r| !r.is_success()).collect();
    assert!(
        failed.is_empty(),
        "Invariant violations: {:?}",
        failed
            .iter()
            .map(|r| (r.seed, &r.invariant_violations))
            .collect::<Vec<_>>()
    );
    // Faults happen, but retries should carry most runs through
    let uploaded = results.iter().filter(|r| r.upload_succeeded).count();
    assert!(uploaded >= results.len() * 8 / 10);
}

#[tokio::test]
async fn test_upload_dst_batch_chaos() {
    let results = run_dst_batch(1000, 30, UploadDSTConfig::chaos).await;
    println!("{}", summarize_batch(&results));

    for result in &results {
        assert!(
            result.is_success(),
            "Seed {} violated invariants: {:?}",
            result.seed,
            result.invariant_violations
        );
    }
    let retried: u64 = results.iter().map(|r| r.upload_stats.retries).sum();
    assert!(retried > 0, "Chaos mode should force retries");
}
