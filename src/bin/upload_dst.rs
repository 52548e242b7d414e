//! Upload DST Runner
//!
//! Runs a batch of deterministic simulations of the build event uploader
//! against the fault-injecting simulated service.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | DST_SEED | 0 | First seed of the batch |
//! | DST_RUNS | 100 | Number of seeds to run |
//! | DST_MODE | moderate | calm, moderate or chaos |
//! | DST_EVENTS | 50 | Events per run |
//! | RUST_LOG | info | Log filter |

use bes_uploader::observability::{init_tracing, LogConfig};
use bes_uploader::upload::{run_dst_batch, summarize_batch, UploadDSTConfig};
use tracing::{error, info};

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing(&LogConfig::from_env());

    let base_seed: u64 = env_or("DST_SEED", 0);
    let runs: usize = env_or("DST_RUNS", 100);
    let events: usize = env_or("DST_EVENTS", 50);
    let mode = std::env::var("DST_MODE").unwrap_or_else(|_| "moderate".to_string());

    let preset: fn(u64) -> UploadDSTConfig = match mode.as_str() {
        "calm" => UploadDSTConfig::calm,
        "moderate" => UploadDSTConfig::moderate,
        "chaos" => UploadDSTConfig::chaos,
        other => return Err(format!("unknown DST_MODE {:?}", other).into()),
    };

    info!(base_seed, runs, events, mode = %mode, "Starting upload DST batch");
    let results = run_dst_batch(base_seed, runs, |seed| UploadDSTConfig {
        events,
        ..preset(seed)
    })
    .await;

    for result in results.iter().filter(|r| !r.is_success()) {
        error!(seed = result.seed, violations = ?result.invariant_violations, "{}", result.summary());
    }

    let summary = summarize_batch(&results);
    println!("{}", summary);

    if results.iter().all(|r| r.is_success()) {
        Ok(())
    } else {
        Err("invariant violations found".into())
    }
}
