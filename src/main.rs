use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use cloud_aggregator::metrics::EncodedBatch;
use cloud_aggregator::{AggregationConfig, Pipeline, UploadError, Uploader};

mod load_generator;

/// How long the synthetic load runs
const LOAD_DURATION: Duration = Duration::from_secs(6);

/// Number of concurrent producer tasks
const CONCURRENCY: u32 = 8;

/// Stands in for the HTTP uploader: logs every batch it receives.
struct LoggingUploader {
    run_id: Uuid,
}

#[async_trait]
impl Uploader for LoggingUploader {
    async fn send(&self, batch: EncodedBatch) -> Result<(), UploadError> {
        info!(
            run_id = %self.run_id,
            sequence = batch.sequence,
            samples = batch.sample_count,
            bytes = batch.payload.len(),
            "batch ready for upload"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,cloud_aggregator=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // ── 1. Configuration ─────────────────────────────────────────
    // Short windows so a few seconds of load produce several flushes
    let config = AggregationConfig::from_json(
        r#"{
            "aggregation_period_ms": 1000,
            "aggregation_wait_period_ms": 500,
            "calc_interval_ms": 500,
            "push_interval_ms": 1000,
            "min_samples": 10
        }"#,
    )?;

    // ── 2. Start the pipeline ────────────────────────────────────
    let run_id = Uuid::new_v4();
    info!(%run_id, "starting demo run");
    let pipeline = Pipeline::spawn(config, Arc::new(LoggingUploader { run_id }))?;

    // ── 3. Generate load ─────────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    load_generator::run(running, pipeline.submitter(), CONCURRENCY, LOAD_DURATION).await;

    // ── 4. Final flush & summary ─────────────────────────────────
    let stats = pipeline.shutdown().await;
    println!("{}", serde_json::to_string_pretty(&stats)?);

    Ok(())
}
