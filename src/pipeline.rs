//! Periodic drain → aggregate → encode → upload pipeline
//!
//! Two tasks run side by side:
//!
//! * the **calc** task ticks every `calc_interval`, drains the sample
//!   buffer, runs one [`FlushCycle`] on the blocking pool and queues the
//!   resulting batches;
//! * the **submission** task ticks every `push_interval` and hands queued
//!   batches to the [`Uploader`], without waiting on the outcome.
//!
//! They share nothing but the buffer and the batch channel between them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::AggregationConfig;
use crate::error::{ConfigError, UploadError};
use crate::metrics::{Aggregator, CloudSample, EncodedBatch, Sample, SampleBuffer, SampleEncoder};

// ─── Uploader boundary ───────────────────────────────────────────

/// Receives encoded batches. Retry and backoff are the implementor's job.
#[async_trait]
pub trait Uploader: Send + Sync + 'static {
    async fn send(&self, batch: EncodedBatch) -> Result<(), UploadError>;
}

// ─── Counters ────────────────────────────────────────────────────

/// Pipeline counters, updated by both tasks.
#[derive(Debug, Default)]
pub struct PipelineStats {
    samples_drained: AtomicU64,
    single_values: AtomicU64,
    trails_ingested: AtomicU64,
    late_dropped: AtomicU64,
    late_merged: AtomicU64,
    aggregated_records: AtomicU64,
    passthrough_records: AtomicU64,
    truncated_records: AtomicU64,
    encode_failures: AtomicU64,
    batches_encoded: AtomicU64,
    batches_sent: AtomicU64,
    upload_failures: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStatsSnapshot {
    pub samples_drained: u64,
    pub single_values: u64,
    pub trails_ingested: u64,
    pub late_dropped: u64,
    pub late_merged: u64,
    pub aggregated_records: u64,
    pub passthrough_records: u64,
    pub truncated_records: u64,
    pub encode_failures: u64,
    pub batches_encoded: u64,
    pub batches_sent: u64,
    pub upload_failures: u64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        PipelineStatsSnapshot {
            samples_drained: get(&self.samples_drained),
            single_values: get(&self.single_values),
            trails_ingested: get(&self.trails_ingested),
            late_dropped: get(&self.late_dropped),
            late_merged: get(&self.late_merged),
            aggregated_records: get(&self.aggregated_records),
            passthrough_records: get(&self.passthrough_records),
            truncated_records: get(&self.truncated_records),
            encode_failures: get(&self.encode_failures),
            batches_encoded: get(&self.batches_encoded),
            batches_sent: get(&self.batches_sent),
            upload_failures: get(&self.upload_failures),
        }
    }
}

// ─── FlushCycle ──────────────────────────────────────────────────

/// One calc-cadence step: drain, aggregate, encode.
///
/// Owned by the calc task; exposed so callers can drive cycles against
/// their own clock.
pub struct FlushCycle {
    buffer: Arc<SampleBuffer>,
    aggregator: Aggregator,
    encoder: SampleEncoder,
    next_sequence: u64,
    stats: Arc<PipelineStats>,
}

impl FlushCycle {
    pub fn new(config: &AggregationConfig, buffer: Arc<SampleBuffer>, stats: Arc<PipelineStats>) -> Self {
        Self {
            buffer,
            aggregator: Aggregator::new(config),
            encoder: SampleEncoder::from_config(config),
            next_sequence: 1,
            stats,
        }
    }

    /// Emit the time buckets that are due at `now`.
    pub fn run(&mut self, now: DateTime<Utc>) -> Vec<EncodedBatch> {
        self.cycle(|agg| agg.flush_due(now))
    }

    /// Emit everything still held, complete or not.
    pub fn finish(&mut self) -> Vec<EncodedBatch> {
        self.cycle(Aggregator::flush_all)
    }

    pub fn pending_trails(&self) -> usize {
        self.aggregator.pending_trails()
    }

    fn cycle(&mut self, flush: impl FnOnce(&mut Aggregator) -> Vec<CloudSample>) -> Vec<EncodedBatch> {
        let drained = self.buffer.drain();
        self.stats
            .samples_drained
            .fetch_add(drained.len() as u64, Ordering::Relaxed);

        let mut out = Vec::new();
        let mut trails = Vec::new();
        for sample in drained {
            match sample {
                Sample::Single(v) => out.push(CloudSample::SingleValue(v)),
                Sample::HttpTrail(t) => trails.push(t),
            }
        }
        self.stats
            .single_values
            .fetch_add(out.len() as u64, Ordering::Relaxed);

        self.aggregator.ingest(trails);
        out.extend(flush(&mut self.aggregator));
        self.record_aggregator_stats();

        if out.is_empty() {
            return Vec::new();
        }

        let outcome = self.encoder.encode(&out, self.next_sequence);
        self.next_sequence += outcome.batches.len() as u64;
        self.stats
            .encode_failures
            .fetch_add(outcome.dropped as u64, Ordering::Relaxed);
        self.stats
            .batches_encoded
            .fetch_add(outcome.batches.len() as u64, Ordering::Relaxed);

        debug!(
            samples = out.len(),
            batches = outcome.batches.len(),
            dropped = outcome.dropped,
            pending = self.aggregator.pending_trails(),
            "flush cycle complete"
        );
        outcome.batches
    }

    fn record_aggregator_stats(&self) {
        let a = self.aggregator.stats();
        let s = &self.stats;
        s.trails_ingested.store(a.trails_ingested, Ordering::Relaxed);
        s.late_dropped.store(a.late_dropped, Ordering::Relaxed);
        s.late_merged.store(a.late_merged, Ordering::Relaxed);
        s.aggregated_records.store(a.aggregated_records, Ordering::Relaxed);
        s.passthrough_records.store(a.passthrough_records, Ordering::Relaxed);
        s.truncated_records.store(a.truncated_records, Ordering::Relaxed);
    }
}

// ─── Producer side ───────────────────────────────────────────────

/// Cloneable entry point for producers.
#[derive(Clone)]
pub struct SampleSubmitter {
    buffer: Arc<SampleBuffer>,
}

impl SampleSubmitter {
    /// Fire-and-forget: the batch is buffered until the next calc tick.
    pub fn submit(&self, batch: Vec<Sample>) {
        self.buffer.append(batch);
    }
}

// ─── Pipeline ────────────────────────────────────────────────────

/// Handle to a running pipeline.
///
/// Dropping the handle without calling [`shutdown`](Self::shutdown) still
/// makes the calc task run its final flush, but nobody waits for it.
pub struct PipelineHandle {
    buffer: Arc<SampleBuffer>,
    stats: Arc<PipelineStats>,
    shutdown: Option<oneshot::Sender<()>>,
    calc: JoinHandle<()>,
    submission: JoinHandle<()>,
}

pub struct Pipeline;

impl Pipeline {
    /// Validate `config` and start the calc and submission tasks.
    /// Must be called from within a Tokio runtime.
    pub fn spawn(config: AggregationConfig, uploader: Arc<dyn Uploader>) -> Result<PipelineHandle, ConfigError> {
        config.validate()?;

        let buffer = Arc::new(SampleBuffer::new(config.buffer_shards));
        let stats = Arc::new(PipelineStats::default());
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (batch_tx, batch_rx) = mpsc::unbounded_channel();

        let cycle = FlushCycle::new(&config, buffer.clone(), stats.clone());
        let calc = tokio::spawn(calc_loop(cycle, config.calc_interval(), shutdown_rx, batch_tx));
        let submission = tokio::spawn(submission_loop(
            uploader,
            config.push_interval(),
            batch_rx,
            stats.clone(),
        ));

        info!(
            period_ms = config.aggregation_period_ms,
            calc_ms = config.calc_interval_ms,
            push_ms = config.push_interval_ms,
            "aggregation pipeline started"
        );

        Ok(PipelineHandle {
            buffer,
            stats,
            shutdown: Some(shutdown_tx),
            calc,
            submission,
        })
    }
}

impl PipelineHandle {
    pub fn submitter(&self) -> SampleSubmitter {
        SampleSubmitter {
            buffer: self.buffer.clone(),
        }
    }

    pub fn stats(&self) -> PipelineStatsSnapshot {
        self.stats.snapshot()
    }

    /// Final drain and full flush, then wait until every batch has been
    /// handed to the uploader and answered.
    pub async fn shutdown(mut self) -> PipelineStatsSnapshot {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(err) = (&mut self.calc).await {
            warn!(%err, "calc task ended abnormally");
        }
        if let Err(err) = (&mut self.submission).await {
            warn!(%err, "submission task ended abnormally");
        }

        let stats = self.stats.snapshot();
        info!(
            batches_sent = stats.batches_sent,
            upload_failures = stats.upload_failures,
            encode_failures = stats.encode_failures,
            late_dropped = stats.late_dropped,
            "aggregation pipeline stopped"
        );
        stats
    }
}

async fn calc_loop(
    cycle: FlushCycle,
    period: Duration,
    mut shutdown: oneshot::Receiver<()>,
    batches: mpsc::UnboundedSender<EncodedBatch>,
) {
    let cycle = Arc::new(Mutex::new(cycle));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = Utc::now();
                queue(run_blocking(&cycle, move |c| c.run(now)).await, &batches);
            }
            // Fires on an explicit shutdown and when the handle is dropped
            _ = &mut shutdown => break,
        }
    }

    let pending = cycle.lock().pending_trails();
    queue(run_blocking(&cycle, FlushCycle::finish).await, &batches);
    debug!(pending, "final flush queued");
}

/// Sorting and reduction over a large bucket would stall the runtime, so
/// each cycle runs on the blocking pool. The calc loop awaits it, which
/// keeps cycles single-flight.
async fn run_blocking(
    cycle: &Arc<Mutex<FlushCycle>>,
    step: impl FnOnce(&mut FlushCycle) -> Vec<EncodedBatch> + Send + 'static,
) -> Vec<EncodedBatch> {
    let cycle = cycle.clone();
    match tokio::task::spawn_blocking(move || step(&mut *cycle.lock())).await {
        Ok(batches) => batches,
        Err(err) => {
            warn!(%err, "flush cycle panicked, its samples are lost");
            Vec::new()
        }
    }
}

fn queue(out: Vec<EncodedBatch>, batches: &mpsc::UnboundedSender<EncodedBatch>) {
    for batch in out {
        if batches.send(batch).is_err() {
            warn!("submission task gone, batch discarded");
        }
    }
}

async fn submission_loop(
    uploader: Arc<dyn Uploader>,
    period: Duration,
    mut batches: mpsc::UnboundedReceiver<EncodedBatch>,
    stats: Arc<PipelineStats>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut queued: Vec<EncodedBatch> = Vec::new();
    let mut in_flight = JoinSet::new();

    loop {
        tokio::select! {
            batch = batches.recv() => match batch {
                Some(batch) => queued.push(batch),
                None => break,
            },
            _ = ticker.tick() => dispatch(&mut queued, &uploader, &stats, &mut in_flight),
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(err) = joined {
                    warn!(%err, "upload task panicked");
                }
            }
        }
    }

    // Calc task finished its final flush: ship the rest and wait for answers
    dispatch(&mut queued, &uploader, &stats, &mut in_flight);
    while let Some(joined) = in_flight.join_next().await {
        if let Err(err) = joined {
            warn!(%err, "upload task panicked");
        }
    }
}

fn dispatch(
    queued: &mut Vec<EncodedBatch>,
    uploader: &Arc<dyn Uploader>,
    stats: &Arc<PipelineStats>,
    in_flight: &mut JoinSet<()>,
) {
    for batch in queued.drain(..) {
        let uploader = uploader.clone();
        let stats = stats.clone();
        in_flight.spawn(async move {
            let sequence = batch.sequence;
            let samples = batch.sample_count;
            match uploader.send(batch).await {
                Ok(()) => {
                    stats.batches_sent.fetch_add(1, Ordering::Relaxed);
                    debug!(sequence, samples, "batch uploaded");
                }
                Err(err) => {
                    stats.upload_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(sequence, samples, %err, "batch upload failed");
                }
            }
        });
    }
}
