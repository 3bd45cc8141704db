use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, warn};

/// Operator-facing conditions raised by the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// Backpressure: the buffer refused a tweet and the connector paused
    BufferFull {
        capacity: usize,
        queued: usize,
        in_flight: usize,
    },
    /// The source kept failing after local retries
    SourceUnavailable {
        source: String,
        attempts: u32,
        error: String,
    },
    /// The broker rejected or never acknowledged these records
    DeliveryFailure {
        sequences: Vec<u64>,
        tweet_ids: Vec<String>,
        attempts: u32,
        error: String,
    },
    /// A payload was dropped because it could not be decoded or encoded
    CorruptPayload { origin: String, reason: String },
}

/// Lock-free counters shared by every pipeline role.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub ingested: AtomicU64,
    pub duplicates_skipped: AtomicU64,
    pub already_delivered_skipped: AtomicU64,
    pub corrupt_payloads: AtomicU64,
    pub buffer_full_signals: AtomicU64,
    pub source_unavailable: AtomicU64,
    pub acked: AtomicU64,
    pub publish_retries: AtomicU64,
    pub delivery_failures: AtomicU64,
    pub abandoned: AtomicU64,
    pub dead_lettered: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub ingested: u64,
    pub duplicates_skipped: u64,
    pub already_delivered_skipped: u64,
    pub corrupt_payloads: u64,
    pub buffer_full_signals: u64,
    pub source_unavailable: u64,
    pub acked: u64,
    pub publish_retries: u64,
    pub delivery_failures: u64,
    pub abandoned: u64,
    pub dead_lettered: u64,
}

impl PipelineStats {
    pub fn incr(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            ingested: self.ingested.load(Ordering::Relaxed),
            duplicates_skipped: self.duplicates_skipped.load(Ordering::Relaxed),
            already_delivered_skipped: self.already_delivered_skipped.load(Ordering::Relaxed),
            corrupt_payloads: self.corrupt_payloads.load(Ordering::Relaxed),
            buffer_full_signals: self.buffer_full_signals.load(Ordering::Relaxed),
            source_unavailable: self.source_unavailable.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            publish_retries: self.publish_retries.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }
}

/// Logs, counts and optionally forwards pipeline events.
#[derive(Debug, Clone)]
pub struct EventSink {
    stats: Arc<PipelineStats>,
    subscriber: Option<mpsc::UnboundedSender<PipelineEvent>>,
}

impl EventSink {
    pub fn new(stats: Arc<PipelineStats>) -> Self {
        Self {
            stats,
            subscriber: None,
        }
    }

    /// Sink that also forwards every event to the returned receiver
    pub fn with_subscriber(
        stats: Arc<PipelineStats>,
    ) -> (Self, mpsc::UnboundedReceiver<PipelineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                stats,
                subscriber: Some(tx),
            },
            rx,
        )
    }

    pub fn stats(&self) -> &Arc<PipelineStats> {
        &self.stats
    }

    pub fn emit(&self, event: PipelineEvent) {
        match &event {
            PipelineEvent::BufferFull {
                capacity,
                queued,
                in_flight,
            } => {
                PipelineStats::incr(&self.stats.buffer_full_signals, 1);
                warn!(
                    capacity = capacity,
                    queued = queued,
                    in_flight = in_flight,
                    "Buffer full, pausing source"
                );
            }
            PipelineEvent::SourceUnavailable {
                source,
                attempts,
                error,
            } => {
                PipelineStats::incr(&self.stats.source_unavailable, 1);
                error!(
                    source = %source,
                    attempts = attempts,
                    error = %error,
                    "Source unavailable"
                );
            }
            PipelineEvent::DeliveryFailure {
                sequences,
                tweet_ids,
                attempts,
                error,
            } => {
                PipelineStats::incr(&self.stats.delivery_failures, 1);
                error!(
                    records = sequences.len(),
                    first_sequence = sequences.first().copied().unwrap_or_default(),
                    first_tweet_id = tweet_ids.first().map(String::as_str).unwrap_or(""),
                    attempts = attempts,
                    error = %error,
                    "Delivery failed, records abandoned"
                );
            }
            PipelineEvent::CorruptPayload { origin, reason } => {
                PipelineStats::incr(&self.stats.corrupt_payloads, 1);
                warn!(origin = %origin, reason = %reason, "Dropping corrupt payload");
            }
        }

        if let Some(tx) = &self.subscriber {
            let _ = tx.send(event);
        }
    }
}
