use super::broker::{Broker, ProducerRecord};
use super::codec::{CodecError, TweetCodec};
use super::partition::{partition_key, route};
use crate::config::types::{PartitionKeyPolicy, PublisherConfig, RetryConfig};
use crate::delivery::events::{EventSink, PipelineEvent, PipelineStats};
use crate::delivery::tracker::{AbandonReason, AbandonedRecord, DeliveryUpdate};
use crate::pipeline::buffer::{BufferSlot, TweetBuffer};
use crate::pipeline::channel::{Receiver, Sender};
use crate::retry::Backoff;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A slot with its partition key, on its way to a worker
#[derive(Debug)]
pub struct Routed {
    pub slot: BufferSlot,
    pub key: String,
}

/// Pops slots in FIFO order and hands each to the worker owning its key.
///
/// Returns when the buffer is closed and empty or on cancellation. A slot
/// popped but not handed over stays in-flight in the buffer.
pub async fn dispatch(
    buffer: Arc<TweetBuffer>,
    workers: Vec<Sender<Routed>>,
    policy: PartitionKeyPolicy,
    cancel: CancellationToken,
) -> u64 {
    let mut dispatched = 0u64;

    loop {
        let slot = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            slot = buffer.pop() => match slot {
                Some(slot) => slot,
                None => break,
            },
        };

        let key = partition_key(policy, &slot.tweet);
        let worker = route(&key, workers.len());

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            sent = workers[worker].send(Routed { slot, key }) => {
                if sent.is_err() {
                    warn!(worker, "Publisher worker gone, stopping dispatch");
                    break;
                }
            }
        }
        dispatched += 1;
    }

    debug!(dispatched, "Dispatcher stopped");
    dispatched
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub batches: u64,
    pub acked: u64,
    pub abandoned: u64,
}

pub struct PublishWorker {
    pub id: usize,
    pub topic: String,
    pub batch_size: usize,
    pub linger: Duration,
    pub retry: RetryConfig,
    pub broker: Arc<dyn Broker>,
    pub codec: Arc<dyn TweetCodec>,
    pub buffer: Arc<TweetBuffer>,
    pub updates: Sender<DeliveryUpdate>,
    pub events: EventSink,
    pub cancel: CancellationToken,
}

impl PublishWorker {
    pub fn new(
        id: usize,
        config: &PublisherConfig,
        broker: Arc<dyn Broker>,
        codec: Arc<dyn TweetCodec>,
        buffer: Arc<TweetBuffer>,
        updates: Sender<DeliveryUpdate>,
        events: EventSink,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            topic: config.topic.clone(),
            batch_size: config.batch_size.max(1),
            linger: config.linger,
            retry: config.retry.clone(),
            broker,
            codec,
            buffer,
            updates,
            events,
            cancel,
        }
    }

    /// Batch and publish until the input closes or cancellation.
    ///
    /// On cancellation the current batch is left in the buffer as in-flight;
    /// the shutdown path drains and abandons it.
    pub async fn run(self, mut rx: Receiver<Routed>) -> WorkerSummary {
        let mut summary = WorkerSummary::default();

        loop {
            let first = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                routed = rx.recv() => routed,
            };
            let Some(first) = first else { break };

            let mut batch = vec![first];
            let deadline = Instant::now() + self.linger;
            let mut closed = false;

            while batch.len() < self.batch_size {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return summary,
                    routed = rx.recv() => match routed {
                        Some(routed) => batch.push(routed),
                        None => {
                            closed = true;
                            break;
                        }
                    },
                    _ = tokio::time::sleep_until(deadline) => break,
                }
            }

            summary.batches += 1;
            if !self.publish(batch, &mut summary).await {
                break;
            }
            if closed {
                break;
            }
        }

        debug!(
            worker = self.id,
            batches = summary.batches,
            acked = summary.acked,
            abandoned = summary.abandoned,
            "Publish worker stopped"
        );
        summary
    }

    async fn update(&self, update: DeliveryUpdate) {
        if self.updates.send(update).await.is_err() {
            warn!(worker = self.id, "Delivery tracker gone, dropping update");
        }
    }

    /// Encode a slot and read it back the way a consumer would. A record
    /// that fails its own checksum is never sent.
    fn encode_verified(&self, slot: &BufferSlot) -> Result<Vec<u8>, CodecError> {
        let payload = self.codec.encode(&slot.tweet)?;
        let decoded = self.codec.decode(&payload)?;
        if decoded.id() != slot.tweet.id() {
            return Err(CodecError::IdMismatch {
                expected: slot.tweet.id().to_string(),
                actual: decoded.id().to_string(),
            });
        }
        Ok(payload)
    }

    /// Publish one batch to completion: acked or abandoned.
    /// Returns false if cancelled mid-way.
    async fn publish(&self, batch: Vec<Routed>, summary: &mut WorkerSummary) -> bool {
        let mut records: Vec<ProducerRecord> = Vec::with_capacity(batch.len());
        let mut tweets = Vec::with_capacity(batch.len());
        let mut corrupt = Vec::new();

        for Routed { slot, key } in batch {
            match self.encode_verified(&slot) {
                Ok(payload) => {
                    records.push(ProducerRecord {
                        sequence: slot.sequence,
                        key,
                        idempotency_key: slot.tweet.id().to_string(),
                        payload,
                        content_type: self.codec.content_type(),
                    });
                    tweets.push(slot);
                }
                Err(e) => {
                    self.events.emit(PipelineEvent::CorruptPayload {
                        origin: "codec".to_string(),
                        reason: e.to_string(),
                    });
                    corrupt.push(AbandonedRecord {
                        sequence: slot.sequence,
                        tweet: slot.tweet,
                        error: e.to_string(),
                    });
                }
            }
        }

        if !corrupt.is_empty() {
            let sequences: Vec<u64> = corrupt.iter().map(|r| r.sequence).collect();
            summary.abandoned += corrupt.len() as u64;
            self.update(DeliveryUpdate::Abandoned {
                records: corrupt,
                reason: AbandonReason::Corrupt,
            })
            .await;
            self.buffer.release(&sequences);
        }

        if records.is_empty() {
            return true;
        }

        let sequences: Vec<u64> = records.iter().map(|r| r.sequence).collect();
        self.update(DeliveryUpdate::Pending {
            entries: records
                .iter()
                .map(|r| (r.sequence, r.idempotency_key.clone()))
                .collect(),
        })
        .await;

        let stats = self.events.stats().clone();
        let mut backoff = Backoff::new(&self.retry);
        let mut sends: u32 = 0;

        loop {
            sends += 1;
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                result = self.broker.send_batch(&self.topic, &records) => result,
            };

            let error = match result {
                Ok(acks) => {
                    debug!(
                        worker = self.id,
                        records = acks.len(),
                        first_sequence = sequences[0],
                        attempts = sends,
                        "Batch acknowledged"
                    );
                    self.update(DeliveryUpdate::Acked {
                        sequences: sequences.clone(),
                    })
                    .await;
                    self.buffer.ack(&sequences);
                    PipelineStats::incr(&stats.acked, sequences.len() as u64);
                    summary.acked += sequences.len() as u64;
                    return true;
                }
                Err(error) => error,
            };

            self.update(DeliveryUpdate::Failed {
                sequences: sequences.clone(),
                error: error.to_string(),
            })
            .await;

            let delay = if error.is_retriable() {
                backoff.next_delay()
            } else {
                None
            };

            match delay {
                Some(delay) => {
                    warn!(
                        worker = self.id,
                        records = sequences.len(),
                        attempt = sends,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Publish failed, retrying batch"
                    );
                    PipelineStats::incr(&stats.publish_retries, 1);
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return false,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    self.update(DeliveryUpdate::Retrying {
                        sequences: sequences.clone(),
                    })
                    .await;
                }
                None => {
                    let reason = if error.is_retriable() {
                        AbandonReason::RetriesExhausted
                    } else {
                        AbandonReason::Rejected
                    };
                    self.events.emit(PipelineEvent::DeliveryFailure {
                        sequences: sequences.clone(),
                        tweet_ids: records.iter().map(|r| r.idempotency_key.clone()).collect(),
                        attempts: sends,
                        error: error.to_string(),
                    });
                    summary.abandoned += tweets.len() as u64;
                    self.update(DeliveryUpdate::Abandoned {
                        records: tweets
                            .into_iter()
                            .map(|slot| AbandonedRecord {
                                sequence: slot.sequence,
                                tweet: slot.tweet,
                                error: error.to_string(),
                            })
                            .collect(),
                        reason,
                    })
                    .await;
                    self.buffer.release(&sequences);
                    return true;
                }
            }
        }
    }
}

/// Log line for a finished worker pool
pub fn log_pool_summary(dispatched: u64, summaries: &[WorkerSummary]) {
    let acked: u64 = summaries.iter().map(|s| s.acked).sum();
    let abandoned: u64 = summaries.iter().map(|s| s.abandoned).sum();
    let batches: u64 = summaries.iter().map(|s| s.batches).sum();
    info!(dispatched, batches, acked, abandoned, "Publisher stopped");
}
