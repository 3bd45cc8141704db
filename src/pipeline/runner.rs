use super::backpressure::BackpressureHandler;
use super::buffer::TweetBuffer;
use super::channel::{create_channel, Sender, UPDATE_CHANNEL_SIZE};
use crate::config::types::Config;
use crate::delivery::events::{EventSink, PipelineStats, StatsSnapshot};
use crate::delivery::tracker::{
    AbandonReason, AbandonedRecord, DeliveryTracker, DeliveryUpdate, TrackerReport, TrackerTask,
};
use crate::publisher::{Broker, Publisher, PublisherHandle};
use crate::source::{ConnectorSummary, SourceConnector, TweetSource};
use crate::storage::{Checkpoint, CheckpointError, CheckpointManager, CheckpointStore, StorageError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// What a shutdown achieved.
#[derive(Debug, Clone)]
pub struct ShutdownReport {
    /// Last durably persisted checkpoint
    pub checkpoint: Checkpoint,
    pub stats: StatsSnapshot,
    /// Sequences ahead of the checkpoint; a restart re-ingests them
    pub unresolved: Vec<u64>,
    /// The publisher drained everything before the grace period ran out
    pub drained_within_grace: bool,
    pub connector: ConnectorSummary,
    pub persist_error: Option<String>,
}

/// Wiring of connector, buffer, publisher and tracker around one store and
/// one broker.
pub struct Bridge {
    config: Config,
    store: Arc<dyn CheckpointStore>,
    broker: Arc<dyn Broker>,
    source: Box<dyn TweetSource>,
    events: Option<EventSink>,
}

impl Bridge {
    pub fn new(
        config: Config,
        store: Arc<dyn CheckpointStore>,
        broker: Arc<dyn Broker>,
        source: Box<dyn TweetSource>,
    ) -> Self {
        Self {
            config,
            store,
            broker,
            source,
            events: None,
        }
    }

    /// Use a caller-provided event sink, e.g. one with a subscriber
    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = Some(events);
        self
    }

    /// Load the checkpoint and spawn every pipeline role.
    pub async fn start(self) -> Result<RunningBridge, PipelineError> {
        let Bridge {
            config,
            store,
            broker,
            source,
            events,
        } = self;

        store.init_schema().await?;

        let instance_id = Uuid::new_v4();
        let mut manager = CheckpointManager::new(store.clone(), config.checkpoint.persist_interval);
        let checkpoint = match manager.load().await? {
            Some(stored) => Checkpoint {
                instance_id,
                ..stored
            },
            None => Checkpoint::initial(instance_id),
        };

        let resume_from = config
            .source
            .resume_from
            .clone()
            .or_else(|| checkpoint.cursor.clone());
        if config.source.resume_from.is_some() {
            warn!(
                resume_from = resume_from.as_deref().unwrap_or(""),
                "Overriding checkpoint cursor from configuration"
            );
        }

        info!(
            instance_id = %instance_id,
            sequence = checkpoint.sequence,
            cursor = resume_from.as_deref().unwrap_or(""),
            "Starting bridge"
        );

        let events = events.unwrap_or_else(|| EventSink::new(Arc::new(PipelineStats::default())));
        let buffer = Arc::new(TweetBuffer::new(
            config.buffer.capacity,
            checkpoint.next_sequence(),
        ));

        let (updates_tx, updates_rx) = create_channel(UPDATE_CHANNEL_SIZE);
        let (published_tx, published_rx) = watch::channel(checkpoint.clone());

        let tracker = TrackerTask::new(
            DeliveryTracker::new(
                checkpoint,
                config.publisher.on_abandon,
                events.stats().clone(),
            ),
            manager,
            store.clone(),
            updates_rx,
            published_tx,
            config.checkpoint.persist_interval,
            events.clone(),
        );
        let tracker_handle = tokio::spawn(tracker.run());

        let publisher_cancel = CancellationToken::new();
        let publisher = Publisher::new(config.publisher.clone(), broker.clone(), events.clone())
            .spawn(buffer.clone(), updates_tx.clone(), publisher_cancel);

        let source_cancel = CancellationToken::new();
        let connector = SourceConnector::new(
            source,
            &config.source,
            resume_from,
            published_rx.clone(),
            events.clone(),
        );
        let backpressure = BackpressureHandler::from_config(&config.buffer);
        let connector_handle = {
            let buffer = buffer.clone();
            let cancel = source_cancel.clone();
            tokio::spawn(async move { connector.run(&buffer, &backpressure, cancel).await })
        };

        Ok(RunningBridge {
            buffer,
            broker,
            events,
            checkpoint: published_rx,
            updates: Some(updates_tx),
            source_cancel,
            connector: Some(connector_handle),
            connector_summary: None,
            publisher,
            tracker: tracker_handle,
        })
    }
}

pub struct RunningBridge {
    buffer: Arc<TweetBuffer>,
    broker: Arc<dyn Broker>,
    events: EventSink,
    checkpoint: watch::Receiver<Checkpoint>,
    updates: Option<Sender<DeliveryUpdate>>,
    source_cancel: CancellationToken,
    connector: Option<JoinHandle<ConnectorSummary>>,
    connector_summary: Option<ConnectorSummary>,
    publisher: PublisherHandle,
    tracker: JoinHandle<TrackerReport>,
}

impl RunningBridge {
    /// Receiver of every durably persisted checkpoint
    pub fn checkpoint(&self) -> watch::Receiver<Checkpoint> {
        self.checkpoint.clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.events.stats().snapshot()
    }

    pub fn buffer(&self) -> &Arc<TweetBuffer> {
        &self.buffer
    }

    /// Resolves when the source is exhausted or the connector stops.
    /// Cancel-safe.
    pub async fn wait_for_source(&mut self) -> Result<ConnectorSummary, PipelineError> {
        if let Some(handle) = self.connector.as_mut() {
            let result = handle.await;
            self.connector = None;
            self.connector_summary = Some(result?);
        }
        Ok(self.connector_summary.clone().unwrap_or_default())
    }

    /// Stop ingesting, give in-flight work `grace` to finish, then abandon what
    /// is left and persist the best-known checkpoint.
    pub async fn shutdown(mut self, grace: Duration) -> Result<ShutdownReport, PipelineError> {
        info!(grace_ms = grace.as_millis() as u64, "Shutting down bridge");

        self.source_cancel.cancel();
        self.buffer.close();
        let connector = self.wait_for_source().await?;

        let drained_within_grace =
            match tokio::time::timeout(grace, self.publisher.wait()).await {
                Ok(result) => {
                    result?;
                    true
                }
                Err(_) => {
                    warn!("Grace period elapsed with records in flight, cancelling publisher");
                    self.publisher.cancel();
                    self.publisher.wait().await?;
                    false
                }
            };

        let remaining = self.buffer.drain_remaining();
        if let Some(updates) = self.updates.take() {
            if !remaining.is_empty() {
                warn!(
                    records = remaining.len(),
                    first_sequence = remaining[0].sequence,
                    "Abandoning undelivered records at shutdown"
                );
                let records = remaining
                    .into_iter()
                    .map(|slot| AbandonedRecord {
                        sequence: slot.sequence,
                        tweet: slot.tweet,
                        error: "not delivered before shutdown".to_string(),
                    })
                    .collect();
                let _ = updates
                    .send(DeliveryUpdate::Abandoned {
                        records,
                        reason: AbandonReason::Shutdown,
                    })
                    .await;
            }
        }

        let report = self.tracker.await?;

        if let Err(e) = self.broker.flush(grace).await {
            warn!(error = %e, "Broker flush failed");
        }

        let stats = self.events.stats().snapshot();
        info!(
            sequence = report.checkpoint.sequence,
            unresolved = report.unresolved.len(),
            acked = stats.acked,
            drained_within_grace,
            "Bridge stopped"
        );

        Ok(ShutdownReport {
            checkpoint: report.checkpoint,
            stats,
            unresolved: report.unresolved,
            drained_within_grace,
            connector,
            persist_error: report.persist_error,
        })
    }
}
