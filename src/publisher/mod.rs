pub mod broker;
pub mod codec;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;
pub mod partition;
pub mod stdout;
pub mod worker;

pub use broker::{Broker, BrokerError, ProducerRecord, RecordAck};
pub use codec::{build_codec, CodecError, JsonCodec, TweetCodec};
pub use memory::InMemoryBroker;
pub use stdout::StdoutBroker;

use crate::config::types::{BrokerConfig, BrokerType, PublisherConfig};
use crate::delivery::events::EventSink;
use crate::delivery::tracker::DeliveryUpdate;
use crate::pipeline::buffer::TweetBuffer;
use crate::pipeline::channel::{create_channel, Sender};
use std::sync::Arc;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use worker::{PublishWorker, WorkerSummary};

pub fn build_broker(config: &BrokerConfig) -> Result<Arc<dyn Broker>, BrokerError> {
    match config.broker_type {
        BrokerType::Stdout => Ok(Arc::new(StdoutBroker::new())),
        BrokerType::Kafka => {
            let kafka = config
                .kafka
                .as_ref()
                .ok_or_else(|| BrokerError::Fatal("broker.kafka section is required".to_string()))?;
            build_kafka(kafka)
        }
    }
}

#[cfg(feature = "kafka")]
fn build_kafka(config: &crate::config::types::KafkaConfig) -> Result<Arc<dyn Broker>, BrokerError> {
    Ok(Arc::new(kafka::KafkaBroker::new(config)?))
}

#[cfg(not(feature = "kafka"))]
fn build_kafka(
    _config: &crate::config::types::KafkaConfig,
) -> Result<Arc<dyn Broker>, BrokerError> {
    Err(BrokerError::Fatal(
        "broker type 'kafka' requires building with --features kafka".to_string(),
    ))
}

/// Dispatcher plus worker pool draining the buffer into a broker.
pub struct Publisher {
    config: PublisherConfig,
    broker: Arc<dyn Broker>,
    codec: Arc<dyn TweetCodec>,
    events: EventSink,
}

impl Publisher {
    pub fn new(config: PublisherConfig, broker: Arc<dyn Broker>, events: EventSink) -> Self {
        let codec: Arc<dyn TweetCodec> = Arc::from(build_codec(config.codec));
        Self {
            config,
            broker,
            codec,
            events,
        }
    }

    pub fn spawn(
        self,
        buffer: Arc<TweetBuffer>,
        updates: Sender<DeliveryUpdate>,
        cancel: CancellationToken,
    ) -> PublisherHandle {
        let worker_count = self.config.workers.max(1);
        let mut senders = Vec::with_capacity(worker_count);
        let mut workers = Vec::with_capacity(worker_count);

        for id in 0..worker_count {
            let (tx, rx) = create_channel(self.config.batch_size.saturating_mul(2));
            senders.push(tx);

            let worker = PublishWorker::new(
                id,
                &self.config,
                self.broker.clone(),
                self.codec.clone(),
                buffer.clone(),
                updates.clone(),
                self.events.clone(),
                cancel.clone(),
            );
            workers.push(Some(tokio::spawn(worker.run(rx))));
        }

        let dispatcher = tokio::spawn(worker::dispatch(
            buffer,
            senders,
            self.config.partition_key,
            cancel.clone(),
        ));

        tracing::info!(
            workers = worker_count,
            topic = %self.config.topic,
            broker = self.broker.name(),
            batch_size = self.config.batch_size,
            "Publisher started"
        );

        PublisherHandle {
            dispatcher: Some(dispatcher),
            workers,
            dispatched: 0,
            summaries: Vec::new(),
            cancel,
        }
    }
}

/// Handle to a running publisher.
///
/// [`PublisherHandle::wait`] is cancel-safe: if it is dropped part way (for
/// example by a timeout) it can be called again and resumes where it left off.
pub struct PublisherHandle {
    dispatcher: Option<JoinHandle<u64>>,
    workers: Vec<Option<JoinHandle<WorkerSummary>>>,
    dispatched: u64,
    summaries: Vec<WorkerSummary>,
    cancel: CancellationToken,
}

impl PublisherHandle {
    /// Stop dispatching and publishing; unacknowledged slots stay in the buffer
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the dispatcher and every worker to finish.
    pub async fn wait(&mut self) -> Result<(), JoinError> {
        if let Some(dispatcher) = self.dispatcher.as_mut() {
            let result = dispatcher.await;
            self.dispatcher = None;
            self.dispatched = result?;
        }

        for slot in self.workers.iter_mut() {
            if let Some(handle) = slot.as_mut() {
                let result = handle.await;
                *slot = None;
                self.summaries.push(result?);
            }
        }

        worker::log_pool_summary(self.dispatched, &self.summaries);
        Ok(())
    }
}
