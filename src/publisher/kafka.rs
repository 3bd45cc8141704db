use super::broker::{Broker, BrokerError, ProducerRecord, RecordAck, IDEMPOTENCY_HEADER};
use crate::config::types::KafkaConfig;
use async_trait::async_trait;
use futures::future::join_all;
use rdkafka::config::ClientConfig;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::time::Duration;
use tracing::{debug, info};

/// Kafka broker over an rdkafka `FutureProducer`.
///
/// Configured for at-least-once delivery: `acks=all` and idempotent writes by
/// default, so librdkafka's own retries never duplicate within a session.
pub struct KafkaBroker {
    producer: FutureProducer,
    queue_timeout: Duration,
}

impl KafkaBroker {
    pub fn new(config: &KafkaConfig) -> Result<Self, BrokerError> {
        let client_id = config.client_id.clone().unwrap_or_else(|| {
            let host = hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "localhost".to_string());
            format!("twitter-to-kafka-{}", host)
        });

        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.brokers)
            .set("client.id", &client_id)
            .set("acks", &config.acks)
            .set(
                "enable.idempotence",
                if config.enable_idempotence { "true" } else { "false" },
            )
            .set("compression.type", &config.compression)
            .set("request.timeout.ms", config.request_timeout.as_millis().to_string())
            .set("message.timeout.ms", config.message_timeout.as_millis().to_string());

        for (key, value) in &config.properties {
            client_config.set(key, value);
        }

        let producer: FutureProducer = client_config
            .create()
            .map_err(|e| BrokerError::Fatal(format!("failed to create Kafka producer: {}", e)))?;

        info!(brokers = %config.brokers, client_id = %client_id, "Kafka producer initialized");

        Ok(Self {
            producer,
            queue_timeout: config.request_timeout,
        })
    }
}

fn classify(error: KafkaError) -> BrokerError {
    use RDKafkaErrorCode::*;

    let transient = matches!(
        error.rdkafka_error_code(),
        Some(
            QueueFull
                | MessageTimedOut
                | RequestTimedOut
                | NotLeaderForPartition
                | LeaderNotAvailable
                | NetworkException
                | BrokerNotAvailable
                | AllBrokersDown
                | BrokerTransportFailure
                | OperationTimedOut
                | NotEnoughReplicas
                | NotEnoughReplicasAfterAppend
        )
    );

    if transient {
        BrokerError::Transient(error.to_string())
    } else {
        BrokerError::Fatal(error.to_string())
    }
}

#[async_trait]
impl Broker for KafkaBroker {
    fn name(&self) -> &str {
        "kafka"
    }

    async fn send_batch(
        &self,
        topic: &str,
        records: &[ProducerRecord],
    ) -> Result<Vec<RecordAck>, BrokerError> {
        let sends = records.iter().map(|record| {
            let headers = OwnedHeaders::new()
                .insert(Header {
                    key: IDEMPOTENCY_HEADER,
                    value: Some(record.idempotency_key.as_bytes()),
                })
                .insert(Header {
                    key: "content-type",
                    value: Some(record.content_type.as_bytes()),
                });

            let future_record = FutureRecord::to(topic)
                .key(record.key.as_bytes())
                .payload(&record.payload)
                .headers(headers);

            async move {
                self.producer
                    .send(future_record, Timeout::After(self.queue_timeout))
                    .await
                    .map(|(partition, offset)| RecordAck {
                        sequence: record.sequence,
                        partition,
                        offset,
                    })
                    .map_err(|(error, _message)| error)
            }
        });

        let results = join_all(sends).await;

        let mut acks = Vec::with_capacity(records.len());
        let mut first_error = None;
        for result in results {
            match result {
                Ok(ack) => acks.push(ack),
                Err(error) => {
                    first_error.get_or_insert(error);
                }
            }
        }

        match first_error {
            Some(error) => Err(classify(error)),
            None => {
                debug!(topic, records = acks.len(), "Batch acknowledged");
                Ok(acks)
            }
        }
    }

    async fn flush(&self, timeout: Duration) -> Result<(), BrokerError> {
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
            .await
            .map_err(|e| BrokerError::Fatal(format!("flush task failed: {}", e)))?
            .map_err(classify)
    }
}
