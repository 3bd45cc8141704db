use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Record header carrying the tweet id for downstream dedup
pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerRecord {
    pub sequence: u64,
    pub key: String,
    pub idempotency_key: String,
    pub payload: Vec<u8>,
    pub content_type: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordAck {
    pub sequence: u64,
    pub partition: i32,
    pub offset: i64,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    /// Worth retrying: timeouts, leader changes, full queues
    #[error("transient broker error: {0}")]
    Transient(String),

    /// Retrying cannot help: oversized record, authorization, unknown topic
    #[error("fatal broker error: {0}")]
    Fatal(String),
}

impl BrokerError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, BrokerError::Transient(_))
    }
}

/// Destination of published records.
///
/// `send_batch` succeeds only when every record in the batch is acknowledged;
/// on error the whole batch is retried, and the idempotency key lets
/// consumers discard the records that did get through.
#[async_trait]
pub trait Broker: Send + Sync {
    fn name(&self) -> &str;

    async fn send_batch(
        &self,
        topic: &str,
        records: &[ProducerRecord],
    ) -> Result<Vec<RecordAck>, BrokerError>;

    /// Wait for buffered records to leave the client
    async fn flush(&self, timeout: Duration) -> Result<(), BrokerError>;
}
