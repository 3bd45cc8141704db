use super::broker::{Broker, BrokerError, ProducerRecord, RecordAck};
use async_trait::async_trait;
use std::io::Write;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Writes each record value as one line on stdout. For dry runs.
#[derive(Debug, Default)]
pub struct StdoutBroker {
    next_offset: AtomicI64,
}

impl StdoutBroker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Broker for StdoutBroker {
    fn name(&self) -> &str {
        "stdout"
    }

    async fn send_batch(
        &self,
        _topic: &str,
        records: &[ProducerRecord],
    ) -> Result<Vec<RecordAck>, BrokerError> {
        let mut out = std::io::stdout().lock();
        let mut acks = Vec::with_capacity(records.len());

        for record in records {
            out.write_all(&record.payload)
                .and_then(|_| out.write_all(b"\n"))
                .map_err(|e| BrokerError::Transient(format!("stdout write failed: {}", e)))?;
            acks.push(RecordAck {
                sequence: record.sequence,
                partition: 0,
                offset: self.next_offset.fetch_add(1, Ordering::Relaxed),
            });
        }

        out.flush()
            .map_err(|e| BrokerError::Transient(format!("stdout flush failed: {}", e)))?;
        Ok(acks)
    }

    async fn flush(&self, _timeout: Duration) -> Result<(), BrokerError> {
        std::io::stdout()
            .flush()
            .map_err(|e| BrokerError::Transient(e.to_string()))
    }
}
