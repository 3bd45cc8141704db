use super::broker::{Broker, BrokerError, ProducerRecord, RecordAck};
use super::partition::route;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// A record as a downstream consumer would see it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub sequence: u64,
    pub key: String,
    pub idempotency_key: String,
    pub payload: Vec<u8>,
    pub partition: i32,
    pub offset: i64,
}

type FaultPredicate = Box<dyn Fn(&ProducerRecord) -> bool + Send + Sync>;

struct Fault {
    matches: FaultPredicate,
    /// Batches still to fail; `None` fails forever
    remaining: Option<u32>,
    error: BrokerError,
}

#[derive(Default)]
struct TopicLog {
    partitions: HashMap<i32, Vec<StoredRecord>>,
    seen_keys: HashSet<String>,
}

#[derive(Default)]
struct State {
    topics: HashMap<String, TopicLog>,
    deliveries: HashMap<String, u32>,
    faults: Vec<Fault>,
    batches: u64,
}

/// Partitioned in-process broker with idempotent consumers and fault injection.
///
/// Every accepted send counts as a delivery, but a record whose idempotency
/// key was already stored on the topic is not appended again, which is what a
/// deduplicating consumer would observe.
pub struct InMemoryBroker {
    partitions: usize,
    latency: Mutex<Duration>,
    state: Mutex<State>,
}

impl InMemoryBroker {
    pub fn new(partitions: usize) -> Self {
        Self {
            partitions: partitions.max(1),
            latency: Mutex::new(Duration::ZERO),
            state: Mutex::new(State::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Delay applied to every `send_batch`
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap_or_else(PoisonError::into_inner) = latency;
    }

    /// Fail the next `times` batches containing a matching record
    pub fn fail_matching<F>(&self, times: Option<u32>, error: BrokerError, matches: F)
    where
        F: Fn(&ProducerRecord) -> bool + Send + Sync + 'static,
    {
        self.state().faults.push(Fault {
            matches: Box::new(matches),
            remaining: times,
            error,
        });
    }

    pub fn clear_faults(&self) {
        self.state().faults.clear();
    }

    /// Deduplicated records of a topic, partition by partition, in offset order
    pub fn visible(&self, topic: &str) -> Vec<StoredRecord> {
        let state = self.state();
        let Some(log) = state.topics.get(topic) else {
            return Vec::new();
        };
        let mut partitions: Vec<_> = log.partitions.iter().collect();
        partitions.sort_by_key(|(partition, _)| **partition);
        partitions
            .into_iter()
            .flat_map(|(_, records)| records.iter().cloned())
            .collect()
    }

    /// How many times a record with this idempotency key was accepted
    pub fn deliveries(&self, idempotency_key: &str) -> u32 {
        self.state()
            .deliveries
            .get(idempotency_key)
            .copied()
            .unwrap_or(0)
    }

    /// Batches attempted, including failed ones
    pub fn batches(&self) -> u64 {
        self.state().batches
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    fn name(&self) -> &str {
        "memory"
    }

    async fn send_batch(
        &self,
        topic: &str,
        records: &[ProducerRecord],
    ) -> Result<Vec<RecordAck>, BrokerError> {
        let latency = *self.latency.lock().unwrap_or_else(PoisonError::into_inner);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state();
        state.batches += 1;

        for fault in state.faults.iter_mut() {
            if fault.remaining == Some(0) {
                continue;
            }
            if records.iter().any(|record| (fault.matches)(record)) {
                if let Some(remaining) = fault.remaining.as_mut() {
                    *remaining -= 1;
                }
                return Err(fault.error.clone());
            }
        }

        let State {
            topics, deliveries, ..
        } = &mut *state;
        let log = topics.entry(topic.to_string()).or_default();
        let mut acks = Vec::with_capacity(records.len());

        for record in records {
            *deliveries.entry(record.idempotency_key.clone()).or_insert(0) += 1;

            let partition = route(&record.key, self.partitions) as i32;
            let entries = log.partitions.entry(partition).or_default();

            let offset = if log.seen_keys.insert(record.idempotency_key.clone()) {
                let offset = entries.len() as i64;
                entries.push(StoredRecord {
                    sequence: record.sequence,
                    key: record.key.clone(),
                    idempotency_key: record.idempotency_key.clone(),
                    payload: record.payload.clone(),
                    partition,
                    offset,
                });
                offset
            } else {
                entries
                    .iter()
                    .find(|stored| stored.idempotency_key == record.idempotency_key)
                    .map(|stored| stored.offset)
                    .unwrap_or(-1)
            };

            acks.push(RecordAck {
                sequence: record.sequence,
                partition,
                offset,
            });
        }

        Ok(acks)
    }

    async fn flush(&self, _timeout: Duration) -> Result<(), BrokerError> {
        Ok(())
    }
}
