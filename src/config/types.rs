use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub source: SourceConfig,
    #[serde(default)]
    pub buffer: BufferConfig,
    pub publisher: PublisherConfig,
    pub broker: BrokerConfig,
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(rename = "type")]
    pub source_type: SourceType,
    pub twitter: Option<TwitterSourceConfig>,
    pub mock: Option<MockSourceConfig>,
    pub file: Option<FileSourceConfig>,
    /// Overrides the cursor stored in the checkpoint
    #[serde(default)]
    pub resume_from: Option<String>,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "default_unavailable_cooldown", with = "humantime_serde")]
    pub unavailable_cooldown: Duration,
    #[serde(default = "default_dedup_window")]
    pub dedup_window: usize,
}

fn default_unavailable_cooldown() -> Duration {
    Duration::from_secs(30)
}

fn default_dedup_window() -> usize {
    10_000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Twitter,
    Mock,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwitterSourceConfig {
    pub bearer_token: String,
    pub query: String,
    #[serde(default = "default_twitter_base_url")]
    pub base_url: String,
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(default = "default_max_results")]
    pub max_results: u32,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_twitter_base_url() -> String {
    "https://api.twitter.com".to_string()
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(15)
}

fn default_max_results() -> u32 {
    100
}

fn default_max_pages() -> usize {
    10
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockSourceConfig {
    pub keywords: Vec<String>,
    #[serde(default = "default_mock_min_length")]
    pub min_length: usize,
    #[serde(default = "default_mock_max_length")]
    pub max_length: usize,
    #[serde(default = "default_mock_interval", with = "humantime_serde")]
    pub interval: Duration,
    #[serde(default = "default_mock_batch")]
    pub batch: usize,
    /// Stop after this many tweets; unbounded when absent
    #[serde(default)]
    pub limit: Option<u64>,
}

fn default_mock_min_length() -> usize {
    5
}

fn default_mock_max_length() -> usize {
    15
}

fn default_mock_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_mock_batch() -> usize {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSourceConfig {
    pub path: PathBuf,
    #[serde(default = "default_file_chunk")]
    pub chunk: usize,
}

fn default_file_chunk() -> usize {
    500
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff", with = "humantime_serde")]
    pub initial_backoff: Duration,
    #[serde(default = "default_max_backoff", with = "humantime_serde")]
    pub max_backoff: Duration,
    /// Fraction of each backoff randomised, 0.0..=1.0
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(500)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(60)
}

fn default_jitter() -> f64 {
    0.2
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
            jitter: default_jitter(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    #[serde(default = "default_buffer_capacity")]
    pub capacity: usize,
    #[serde(default = "default_backpressure_strategy")]
    pub strategy: BackpressureStrategy,
    /// How long the connector pauses after a full-buffer signal before retrying
    #[serde(default = "default_pause_interval", with = "humantime_serde")]
    pub pause_interval: Duration,
}

fn default_buffer_capacity() -> usize {
    10_000
}

fn default_backpressure_strategy() -> BackpressureStrategy {
    BackpressureStrategy::Block
}

fn default_pause_interval() -> Duration {
    Duration::from_millis(50)
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: default_buffer_capacity(),
            strategy: default_backpressure_strategy(),
            pause_interval: default_pause_interval(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackpressureStrategy {
    Block,
    Signal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherConfig {
    pub topic: String,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_linger", with = "humantime_serde")]
    pub linger: Duration,
    #[serde(default = "default_partition_key")]
    pub partition_key: PartitionKeyPolicy,
    #[serde(default = "default_codec")]
    pub codec: CodecKind,
    #[serde(default = "default_publish_retry")]
    pub retry: RetryConfig,
    #[serde(default = "default_abandon_policy")]
    pub on_abandon: AbandonPolicy,
}

fn default_workers() -> usize {
    4
}

fn default_batch_size() -> usize {
    500
}

fn default_linger() -> Duration {
    Duration::from_millis(100)
}

fn default_partition_key() -> PartitionKeyPolicy {
    PartitionKeyPolicy::Author
}

fn default_codec() -> CodecKind {
    CodecKind::Json
}

fn default_publish_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 5,
        initial_backoff: Duration::from_millis(100),
        max_backoff: Duration::from_secs(10),
        jitter: 0.2,
    }
}

fn default_abandon_policy() -> AbandonPolicy {
    AbandonPolicy::Hold
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionKeyPolicy {
    Author,
    TweetId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbandonPolicy {
    /// Abandoned records block the checkpoint until a restart re-ingests them
    Hold,
    /// Abandoned records go to the dead-letter table and stop blocking the checkpoint
    DeadLetter,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(rename = "type")]
    pub broker_type: BrokerType,
    pub kafka: Option<KafkaConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerType {
    Kafka,
    Stdout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    pub brokers: String,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default = "default_acks")]
    pub acks: String,
    #[serde(default = "default_compression")]
    pub compression: String,
    #[serde(default = "default_true")]
    pub enable_idempotence: bool,
    #[serde(default = "default_kafka_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
    #[serde(default = "default_kafka_message_timeout", with = "humantime_serde")]
    pub message_timeout: Duration,
    /// Extra librdkafka properties passed through verbatim
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

fn default_acks() -> String {
    "all".to_string()
}

fn default_compression() -> String {
    "snappy".to_string()
}

fn default_true() -> bool {
    true
}

fn default_kafka_request_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_kafka_message_timeout() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    pub path: PathBuf,
    #[serde(default = "default_persist_interval", with = "humantime_serde")]
    pub persist_interval: Duration,
}

fn default_persist_interval() -> Duration {
    Duration::from_secs(1)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    #[serde(default = "default_grace_period", with = "humantime_serde")]
    pub grace_period: Duration,
}

fn default_grace_period() -> Duration {
    Duration::from_secs(10)
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period: default_grace_period(),
        }
    }
}
