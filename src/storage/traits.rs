use super::checkpoint::Checkpoint;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A record the publisher gave up on, kept for manual replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub sequence: u64,
    pub tweet_id: String,
    pub author: String,
    /// Raw source payload of the tweet
    pub payload: String,
    pub error: String,
    pub reason: String,
    pub abandoned_at: DateTime<Utc>,
}

/// Durable home of the delivery checkpoint and the dead-letter table.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn init_schema(&self) -> Result<(), StorageError>;

    async fn load_checkpoint(&self) -> Result<Option<Checkpoint>, StorageError>;

    /// Replace the stored checkpoint. Must be durable when this returns.
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StorageError>;

    async fn clear_checkpoint(&self) -> Result<(), StorageError>;

    async fn write_dead_letters(&self, letters: &[DeadLetter]) -> Result<(), StorageError>;

    /// Most recent dead letters first
    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, StorageError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<duckdb::Error> for StorageError {
    fn from(e: duckdb::Error) -> Self {
        StorageError::Database(e.to_string())
    }
}
