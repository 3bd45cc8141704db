use super::checkpoint::Checkpoint;
use super::traits::{CheckpointStore, DeadLetter, StorageError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

/// Process-local store for tests and dry runs.
///
/// A single instance can be shared between two pipeline runs to simulate a
/// restart against the same durable state.
#[derive(Default)]
pub struct MemoryStore {
    checkpoint: Mutex<Option<Checkpoint>>,
    dead_letters: Mutex<Vec<DeadLetter>>,
    saves: AtomicU64,
    fail_saves: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful checkpoint saves
    pub fn saves(&self) -> u64 {
        self.saves.load(Ordering::Relaxed)
    }

    /// Make every subsequent save fail, as if the disk went away
    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::Relaxed);
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters
            .lock()
            .map(|letters| letters.clone())
            .unwrap_or_default()
    }
}

fn poisoned<T>(_: T) -> StorageError {
    StorageError::Database("memory store mutex poisoned".to_string())
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn init_schema(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn load_checkpoint(&self) -> Result<Option<Checkpoint>, StorageError> {
        Ok(self.checkpoint.lock().map_err(poisoned)?.clone())
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StorageError> {
        if self.fail_saves.load(Ordering::Relaxed) {
            return Err(StorageError::Database("injected save failure".to_string()));
        }
        *self.checkpoint.lock().map_err(poisoned)? = Some(checkpoint.clone());
        self.saves.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn clear_checkpoint(&self) -> Result<(), StorageError> {
        *self.checkpoint.lock().map_err(poisoned)? = None;
        Ok(())
    }

    async fn write_dead_letters(&self, letters: &[DeadLetter]) -> Result<(), StorageError> {
        self.dead_letters
            .lock()
            .map_err(poisoned)?
            .extend_from_slice(letters);
        Ok(())
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, StorageError> {
        let letters = self.dead_letters.lock().map_err(poisoned)?;
        Ok(letters.iter().rev().take(limit).cloned().collect())
    }
}
