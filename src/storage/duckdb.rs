use super::checkpoint::Checkpoint;
use super::traits::{CheckpointStore, DeadLetter, StorageError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use duckdb::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Check if a process with the given PID is still running
fn is_process_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use std::process::Command;
        Command::new("ps")
            .arg("-p")
            .arg(pid.to_string())
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        // Assume the holder is alive when we cannot check
        let _ = pid;
        true
    }
}

/// Extract PID from DuckDB lock error message: "... (PID 12345) ..."
fn extract_pid_from_lock_error(error_msg: &str) -> Option<u32> {
    let start = error_msg.find("(PID ")? + 5;
    let end = error_msg[start..].find(')')?;
    error_msg[start..start + end].parse().ok()
}

/// Remove the lock artifact left by a dead process. The WAL stays: DuckDB
/// replays it on open, and it may hold committed dead letters.
fn remove_stale_lock(db_path: &Path) -> std::io::Result<()> {
    let stale = PathBuf::from(format!("{}.lock", db_path.display()));
    if stale.exists() {
        std::fs::remove_file(&stale)?;
        tracing::info!("Removed stale lock file: {}", stale.display());
    }
    Ok(())
}

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>, StorageError> {
    conn.lock()
        .map_err(|_| StorageError::Database("connection mutex poisoned".to_string()))
}

fn join_error(e: tokio::task::JoinError) -> StorageError {
    StorageError::Database(format!("Task join error: {}", e))
}

fn timestamp_from_micros(index: usize, micros: i64) -> Result<DateTime<Utc>, duckdb::Error> {
    DateTime::from_timestamp_micros(micros).ok_or_else(|| {
        duckdb::Error::FromSqlConversionFailure(
            index,
            duckdb::types::Type::BigInt,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "invalid timestamp",
            )),
        )
    })
}

/// Checkpoint store backed by a single DuckDB file.
pub struct DuckDbStore {
    conn: Arc<Mutex<Connection>>,
}

impl DuckDbStore {
    /// Open (or create) the database at `path`.
    ///
    /// A lock left behind by a dead process is cleared and the open retried
    /// once. A lock held by a live process is an error: two instances must
    /// never share one checkpoint.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        match Connection::open(path) {
            Ok(conn) => Ok(Self {
                conn: Arc::new(Mutex::new(conn)),
            }),
            Err(e) => {
                let error_msg = e.to_string();

                if error_msg.contains("Could not set lock") {
                    tracing::warn!("Database lock detected: {}", error_msg);

                    if let Some(pid) = extract_pid_from_lock_error(&error_msg) {
                        if !is_process_running(pid) {
                            tracing::warn!(
                                "Process {} is not running, removing stale lock file",
                                pid
                            );
                            remove_stale_lock(path)?;

                            let conn = Connection::open(path)?;
                            return Ok(Self {
                                conn: Arc::new(Mutex::new(conn)),
                            });
                        }
                        tracing::error!(
                            "Process {} is still running, another instance owns this checkpoint",
                            pid
                        );
                    }
                }

                Err(e.into())
            }
        }
    }

    /// In-memory database (for tests)
    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

#[async_trait]
impl CheckpointStore for DuckDbStore {
    async fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;

            conn.execute(
                "CREATE TABLE IF NOT EXISTS checkpoints (
                    id INTEGER PRIMARY KEY DEFAULT 1,
                    checkpoint_data TEXT NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL,
                    CHECK (id = 1)
                )",
                [],
            )?;

            conn.execute(
                "CREATE TABLE IF NOT EXISTS dead_letters (
                    sequence UBIGINT NOT NULL,
                    tweet_id VARCHAR NOT NULL,
                    author VARCHAR NOT NULL,
                    payload VARCHAR NOT NULL,
                    error VARCHAR NOT NULL,
                    reason VARCHAR NOT NULL,
                    abandoned_at TIMESTAMPTZ NOT NULL
                )",
                [],
            )?;

            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_dead_letters_tweet ON dead_letters(tweet_id)",
                [],
            )?;

            Ok::<(), StorageError>(())
        })
        .await
        .map_err(join_error)?
    }

    async fn load_checkpoint(&self) -> Result<Option<Checkpoint>, StorageError> {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || -> Result<Option<Checkpoint>, StorageError> {
            let conn = lock(&conn)?;
            let mut stmt = conn.prepare("SELECT checkpoint_data FROM checkpoints WHERE id = 1")?;
            let mut rows = stmt.query([])?;

            if let Some(row) = rows.next()? {
                let checkpoint_json: String = row.get(0)?;
                let checkpoint: Checkpoint =
                    serde_json::from_str(&checkpoint_json).map_err(|e| {
                        StorageError::Checkpoint(format!("Failed to deserialize checkpoint: {}", e))
                    })?;
                Ok(Some(checkpoint))
            } else {
                Ok(None)
            }
        })
        .await
        .map_err(join_error)?
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StorageError> {
        let conn = self.conn.clone();
        let checkpoint_json = serde_json::to_string(checkpoint)
            .map_err(|e| StorageError::Checkpoint(format!("Failed to serialize checkpoint: {}", e)))?;

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            conn.execute(
                "INSERT OR REPLACE INTO checkpoints (id, checkpoint_data, created_at)
                 VALUES (1, ?, to_timestamp(? / 1000000.0))",
                duckdb::params![checkpoint_json, Utc::now().timestamp_micros()],
            )?;
            // Flush the WAL so an acknowledged save survives a crash
            conn.execute_batch("CHECKPOINT")?;

            Ok::<(), StorageError>(())
        })
        .await
        .map_err(join_error)?
    }

    async fn clear_checkpoint(&self) -> Result<(), StorageError> {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            conn.execute("DELETE FROM checkpoints", [])?;
            conn.execute_batch("CHECKPOINT")?;
            Ok::<(), StorageError>(())
        })
        .await
        .map_err(join_error)?
    }

    async fn write_dead_letters(&self, letters: &[DeadLetter]) -> Result<(), StorageError> {
        if letters.is_empty() {
            return Ok(());
        }

        let conn = self.conn.clone();
        let letters = letters.to_vec();

        tokio::task::spawn_blocking(move || {
            let mut conn = lock(&conn)?;
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO dead_letters (sequence, tweet_id, author, payload, error, reason, abandoned_at)
                     VALUES (?, ?, ?, ?, ?, ?, to_timestamp(? / 1000000.0))",
                )?;

                for letter in &letters {
                    stmt.execute(duckdb::params![
                        letter.sequence,
                        letter.tweet_id,
                        letter.author,
                        letter.payload,
                        letter.error,
                        letter.reason,
                        letter.abandoned_at.timestamp_micros(),
                    ])?;
                }
            }
            tx.commit()?;

            Ok::<(), StorageError>(())
        })
        .await
        .map_err(join_error)?
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, StorageError> {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            let mut stmt = conn.prepare(
                "SELECT sequence, tweet_id, author, payload, error, reason, epoch_us(abandoned_at)
                 FROM dead_letters
                 ORDER BY abandoned_at DESC, sequence DESC
                 LIMIT ?",
            )?;

            let mut rows = stmt.query(duckdb::params![limit as i64])?;
            let mut letters = Vec::new();

            while let Some(row) = rows.next()? {
                letters.push(DeadLetter {
                    sequence: row.get(0)?,
                    tweet_id: row.get(1)?,
                    author: row.get(2)?,
                    payload: row.get(3)?,
                    error: row.get(4)?,
                    reason: row.get(5)?,
                    abandoned_at: timestamp_from_micros(6, row.get::<_, i64>(6)?)?,
                });
            }

            Ok::<Vec<DeadLetter>, StorageError>(letters)
        })
        .await
        .map_err(join_error)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::checkpoint::CURRENT_VERSION;
    use chrono::Duration;
    use uuid::Uuid;

    async fn setup_store() -> DuckDbStore {
        let store = DuckDbStore::in_memory().unwrap();
        store.init_schema().await.unwrap();
        store
    }

    fn dead_letter(sequence: u64, abandoned_at: DateTime<Utc>) -> DeadLetter {
        DeadLetter {
            sequence,
            tweet_id: format!("{}", 1000 + sequence),
            author: "ferris".to_string(),
            payload: r#"{"id":"x"}"#.to_string(),
            error: "broker rejected record".to_string(),
            reason: "rejected".to_string(),
            abandoned_at,
        }
    }

    #[tokio::test]
    async fn test_schema_initialization_is_idempotent() {
        let store = DuckDbStore::in_memory().unwrap();
        assert!(store.init_schema().await.is_ok());
        assert!(store.init_schema().await.is_ok());
    }

    #[tokio::test]
    async fn test_checkpoint_replace_and_clear() {
        let store = setup_store().await;
        assert!(store.load_checkpoint().await.unwrap().is_none());

        let mut checkpoint = Checkpoint::initial(Uuid::new_v4());
        checkpoint.sequence = 3;
        checkpoint.cursor = Some("1003".to_string());
        store.save_checkpoint(&checkpoint).await.unwrap();

        checkpoint.sequence = 8;
        checkpoint.cursor = Some("1008".to_string());
        store.save_checkpoint(&checkpoint).await.unwrap();

        let loaded = store.load_checkpoint().await.unwrap().unwrap();
        assert_eq!(loaded.version, CURRENT_VERSION);
        assert_eq!(loaded.sequence, 8);
        assert_eq!(loaded.cursor.as_deref(), Some("1008"));

        store.clear_checkpoint().await.unwrap();
        assert!(store.load_checkpoint().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_checkpoint_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.duckdb");

        {
            let store = DuckDbStore::new(&path).unwrap();
            store.init_schema().await.unwrap();
            let mut checkpoint = Checkpoint::initial(Uuid::new_v4());
            checkpoint.sequence = 42;
            store.save_checkpoint(&checkpoint).await.unwrap();
        }

        let store = DuckDbStore::new(&path).unwrap();
        store.init_schema().await.unwrap();
        let loaded = store.load_checkpoint().await.unwrap().unwrap();
        assert_eq!(loaded.sequence, 42);
    }

    #[tokio::test]
    async fn test_dead_letters_newest_first() {
        let store = setup_store().await;
        let now = Utc::now();

        store
            .write_dead_letters(&[
                dead_letter(1, now - Duration::seconds(20)),
                dead_letter(2, now - Duration::seconds(10)),
                dead_letter(3, now),
            ])
            .await
            .unwrap();

        let letters = store.list_dead_letters(2).await.unwrap();
        assert_eq!(letters.len(), 2);
        assert_eq!(letters[0].sequence, 3);
        assert_eq!(letters[1].sequence, 2);
        assert_eq!(letters[0].tweet_id, "1003");
        assert_eq!(letters[0].reason, "rejected");
    }

    #[tokio::test]
    async fn test_write_no_dead_letters() {
        let store = setup_store().await;
        store.write_dead_letters(&[]).await.unwrap();
        assert!(store.list_dead_letters(10).await.unwrap().is_empty());
    }

    #[test]
    fn test_extract_pid_from_lock_error() {
        let error_msg = "IO Error: Could not set lock on file \"/path/to/db.duckdb\": Conflicting lock is held in /path/to/binary (deleted) (PID 12345). See also https://duckdb.org/docs/stable/connect/concurrency";
        assert_eq!(extract_pid_from_lock_error(error_msg), Some(12345));
        assert_eq!(extract_pid_from_lock_error("Some other error"), None);
        assert_eq!(extract_pid_from_lock_error("Error (PID abc)"), None);
    }

    #[test]
    fn test_stale_lock_removal_keeps_wal() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let db_path = temp_dir.path().join("state.duckdb");
        let wal = temp_dir.path().join("state.duckdb.wal");
        let lock_file = temp_dir.path().join("state.duckdb.lock");
        std::fs::write(&wal, b"wal").unwrap();
        std::fs::write(&lock_file, b"").unwrap();

        remove_stale_lock(&db_path).unwrap();

        assert!(wal.exists());
        assert!(!lock_file.exists());
        // Nothing to remove is fine
        remove_stale_lock(&db_path).unwrap();
    }

    #[test]
    #[cfg(unix)]
    fn test_is_process_running() {
        assert!(is_process_running(std::process::id()));
        assert!(!is_process_running(999999));
    }
}
