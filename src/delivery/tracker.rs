use super::attempt::{AttemptState, PublishAttempt};
use super::events::{EventSink, PipelineStats};
use crate::config::types::AbandonPolicy;
use crate::source::tweet::Tweet;
use crate::storage::{Checkpoint, CheckpointManager, CheckpointStore, DeadLetter};
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbandonReason {
    /// Transient failures outlasted the retry budget
    RetriesExhausted,
    /// The broker refused the record outright
    Rejected,
    /// The record could not be encoded
    Corrupt,
    /// Still in flight when the shutdown grace period ran out
    Shutdown,
}

impl AbandonReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AbandonReason::RetriesExhausted => "retries_exhausted",
            AbandonReason::Rejected => "rejected",
            AbandonReason::Corrupt => "corrupt",
            AbandonReason::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AbandonedRecord {
    pub sequence: u64,
    pub tweet: Arc<Tweet>,
    pub error: String,
}

/// Publish outcome reported by the publisher to the tracker.
#[derive(Debug, Clone)]
pub enum DeliveryUpdate {
    /// First send of a batch: `(sequence, tweet id)` pairs
    Pending { entries: Vec<(u64, String)> },
    Failed { sequences: Vec<u64>, error: String },
    Retrying { sequences: Vec<u64> },
    Acked { sequences: Vec<u64> },
    Abandoned {
        records: Vec<AbandonedRecord>,
        reason: AbandonReason,
    },
}

/// Contiguous-prefix bookkeeping behind the checkpoint.
///
/// The checkpoint only moves forward, one sequence at a time, across records
/// that are acked or dead-lettered. Any other record stops it, so a gap left
/// by an out-of-order ack or an abandoned record is never skipped.
pub struct DeliveryTracker {
    policy: AbandonPolicy,
    checkpoint: Checkpoint,
    attempts: BTreeMap<u64, PublishAttempt>,
    dead_letter_queue: Vec<DeadLetter>,
    dirty: bool,
    stats: Arc<PipelineStats>,
}

impl DeliveryTracker {
    pub fn new(checkpoint: Checkpoint, policy: AbandonPolicy, stats: Arc<PipelineStats>) -> Self {
        Self {
            policy,
            checkpoint,
            attempts: BTreeMap::new(),
            dead_letter_queue: Vec::new(),
            dirty: false,
            stats,
        }
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    /// Checkpoint moved since the last successful persist
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub fn attempt(&self, sequence: u64) -> Option<&PublishAttempt> {
        self.attempts.get(&sequence)
    }

    /// Sequences tracked but not yet behind the checkpoint
    pub fn unresolved(&self) -> Vec<u64> {
        self.attempts.keys().copied().collect()
    }

    pub fn apply(&mut self, update: DeliveryUpdate) {
        match update {
            DeliveryUpdate::Pending { entries } => {
                for (sequence, tweet_id) in entries {
                    if sequence <= self.checkpoint.sequence {
                        warn!(sequence, "Pending record already behind checkpoint");
                        continue;
                    }
                    self.attempts
                        .insert(sequence, PublishAttempt::pending(sequence, tweet_id));
                }
            }
            DeliveryUpdate::Failed { sequences, error } => {
                self.transition_all(&sequences, |attempt| attempt.fail(error.as_str()));
            }
            DeliveryUpdate::Retrying { sequences } => {
                self.transition_all(&sequences, PublishAttempt::retry);
            }
            DeliveryUpdate::Acked { sequences } => {
                self.transition_all(&sequences, PublishAttempt::ack);
                self.advance();
            }
            DeliveryUpdate::Abandoned { records, reason } => {
                self.abandon(records, reason);
                self.advance();
            }
        }
    }

    fn transition_all<F>(&mut self, sequences: &[u64], mut step: F)
    where
        F: FnMut(&mut PublishAttempt) -> Result<(), super::attempt::TransitionError>,
    {
        for sequence in sequences {
            match self.attempts.get_mut(sequence) {
                Some(attempt) => {
                    if let Err(e) = step(attempt) {
                        warn!(error = %e, "Ignoring delivery update");
                    }
                }
                None => debug!(sequence, "Update for untracked sequence"),
            }
        }
    }

    fn abandon(&mut self, records: Vec<AbandonedRecord>, reason: AbandonReason) {
        let dead_letter = match reason {
            AbandonReason::Corrupt => true,
            AbandonReason::Shutdown => false,
            AbandonReason::RetriesExhausted | AbandonReason::Rejected => {
                self.policy == AbandonPolicy::DeadLetter
            }
        };

        for record in records {
            if record.sequence <= self.checkpoint.sequence {
                continue;
            }

            let attempt = self
                .attempts
                .entry(record.sequence)
                .or_insert_with(|| PublishAttempt::pending(record.sequence, record.tweet.id()));

            if let Err(e) = attempt.abandon(record.error.as_str()) {
                warn!(error = %e, "Ignoring abandon");
                continue;
            }
            PipelineStats::incr(&self.stats.abandoned, 1);

            if dead_letter {
                self.dead_letter_queue.push(DeadLetter {
                    sequence: record.sequence,
                    tweet_id: record.tweet.id().to_string(),
                    author: record.tweet.author().to_string(),
                    payload: record.tweet.raw_payload().to_string(),
                    error: record.error,
                    reason: reason.as_str().to_string(),
                    abandoned_at: Utc::now(),
                });
            } else if reason != AbandonReason::Shutdown {
                warn!(
                    sequence = record.sequence,
                    tweet_id = record.tweet.id(),
                    "Abandoned record holds the checkpoint until restart"
                );
            }
        }
    }

    /// Dead letters waiting to be written
    pub fn take_dead_letters(&mut self) -> Vec<DeadLetter> {
        std::mem::take(&mut self.dead_letter_queue)
    }

    /// Put back dead letters whose write failed
    pub fn requeue_dead_letters(&mut self, letters: Vec<DeadLetter>) {
        let mut letters = letters;
        letters.append(&mut self.dead_letter_queue);
        self.dead_letter_queue = letters;
    }

    /// Dead letters are durable; the records no longer block the checkpoint
    pub fn confirm_dead_lettered(&mut self, sequences: &[u64]) {
        for sequence in sequences {
            if let Some(attempt) = self.attempts.get_mut(sequence) {
                attempt.mark_dead_lettered();
                PipelineStats::incr(&self.stats.dead_lettered, 1);
            }
        }
        self.advance();
    }

    /// Move the checkpoint across the resolved prefix. Returns true if it moved.
    pub fn advance(&mut self) -> bool {
        let start = self.checkpoint.sequence;
        loop {
            let next = self.checkpoint.sequence + 1;
            let resolved = match self.attempts.get(&next) {
                Some(attempt) => match attempt.state() {
                    AttemptState::Acked => true,
                    AttemptState::Abandoned => attempt.is_dead_lettered(),
                    AttemptState::Pending | AttemptState::Failed => false,
                },
                None => false,
            };
            if !resolved {
                break;
            }

            if let Some(attempt) = self.attempts.remove(&next) {
                self.checkpoint.sequence = next;
                self.checkpoint.cursor = Some(attempt.tweet_id);
            }
        }

        let moved = self.checkpoint.sequence > start;
        if moved {
            self.dirty = true;
        }
        moved
    }
}

/// Result of a tracker run, reported at shutdown.
#[derive(Debug, Clone)]
pub struct TrackerReport {
    /// Last checkpoint that was durably persisted
    pub checkpoint: Checkpoint,
    /// Sequences still ahead of the checkpoint
    pub unresolved: Vec<u64>,
    pub persist_error: Option<String>,
}

/// Task wrapper: consumes updates, persists and publishes the checkpoint.
pub struct TrackerTask {
    tracker: DeliveryTracker,
    manager: CheckpointManager,
    store: Arc<dyn CheckpointStore>,
    updates: mpsc::Receiver<DeliveryUpdate>,
    published: watch::Sender<Checkpoint>,
    persist_interval: Duration,
    events: EventSink,
    last_persisted: Checkpoint,
    persist_error: Option<String>,
}

impl TrackerTask {
    pub fn new(
        tracker: DeliveryTracker,
        manager: CheckpointManager,
        store: Arc<dyn CheckpointStore>,
        updates: mpsc::Receiver<DeliveryUpdate>,
        published: watch::Sender<Checkpoint>,
        persist_interval: Duration,
        events: EventSink,
    ) -> Self {
        let last_persisted = tracker.checkpoint().clone();
        Self {
            tracker,
            manager,
            store,
            updates,
            published,
            persist_interval,
            events,
            last_persisted,
            persist_error: None,
        }
    }

    /// Runs until every update sender is dropped, then persists one last time.
    pub async fn run(mut self) -> TrackerReport {
        let mut ticker = tokio::time::interval(self.persist_interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                update = self.updates.recv() => {
                    match update {
                        Some(update) => {
                            self.tracker.apply(update);
                            if self.manager.should_save() {
                                self.flush().await;
                            }
                        }
                        None => break,
                    }
                }
                _ = ticker.tick() => {
                    self.flush().await;
                }
            }
        }

        self.flush().await;

        let unresolved = self.tracker.unresolved();
        info!(
            sequence = self.last_persisted.sequence,
            cursor = self.last_persisted.cursor.as_deref().unwrap_or(""),
            unresolved = unresolved.len(),
            acked = self.events.stats().snapshot().acked,
            "Delivery tracker stopped"
        );

        TrackerReport {
            checkpoint: self.last_persisted,
            unresolved,
            persist_error: self.persist_error,
        }
    }

    async fn flush(&mut self) {
        let letters = self.tracker.take_dead_letters();
        if !letters.is_empty() {
            match self.store.write_dead_letters(&letters).await {
                Ok(()) => {
                    let sequences: Vec<u64> = letters.iter().map(|l| l.sequence).collect();
                    info!(records = sequences.len(), "Wrote dead letters");
                    self.tracker.confirm_dead_lettered(&sequences);
                }
                Err(e) => {
                    error!(
                        error = %e,
                        records = letters.len(),
                        "Failed to write dead letters, will retry"
                    );
                    self.tracker.requeue_dead_letters(letters);
                }
            }
        }

        if !self.tracker.is_dirty() {
            self.manager.reset_timer();
            return;
        }

        let mut checkpoint = self.tracker.checkpoint().clone();
        checkpoint.updated_at = Utc::now();

        match self.manager.save(&checkpoint).await {
            Ok(()) => {
                self.tracker.mark_clean();
                self.persist_error = None;
                debug!(sequence = checkpoint.sequence, "Checkpoint persisted");
                self.last_persisted = checkpoint.clone();
                self.published.send_replace(checkpoint);
            }
            Err(e) => {
                // Stays dirty; the next flush retries
                error!(error = %e, sequence = checkpoint.sequence, "Failed to persist checkpoint");
                self.manager.reset_timer();
                self.persist_error = Some(e.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn tweet(id: u64) -> Arc<Tweet> {
        let created_at = Utc.with_ymd_and_hms(2026, 1, 28, 10, 0, 0).unwrap();
        Arc::new(Tweet::new(id.to_string(), "t", "a", created_at, "{}"))
    }

    fn tracker(policy: AbandonPolicy) -> DeliveryTracker {
        DeliveryTracker::new(
            Checkpoint::initial(Uuid::new_v4()),
            policy,
            Arc::new(PipelineStats::default()),
        )
    }

    fn pending(range: std::ops::RangeInclusive<u64>) -> DeliveryUpdate {
        DeliveryUpdate::Pending {
            entries: range.map(|s| (s, format!("{}", 100 + s))).collect(),
        }
    }

    fn abandoned(sequences: &[u64], reason: AbandonReason) -> DeliveryUpdate {
        DeliveryUpdate::Abandoned {
            records: sequences
                .iter()
                .map(|&sequence| AbandonedRecord {
                    sequence,
                    tweet: tweet(100 + sequence),
                    error: "broker down".to_string(),
                })
                .collect(),
            reason,
        }
    }

    #[test]
    fn test_out_of_order_acks_never_skip_gap() {
        let mut tracker = tracker(AbandonPolicy::Hold);
        tracker.apply(pending(1..=5));

        tracker.apply(DeliveryUpdate::Acked {
            sequences: vec![2, 3, 5],
        });
        assert_eq!(tracker.checkpoint().sequence, 0);
        assert!(!tracker.is_dirty());

        tracker.apply(DeliveryUpdate::Acked { sequences: vec![1] });
        assert_eq!(tracker.checkpoint().sequence, 3);
        assert_eq!(tracker.checkpoint().cursor.as_deref(), Some("103"));
        assert!(tracker.is_dirty());

        tracker.apply(DeliveryUpdate::Acked { sequences: vec![4] });
        assert_eq!(tracker.checkpoint().sequence, 5);
        assert!(tracker.unresolved().is_empty());
    }

    #[test]
    fn test_unregistered_sequence_is_a_gap() {
        let mut tracker = tracker(AbandonPolicy::Hold);
        tracker.apply(pending(2..=3));
        tracker.apply(DeliveryUpdate::Acked {
            sequences: vec![2, 3],
        });
        // Sequence 1 was never handed to the broker
        assert_eq!(tracker.checkpoint().sequence, 0);
    }

    #[test]
    fn test_retry_then_ack_advances() {
        let mut tracker = tracker(AbandonPolicy::Hold);
        tracker.apply(pending(1..=2));
        tracker.apply(DeliveryUpdate::Failed {
            sequences: vec![1, 2],
            error: "timeout".to_string(),
        });
        tracker.apply(DeliveryUpdate::Retrying {
            sequences: vec![1, 2],
        });
        assert_eq!(tracker.attempt(1).unwrap().attempts(), 2);

        tracker.apply(DeliveryUpdate::Acked {
            sequences: vec![1, 2],
        });
        assert_eq!(tracker.checkpoint().sequence, 2);
    }

    #[test]
    fn test_hold_policy_blocks_checkpoint() {
        let mut tracker = tracker(AbandonPolicy::Hold);
        tracker.apply(pending(1..=3));
        tracker.apply(DeliveryUpdate::Acked { sequences: vec![1] });
        tracker.apply(abandoned(&[2], AbandonReason::RetriesExhausted));
        tracker.apply(DeliveryUpdate::Acked { sequences: vec![3] });

        assert_eq!(tracker.checkpoint().sequence, 1);
        assert!(tracker.take_dead_letters().is_empty());
        assert_eq!(tracker.unresolved(), vec![2, 3]);
    }

    #[test]
    fn test_dead_letter_policy_resolves_after_confirm() {
        let mut tracker = tracker(AbandonPolicy::DeadLetter);
        tracker.apply(pending(1..=3));
        tracker.apply(abandoned(&[1], AbandonReason::Rejected));
        tracker.apply(DeliveryUpdate::Acked {
            sequences: vec![2, 3],
        });
        assert_eq!(tracker.checkpoint().sequence, 0);

        let letters = tracker.take_dead_letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].tweet_id, "101");
        assert_eq!(letters[0].reason, "rejected");

        tracker.confirm_dead_lettered(&[1]);
        assert_eq!(tracker.checkpoint().sequence, 3);
    }

    #[test]
    fn test_shutdown_abandon_always_holds() {
        let mut tracker = tracker(AbandonPolicy::DeadLetter);
        // Never registered as pending: popped but not yet sent
        tracker.apply(abandoned(&[1, 2], AbandonReason::Shutdown));

        assert!(tracker.take_dead_letters().is_empty());
        assert_eq!(tracker.checkpoint().sequence, 0);
        assert_eq!(tracker.unresolved(), vec![1, 2]);
    }

    #[test]
    fn test_corrupt_records_are_dead_lettered_under_hold() {
        let mut tracker = tracker(AbandonPolicy::Hold);
        tracker.apply(abandoned(&[1], AbandonReason::Corrupt));
        let letters = tracker.take_dead_letters();
        assert_eq!(letters.len(), 1);
        tracker.confirm_dead_lettered(&[1]);
        assert_eq!(tracker.checkpoint().sequence, 1);
    }

    #[test]
    fn test_late_failure_after_ack_is_ignored() {
        let mut tracker = tracker(AbandonPolicy::Hold);
        tracker.apply(pending(1..=2));
        tracker.apply(DeliveryUpdate::Acked { sequences: vec![2] });
        tracker.apply(DeliveryUpdate::Failed {
            sequences: vec![2],
            error: "late".to_string(),
        });
        assert_eq!(tracker.attempt(2).unwrap().state(), AttemptState::Acked);
    }

    #[test]
    fn test_resumed_checkpoint_continues_sequence() {
        let mut checkpoint = Checkpoint::initial(Uuid::new_v4());
        checkpoint.sequence = 10;
        let mut tracker = DeliveryTracker::new(
            checkpoint,
            AbandonPolicy::Hold,
            Arc::new(PipelineStats::default()),
        );
        tracker.apply(pending(9..=11));
        tracker.apply(DeliveryUpdate::Acked {
            sequences: vec![9, 11],
        });
        assert_eq!(tracker.checkpoint().sequence, 11);
    }

    fn spawn_task(
        store: Arc<MemoryStore>,
        policy: AbandonPolicy,
        persist_interval: Duration,
    ) -> (
        mpsc::Sender<DeliveryUpdate>,
        watch::Receiver<Checkpoint>,
        tokio::task::JoinHandle<TrackerReport>,
    ) {
        let stats = Arc::new(PipelineStats::default());
        let initial = Checkpoint::initial(Uuid::new_v4());
        let (tx, rx) = mpsc::channel(64);
        let (published_tx, published_rx) = watch::channel(initial.clone());
        let store_dyn: Arc<dyn CheckpointStore> = store;
        let task = TrackerTask::new(
            DeliveryTracker::new(initial, policy, stats.clone()),
            CheckpointManager::new(store_dyn.clone(), persist_interval),
            store_dyn,
            rx,
            published_tx,
            persist_interval,
            EventSink::new(stats),
        );
        (tx, published_rx, tokio::spawn(task.run()))
    }

    #[tokio::test]
    async fn test_task_persists_before_publishing() {
        let store = Arc::new(MemoryStore::new());
        let (tx, mut published, handle) =
            spawn_task(store.clone(), AbandonPolicy::Hold, Duration::from_millis(10));

        tx.send(pending(1..=3)).await.unwrap();
        tx.send(DeliveryUpdate::Acked {
            sequences: vec![1, 2, 3],
        })
        .await
        .unwrap();

        tokio::time::timeout(Duration::from_secs(2), published.wait_for(|c| c.sequence == 3))
            .await
            .unwrap()
            .unwrap();

        let stored = store.load_checkpoint().await.unwrap().unwrap();
        assert_eq!(stored.sequence, 3);
        assert_eq!(stored.cursor.as_deref(), Some("103"));

        drop(tx);
        let report = handle.await.unwrap();
        assert_eq!(report.checkpoint.sequence, 3);
        assert!(report.unresolved.is_empty());
    }

    #[tokio::test]
    async fn test_task_persists_on_exit_even_with_long_interval() {
        let store = Arc::new(MemoryStore::new());
        let (tx, _published, handle) =
            spawn_task(store.clone(), AbandonPolicy::Hold, Duration::from_secs(3600));

        tx.send(pending(1..=2)).await.unwrap();
        tx.send(DeliveryUpdate::Acked { sequences: vec![1] })
            .await
            .unwrap();
        drop(tx);

        let report = handle.await.unwrap();
        assert_eq!(report.checkpoint.sequence, 1);
        assert_eq!(report.unresolved, vec![2]);
        assert_eq!(store.load_checkpoint().await.unwrap().unwrap().sequence, 1);
    }

    #[tokio::test]
    async fn test_task_failed_persist_is_not_published() {
        let store = Arc::new(MemoryStore::new());
        store.fail_saves(true);
        let (tx, published, handle) =
            spawn_task(store.clone(), AbandonPolicy::Hold, Duration::from_millis(10));

        tx.send(pending(1..=1)).await.unwrap();
        tx.send(DeliveryUpdate::Acked { sequences: vec![1] })
            .await
            .unwrap();
        drop(tx);

        let report = handle.await.unwrap();
        assert_eq!(report.checkpoint.sequence, 0);
        assert!(report.persist_error.is_some());
        assert_eq!(published.borrow().sequence, 0);
    }

    #[tokio::test]
    async fn test_task_writes_dead_letters() {
        let store = Arc::new(MemoryStore::new());
        let (tx, _published, handle) =
            spawn_task(store.clone(), AbandonPolicy::DeadLetter, Duration::from_millis(10));

        tx.send(pending(1..=2)).await.unwrap();
        tx.send(abandoned(&[1], AbandonReason::RetriesExhausted))
            .await
            .unwrap();
        tx.send(DeliveryUpdate::Acked { sequences: vec![2] })
            .await
            .unwrap();
        drop(tx);

        let report = handle.await.unwrap();
        assert_eq!(report.checkpoint.sequence, 2);
        assert_eq!(store.dead_letters().len(), 1);
        assert_eq!(store.dead_letters()[0].reason, "retries_exhausted");
    }
}
