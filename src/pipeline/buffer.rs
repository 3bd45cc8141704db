use crate::source::tweet::Tweet;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::Notify;

/// A tweet plus the sequence number it was given at enqueue time.
#[derive(Debug, Clone)]
pub struct BufferSlot {
    pub sequence: u64,
    pub tweet: Arc<Tweet>,
}

#[derive(Debug, Error)]
pub enum BufferError {
    /// Backpressure signal; the tweet is handed back untouched
    #[error("buffer is full")]
    Full(Tweet),

    #[error("buffer is closed")]
    Closed(Tweet),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferStats {
    pub capacity: usize,
    pub queued: usize,
    pub in_flight: usize,
    pub next_sequence: u64,
    /// Highest queued + in-flight count ever observed
    pub high_water: usize,
    pub closed: bool,
}

struct BufferState {
    queued: VecDeque<BufferSlot>,
    in_flight: BTreeMap<u64, BufferSlot>,
    next_sequence: u64,
    high_water: usize,
    closed: bool,
}

impl BufferState {
    fn occupied(&self) -> usize {
        self.queued.len() + self.in_flight.len()
    }
}

/// Bounded FIFO between the source connector and the publisher.
///
/// Capacity covers queued slots and slots handed to the publisher that the
/// broker has not acknowledged yet. A slot only leaves the buffer through
/// [`TweetBuffer::ack`] or [`TweetBuffer::release`], so nothing dequeued is
/// lost if a publish fails.
pub struct TweetBuffer {
    capacity: usize,
    state: Mutex<BufferState>,
    not_empty: Notify,
    not_full: Notify,
}

impl TweetBuffer {
    /// `first_sequence` is the sequence given to the first enqueued tweet.
    pub fn new(capacity: usize, first_sequence: u64) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(BufferState {
                queued: VecDeque::new(),
                in_flight: BTreeMap::new(),
                next_sequence: first_sequence,
                high_water: 0,
                closed: false,
            }),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue without waiting. Returns the assigned sequence number.
    pub fn try_push(&self, tweet: Tweet) -> Result<u64, BufferError> {
        let sequence = {
            let mut state = self.state();
            if state.closed {
                return Err(BufferError::Closed(tweet));
            }
            if state.occupied() >= self.capacity {
                return Err(BufferError::Full(tweet));
            }

            let sequence = state.next_sequence;
            state.next_sequence += 1;
            state.queued.push_back(BufferSlot {
                sequence,
                tweet: Arc::new(tweet),
            });
            state.high_water = state.high_water.max(state.occupied());
            sequence
        };

        self.not_empty.notify_waiters();
        Ok(sequence)
    }

    /// Enqueue, waiting for space while the buffer is full.
    ///
    /// Only fails once the buffer is closed.
    pub async fn push(&self, mut tweet: Tweet) -> Result<u64, BufferError> {
        loop {
            // Register before checking so an ack between the check and the
            // await still wakes us
            let notified = self.not_full.notified();
            match self.try_push(tweet) {
                Ok(sequence) => return Ok(sequence),
                Err(BufferError::Full(returned)) => tweet = returned,
                Err(closed) => return Err(closed),
            }
            notified.await;
        }
    }

    /// Wait until there is room for at least one more tweet, or the buffer closes.
    pub async fn wait_for_space(&self) {
        loop {
            let notified = self.not_full.notified();
            {
                let state = self.state();
                if state.closed || state.occupied() < self.capacity {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Take the oldest queued slot, waiting while the buffer is empty.
    ///
    /// The slot stays accounted as in-flight until retired. Returns `None`
    /// once the buffer is closed and no queued slot remains.
    pub async fn pop(&self) -> Option<BufferSlot> {
        loop {
            let notified = self.not_empty.notified();
            {
                let mut state = self.state();
                if let Some(slot) = state.queued.pop_front() {
                    state.in_flight.insert(slot.sequence, slot.clone());
                    return Some(slot);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Free the slots of records the broker acknowledged.
    pub fn ack(&self, sequences: &[u64]) -> usize {
        self.retire(sequences)
    }

    /// Free the slots of abandoned records. Their delivery state stays with
    /// the tracker.
    pub fn release(&self, sequences: &[u64]) -> usize {
        self.retire(sequences)
    }

    fn retire(&self, sequences: &[u64]) -> usize {
        let removed = {
            let mut state = self.state();
            sequences
                .iter()
                .filter(|&sequence| state.in_flight.remove(sequence).is_some())
                .count()
        };

        if removed > 0 {
            self.not_full.notify_waiters();
        }
        removed
    }

    /// Stop accepting tweets and wake every waiter.
    ///
    /// Queued slots can still be popped.
    pub fn close(&self) {
        self.state().closed = true;
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    /// Remove everything still held, queued and in-flight, in sequence order.
    pub fn drain_remaining(&self) -> Vec<BufferSlot> {
        let drained = {
            let mut state = self.state();
            let mut slots: Vec<BufferSlot> = std::mem::take(&mut state.in_flight)
                .into_values()
                .collect();
            slots.extend(state.queued.drain(..));
            slots.sort_by_key(|slot| slot.sequence);
            slots
        };

        self.not_full.notify_waiters();
        drained
    }

    pub fn len(&self) -> usize {
        self.state().occupied()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> BufferStats {
        let state = self.state();
        BufferStats {
            capacity: self.capacity,
            queued: state.queued.len(),
            in_flight: state.in_flight.len(),
            next_sequence: state.next_sequence,
            high_water: state.high_water,
            closed: state.closed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    fn make_tweet(id: u64) -> Tweet {
        let created_at = Utc.with_ymd_and_hms(2026, 1, 28, 10, 0, 0).unwrap();
        Tweet::new(id.to_string(), format!("tweet {}", id), "author", created_at, "{}")
    }

    #[test]
    fn test_sequences_are_monotonic_from_first_sequence() {
        let buffer = TweetBuffer::new(10, 41);
        assert_eq!(buffer.try_push(make_tweet(1)).unwrap(), 41);
        assert_eq!(buffer.try_push(make_tweet(2)).unwrap(), 42);
        assert_eq!(buffer.stats().next_sequence, 43);
    }

    #[test]
    fn test_try_push_signals_full_and_returns_tweet() {
        let buffer = TweetBuffer::new(2, 1);
        buffer.try_push(make_tweet(1)).unwrap();
        buffer.try_push(make_tweet(2)).unwrap();

        match buffer.try_push(make_tweet(3)) {
            Err(BufferError::Full(tweet)) => assert_eq!(tweet.id(), "3"),
            other => panic!("expected Full, got {:?}", other),
        }
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.stats().high_water, 2);
    }

    #[tokio::test]
    async fn test_pop_is_fifo_and_keeps_slot_in_flight() {
        let buffer = TweetBuffer::new(3, 1);
        for id in 1..=3 {
            buffer.try_push(make_tweet(id)).unwrap();
        }

        let first = buffer.pop().await.unwrap();
        let second = buffer.pop().await.unwrap();
        assert_eq!(first.tweet.id(), "1");
        assert_eq!(second.tweet.id(), "2");

        // Dequeued but unacknowledged slots still take capacity
        assert!(matches!(
            buffer.try_push(make_tweet(4)),
            Err(BufferError::Full(_))
        ));

        assert_eq!(buffer.ack(&[first.sequence]), 1);
        assert_eq!(buffer.try_push(make_tweet(4)).unwrap(), 4);

        let stats = buffer.stats();
        assert_eq!(stats.queued, 2);
        assert_eq!(stats.in_flight, 1);
    }

    #[tokio::test]
    async fn test_push_blocks_until_release() {
        let buffer = Arc::new(TweetBuffer::new(1, 1));
        buffer.try_push(make_tweet(1)).unwrap();
        let slot = buffer.pop().await.unwrap();

        let pusher = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.push(make_tweet(2)).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pusher.is_finished());

        buffer.release(&[slot.sequence]);
        let sequence = tokio::time::timeout(Duration::from_secs(1), pusher)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(sequence, 2);
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_push_and_pop() {
        let buffer = Arc::new(TweetBuffer::new(1, 1));
        buffer.try_push(make_tweet(1)).unwrap();

        let pusher = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.push(make_tweet(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        buffer.close();

        let result = pusher.await.unwrap();
        assert!(matches!(result, Err(BufferError::Closed(_))));

        // Queued slots drain after close, then pop reports the end
        assert_eq!(buffer.pop().await.unwrap().tweet.id(), "1");
        assert!(buffer.pop().await.is_none());
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let buffer = Arc::new(TweetBuffer::new(4, 1));
        let popper = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        buffer.try_push(make_tweet(9)).unwrap();

        let slot = tokio::time::timeout(Duration::from_secs(1), popper)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(slot.sequence, 1);
    }

    #[tokio::test]
    async fn test_drain_remaining_returns_everything_in_order() {
        let buffer = TweetBuffer::new(5, 10);
        for id in 1..=4 {
            buffer.try_push(make_tweet(id)).unwrap();
        }
        buffer.pop().await.unwrap();
        buffer.pop().await.unwrap();

        let drained = buffer.drain_remaining();
        let sequences: Vec<u64> = drained.iter().map(|slot| slot.sequence).collect();
        assert_eq!(sequences, vec![10, 11, 12, 13]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_ack_ignores_unknown_sequences() {
        let buffer = TweetBuffer::new(2, 1);
        buffer.try_push(make_tweet(1)).unwrap();
        // Still queued, not in flight
        assert_eq!(buffer.ack(&[1, 99]), 0);
        assert_eq!(buffer.len(), 1);
    }
}
