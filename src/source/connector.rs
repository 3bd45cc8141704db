use super::tweet::{is_at_or_before, PayloadError, Tweet};
use super::{Fetch, SourceError, TweetSource};
use crate::config::types::{RetryConfig, SourceConfig};
use crate::delivery::events::{EventSink, PipelineEvent, PipelineStats};
use crate::pipeline::backpressure::{BackpressureHandler, Enqueued};
use crate::pipeline::buffer::TweetBuffer;
use crate::retry::Backoff;
use crate::storage::Checkpoint;
use std::collections::{HashSet, VecDeque};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Bounded memory of recently admitted tweet ids.
struct RecentIds {
    capacity: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    /// Returns false if the id was already present
    fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.seen.insert(id.to_string());
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectorSummary {
    pub enqueued: u64,
    /// Last cursor handed to the buffer
    pub cursor: Option<String>,
    /// The source reported it had nothing more to give
    pub exhausted: bool,
}

/// Drives a [`TweetSource`] into the buffer.
///
/// Filters out ids at or before the durable checkpoint cursor and ids it has
/// already admitted, retries transient failures with backoff, and turns a
/// persistent failure into a `SourceUnavailable` event plus a cooldown.
pub struct SourceConnector {
    source: Box<dyn TweetSource>,
    cursor: Option<String>,
    checkpoint: watch::Receiver<Checkpoint>,
    recent: RecentIds,
    retry: RetryConfig,
    cooldown: Duration,
    events: EventSink,
}

impl SourceConnector {
    /// `resume_from` is where polling starts: the config override if set,
    /// otherwise the checkpoint cursor.
    pub fn new(
        source: Box<dyn TweetSource>,
        config: &SourceConfig,
        resume_from: Option<String>,
        checkpoint: watch::Receiver<Checkpoint>,
        events: EventSink,
    ) -> Self {
        Self {
            source,
            cursor: resume_from,
            checkpoint,
            recent: RecentIds::new(config.dedup_window),
            retry: config.retry.clone(),
            cooldown: config.unavailable_cooldown,
            events,
        }
    }

    /// One fetch with local retries. Transient errors back off; anything else,
    /// or a spent retry budget, becomes `SourceError::Unavailable`.
    pub async fn poll(&mut self, shutdown: &CancellationToken) -> Result<Fetch, SourceError> {
        let mut backoff = Backoff::new(&self.retry);

        loop {
            let error = match self.source.fetch(self.cursor.as_deref()).await {
                Ok(fetch) => return Ok(fetch),
                Err(e) => e,
            };

            let delay = if error.is_transient() {
                backoff.next_delay()
            } else {
                None
            };

            let Some(delay) = delay else {
                return Err(SourceError::Unavailable {
                    attempts: backoff.attempts().max(1),
                    last_error: error.to_string(),
                });
            };

            warn!(
                source = self.source.name(),
                attempt = backoff.attempts(),
                max_attempts = backoff.max_attempts(),
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Source fetch failed, retrying"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => {
                    return Err(SourceError::Unavailable {
                        attempts: backoff.attempts(),
                        last_error: error.to_string(),
                    });
                }
            }
        }
    }

    /// Filter a fetched batch down to tweets that should be buffered.
    pub fn admit(&mut self, items: Vec<Result<Tweet, PayloadError>>) -> Vec<Tweet> {
        let durable_cursor = self.checkpoint.borrow().cursor.clone();
        let stats = self.events.stats().clone();
        let mut admitted = Vec::with_capacity(items.len());

        for item in items {
            let tweet = match item {
                Ok(tweet) => tweet,
                Err(e) => {
                    self.events.emit(PipelineEvent::CorruptPayload {
                        origin: self.source.name().to_string(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            if let Some(cursor) = durable_cursor.as_deref() {
                if is_at_or_before(tweet.id(), cursor) {
                    PipelineStats::incr(&stats.already_delivered_skipped, 1);
                    debug!(tweet_id = tweet.id(), cursor, "Skipping already delivered tweet");
                    continue;
                }
            }

            if !self.recent.insert(tweet.id()) {
                PipelineStats::incr(&stats.duplicates_skipped, 1);
                debug!(tweet_id = tweet.id(), "Skipping duplicate tweet");
                continue;
            }

            admitted.push(tweet);
        }

        admitted
    }

    /// Poll until the source is exhausted or shutdown is requested.
    pub async fn run(
        mut self,
        buffer: &TweetBuffer,
        backpressure: &BackpressureHandler,
        shutdown: CancellationToken,
    ) -> ConnectorSummary {
        let mut summary = ConnectorSummary::default();
        info!(
            source = self.source.name(),
            cursor = self.cursor.as_deref().unwrap_or(""),
            "Source connector started"
        );

        'poll: while !shutdown.is_cancelled() {
            let fetch = tokio::select! {
                fetch = self.poll(&shutdown) => fetch,
                _ = shutdown.cancelled() => break,
            };

            let items = match fetch {
                Ok(Fetch::Items(items)) => items,
                Ok(Fetch::Exhausted) => {
                    summary.exhausted = true;
                    break;
                }
                Err(e) => {
                    if shutdown.is_cancelled() {
                        break;
                    }
                    let (attempts, error) = match e {
                        SourceError::Unavailable {
                            attempts,
                            last_error,
                        } => (attempts, last_error),
                        other => (1, other.to_string()),
                    };
                    self.events.emit(PipelineEvent::SourceUnavailable {
                        source: self.source.name().to_string(),
                        attempts,
                        error,
                    });
                    tokio::select! {
                        _ = tokio::time::sleep(self.cooldown) => {}
                        _ = shutdown.cancelled() => break,
                    }
                    continue;
                }
            };

            let fetched = items.len();
            let admitted = self.admit(items);

            for tweet in admitted {
                let tweet_id = tweet.id().to_string();
                match backpressure.enqueue(buffer, tweet, &self.events, &shutdown).await {
                    Enqueued::Accepted(sequence) => {
                        debug!(sequence, tweet_id = %tweet_id, "Buffered tweet");
                        PipelineStats::incr(&self.events.stats().ingested, 1);
                        summary.enqueued += 1;
                        self.cursor = Some(tweet_id);
                    }
                    // The rest of this batch was never buffered; a restart
                    // re-fetches it from the checkpoint
                    Enqueued::Stopped => break 'poll,
                }
            }

            if fetched == 0 {
                tokio::select! {
                    _ = tokio::time::sleep(self.source.idle_interval()) => {}
                    _ = shutdown.cancelled() => break,
                }
            }
        }

        summary.cursor = self.cursor.clone();
        info!(
            source = self.source.name(),
            enqueued = summary.enqueued,
            exhausted = summary.exhausted,
            cursor = summary.cursor.as_deref().unwrap_or(""),
            "Source connector stopped"
        );
        summary
    }
}
