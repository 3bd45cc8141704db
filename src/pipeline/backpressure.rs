use super::buffer::{BufferError, TweetBuffer};
use crate::config::types::{BackpressureStrategy, BufferConfig};
use crate::delivery::events::{EventSink, PipelineEvent};
use crate::source::tweet::Tweet;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Applies the configured full-buffer behaviour on the connector side.
///
/// `block` waits inside the buffer for free space. `signal` gets the tweet
/// back, raises a `BufferFull` event once per full episode and pauses before
/// retrying. Neither strategy drops a tweet.
pub struct BackpressureHandler {
    strategy: BackpressureStrategy,
    pause_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Accepted(u64),
    /// Buffer closed or shutdown requested before the tweet got in
    Stopped,
}

impl BackpressureHandler {
    pub fn new(strategy: BackpressureStrategy, pause_interval: Duration) -> Self {
        Self {
            strategy,
            pause_interval,
        }
    }

    pub fn from_config(config: &BufferConfig) -> Self {
        Self::new(config.strategy, config.pause_interval)
    }

    pub async fn enqueue(
        &self,
        buffer: &TweetBuffer,
        tweet: Tweet,
        events: &EventSink,
        shutdown: &CancellationToken,
    ) -> Enqueued {
        match self.strategy {
            BackpressureStrategy::Block => {
                tokio::select! {
                    result = buffer.push(tweet) => match result {
                        Ok(sequence) => Enqueued::Accepted(sequence),
                        Err(_) => Enqueued::Stopped,
                    },
                    _ = shutdown.cancelled() => Enqueued::Stopped,
                }
            }
            BackpressureStrategy::Signal => {
                self.enqueue_signalling(buffer, tweet, events, shutdown)
                    .await
            }
        }
    }

    async fn enqueue_signalling(
        &self,
        buffer: &TweetBuffer,
        mut tweet: Tweet,
        events: &EventSink,
        shutdown: &CancellationToken,
    ) -> Enqueued {
        let mut signalled = false;

        loop {
            match buffer.try_push(tweet) {
                Ok(sequence) => return Enqueued::Accepted(sequence),
                Err(BufferError::Closed(_)) => return Enqueued::Stopped,
                Err(BufferError::Full(returned)) => {
                    tweet = returned;
                    if !signalled {
                        let stats = buffer.stats();
                        events.emit(PipelineEvent::BufferFull {
                            capacity: stats.capacity,
                            queued: stats.queued,
                            in_flight: stats.in_flight,
                        });
                        signalled = true;
                    }
                }
            }

            tokio::select! {
                _ = buffer.wait_for_space() => {}
                _ = tokio::time::sleep(self.pause_interval) => {}
                _ = shutdown.cancelled() => return Enqueued::Stopped,
            }
        }
    }
}
