use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    /// Handed to the broker, no answer yet
    Pending,
    Acked,
    /// Last send failed, a retry may follow
    Failed,
    /// Given up; no further retries in this process
    Abandoned,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("sequence {sequence}: invalid transition {from:?} -> {to:?}")]
pub struct TransitionError {
    pub sequence: u64,
    pub from: AttemptState,
    pub to: AttemptState,
}

/// Delivery state of one buffered tweet.
#[derive(Debug, Clone, Serialize)]
pub struct PublishAttempt {
    pub sequence: u64,
    pub tweet_id: String,
    state: AttemptState,
    attempts: u32,
    last_error: Option<String>,
    dead_lettered: bool,
}

impl PublishAttempt {
    /// A record that has just been sent for the first time.
    pub fn pending(sequence: u64, tweet_id: impl Into<String>) -> Self {
        Self {
            sequence,
            tweet_id: tweet_id.into(),
            state: AttemptState::Pending,
            attempts: 1,
            last_error: None,
            dead_lettered: false,
        }
    }

    pub fn state(&self) -> AttemptState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn is_dead_lettered(&self) -> bool {
        self.dead_lettered
    }

    pub fn mark_dead_lettered(&mut self) {
        self.dead_lettered = true;
    }

    fn transition(&mut self, to: AttemptState) -> Result<(), TransitionError> {
        use AttemptState::*;

        let allowed = matches!(
            (self.state, to),
            (Pending, Acked)
                | (Pending, Failed)
                | (Failed, Pending)
                | (Failed, Abandoned)
                | (Pending, Abandoned)
        );
        if !allowed {
            return Err(TransitionError {
                sequence: self.sequence,
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    pub fn ack(&mut self) -> Result<(), TransitionError> {
        self.transition(AttemptState::Acked)
    }

    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), TransitionError> {
        self.transition(AttemptState::Failed)?;
        self.last_error = Some(error.into());
        Ok(())
    }

    /// Failed record sent again
    pub fn retry(&mut self) -> Result<(), TransitionError> {
        self.transition(AttemptState::Pending)?;
        self.attempts += 1;
        Ok(())
    }

    pub fn abandon(&mut self, error: impl Into<String>) -> Result<(), TransitionError> {
        self.transition(AttemptState::Abandoned)?;
        self.last_error = Some(error.into());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_cycle_then_ack() {
        let mut attempt = PublishAttempt::pending(1, "100");
        attempt.fail("timeout").unwrap();
        attempt.retry().unwrap();
        attempt.fail("timeout").unwrap();
        attempt.retry().unwrap();
        attempt.ack().unwrap();

        assert_eq!(attempt.state(), AttemptState::Acked);
        assert_eq!(attempt.attempts(), 3);
        assert_eq!(attempt.last_error(), Some("timeout"));
    }

    #[test]
    fn test_acked_is_terminal() {
        let mut attempt = PublishAttempt::pending(7, "107");
        attempt.ack().unwrap();

        let err = attempt.fail("late failure").unwrap_err();
        assert_eq!(err.from, AttemptState::Acked);
        assert_eq!(err.to, AttemptState::Failed);
        assert!(attempt.abandon("x").is_err());
        assert_eq!(attempt.state(), AttemptState::Acked);
    }

    #[test]
    fn test_abandoned_cannot_be_acked() {
        let mut attempt = PublishAttempt::pending(2, "102");
        attempt.fail("rejected").unwrap();
        attempt.abandon("rejected").unwrap();
        assert!(attempt.ack().is_err());
        assert!(attempt.retry().is_err());
    }

    #[test]
    fn test_pending_must_fail_before_retry() {
        let mut attempt = PublishAttempt::pending(3, "103");
        assert!(attempt.retry().is_err());
        assert_eq!(attempt.attempts(), 1);
    }
}
