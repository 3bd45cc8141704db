pub mod connector;
pub mod file;
pub mod mock;
pub mod tweet;
pub mod twitter;

pub use connector::{ConnectorSummary, SourceConnector};
pub use tweet::{PayloadError, Tweet};

use crate::config::types::{SourceConfig, SourceType};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Source returned error status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Source rejected credentials ({status}): {message}")]
    Unauthorized { status: u16, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Source unavailable after {attempts} attempts: {last_error}")]
    Unavailable { attempts: u32, last_error: String },

    #[error("Source configuration error: {0}")]
    Config(String),
}

impl SourceError {
    /// Worth retrying locally with backoff
    pub fn is_transient(&self) -> bool {
        match self {
            SourceError::Http(_) | SourceError::Io(_) => true,
            SourceError::Status { status, .. } => *status == 429 || *status >= 500,
            SourceError::Unauthorized { .. }
            | SourceError::Unavailable { .. }
            | SourceError::Config(_) => false,
        }
    }
}

/// Result of one poll.
#[derive(Debug)]
pub enum Fetch {
    /// Payloads in source order, oldest first; may be empty
    Items(Vec<Result<Tweet, PayloadError>>),
    /// The source has nothing more to give, ever
    Exhausted,
}

/// A pollable origin of tweets.
#[async_trait]
pub trait TweetSource: Send {
    fn name(&self) -> &str;

    /// Fetch tweets newer than `cursor`.
    async fn fetch(&mut self, cursor: Option<&str>) -> Result<Fetch, SourceError>;

    /// Pause between polls that returned nothing
    fn idle_interval(&self) -> Duration;
}

pub fn build_source(config: &SourceConfig) -> Result<Box<dyn TweetSource>, SourceError> {
    let missing = |kind: &str| SourceError::Config(format!("source.{} section is required", kind));

    match config.source_type {
        SourceType::Twitter => {
            let twitter = config.twitter.as_ref().ok_or_else(|| missing("twitter"))?;
            Ok(Box::new(twitter::TwitterSource::new(twitter)?))
        }
        SourceType::Mock => {
            let mock = config.mock.as_ref().ok_or_else(|| missing("mock"))?;
            Ok(Box::new(mock::MockSource::new(mock)))
        }
        SourceType::File => {
            let file = config.file.as_ref().ok_or_else(|| missing("file"))?;
            Ok(Box::new(file::FileSource::new(file)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let throttled = SourceError::Status {
            status: 429,
            message: "Too Many Requests".to_string(),
        };
        let server = SourceError::Status {
            status: 503,
            message: String::new(),
        };
        let bad_request = SourceError::Status {
            status: 400,
            message: "invalid query".to_string(),
        };
        let unauthorized = SourceError::Unauthorized {
            status: 401,
            message: String::new(),
        };

        assert!(throttled.is_transient());
        assert!(server.is_transient());
        assert!(!bad_request.is_transient());
        assert!(!unauthorized.is_transient());
    }
}
