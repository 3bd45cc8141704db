use crate::config::types::CodecKind;
use crate::source::tweet::Tweet;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to serialize tweet {id}: {source}")]
    Serialize {
        id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to decode record: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("record decoded as tweet {actual}, expected {expected}")]
    IdMismatch { expected: String, actual: String },

    #[error("checksum mismatch for tweet {id}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        id: String,
        expected: String,
        actual: String,
    },
}

/// Turns tweets into record values and back.
pub trait TweetCodec: Send + Sync {
    fn content_type(&self) -> &'static str;

    fn encode(&self, tweet: &Tweet) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, bytes: &[u8]) -> Result<Tweet, CodecError>;
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    tweet: &'a Tweet,
    sha256: String,
}

#[derive(Deserialize)]
struct Envelope {
    tweet: Tweet,
    sha256: String,
}

/// Hex SHA-256 of the raw source payload
pub fn payload_digest(raw_payload: &str) -> String {
    Sha256::digest(raw_payload.as_bytes())
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// JSON envelope `{"tweet": {...}, "sha256": "<hex>"}`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl TweetCodec for JsonCodec {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn encode(&self, tweet: &Tweet) -> Result<Vec<u8>, CodecError> {
        let envelope = EnvelopeRef {
            tweet,
            sha256: payload_digest(tweet.raw_payload()),
        };
        serde_json::to_vec(&envelope).map_err(|source| CodecError::Serialize {
            id: tweet.id().to_string(),
            source,
        })
    }

    fn decode(&self, bytes: &[u8]) -> Result<Tweet, CodecError> {
        let envelope: Envelope = serde_json::from_slice(bytes)?;
        let actual = payload_digest(envelope.tweet.raw_payload());
        if actual != envelope.sha256 {
            return Err(CodecError::ChecksumMismatch {
                id: envelope.tweet.id().to_string(),
                expected: envelope.sha256,
                actual,
            });
        }
        Ok(envelope.tweet)
    }
}

pub fn build_codec(kind: CodecKind) -> Box<dyn TweetCodec> {
    match kind {
        CodecKind::Json => Box::new(JsonCodec),
    }
}
