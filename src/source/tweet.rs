use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use thiserror::Error;

/// A payload that could not be normalized into a [`Tweet`].
///
/// These are never retried: the connector drops the payload, logs a warning
/// and counts it.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("missing field '{0}'")]
    MissingField(&'static str),

    #[error("invalid created_at '{value}': {reason}")]
    InvalidTimestamp { value: String, reason: String },
}

/// A normalized tweet.
///
/// Immutable once built; the original payload is kept verbatim for replay and
/// debugging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tweet {
    id: String,
    text: String,
    author: String,
    created_at: DateTime<Utc>,
    raw_payload: String,
}

impl Tweet {
    pub fn new(
        id: impl Into<String>,
        text: impl Into<String>,
        author: impl Into<String>,
        created_at: DateTime<Utc>,
        raw_payload: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            author: author.into(),
            created_at,
            raw_payload: raw_payload.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn author(&self) -> &str {
        &self.author
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn raw_payload(&self) -> &str {
        &self.raw_payload
    }

    /// Normalize a Twitter API v2 tweet object.
    ///
    /// `usernames` maps author ids to usernames from the `includes.users`
    /// expansion. The author is the username when known, then an inline
    /// `author_username`, then the bare `author_id`.
    pub fn from_v2_value(
        value: &Value,
        usernames: &HashMap<String, String>,
    ) -> Result<Self, PayloadError> {
        let id = str_field(value, "id")?;
        let text = str_field(value, "text")?;
        let author_id = str_field(value, "author_id")?;
        let created_at_raw = str_field(value, "created_at")?;

        let created_at = DateTime::parse_from_rfc3339(created_at_raw)
            .map_err(|e| PayloadError::InvalidTimestamp {
                value: created_at_raw.to_string(),
                reason: e.to_string(),
            })?
            .with_timezone(&Utc);

        let author = usernames
            .get(author_id)
            .map(String::as_str)
            .or_else(|| value.get("author_username").and_then(Value::as_str))
            .unwrap_or(author_id);

        Ok(Self::new(id, text, author, created_at, value.to_string()))
    }

    /// Normalize a single JSON line holding a v2 tweet object.
    ///
    /// The line itself is kept as the raw payload.
    pub fn from_v2_json(line: &str) -> Result<Self, PayloadError> {
        let value: Value = serde_json::from_str(line)?;
        let mut tweet = Self::from_v2_value(&value, &HashMap::new())?;
        tweet.raw_payload = line.to_string();
        Ok(tweet)
    }
}

fn str_field<'a>(value: &'a Value, field: &'static str) -> Result<&'a str, PayloadError> {
    value
        .get(field)
        .and_then(Value::as_str)
        .ok_or(PayloadError::MissingField(field))
}

/// Order two tweet ids.
///
/// Twitter ids are time-ordered integers, so ids that both parse as `u64`
/// compare numerically. Any other pair is only comparable when equal.
pub fn compare_ids(a: &str, b: &str) -> Option<Ordering> {
    if a == b {
        return Some(Ordering::Equal);
    }
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(a), Ok(b)) => Some(a.cmp(&b)),
        _ => None,
    }
}

/// True when `id` is known to be at or before `cursor`.
pub fn is_at_or_before(id: &str, cursor: &str) -> bool {
    matches!(
        compare_ids(id, cursor),
        Some(Ordering::Less) | Some(Ordering::Equal)
    )
}
