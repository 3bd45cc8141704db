use super::tweet::Tweet;
use super::{Fetch, SourceError, TweetSource};
use crate::config::types::MockSourceConfig;
use async_trait::async_trait;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;

const WORDS: &[&str] = &[
    "Lorem", "ipsum", "dolor", "sit", "amet", "consectetuer", "adipiscing", "elit", "Maecenas",
    "porttitor", "congue", "massa", "Fusce", "posuere", "magna", "sed", "pulvinar", "ultricies",
    "purus", "lectus", "malesuada", "libero", "vitae", "commodo", "nulla", "tristique", "nunc",
];

const AUTHORS: &[&str] = &["ada", "grace", "linus", "barbara", "ken", "margaret", "dennis", "frances"];

/// Synthetic tweets for local runs and tests.
///
/// Ids count up from the cursor, so a restarted mock resumes where the
/// checkpoint left off.
pub struct MockSource {
    keywords: Vec<String>,
    min_length: usize,
    max_length: usize,
    interval: Duration,
    batch: usize,
    limit: Option<u64>,
    emitted: u64,
    rng: StdRng,
}

impl MockSource {
    pub fn new(config: &MockSourceConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Deterministic text and authors
    pub fn seeded(config: &MockSourceConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: &MockSourceConfig, rng: StdRng) -> Self {
        let min_length = config.min_length.max(1);
        Self {
            keywords: config.keywords.clone(),
            min_length,
            max_length: config.max_length.max(min_length),
            interval: config.interval,
            batch: config.batch.max(1),
            limit: config.limit,
            emitted: 0,
            rng,
        }
    }

    fn generate_text(&mut self) -> String {
        let length = self.rng.gen_range(self.min_length..=self.max_length);
        let mut words: Vec<&str> = (0..length)
            .map(|_| *WORDS.choose(&mut self.rng).unwrap_or(&"lorem"))
            .collect();

        if let Some(keyword) = self.keywords.choose(&mut self.rng) {
            let position = self.rng.gen_range(0..words.len());
            words[position] = keyword.as_str();
        }
        words.join(" ")
    }

    fn generate(&mut self, id: u64) -> Tweet {
        let author_id = self.rng.gen_range(0..AUTHORS.len());
        let payload = json!({
            "id": id.to_string(),
            "text": self.generate_text(),
            "author_id": author_id.to_string(),
            "author_username": AUTHORS[author_id],
            "created_at": Utc::now().to_rfc3339(),
        });

        // Built from known-good fields
        Tweet::from_v2_value(&payload, &HashMap::new()).unwrap_or_else(|_| {
            Tweet::new(id.to_string(), "", AUTHORS[author_id], Utc::now(), payload.to_string())
        })
    }
}

#[async_trait]
impl TweetSource for MockSource {
    fn name(&self) -> &str {
        "mock"
    }

    async fn fetch(&mut self, cursor: Option<&str>) -> Result<Fetch, SourceError> {
        let remaining = match self.limit {
            Some(limit) if self.emitted >= limit => return Ok(Fetch::Exhausted),
            Some(limit) => limit - self.emitted,
            None => u64::MAX,
        };

        if !self.interval.is_zero() {
            tokio::time::sleep(self.interval).await;
        }

        let start = cursor.and_then(|c| c.parse::<u64>().ok()).unwrap_or(0) + 1;
        let count = (self.batch as u64).min(remaining);

        let tweets = (start..start + count).map(|id| Ok(self.generate(id))).collect();
        self.emitted += count;
        Ok(Fetch::Items(tweets))
    }

    fn idle_interval(&self) -> Duration {
        self.interval
    }
}
