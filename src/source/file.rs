use super::tweet::Tweet;
use super::{Fetch, SourceError, TweetSource};
use crate::config::types::FileSourceConfig;
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};

/// Replays a JSON-lines file of v2 tweet objects.
///
/// The file is read once, front to back. The cursor is not used to seek: the
/// connector drops ids at or before the checkpoint.
pub struct FileSource {
    path: PathBuf,
    chunk: usize,
    lines: Option<Lines<BufReader<File>>>,
    line_number: u64,
}

impl FileSource {
    pub fn new(config: &FileSourceConfig) -> Self {
        Self {
            path: config.path.clone(),
            chunk: config.chunk.max(1),
            lines: None,
            line_number: 0,
        }
    }
}

#[async_trait]
impl TweetSource for FileSource {
    fn name(&self) -> &str {
        "file"
    }

    async fn fetch(&mut self, _cursor: Option<&str>) -> Result<Fetch, SourceError> {
        if self.lines.is_none() {
            let file = File::open(&self.path).await?;
            tracing::info!(path = %self.path.display(), "Replaying tweets from file");
            self.lines = Some(BufReader::new(file).lines());
        }
        let Some(lines) = self.lines.as_mut() else {
            return Ok(Fetch::Exhausted);
        };

        let mut items = Vec::with_capacity(self.chunk);
        while items.len() < self.chunk {
            let Some(line) = lines.next_line().await? else {
                break;
            };
            self.line_number += 1;

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            items.push(Tweet::from_v2_json(trimmed));
        }

        if items.is_empty() {
            tracing::info!(lines = self.line_number, "Reached end of tweet file");
            return Ok(Fetch::Exhausted);
        }
        Ok(Fetch::Items(items))
    }

    fn idle_interval(&self) -> Duration {
        Duration::from_millis(100)
    }
}
