pub fn generate_starter_config() -> String {
    r##"# =============================================================================
# TWITTER-TO-KAFKA CONFIGURATION
# =============================================================================
# Pulls tweets from a source, buffers them, and publishes them to a Kafka topic
# with at-least-once delivery. Progress is checkpointed so a restart resumes
# without losing or skipping tweets.
#
# Config file locations (in order of precedence):
#   1. Path specified via --config argument
#   2. ~/.config/twitter-to-kafka/config.yml
#   3. /etc/twitter-to-kafka/config.yml
#
# Values of the form $env{NAME} are replaced with environment variables.

# =============================================================================
# SOURCE
# =============================================================================
# type: twitter | mock | file

source:
  type: mock

  # twitter:
  #   bearer_token: $env{TWITTER_BEARER_TOKEN}
  #   # Twitter API v2 recent-search query
  #   query: "rust OR kafka -is:retweet"
  #   poll_interval: 15s
  #   # 10..=100 per page
  #   max_results: 100
  #   max_pages: 10
  #   timeout: 30s

  mock:
    keywords: [rust, kafka, streaming, microservices]
    min_length: 5
    max_length: 15
    interval: 100ms
    batch: 10

  # file:
  #   # JSON lines, one Twitter v2 tweet object per line
  #   path: ~/tweets.jsonl
  #   chunk: 500

  # Explicit cursor (tweet id) to resume after; overrides the checkpoint
  # resume_from: "1600000000000000000"

  retry:
    max_attempts: 5
    initial_backoff: 500ms
    max_backoff: 60s
    jitter: 0.2

  # Pause after the source is declared unavailable, before polling again
  unavailable_cooldown: 30s

  # Number of recent tweet ids remembered for duplicate suppression
  dedup_window: 10000

# =============================================================================
# BUFFER
# =============================================================================

buffer:
  # Queued plus in-flight (unacknowledged) tweets
  capacity: 10000
  # block:  the connector waits for free space
  # signal: the connector is told the buffer is full and pauses polling
  strategy: block
  pause_interval: 50ms

# =============================================================================
# PUBLISHER
# =============================================================================

publisher:
  topic: twitter-topic
  workers: 4
  # A batch is sent when it reaches batch_size records or linger elapses
  batch_size: 500
  linger: 100ms
  # author | tweet_id
  partition_key: author
  codec: json
  retry:
    max_attempts: 5
    initial_backoff: 100ms
    max_backoff: 10s
    jitter: 0.2
  # hold:        an abandoned tweet blocks the checkpoint until restart
  # dead_letter: an abandoned tweet is written to the dead-letter table
  on_abandon: hold

# =============================================================================
# BROKER
# =============================================================================
# type: kafka | stdout
# The kafka broker requires building with `--features kafka`.

broker:
  type: stdout
  kafka:
    brokers: localhost:9092
    acks: all
    compression: snappy
    enable_idempotence: true
    request_timeout: 10s
    message_timeout: 30s
    properties: {}

# =============================================================================
# CHECKPOINT
# =============================================================================

checkpoint:
  path: ~/.local/share/twitter-to-kafka/state.duckdb
  persist_interval: 1s

shutdown:
  grace_period: 10s
"##
    .to_string()
}
