use super::types::*;
use crate::config::{env_var_regex, expand_env_vars, expand_tilde};
use std::fs::File;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation failed:\n{}", .0.join("\n"))]
    ValidationList(Vec<String>),

    #[error("validation failed: {0}")]
    Validation(String),
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    use std::io::Read;

    let mut file = File::open(path).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to open config file '{}': {}", path.display(), e),
        ))
    })?;

    let mut yaml_string = String::new();
    file.read_to_string(&mut yaml_string).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read config file '{}': {}", path.display(), e),
        ))
    })?;

    let config = parse_config(&yaml_string).map_err(|e| match e {
        ConfigError::YamlParse(err) => ConfigError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("in file '{}': {}", path.display(), err),
        )),
        other => other,
    })?;

    Ok(config)
}

/// Parse and validate a config from a YAML string.
///
/// Environment variables (`$env{NAME}`) are expanded before parsing and tilde
/// paths afterwards.
pub fn parse_config(yaml: &str) -> Result<Config, ConfigError> {
    let yaml_string = expand_env_vars(yaml);

    check_unexpanded_vars(&yaml_string)?;

    let mut config: Config = serde_yaml::from_str(&yaml_string)?;

    expand_paths(&mut config);
    validate_config(&config)?;

    Ok(config)
}

/// Checks for unexpanded environment variables and returns a helpful error
fn check_unexpanded_vars(yaml_string: &str) -> Result<(), ConfigError> {
    // Comment lines may document the syntax without using it
    let mut unexpanded_vars: Vec<String> = yaml_string
        .lines()
        .filter(|line| !line.trim_start().starts_with('#'))
        .flat_map(|line| {
            env_var_regex()
                .captures_iter(line)
                .filter_map(|cap| cap.get(1).map(|m| m.as_str().to_string()))
                .collect::<Vec<_>>()
        })
        .collect();

    if unexpanded_vars.is_empty() {
        return Ok(());
    }

    unexpanded_vars.sort();
    unexpanded_vars.dedup();

    let error_msg = if unexpanded_vars.len() == 1 {
        format!(
            "Environment variable $env{{{0}}} is not set.\n\
             \n\
             To fix this, either:\n\
             1. Set the environment variable: export {0}=...\n\
             2. Replace $env{{{0}}} in the config file with the actual value",
            unexpanded_vars[0]
        )
    } else {
        format!(
            "Environment variables are not set: {}\n\
             \n\
             To fix this, either:\n\
             1. Set the environment variables\n\
             2. Replace the variables in the config file with actual values",
            unexpanded_vars.join(", ")
        )
    };

    Err(ConfigError::Validation(error_msg))
}

fn expand_paths(config: &mut Config) {
    if let Some(file) = config.source.file.as_mut() {
        file.path = expand_tilde(&file.path);
    }
    config.checkpoint.path = expand_tilde(&config.checkpoint.path);
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    validate_source(&config.source, &mut errors);
    validate_retry("source.retry", &config.source.retry, &mut errors);

    if config.buffer.capacity == 0 {
        errors.push("buffer.capacity must be greater than 0".to_string());
    }

    validate_publisher(&config.publisher, &mut errors);

    if config.broker.broker_type == BrokerType::Kafka {
        match &config.broker.kafka {
            None => errors.push("broker.type is 'kafka' but the 'broker.kafka' section is missing".to_string()),
            Some(kafka) if kafka.brokers.trim().is_empty() => {
                errors.push("broker.kafka.brokers cannot be empty".to_string())
            }
            Some(_) => {}
        }
    }

    if config.checkpoint.path.as_os_str().is_empty() {
        errors.push("checkpoint.path cannot be empty".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationList(errors))
    }
}

fn validate_source(source: &SourceConfig, errors: &mut Vec<String>) {
    match source.source_type {
        SourceType::Twitter => match &source.twitter {
            None => errors.push("source.type is 'twitter' but the 'source.twitter' section is missing".to_string()),
            Some(twitter) => {
                if twitter.bearer_token.trim().is_empty() {
                    errors.push("source.twitter.bearer_token cannot be empty".to_string());
                }
                if twitter.query.trim().is_empty() {
                    errors.push("source.twitter.query cannot be empty".to_string());
                }
                // API v2 recent search accepts 10..=100
                if !(10..=100).contains(&twitter.max_results) {
                    errors.push(format!(
                        "source.twitter.max_results must be between 10 and 100, got {}",
                        twitter.max_results
                    ));
                }
                if twitter.max_pages == 0 {
                    errors.push("source.twitter.max_pages must be greater than 0".to_string());
                }
            }
        },
        SourceType::Mock => match &source.mock {
            None => errors.push("source.type is 'mock' but the 'source.mock' section is missing".to_string()),
            Some(mock) => {
                if mock.keywords.is_empty() {
                    errors.push("source.mock.keywords must contain at least one keyword".to_string());
                }
                if mock.min_length == 0 || mock.min_length > mock.max_length {
                    errors.push(format!(
                        "source.mock: min_length ({}) must be at least 1 and not exceed max_length ({})",
                        mock.min_length, mock.max_length
                    ));
                }
                if mock.batch == 0 {
                    errors.push("source.mock.batch must be greater than 0".to_string());
                }
            }
        },
        SourceType::File => match &source.file {
            None => errors.push("source.type is 'file' but the 'source.file' section is missing".to_string()),
            Some(file) => {
                if file.chunk == 0 {
                    errors.push("source.file.chunk must be greater than 0".to_string());
                }
            }
        },
    }

    if source.dedup_window == 0 {
        errors.push("source.dedup_window must be greater than 0".to_string());
    }
}

fn validate_publisher(publisher: &PublisherConfig, errors: &mut Vec<String>) {
    if publisher.topic.trim().is_empty() {
        errors.push("publisher.topic cannot be empty".to_string());
    }
    if publisher.workers == 0 {
        errors.push("publisher.workers must be greater than 0".to_string());
    }
    if publisher.batch_size == 0 {
        errors.push("publisher.batch_size must be greater than 0".to_string());
    }
    validate_retry("publisher.retry", &publisher.retry, errors);
}

fn validate_retry(context: &str, retry: &RetryConfig, errors: &mut Vec<String>) {
    if retry.max_attempts == 0 {
        errors.push(format!("{}.max_attempts must be greater than 0", context));
    }
    if retry.initial_backoff > retry.max_backoff {
        errors.push(format!(
            "{}: initial_backoff ({:?}) exceeds max_backoff ({:?})",
            context, retry.initial_backoff, retry.max_backoff
        ));
    }
    if !(0.0..=1.0).contains(&retry.jitter) {
        errors.push(format!(
            "{}.jitter must be between 0.0 and 1.0, got {}",
            context, retry.jitter
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const MOCK_CONFIG: &str = r#"
source:
  type: mock
  mock:
    keywords: [rust, kafka]
    interval: 10ms
publisher:
  topic: tweets
broker:
  type: stdout
checkpoint:
  path: /tmp/t2k-test.duckdb
"#;

    #[test]
    fn test_parse_minimal_config_applies_defaults() {
        let config = parse_config(MOCK_CONFIG).unwrap();

        assert_eq!(config.source.source_type, SourceType::Mock);
        assert_eq!(config.buffer.capacity, 10_000);
        assert_eq!(config.buffer.strategy, BackpressureStrategy::Block);
        assert_eq!(config.publisher.batch_size, 500);
        assert_eq!(config.publisher.linger, Duration::from_millis(100));
        assert_eq!(config.publisher.partition_key, PartitionKeyPolicy::Author);
        assert_eq!(config.publisher.on_abandon, AbandonPolicy::Hold);
        assert_eq!(config.shutdown.grace_period, Duration::from_secs(10));
        assert_eq!(config.source.mock.unwrap().interval, Duration::from_millis(10));
    }

    #[test]
    fn test_missing_source_section_is_reported() {
        let yaml = MOCK_CONFIG.replace("type: mock", "type: twitter");
        let err = parse_config(&yaml).unwrap_err();
        match err {
            ConfigError::ValidationList(errors) => {
                assert!(errors.iter().any(|e| e.contains("source.twitter")));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_validation_collects_every_problem() {
        let yaml = r#"
source:
  type: mock
  mock:
    keywords: []
    min_length: 20
    max_length: 10
buffer:
  capacity: 0
publisher:
  topic: ""
  workers: 0
  retry:
    jitter: 2.0
broker:
  type: kafka
checkpoint:
  path: /tmp/x.duckdb
"#;
        let err = parse_config(yaml).unwrap_err();
        match err {
            ConfigError::ValidationList(errors) => {
                assert!(errors.iter().any(|e| e.contains("keywords")));
                assert!(errors.iter().any(|e| e.contains("min_length")));
                assert!(errors.iter().any(|e| e.contains("buffer.capacity")));
                assert!(errors.iter().any(|e| e.contains("publisher.topic")));
                assert!(errors.iter().any(|e| e.contains("publisher.workers")));
                assert!(errors.iter().any(|e| e.contains("jitter")));
                assert!(errors.iter().any(|e| e.contains("broker.kafka")));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_unexpanded_env_var_is_rejected() {
        let yaml = MOCK_CONFIG.replace("topic: tweets", "topic: $env{T2K_SURELY_UNSET_TOPIC}");
        let err = parse_config(&yaml).unwrap_err();
        assert!(err.to_string().contains("T2K_SURELY_UNSET_TOPIC"));
    }

    #[test]
    fn test_env_var_is_expanded() {
        std::env::set_var("T2K_TEST_TOPIC", "from-env");
        let yaml = MOCK_CONFIG.replace("topic: tweets", "topic: $env{T2K_TEST_TOPIC}");
        let config = parse_config(&yaml).unwrap();
        assert_eq!(config.publisher.topic, "from-env");
        std::env::remove_var("T2K_TEST_TOPIC");
    }

    #[test]
    fn test_twitter_max_results_bounds() {
        let yaml = r##"
source:
  type: twitter
  twitter:
    bearer_token: abc
    query: "#rust"
    max_results: 500
publisher:
  topic: tweets
broker:
  type: stdout
checkpoint:
  path: /tmp/x.duckdb
"##;
        let err = parse_config(yaml).unwrap_err();
        assert!(err.to_string().contains("max_results"));
    }
}
