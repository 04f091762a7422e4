//! Configuration management for the chat ingest service
//!
//! Loaded once from environment variables (and `.env` when present).
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use db_pool::env_utils::{parse_env_or, parse_env_with_default};
use db_pool::DbConfig;
use resilience::RetryConfig;

use crate::logging::LogFormat;
use crate::services::dead_letter::DeadLetterConfig;

pub const SERVICE_NAME: &str = "chat-ingest-service";

#[derive(Debug, Clone)]
pub struct Config {
    pub database: DbConfig,
    pub kafka: KafkaConfig,
    pub retry: RetryConfig,
    /// How long in-flight records may take to finish after a shutdown signal
    pub shutdown_grace: Duration,
    pub metrics_port: u16,
    pub run_migrations: bool,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone)]
pub struct KafkaConfig {
    pub brokers: String,
    pub group_id: String,
    pub topic: String,
    pub dead_letter_suffix: String,
    /// Number of workers, each with its own consumer in the group
    pub concurrency: usize,
    pub auto_offset_reset: String,
    pub session_timeout_ms: u32,
    pub max_poll_interval_ms: u32,
    pub producer_timeout_ms: u64,
    pub create_topics: bool,
    pub topic_partitions: i32,
    pub topic_replication: i32,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            group_id: "chat-ingest-consumer".to_string(),
            topic: "chat-messages".to_string(),
            dead_letter_suffix: "-dead-letter".to_string(),
            concurrency: 3,
            auto_offset_reset: "latest".to_string(),
            session_timeout_ms: 30_000,
            max_poll_interval_ms: 300_000,
            producer_timeout_ms: 5_000,
            create_topics: false,
            topic_partitions: 3,
            topic_replication: 1,
        }
    }
}

impl KafkaConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            brokers: env_string("KAFKA_BROKERS", &defaults.brokers),
            group_id: env_string("KAFKA_GROUP_ID", &defaults.group_id),
            topic: env_string("KAFKA_CHAT_MESSAGES_TOPIC", &defaults.topic),
            dead_letter_suffix: env_string("KAFKA_DEAD_LETTER_SUFFIX", &defaults.dead_letter_suffix),
            concurrency: strict("KAFKA_CONSUMER_CONCURRENCY", defaults.concurrency)?,
            auto_offset_reset: env_string("KAFKA_AUTO_OFFSET_RESET", &defaults.auto_offset_reset),
            session_timeout_ms: parse_env_with_default(
                "KAFKA_SESSION_TIMEOUT_MS",
                defaults.session_timeout_ms,
            ),
            max_poll_interval_ms: parse_env_with_default(
                "KAFKA_MAX_POLL_INTERVAL_MS",
                defaults.max_poll_interval_ms,
            ),
            producer_timeout_ms: parse_env_with_default(
                "KAFKA_PRODUCER_TIMEOUT_MS",
                defaults.producer_timeout_ms,
            ),
            create_topics: parse_env_with_default("KAFKA_CREATE_TOPICS", defaults.create_topics),
            topic_partitions: parse_env_with_default(
                "KAFKA_TOPIC_PARTITIONS",
                defaults.topic_partitions,
            ),
            topic_replication: parse_env_with_default(
                "KAFKA_TOPIC_REPLICATION",
                defaults.topic_replication,
            ),
        };

        if config.concurrency == 0 {
            bail!("KAFKA_CONSUMER_CONCURRENCY must be at least 1");
        }
        if config.dead_letter_suffix.is_empty() {
            bail!("KAFKA_DEAD_LETTER_SUFFIX must not be empty");
        }

        Ok(config)
    }

    pub fn dead_letter(&self) -> DeadLetterConfig {
        DeadLetterConfig {
            brokers: self.brokers.clone(),
            suffix: self.dead_letter_suffix.clone(),
            timeout: Duration::from_millis(self.producer_timeout_ms),
        }
    }
}

/// Retry policy from `RETRY_*` variables; invalid values are rejected
pub fn retry_from_env() -> Result<RetryConfig> {
    let defaults = RetryConfig::default();

    let config = RetryConfig {
        max_attempts: strict("RETRY_MAX_ATTEMPTS", defaults.max_attempts)?,
        initial_backoff: Duration::from_millis(strict(
            "RETRY_INITIAL_BACKOFF_MS",
            defaults.initial_backoff.as_millis() as u64,
        )?),
        max_backoff: Duration::from_millis(strict(
            "RETRY_MAX_BACKOFF_MS",
            defaults.max_backoff.as_millis() as u64,
        )?),
        backoff_multiplier: strict("RETRY_BACKOFF_MULTIPLIER", defaults.backoff_multiplier)?,
        jitter: strict("RETRY_JITTER", defaults.jitter)?,
    };

    if config.max_attempts == 0 {
        bail!("RETRY_MAX_ATTEMPTS must be at least 1");
    }
    if !config.backoff_multiplier.is_finite() || config.backoff_multiplier < 1.0 {
        bail!("RETRY_BACKOFF_MULTIPLIER must be a finite number >= 1.0");
    }
    if config.max_backoff < config.initial_backoff {
        bail!("RETRY_MAX_BACKOFF_MS must not be lower than RETRY_INITIAL_BACKOFF_MS");
    }

    Ok(config)
}

/// A worker in retry backoff does not poll its consumer; the longest
/// reachable backoff must end before `max.poll.interval.ms`
pub fn check_backoff_fits_poll_interval(retry: &RetryConfig, kafka: &KafkaConfig) -> Result<()> {
    let longest = retry.longest_backoff();
    let poll_interval = Duration::from_millis(u64::from(kafka.max_poll_interval_ms));

    if longest >= poll_interval {
        bail!(
            "retry backoff of up to {}ms (attempt {} of {}) must be shorter than \
             KAFKA_MAX_POLL_INTERVAL_MS={}",
            longest.as_millis(),
            retry.last_retry_attempt(),
            retry.max_attempts,
            kafka.max_poll_interval_ms
        );
    }
    Ok(())
}

impl Config {
    pub fn from_env() -> Result<Self> {
        // A missing .env file is expected outside local development
        let _ = dotenvy::dotenv();

        let database = DbConfig::from_env(SERVICE_NAME).map_err(|e| anyhow!(e))?;
        let kafka = KafkaConfig::from_env().context("Invalid Kafka configuration")?;
        let retry = retry_from_env().context("Invalid retry configuration")?;
        check_backoff_fits_poll_interval(&retry, &kafka)?;
        let log_format = std::env::var("LOG_FORMAT")
            .ok()
            .map(|v| v.parse::<LogFormat>())
            .transpose()
            .map_err(|e| anyhow!(e))?
            .unwrap_or_default();

        Ok(Self {
            database,
            kafka,
            retry,
            shutdown_grace: Duration::from_secs(parse_env_with_default("SHUTDOWN_GRACE_SECS", 30)),
            metrics_port: parse_env_with_default("METRICS_PORT", 9090),
            run_migrations: parse_env_with_default("RUN_MIGRATIONS", true),
            log_format,
        })
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn strict<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    parse_env_or(key, default).map_err(|e| anyhow!(e))
}
