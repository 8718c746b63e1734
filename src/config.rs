use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const MIN_LIMIT: usize = 1;
pub const MAX_LIMIT: usize = 1000;
pub const MIN_INTERVAL: Duration = Duration::from_millis(100);
pub const MIN_RESERVE_DURATION: Duration = Duration::from_secs(15);
pub const MIN_PROCESS_TIMEOUT: Duration = Duration::from_millis(200);

pub const DEFAULT_HEADER_EVENT_ID: &str = "x-event-id";
pub const DEFAULT_HEADER_EVENT_TYPE: &str = "x-event-type";

/// Tuning of the delivery engine.
///
/// Built by hand or through one of the presets, then checked by
/// [`OutboxConfig::validate`] when the engine is constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxConfig {
    /// Events reserved per poll cycle, in `[1, 1000]`.
    pub limit: usize,
    /// Poll interval, at least 100ms.
    pub interval: Duration,
    /// How long a reservation excludes other pollers, at least 15s.
    pub reserve_duration: Duration,
    /// Deadline for every store round trip and for the publish hand-off, at least 200ms.
    pub process_timeout: Duration,
    /// Header key carrying the event id.
    pub header_event_id: String,
    /// Header key carrying the event type.
    pub header_event_type: String,
}

/// Producer flush tuning derived from an [`OutboxConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushConfig {
    pub max_messages: usize,
    pub frequency: Duration,
}

impl OutboxConfig {
    pub fn small_batch() -> Self {
        Self::preset(50, 250, 15, 300)
    }

    pub fn medium_batch() -> Self {
        Self::preset(200, 450, 30, 530)
    }

    pub fn large_batch() -> Self {
        Self::preset(500, 620, 45, 720)
    }

    fn preset(limit: usize, interval_ms: u64, reserve_secs: u64, timeout_ms: u64) -> Self {
        Self {
            limit,
            interval: Duration::from_millis(interval_ms),
            reserve_duration: Duration::from_secs(reserve_secs),
            process_timeout: Duration::from_millis(timeout_ms),
            header_event_id: DEFAULT_HEADER_EVENT_ID.to_string(),
            header_event_type: DEFAULT_HEADER_EVENT_TYPE.to_string(),
        }
    }

    /// Checks every constraint and reports all violations at once.
    pub fn validate(&self) -> Result<()> {
        let mut violations = Vec::new();

        if self.limit < MIN_LIMIT || self.limit > MAX_LIMIT {
            violations.push(format!("limit must be in [{};{}]", MIN_LIMIT, MAX_LIMIT));
        }

        if self.interval < MIN_INTERVAL {
            violations.push(format!("interval must be >= {:?}", MIN_INTERVAL));
        }

        if self.reserve_duration < MIN_RESERVE_DURATION {
            violations.push(format!("reserve_duration must be >= {:?}", MIN_RESERVE_DURATION));
        }

        if self.process_timeout < MIN_PROCESS_TIMEOUT {
            violations.push(format!("process_timeout must be >= {:?}", MIN_PROCESS_TIMEOUT));
        }

        if self.header_event_id.is_empty() {
            violations.push("header_event_id required".to_string());
        }

        if self.header_event_type.is_empty() {
            violations.push("header_event_type required".to_string());
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidConfig { violations })
        }
    }

    // Limit = 50, ProcessTimeout = 300ms  -> max 20 messages, every 90ms
    // Limit = 200, ProcessTimeout = 530ms -> max 80 messages, every 159ms
    pub fn flush_config(&self) -> FlushConfig {
        let max_messages = (self.limit * 2 / 5).max(1);
        let frequency = Duration::from_nanos((self.process_timeout.as_nanos() * 3 / 10) as u64);

        FlushConfig {
            max_messages,
            frequency,
        }
    }
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self::small_batch()
    }
}

/// Settings file of the `pg-outbox` binary.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    pub postgres: PostgresConfig,
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub outbox: OutboxSettings,
    #[serde(default)]
    pub consumer: Option<ConsumerSettings>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KafkaConfig {
    pub brokers: Vec<String>,
    #[serde(default = "default_compression")]
    pub compression: String,
    #[serde(default = "default_acks")]
    pub acks: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutboxSettings {
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_reserve_duration_secs")]
    pub reserve_duration_secs: u64,
    #[serde(default = "default_process_timeout_ms")]
    pub process_timeout_ms: u64,
    #[serde(default = "default_header_event_id")]
    pub header_event_id: String,
    #[serde(default = "default_header_event_type")]
    pub header_event_type: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConsumerSettings {
    pub group_id: String,
    pub topics: Vec<String>,
    #[serde(default = "default_auto_commit")]
    pub auto_commit: bool,
    #[serde(default = "default_sleep_after_rebalance_ms")]
    pub sleep_after_rebalance_ms: u64,
}

/// Consumer-group runner settings.
#[derive(Debug, Clone)]
pub struct ConsumerGroupConfig {
    pub brokers: Vec<String>,
    pub topics: Vec<String>,
    pub group_id: String,
    /// Handled messages are committed either way. `true` leaves the commit to
    /// librdkafka's periodic auto-commit, `false` commits after every message.
    pub auto_commit: bool,
    /// Backoff after a consume session ends with an error.
    pub sleep_after_rebalance: Duration,
}

impl AppConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("PG_OUTBOX")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        settings
            .try_deserialize()
            .map_err(|e| Error::Config(e.to_string()))
    }

    pub fn postgres_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}?connect_timeout={}",
            self.postgres.username,
            self.postgres.password,
            self.postgres.host,
            self.postgres.port,
            self.postgres.database,
            self.postgres.connect_timeout_secs
        )
    }

    pub fn consumer_group_config(&self) -> Option<ConsumerGroupConfig> {
        self.consumer.as_ref().map(|c| ConsumerGroupConfig {
            brokers: self.kafka.brokers.clone(),
            topics: c.topics.clone(),
            group_id: c.group_id.clone(),
            auto_commit: c.auto_commit,
            sleep_after_rebalance: Duration::from_millis(c.sleep_after_rebalance_ms),
        })
    }
}

impl OutboxSettings {
    pub fn to_outbox_config(&self) -> OutboxConfig {
        OutboxConfig {
            limit: self.limit,
            interval: Duration::from_millis(self.interval_ms),
            reserve_duration: Duration::from_secs(self.reserve_duration_secs),
            process_timeout: Duration::from_millis(self.process_timeout_ms),
            header_event_id: self.header_event_id.clone(),
            header_event_type: self.header_event_type.clone(),
        }
    }
}

impl Default for OutboxSettings {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            interval_ms: default_interval_ms(),
            reserve_duration_secs: default_reserve_duration_secs(),
            process_timeout_ms: default_process_timeout_ms(),
            header_event_id: default_header_event_id(),
            header_event_type: default_header_event_type(),
        }
    }
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_compression() -> String {
    "snappy".to_string()
}

fn default_acks() -> String {
    "all".to_string()
}

fn default_limit() -> usize {
    50
}

fn default_interval_ms() -> u64 {
    250
}

fn default_reserve_duration_secs() -> u64 {
    15
}

fn default_process_timeout_ms() -> u64 {
    300
}

fn default_header_event_id() -> String {
    DEFAULT_HEADER_EVENT_ID.to_string()
}

fn default_header_event_type() -> String {
    DEFAULT_HEADER_EVENT_TYPE.to_string()
}

fn default_auto_commit() -> bool {
    true
}

fn default_sleep_after_rebalance_ms() -> u64 {
    1000
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::Builder;

    #[test]
    fn test_presets_are_valid() {
        assert!(OutboxConfig::small_batch().validate().is_ok());
        assert!(OutboxConfig::medium_batch().validate().is_ok());
        assert!(OutboxConfig::large_batch().validate().is_ok());
    }

    #[test]
    fn test_validation_aggregates_all_violations() {
        let config = OutboxConfig {
            limit: 0,
            interval: Duration::from_millis(99),
            reserve_duration: Duration::from_secs(14),
            process_timeout: Duration::from_millis(199),
            header_event_id: String::new(),
            header_event_type: String::new(),
        };

        match config.validate() {
            Err(Error::InvalidConfig { violations }) => {
                assert_eq!(violations.len(), 6);
                assert!(violations[0].starts_with("limit"));
                assert!(violations[5].starts_with("header_event_type"));
            }
            other => panic!("expected InvalidConfig, got {:?}", other),
        }
    }

    #[test]
    fn test_limit_bounds() {
        let mut config = OutboxConfig::small_batch();

        config.limit = 1000;
        assert!(config.validate().is_ok());

        config.limit = 1001;
        assert!(config.validate().is_err());

        config.limit = 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_flush_config_derivation() {
        let flush = OutboxConfig::small_batch().flush_config();
        assert_eq!(flush.max_messages, 20);
        assert_eq!(flush.frequency, Duration::from_millis(90));

        let mut config = OutboxConfig::small_batch();
        config.limit = 2;
        assert_eq!(config.flush_config().max_messages, 1);
    }

    #[test]
    fn test_app_config_from_file() {
        let mut file = Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[postgres]
host = "localhost"
port = 5432
database = "app"
username = "app"
password = "secret"

[kafka]
brokers = ["localhost:9092"]

[outbox]
limit = 200
interval_ms = 450

[consumer]
group_id = "audit"
topics = ["orders"]
"#
        )
        .unwrap();

        let config = AppConfig::from_file(file.path()).unwrap();
        let outbox = config.outbox.to_outbox_config();

        assert_eq!(outbox.limit, 200);
        assert_eq!(outbox.interval, Duration::from_millis(450));
        assert_eq!(outbox.reserve_duration, Duration::from_secs(15));
        assert_eq!(outbox.header_event_id, DEFAULT_HEADER_EVENT_ID);
        assert_eq!(config.kafka.acks, "all");

        let group = config.consumer_group_config().unwrap();
        assert_eq!(group.group_id, "audit");
        assert!(group.auto_commit);
        assert_eq!(group.brokers, vec!["localhost:9092".to_string()]);
    }

    #[test]
    fn test_manual_commit_consumer_settings() {
        let mut file = Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[postgres]
host = "localhost"
port = 5432
database = "app"
username = "app"
password = "secret"

[kafka]
brokers = ["kafka-1:9092", "kafka-2:9092"]

[consumer]
group_id = "billing"
topics = ["orders", "payments"]
auto_commit = false
sleep_after_rebalance_ms = 2500
"#
        )
        .unwrap();

        let config = AppConfig::from_file(file.path()).unwrap();
        let group = config.consumer_group_config().unwrap();

        assert!(!group.auto_commit);
        assert_eq!(group.topics, vec!["orders".to_string(), "payments".to_string()]);
        assert_eq!(group.sleep_after_rebalance, Duration::from_millis(2500));
        assert_eq!(group.brokers.len(), 2);
    }
}
