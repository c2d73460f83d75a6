//! Consumer configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Where a shard without a persisted checkpoint starts consuming.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CursorPosition {
    /// The oldest data still retained in the shard.
    #[default]
    Begin,
    /// Only data written after the consumer starts.
    End,
    /// The first data received at or after this unix timestamp, in seconds.
    Timestamp(i64),
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum Error {
    #[error("{field} must not be empty")]
    EmptyField { field: &'static str },

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("query must not be blank when set")]
    BlankQuery,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Settings shared read-only by every shard worker of one consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub endpoint: String,
    pub project: String,
    pub logstore: String,
    pub consumer_group_name: String,
    pub consumer_name: String,

    /// Only used for shards that have no checkpoint in the consumer group yet.
    pub cursor_position: CursorPosition,

    /// How often the consumer group heartbeat runs.
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// Reference interval for pacing fetches of quiet shards, and the tick of the owner loop.
    #[serde(with = "humantime_serde")]
    pub data_fetch_interval: Duration,

    /// Batches with at least this many log groups are fetched back to back.
    pub max_fetch_log_group_count: usize,

    /// Disable the periodic checkpoint flush. Processors then own checkpointing entirely.
    pub auto_commit_disabled: bool,

    #[serde(with = "humantime_serde")]
    pub auto_commit_interval: Duration,

    pub disable_runtime_metrics: bool,

    #[serde(with = "humantime_serde")]
    pub metrics_report_interval: Duration,

    /// Maximum number of in-flight pulls across all shards of this consumer.
    pub max_io_workers: usize,

    /// Server-side filter applied to pulled data.
    pub query: Option<String>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            project: String::new(),
            logstore: String::new(),
            consumer_group_name: String::new(),
            consumer_name: String::new(),
            cursor_position: CursorPosition::default(),
            heartbeat_interval: Duration::from_secs(20),
            data_fetch_interval: Duration::from_millis(200),
            max_fetch_log_group_count: 1000,
            auto_commit_disabled: false,
            auto_commit_interval: Duration::from_secs(60),
            disable_runtime_metrics: false,
            metrics_report_interval: Duration::from_secs(60),
            max_io_workers: 50,
            query: None,
        }
    }
}

impl ConsumerConfig {
    /// Check the settings a consumer cannot run without.
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("endpoint", &self.endpoint),
            ("project", &self.project),
            ("logstore", &self.logstore),
            ("consumer_group_name", &self.consumer_group_name),
            ("consumer_name", &self.consumer_name),
        ] {
            if value.trim().is_empty() {
                return Err(Error::EmptyField { field });
            }
        }

        for (field, value) in [
            ("heartbeat_interval", self.heartbeat_interval),
            ("data_fetch_interval", self.data_fetch_interval),
            ("auto_commit_interval", self.auto_commit_interval),
            ("metrics_report_interval", self.metrics_report_interval),
        ] {
            if value.is_zero() {
                return Err(Error::Zero { field });
            }
        }

        if self.max_io_workers == 0 {
            return Err(Error::Zero {
                field: "max_io_workers",
            });
        }
        if self.max_fetch_log_group_count == 0 {
            return Err(Error::Zero {
                field: "max_fetch_log_group_count",
            });
        }

        if self.query.as_deref().is_some_and(|q| q.trim().is_empty()) {
            return Err(Error::BlankQuery);
        }

        Ok(())
    }

    /// The active server-side query, if any.
    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// A valid configuration with placeholder identity, for tests.
    pub fn new_testing() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8080".to_owned(),
            project: "project".to_owned(),
            logstore: "logstore".to_owned(),
            consumer_group_name: "group".to_owned(),
            consumer_name: "consumer-1".to_owned(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults_are_not_valid_without_identity() {
        assert_eq!(
            ConsumerConfig::default().validate(),
            Err(Error::EmptyField { field: "endpoint" })
        );
        ConsumerConfig::new_testing().validate().unwrap();
    }

    #[test]
    fn rejects_zero_io_workers() {
        let config = ConsumerConfig {
            max_io_workers: 0,
            ..ConsumerConfig::new_testing()
        };
        assert_eq!(
            config.validate(),
            Err(Error::Zero {
                field: "max_io_workers"
            })
        );
    }

    #[test]
    fn rejects_blank_query() {
        let config = ConsumerConfig {
            query: Some("  ".to_owned()),
            ..ConsumerConfig::new_testing()
        };
        assert_eq!(config.validate(), Err(Error::BlankQuery));
    }

    #[test]
    fn errors_are_plain_values() {
        let err = ConsumerConfig {
            consumer_name: String::new(),
            ..ConsumerConfig::new_testing()
        }
        .validate()
        .unwrap_err();
        let copy = err;
        assert_eq!(copy, err);
        assert_eq!(err.to_string(), "consumer_name must not be empty");
    }

    #[test]
    fn deserialize_with_humantime_durations() {
        let config: ConsumerConfig = serde_json::from_str(
            r#"{
                "endpoint": "cn-hangzhou.log.example.com",
                "project": "p",
                "logstore": "l",
                "consumer_group_name": "g",
                "consumer_name": "c",
                "cursor_position": {"timestamp": 1700000000},
                "data_fetch_interval": "1s 500ms",
                "auto_commit_disabled": true
            }"#,
        )
        .unwrap();

        assert_eq!(config.cursor_position, CursorPosition::Timestamp(1700000000));
        assert_eq!(config.data_fetch_interval, Duration::from_millis(1500));
        assert!(config.auto_commit_disabled);
        // untouched fields keep their defaults
        assert_eq!(config.heartbeat_interval, Duration::from_secs(20));
        assert_eq!(config.max_io_workers, 50);
        config.validate().unwrap();
    }

    #[test]
    fn cursor_position_names() {
        let begin: CursorPosition = serde_json::from_str(r#""begin""#).unwrap();
        let end: CursorPosition = serde_json::from_str(r#""end""#).unwrap();
        assert_eq!(begin, CursorPosition::Begin);
        assert_eq!(end, CursorPosition::End);
    }
}
