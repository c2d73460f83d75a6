//! CLI config for a consumer group member.

use std::time::Duration;

use loghub_consumer::config::{self, ConsumerConfig, CursorPosition};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid cursor position {0:?}, expected begin, end or a unix timestamp in seconds")]
pub struct InvalidCursorPosition(String);

fn parse_cursor_position(s: &str) -> Result<CursorPosition, InvalidCursorPosition> {
    match s.trim() {
        "begin" => Ok(CursorPosition::Begin),
        "end" => Ok(CursorPosition::End),
        other => other
            .parse::<i64>()
            .map(CursorPosition::Timestamp)
            .map_err(|_| InvalidCursorPosition(s.to_owned())),
    }
}

/// CLI config for the consumer.
#[derive(Debug, Clone, clap::Parser)]
pub struct ConsumerArgs {
    /// Endpoint of the log service.
    #[clap(long = "endpoint", env = "LOGHUB_ENDPOINT", action)]
    pub endpoint: String,

    /// Project the logstore belongs to.
    #[clap(long = "project", env = "LOGHUB_PROJECT", action)]
    pub project: String,

    /// Logstore to consume.
    #[clap(long = "logstore", env = "LOGHUB_LOGSTORE", action)]
    pub logstore: String,

    /// Consumer group this consumer joins.
    #[clap(long = "consumer-group", env = "LOGHUB_CONSUMER_GROUP", action)]
    pub consumer_group_name: String,

    /// Name of this consumer within the group. Must be unique within the group.
    #[clap(long = "consumer-name", env = "LOGHUB_CONSUMER_NAME", action)]
    pub consumer_name: String,

    /// Where shards without a checkpoint start: `begin`, `end`, or a unix timestamp in
    /// seconds.
    #[clap(
        long = "cursor-position",
        env = "LOGHUB_CURSOR_POSITION",
        default_value = "begin",
        value_parser = parse_cursor_position,
        action
    )]
    pub cursor_position: CursorPosition,

    /// Interval of the consumer group heartbeat.
    #[clap(
        long = "heartbeat-interval",
        env = "LOGHUB_HEARTBEAT_INTERVAL",
        default_value = "20s",
        value_parser = humantime::parse_duration,
    )]
    pub heartbeat_interval: Duration,

    /// Minimum interval between fetches of a quiet shard.
    #[clap(
        long = "data-fetch-interval",
        env = "LOGHUB_DATA_FETCH_INTERVAL",
        default_value = "200ms",
        value_parser = humantime::parse_duration,
    )]
    pub data_fetch_interval: Duration,

    /// Number of log groups at which a shard is fetched again without delay.
    #[clap(
        long = "max-fetch-log-group-count",
        env = "LOGHUB_MAX_FETCH_LOG_GROUP_COUNT",
        default_value = "1000",
        action
    )]
    pub max_fetch_log_group_count: usize,

    /// Never flush checkpoints periodically, only when processors force it and at shutdown.
    #[clap(
        long = "auto-commit-disabled",
        env = "LOGHUB_AUTO_COMMIT_DISABLED",
        action
    )]
    pub auto_commit_disabled: bool,

    /// Interval of the periodic checkpoint flush.
    #[clap(
        long = "auto-commit-interval",
        env = "LOGHUB_AUTO_COMMIT_INTERVAL",
        default_value = "60s",
        value_parser = humantime::parse_duration,
    )]
    pub auto_commit_interval: Duration,

    /// Do not log per-shard statistics.
    #[clap(
        long = "disable-runtime-metrics",
        env = "LOGHUB_DISABLE_RUNTIME_METRICS",
        action
    )]
    pub disable_runtime_metrics: bool,

    /// Interval of the per-shard statistics log.
    #[clap(
        long = "metrics-report-interval",
        env = "LOGHUB_METRICS_REPORT_INTERVAL",
        default_value = "60s",
        value_parser = humantime::parse_duration,
    )]
    pub metrics_report_interval: Duration,

    /// Maximum number of concurrent pulls across all shards.
    #[clap(
        long = "max-io-workers",
        env = "LOGHUB_MAX_IO_WORKERS",
        default_value = "50",
        action
    )]
    pub max_io_workers: usize,

    /// Server-side query applied to every pull.
    #[clap(long = "query", env = "LOGHUB_QUERY", action)]
    pub query: Option<String>,
}

impl TryFrom<ConsumerArgs> for ConsumerConfig {
    type Error = config::Error;

    fn try_from(args: ConsumerArgs) -> Result<Self, Self::Error> {
        let config = Self {
            endpoint: args.endpoint,
            project: args.project,
            logstore: args.logstore,
            consumer_group_name: args.consumer_group_name,
            consumer_name: args.consumer_name,
            cursor_position: args.cursor_position,
            heartbeat_interval: args.heartbeat_interval,
            data_fetch_interval: args.data_fetch_interval,
            max_fetch_log_group_count: args.max_fetch_log_group_count,
            auto_commit_disabled: args.auto_commit_disabled,
            auto_commit_interval: args.auto_commit_interval,
            disable_runtime_metrics: args.disable_runtime_metrics,
            metrics_report_interval: args.metrics_report_interval,
            max_io_workers: args.max_io_workers,
            query: args.query,
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use clap::Parser;

    use super::*;

    const REQUIRED: [&str; 11] = [
        "consumer",
        "--endpoint",
        "http://localhost:8080",
        "--project",
        "p",
        "--logstore",
        "access-log",
        "--consumer-group",
        "g",
        "--consumer-name",
        "c-1",
    ];

    fn parse(extra: &[&str]) -> ConsumerArgs {
        ConsumerArgs::try_parse_from(REQUIRED.iter().chain(extra)).unwrap()
    }

    #[test]
    fn defaults_match_config_defaults() {
        let config = ConsumerConfig::try_from(parse(&[])).unwrap();
        assert_eq!(
            config,
            ConsumerConfig {
                endpoint: "http://localhost:8080".to_owned(),
                project: "p".to_owned(),
                logstore: "access-log".to_owned(),
                consumer_group_name: "g".to_owned(),
                consumer_name: "c-1".to_owned(),
                ..Default::default()
            }
        );
    }

    #[test]
    fn overrides() {
        let config = ConsumerConfig::try_from(parse(&[
            "--cursor-position",
            "1700000000",
            "--data-fetch-interval",
            "1s",
            "--auto-commit-disabled",
            "--max-io-workers",
            "4",
            "--query",
            "* | where status = 500",
        ]))
        .unwrap();

        assert_eq!(config.cursor_position, CursorPosition::Timestamp(1_700_000_000));
        assert_eq!(config.data_fetch_interval, Duration::from_secs(1));
        assert!(config.auto_commit_disabled);
        assert_eq!(config.max_io_workers, 4);
        assert_eq!(config.query(), Some("* | where status = 500"));
    }

    #[test]
    fn cursor_positions() {
        assert_eq!(parse_cursor_position("begin"), Ok(CursorPosition::Begin));
        assert_eq!(parse_cursor_position("end"), Ok(CursorPosition::End));
        assert_eq!(
            parse_cursor_position("-5"),
            Ok(CursorPosition::Timestamp(-5))
        );
        assert_eq!(
            parse_cursor_position("yesterday"),
            Err(InvalidCursorPosition("yesterday".to_owned()))
        );
        assert!(
            ConsumerArgs::try_parse_from(REQUIRED.iter().chain(&["--cursor-position", "later"]))
                .is_err()
        );
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = ConsumerConfig::try_from(parse(&["--max-io-workers", "0"])).unwrap_err();
        assert_matches!(err, config::Error::Zero { field: "max_io_workers" });

        let err = ConsumerConfig::try_from(parse(&["--query", " "])).unwrap_err();
        assert_matches!(err, config::Error::BlankQuery);

        assert!(
            ConsumerArgs::try_parse_from(REQUIRED.iter().chain(&["--heartbeat-interval", "soon"]))
                .is_err()
        );
    }
}
