//! CLI config for logging.

use thiserror::Error;
use tracing_subscriber::{
    EnvFilter,
    filter::ParseError,
    fmt,
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
};

/// Filter used when `--log-filter` is not given.
pub const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid log filter: {0}")]
    InvalidFilter(#[from] ParseError),

    #[error("failed to install the global log subscriber: {0}")]
    Install(#[from] TryInitError),
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// Human-readable, single line.
    #[default]
    Full,

    /// One JSON object per line.
    Json,
}

/// CLI config for the logging related subset of options.
#[derive(Debug, Clone, clap::Parser)]
pub struct LoggingArgs {
    /// Logs: filter directive
    ///
    /// Configures log severity level filter, by target.
    ///
    /// Simplest options: error, warn, info, debug, trace
    ///
    /// Levels for different modules can be specified. For example
    /// `debug,loghub_consumer::heartbeat=info` specifies debug logging for everything
    /// except the heartbeat, which only logs at info level.
    #[clap(long = "log-filter", env = "LOGHUB_LOG_FILTER", action)]
    pub log_filter: Option<String>,

    /// Logs: message format
    #[clap(
        long = "log-format",
        env = "LOGHUB_LOG_FORMAT",
        default_value_t = LogFormat::default(),
        value_enum,
        action
    )]
    pub log_format: LogFormat,
}

impl LoggingArgs {
    pub fn env_filter(&self) -> Result<EnvFilter, Error> {
        let directives = self.log_filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER);
        Ok(EnvFilter::try_new(directives)?)
    }

    /// Install the configured subscriber as the global default.
    ///
    /// Fails if a global subscriber is already installed.
    pub fn install_global_subscriber(&self) -> Result<(), Error> {
        let registry = tracing_subscriber::registry().with(self.env_filter()?);
        match self.log_format {
            LogFormat::Full => registry.with(fmt::layer()).try_init()?,
            LogFormat::Json => registry.with(fmt::layer().json()).try_init()?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use clap::Parser;

    use super::*;

    #[test]
    fn defaults() {
        let args = LoggingArgs::try_parse_from(["consumer"]).unwrap();
        assert_eq!(args.log_filter, None);
        assert_eq!(args.log_format, LogFormat::Full);
        args.env_filter().unwrap();
    }

    #[test]
    fn format_and_filter() {
        let args = LoggingArgs::try_parse_from([
            "consumer",
            "--log-format",
            "json",
            "--log-filter",
            "debug,loghub_consumer::heartbeat=warn",
        ])
        .unwrap();
        assert_eq!(args.log_format, LogFormat::Json);
        args.env_filter().unwrap();

        assert!(LoggingArgs::try_parse_from(["consumer", "--log-format", "xml"]).is_err());
    }

    #[test]
    fn invalid_filter() {
        let args = LoggingArgs {
            log_filter: Some("loghub_consumer=loudest".to_owned()),
            log_format: LogFormat::Full,
        };
        assert_matches!(args.env_filter(), Err(Error::InvalidFilter(_)));
    }
}
