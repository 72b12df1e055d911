use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

/// The full release name including the Tally version and, if available, the git revision.
pub const RELEASE: &str = std::env!("TALLY_RELEASE");

// Import CRATE_NAMES, which lists all crates in the workspace.
#[cfg(feature = "init")]
mod crates {
    include!(concat!(env!("OUT_DIR"), "/constants.gen.rs"));
}

/// Controls the log format.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect the best format.
    ///
    /// This chooses [`LogFormat::Pretty`] for TTY, otherwise [`LogFormat::Simplified`].
    Auto,

    /// Pretty printing with colors.
    ///
    /// ```text
    ///  INFO tally::setup: reporting metrics to 127.0.0.1:8125
    /// ```
    Pretty,

    /// Simplified plain text output.
    ///
    /// ```text
    /// 2024-12-04T12:10:32.000000Z  INFO tally::setup: reporting metrics to 127.0.0.1:8125
    /// ```
    Simplified,

    /// Dump out JSON lines.
    ///
    /// ```text
    /// {"timestamp":"2024-12-04T12:11:08.729716Z","level":"INFO","fields":{"message":"reporting metrics to 127.0.0.1:8125"},"target":"tally::setup"}
    /// ```
    Json,
}

/// The maximum level of log messages emitted by Tally's own crates.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Disables logging.
    Off,
    /// Only errors.
    Error,
    /// Errors and warnings.
    Warn,
    /// The default level.
    Info,
    /// Debugging output, such as processed events.
    Debug,
    /// Everything, including every emitted metric.
    Trace,
}

impl LogLevel {
    /// Returns the corresponding `tracing` level filter.
    pub fn level_filter(self) -> LevelFilter {
        match self {
            Self::Off => LevelFilter::OFF,
            Self::Error => LevelFilter::ERROR,
            Self::Warn => LevelFilter::WARN,
            Self::Info => LevelFilter::INFO,
            Self::Debug => LevelFilter::DEBUG,
            Self::Trace => LevelFilter::TRACE,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Off => "off",
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        })
    }
}

/// Error returned when parsing an invalid [`LogLevel`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ParseLogLevelError(String);

impl fmt::Display for ParseLogLevelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid log level '{}'", self.0)
    }
}

impl std::error::Error for ParseLogLevelError {}

impl FromStr for LogLevel {
    type Err = ParseLogLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "off" => Self::Off,
            "error" => Self::Error,
            "warn" | "warning" => Self::Warn,
            "info" => Self::Info,
            "debug" => Self::Debug,
            "trace" => Self::Trace,
            _ => return Err(ParseLogLevelError(s.to_owned())),
        })
    }
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    /// The log level for Tally.
    pub level: LogLevel,

    /// Controls the log output format.
    ///
    /// Defaults to [`LogFormat::Auto`], which detects the best format based on the TTY.
    pub format: LogFormat,

    /// When set to `true`, backtraces are forced on.
    ///
    /// Otherwise, backtraces can be enabled by setting the `RUST_BACKTRACE` variable to `full`.
    pub enable_backtraces: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Auto,
            enable_backtraces: false,
        }
    }
}

/// Builds the filter used when `RUST_LOG` is not set.
///
/// Third-party crates log at `INFO` at most, all of Tally's crates at the configured level.
#[cfg(feature = "init")]
fn default_filter(level: LogLevel) -> tracing_subscriber::EnvFilter {
    use tracing_subscriber::filter::Directive;

    let level = level.level_filter();
    let mut filter = tracing_subscriber::EnvFilter::default()
        .add_directive(Directive::from(LevelFilter::INFO.min(level)));

    for name in crates::CRATE_NAMES {
        if let Ok(directive) = format!("{name}={level}").parse::<Directive>() {
            filter = filter.add_directive(directive);
        }
    }

    filter
}

/// Initialize the logging system.
///
/// Calling this more than once has no effect; the first configuration stays active.
///
/// # Example
///
/// ```ignore
/// let log_config = tally_log::LogConfig {
///     enable_backtraces: true,
///     ..Default::default()
/// };
///
/// tally_log::init(&log_config);
/// ```
#[cfg(feature = "init")]
pub fn init(config: &LogConfig) {
    use tracing_subscriber::fmt::layer;
    use tracing_subscriber::prelude::*;

    if config.enable_backtraces {
        // SAFETY: called once during startup, before any other threads are spawned.
        unsafe { std::env::set_var("RUST_BACKTRACE", "full") };
    }

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter(config.level));

    let registry = tracing_subscriber::registry().with(filter);

    let result = match (config.format, console::user_attended()) {
        (LogFormat::Auto, true) | (LogFormat::Pretty, _) => registry
            .with(layer().with_target(true).with_ansi(true).compact())
            .try_init(),
        (LogFormat::Auto, false) | (LogFormat::Simplified, _) => {
            registry.with(layer().with_ansi(false)).try_init()
        }
        (LogFormat::Json, _) => registry.with(layer().json()).try_init(),
    };

    if result.is_ok() {
        crate::debug!("logging initialized for {RELEASE} at level {}", config.level);
    }
}
