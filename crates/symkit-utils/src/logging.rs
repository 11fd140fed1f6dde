//! # Logging Utilities
//!
//! `tracing` setup shared by the symkit binaries.
//!
//! Diagnostics go to stderr so that command output on stdout stays clean,
//! and can additionally be written to a file in plain or JSON form.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use symkit_utils::init_logging;
//!
//! let _guard = init_logging().expect("Failed to initialize logging");
//! tracing::info!("resolving symbols");
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Filter directives (e.g. `RUST_LOG=debug`, `RUST_LOG=symkit_core::dwarf=trace`)
//! - `SYMKIT_LOG_FORMAT`: `pretty` (default) or `json`
//! - `SYMKIT_LOG_FILE`: Also log to this file, rotated daily; a directory gets `symkit.log.<date>` files

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::{env, io};

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::fmt::{self};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

const FORMAT_VAR: &str = "SYMKIT_LOG_FORMAT";
const FILE_VAR: &str = "SYMKIT_LOG_FILE";

/// How events are rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat
{
    /// Human-readable lines
    #[default]
    Pretty,
    /// One JSON object per event
    Json,
}

const FORMAT_NAMES: &[(&str, LogFormat)] = &[("pretty", LogFormat::Pretty), ("text", LogFormat::Pretty), ("json", LogFormat::Json)];

impl FromStr for LogFormat
{
    type Err = LoggingError;

    fn from_str(name: &str) -> Result<Self, Self::Err>
    {
        lookup_name(FORMAT_NAMES, name).ok_or_else(|| LoggingError::InvalidFormat(name.to_string()))
    }
}

/// Verbosity, least to most
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel
{
    Error,
    Warn,
    Info,
    Debug,
    /// Every decoded record; very noisy
    Trace,
}

const LEVEL_NAMES: &[(&str, LogLevel)] = &[
    ("error", LogLevel::Error),
    ("err", LogLevel::Error),
    ("warn", LogLevel::Warn),
    ("warning", LogLevel::Warn),
    ("info", LogLevel::Info),
    ("debug", LogLevel::Debug),
    ("dbg", LogLevel::Debug),
    ("trace", LogLevel::Trace),
];

impl From<LogLevel> for Level
{
    fn from(verbosity: LogLevel) -> Self
    {
        match verbosity {
            LogLevel::Error => Self::ERROR,
            LogLevel::Warn => Self::WARN,
            LogLevel::Info => Self::INFO,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Trace => Self::TRACE,
        }
    }
}

impl FromStr for LogLevel
{
    type Err = LoggingError;

    fn from_str(name: &str) -> Result<Self, Self::Err>
    {
        lookup_name(LEVEL_NAMES, name).ok_or_else(|| LoggingError::InvalidLevel(name.to_string()))
    }
}

fn lookup_name<T: Copy>(table: &[(&str, T)], name: &str) -> Option<T>
{
    table
        .iter()
        .find(|(known, _)| known.eq_ignore_ascii_case(name.trim()))
        .map(|&(_, value)| value)
}

/// Resolved logging settings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoggingConfig
{
    /// Overrides `RUST_LOG` when set
    pub level: Option<LogLevel>,
    pub format: LogFormat,
    pub file: Option<PathBuf>,
}

impl LoggingConfig
{
    /// Settings from `SYMKIT_LOG_FORMAT` and `SYMKIT_LOG_FILE`.
    ///
    /// ## Errors
    ///
    /// Returns [`LoggingError::InvalidFormat`] for an unknown format name.
    pub fn from_env() -> Result<Self, LoggingError>
    {
        let format = match env::var(FORMAT_VAR) {
            Ok(value) => value.parse()?,
            Err(_) => LogFormat::default(),
        };
        let file = env::var_os(FILE_VAR).filter(|value| !value.is_empty()).map(PathBuf::from);
        Ok(Self {
            level: None,
            format,
            file,
        })
    }

    /// Filter for one layer: the explicit level, else `RUST_LOG`, else `info`.
    fn filter(&self) -> EnvFilter
    {
        match self.level {
            Some(level) => EnvFilter::new(Level::from(level).to_string()),
            None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string())),
        }
    }
}

/// Keeps the file writer flushing; drop it at exit.
#[must_use = "file logging stops when the guard is dropped"]
#[derive(Debug, Default)]
pub struct LogGuard
{
    _file: Option<WorkerGuard>,
}

/// Initialize logging from the environment.
///
/// ## Errors
///
/// Returns an error if a variable holds an invalid value, the log file cannot
/// be opened, or a global subscriber is already installed.
pub fn init_logging() -> Result<LogGuard, LoggingError>
{
    init_with(&LoggingConfig::from_env()?)
}

/// Initialize logging with an explicit level and format. `SYMKIT_LOG_FILE`
/// is still honored.
///
/// ## Errors
///
/// Returns an error if the log file cannot be opened or a global subscriber
/// is already installed.
pub fn init_logging_with_level(level: LogLevel, format: LogFormat) -> Result<LogGuard, LoggingError>
{
    let file = env::var_os(FILE_VAR).filter(|value| !value.is_empty()).map(PathBuf::from);
    init_with(&LoggingConfig {
        level: Some(level),
        format,
        file,
    })
}

/// Install a global subscriber for `config`.
///
/// ## Errors
///
/// See [`init_logging`].
pub fn init_with(config: &LoggingConfig) -> Result<LogGuard, LoggingError>
{
    let console = event_layer(config.format, io::stderr, true).with_filter(config.filter());

    let (file_layer, guard) = match &config.file {
        Some(path) => {
            let (dir, name) = log_file_location(path);
            std::fs::create_dir_all(&dir)?;
            let appender = tracing_appender::rolling::daily(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = event_layer(config.format, writer, false).with_filter(config.filter());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    Registry::default()
        .with(console)
        .with(file_layer)
        .try_init()
        .map_err(|err| LoggingError::InitializationFailed(err.to_string()))?;
    Ok(LogGuard { _file: guard })
}

fn event_layer<S, W>(format: LogFormat, writer: W, ansi: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'span> LookupSpan<'span>,
    W: for<'writer> fmt::MakeWriter<'writer> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_timer(ChronoUtc::rfc_3339());
    match format {
        LogFormat::Pretty => layer.with_ansi(ansi).boxed(),
        LogFormat::Json => layer.json().with_current_span(true).with_span_list(true).boxed(),
    }
}

/// Directory and file-name prefix for `path`. A directory (existing, or
/// spelled with a trailing separator) gets `symkit.log`.
fn log_file_location(path: &Path) -> (PathBuf, PathBuf)
{
    let is_dir = path.is_dir() || path.as_os_str().to_string_lossy().ends_with(std::path::MAIN_SEPARATOR);
    match (is_dir, path.file_name()) {
        (false, Some(name)) => {
            let dir = path
                .parent()
                .filter(|parent| !parent.as_os_str().is_empty())
                .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
            (dir, PathBuf::from(name))
        }
        _ => (path.to_path_buf(), PathBuf::from("symkit.log")),
    }
}

/// Why the subscriber could not be installed
#[derive(Debug, thiserror::Error)]
pub enum LoggingError
{
    #[error("unknown log format `{0}` (expected pretty or json)")]
    InvalidFormat(String),

    #[error("unknown log level `{0}` (expected error, warn, info, debug or trace)")]
    InvalidLevel(String),

    #[error("a global subscriber is already set: {0}")]
    InitializationFailed(String),

    #[error("cannot open log file: {0}")]
    FileError(#[from] io::Error),
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_format_names()
    {
        for (name, expected) in [("pretty", LogFormat::Pretty), ("JSON", LogFormat::Json), (" text ", LogFormat::Pretty)] {
            assert_eq!(name.parse::<LogFormat>().unwrap(), expected, "{name}");
        }
        assert!(matches!(
            "xml".parse::<LogFormat>(),
            Err(LoggingError::InvalidFormat(value)) if value == "xml"
        ));
    }

    #[test]
    fn test_level_names_map_to_tracing()
    {
        let cases = [
            ("err", Level::ERROR),
            ("Warning", Level::WARN),
            ("info", Level::INFO),
            ("dbg", Level::DEBUG),
            ("TRACE", Level::TRACE),
        ];
        for (name, expected) in cases {
            let parsed: LogLevel = name.parse().unwrap();
            assert_eq!(Level::from(parsed), expected, "{name}");
        }
        assert!("loud".parse::<LogLevel>().is_err());
        assert!(LogLevel::Trace > LogLevel::Info);
    }

    #[test]
    fn test_log_file_location()
    {
        let (dir, name) = log_file_location(Path::new("logs/run.log"));
        assert_eq!(dir, PathBuf::from("logs"));
        assert_eq!(name, PathBuf::from("run.log"));

        let (dir, name) = log_file_location(Path::new("run.log"));
        assert_eq!(dir, PathBuf::from("."));
        assert_eq!(name, PathBuf::from("run.log"));

        let (dir, name) = log_file_location(&std::env::temp_dir());
        assert_eq!(dir, std::env::temp_dir());
        assert_eq!(name, PathBuf::from("symkit.log"));
    }
}
