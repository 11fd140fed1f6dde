//! # symkit Utilities
//!
//! Shared helpers for the symkit workspace, currently the `tracing`
//! subscriber setup used by the command-line tool.

pub mod logging;

pub use logging::{init_logging, init_logging_with_level, init_with, LogFormat, LogGuard, LogLevel, LoggingConfig, LoggingError};
pub use tracing::{debug, error, info, trace, warn};
