//! # Observability
//!
//! Logging initialisation for the relay services.
//!
//! Services call [`init`] or [`init_with_config`] once at startup and use the
//! standard `tracing` macros everywhere else. Every state transition in the
//! relay layer is logged with `correlation_id`, `operation` and `state`
//! fields, so the JSON format is the one to use in production: the log stream
//! is the only introspection surface the relay exposes.
//!
//! ```rust,ignore
//! fn main() {
//!     observability::init_with_config(observability::LogConfig {
//!         service_name: "relay".into(),
//!         default_level: "debug".into(),
//!         format: observability::LogFormat::Json,
//!         ..Default::default()
//!     })
//!     .ok();
//! }
//! ```

mod file_writer;

use std::io;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

pub use file_writer::{FileLogWriter, FileWriterFactory};

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line.
    Json,
    /// Human readable single-line output.
    Compact,
}

impl LogFormat {
    /// Parse `json` or `compact`/`pretty` (case-insensitive).
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "json" => Some(LogFormat::Json),
            "compact" | "pretty" => Some(LogFormat::Compact),
            _ => None,
        }
    }
}

/// Logging setup for one relay process.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Name of the service, written in the startup line.
    pub service_name: String,

    /// Filter used when `RUST_LOG` is unset, e.g. `info` or `relay_daemon=debug`.
    pub default_level: String,

    /// Format of the primary output.
    pub format: LogFormat,

    /// Optional JSONL file that receives every log line in addition to the
    /// primary output.
    pub log_path: Option<PathBuf>,

    /// Write the primary output to stderr rather than stdout, keeping stdout
    /// free for command output.
    pub use_stderr: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".into(),
            default_level: "info".into(),
            format: LogFormat::Compact,
            log_path: None,
            use_stderr: false,
        }
    }
}

/// Initialize logging with default settings for `service_name`.
pub fn init(service_name: &str) -> io::Result<()> {
    init_with_config(LogConfig {
        service_name: service_name.into(),
        ..Default::default()
    })
}

/// Initialize logging with custom configuration.
///
/// Fails if the log file cannot be opened or a global subscriber is already
/// installed.
pub fn init_with_config(config: LogConfig) -> io::Result<()> {
    let filter = build_filter(&config.default_level);

    let primary = match (config.format, config.use_stderr) {
        (LogFormat::Json, true) => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_writer(io::stderr)
            .boxed(),
        (LogFormat::Json, false) => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .boxed(),
        (LogFormat::Compact, true) => tracing_subscriber::fmt::layer()
            .with_target(true)
            .compact()
            .with_writer(io::stderr)
            .boxed(),
        (LogFormat::Compact, false) => tracing_subscriber::fmt::layer()
            .with_target(true)
            .compact()
            .boxed(),
    };

    let file_layer = match &config.log_path {
        Some(path) => {
            let writer = FileLogWriter::open(path)?;
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_ansi(false)
                    .with_writer(FileWriterFactory::new(writer)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(primary.with_filter(filter))
        .with(file_layer.map(|layer| layer.with_filter(build_filter(&config.default_level))))
        .try_init()
        .map_err(io::Error::other)?;

    tracing::info!(
        service = %config.service_name,
        pid = std::process::id(),
        format = ?config.format,
        "Logging initialized"
    );

    Ok(())
}

fn build_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

pub use tracing::{debug, error, info, instrument, trace, warn};
