use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, fmt};

use crate::Result;

static SUBSCRIBER: OnceLock<std::result::Result<(), String>> = OnceLock::new();

/// Logging settings loaded alongside the run configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive used when `RUST_LOG` is not set.
    pub level: String,
    /// Emit JSON records instead of the human-readable format.
    pub json: bool,
    /// When set, records go to `<directory>/<DD-Month-YYYY>.log` instead of stderr.
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
            directory: None,
        }
    }
}

impl LoggingConfig {
    /// Log file for the current day, if file output is configured.
    pub fn log_file(&self) -> Option<PathBuf> {
        self.directory
            .as_ref()
            .map(|dir| dir.join(format!("{}.log", Utc::now().format("%d-%B-%Y"))))
    }
}

#[derive(Debug, Serialize)]
pub struct LogEvent<'a> {
    pub filename: &'a str,
    pub timestamp: DateTime<Utc>,
    pub component: &'a str,
    pub function: &'a str,
    pub section: &'a str,
    pub line_num: u32,
    pub table: Option<&'a str>,
    pub error: Option<&'a str>,
    pub message: &'a str,
}

/// Initialize the tracing subscriber described by `config`.
///
/// Calling this function multiple times is safe; only the first invocation installs the
/// subscriber and later calls report the outcome of that first attempt.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let result = SUBSCRIBER.get_or_init(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

        let writer = match config.log_file() {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).map_err(|error| error.to_string())?;
                }
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .map_err(|error| error.to_string())?;
                BoxMakeWriter::new(Mutex::new(file))
            }
            None => BoxMakeWriter::new(std::io::stderr),
        };

        let builder = fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_target(false);

        if config.json {
            builder
                .json()
                .with_current_span(false)
                .with_span_list(false)
                .try_init()
                .map_err(|error| error.to_string())?;
        } else {
            builder.try_init().map_err(|error| error.to_string())?;
        }

        Ok(())
    });

    match result {
        Ok(()) => Ok(()),
        Err(message) => Err(anyhow!(message.clone())),
    }
}

/// Emit a structured log event. Events carrying an error are logged at error level.
#[allow(clippy::too_many_arguments)]
pub fn log_event(
    filename: &str,
    component: &str,
    function: &str,
    section: &str,
    line_num: u32,
    message: &str,
    error: Option<&str>,
    table: Option<&str>,
) {
    let event = LogEvent {
        filename,
        timestamp: Utc::now(),
        component,
        function,
        section,
        line_num,
        table,
        error,
        message,
    };

    let serialized = serde_json::to_string(&event);
    match (error, serialized) {
        (Some(_), Ok(serialized)) => error!(target: "featforge", json = %serialized),
        (Some(cause), Err(_)) => error!(target: "featforge", message, error = cause),
        (None, Ok(serialized)) => info!(target: "featforge", json = %serialized),
        (None, Err(_)) => info!(target: "featforge", message),
    }
}
