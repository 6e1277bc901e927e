//! Tracing subscriber setup for the binary.
//!
//! Library code only emits `tracing` events; installing a subscriber is left
//! to whoever embeds the controller. The `rig_daq` binary calls
//! [`init_from_config`], which:
//! - filters by `application.log_level`, overridable through `RUST_LOG`
//! - prints to stdout in the chosen [`OutputFormat`]
//! - optionally mirrors plain-text output to `<log_dir>/log-<stamp>.log`
//!
//! # Example
//! ```no_run
//! use rig_daq::{config::RigConfig, logging};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RigConfig::load()?;
//! logging::init_from_config(&config)?;
//! tracing::info!(port = "/dev/ttyACM0", "Ready");
//! # Ok(())
//! # }
//! ```

use crate::config::RigConfig;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::Level;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Output format for console logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Multi-line, colored (for development)
    Pretty,
    /// Single-line, uncolored (for rigs left running unattended)
    Compact,
    /// JSON lines (for log aggregation)
    Json,
}

/// Tracing configuration options
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Most verbose level emitted unless `RUST_LOG` is set
    pub level: Level,
    /// Console output format
    pub format: OutputFormat,
    /// Whether to include file and line numbers
    pub with_file_and_line: bool,
    /// Whether to include thread names
    pub with_thread_names: bool,
    /// Only honoured by the pretty format
    pub with_ansi: bool,
    /// Plain-text log file, in addition to the console
    pub log_file: Option<PathBuf>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Compact,
            with_file_and_line: false,
            with_thread_names: true,
            with_ansi: true,
            log_file: None,
        }
    }
}

impl TracingConfig {
    /// Level and log file from the `application` and `storage` sections.
    pub fn from_rig_config(config: &RigConfig) -> Result<Self, String> {
        let level = parse_log_level(&config.application.log_level)?;
        let log_file = config.application.log_to_file.then(|| {
            let stamp = crate::storage::stamp(chrono::Local::now());
            config.storage.log_dir.join(format!("log-{stamp}.log"))
        });

        Ok(Self {
            level,
            log_file,
            ..Default::default()
        })
    }

    /// Defaults at `level`.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Set the console format.
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable colors.
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }

    /// Also write plain text to `path`.
    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }
}

/// Initialize tracing from the loaded configuration
pub fn init_from_config(config: &RigConfig) -> Result<(), String> {
    init(TracingConfig::from_rig_config(config)?)
}

/// Install the global subscriber.
///
/// Idempotent: if a subscriber is already installed this returns `Ok(())`,
/// so tests and embedding applications can call it freely.
pub fn init(config: TracingConfig) -> Result<(), String> {
    let mut layers: Vec<BoxedLayer> = vec![console_layer(&config)];

    if let Some(path) = &config.log_file {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create log directory: {}", e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| format!("Failed to open log file {}: {}", path.display(), e))?;

        layers.push(
            fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .with_filter(env_filter(config.level))
                .boxed(),
        );
    }

    tracing_subscriber::registry()
        .with(layers)
        .try_init()
        .or_else(|e| {
            if e
                .to_string()
                .contains("a global default trace dispatcher has already been set")
            {
                Ok(())
            } else {
                Err(format!("Failed to initialize tracing: {}", e))
            }
        })
}

fn console_layer(config: &TracingConfig) -> BoxedLayer {
    let filter = env_filter(config.level);
    match config.format {
        OutputFormat::Pretty => fmt::layer()
            .pretty()
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_thread_names(config.with_thread_names)
            .with_ansi(config.with_ansi)
            .with_filter(filter)
            .boxed(),
        OutputFormat::Compact => fmt::layer()
            .compact()
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_thread_names(config.with_thread_names)
            .with_ansi(false)
            .with_filter(filter)
            .boxed(),
        OutputFormat::Json => fmt::layer()
            .json()
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_thread_names(config.with_thread_names)
            .with_filter(filter)
            .boxed(),
    }
}

/// `RUST_LOG` wins over the configured level.
fn env_filter(level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()))
}

/// Parse log level string into tracing Level
fn parse_log_level(level: &str) -> Result<Level, String> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(format!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert!(matches!(parse_log_level("trace"), Ok(Level::TRACE)));
        assert!(matches!(parse_log_level("WARN"), Ok(Level::WARN)));
        assert!(matches!(parse_log_level("Debug"), Ok(Level::DEBUG)));
        assert!(parse_log_level("verbose").is_err());
    }

    #[test]
    fn test_tracing_config_from_rig_config() {
        let mut config = RigConfig::default();
        config.application.log_level = "debug".to_string();
        config.storage.log_dir = PathBuf::from("/var/log/rig");

        let tracing_config = TracingConfig::from_rig_config(&config).unwrap();
        assert_eq!(tracing_config.level, Level::DEBUG);
        assert!(tracing_config.log_file.is_none());

        config.application.log_to_file = true;
        let tracing_config = TracingConfig::from_rig_config(&config).unwrap();
        let log_file = tracing_config.log_file.unwrap();
        assert!(log_file.starts_with("/var/log/rig"));
        assert!(log_file.extension().is_some_and(|ext| ext == "log"));
    }

    #[test]
    fn test_tracing_config_builder() {
        let config = TracingConfig::new(Level::WARN)
            .with_format(OutputFormat::Json)
            .with_ansi(false)
            .with_log_file("/tmp/rig.log");

        assert_eq!(config.level, Level::WARN);
        assert_eq!(config.format, OutputFormat::Json);
        assert!(!config.with_ansi);
        assert_eq!(config.log_file, Some(PathBuf::from("/tmp/rig.log")));
    }
}
