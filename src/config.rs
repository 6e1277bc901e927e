//! Configuration System using Figment
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. Built-in defaults (`RigConfig::default()`)
//! 2. A TOML file (`config/rig_daq.toml` unless another path is given)
//! 3. Environment variables prefixed with `RIG_DAQ_`, nested with `__`
//!
//! # Example
//! ```no_run
//! use rig_daq::config::RigConfig;
//!
//! let config = RigConfig::load()?;
//! println!("Serving on {}", config.http.bind);
//! # Ok::<(), figment::Error>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/rig_daq.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RigConfig {
    /// Name, log level and log file
    pub application: ApplicationConfig,
    /// Serial link parameters
    pub serial: SerialConfig,
    /// Worker timing
    pub session: SessionConfig,
    /// Data and log directories
    pub storage: StorageConfig,
    /// Control plane listener
    pub http: HttpConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Shown in the control plane banner
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Mirror log output into `storage.log_dir`
    pub log_to_file: bool,
}

/// Serial link timing.
///
/// The settle delays give the microcontroller time to reboot after the
/// port is (re)opened; an Arduino resets on DTR.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SerialConfig {
    /// Must match the rig firmware
    pub baud_rate: u32,
    /// Pause between closing and reopening an already-open port
    pub reopen_settle_ms: u64,
    /// Pause after opening, before the `LINK` handshake
    pub handshake_settle_ms: u64,
    /// Pause after `UNLINK`, before flushing and closing
    pub unlink_grace_ms: u64,
    /// Upper bound on any single write or flush
    pub io_timeout_ms: u64,
    /// Back-off after a failed or empty read
    pub read_retry_ms: u64,
}

/// Session worker timing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Limit monitor poll interval
    pub monitor_interval_ms: u64,
    /// Queue consumer wake-up interval when no lines arrive
    pub queue_poll_ms: u64,
    /// Upper bound on joining a worker during teardown
    pub join_timeout_ms: u64,
}

/// Data and log locations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Default root for per-session data folders
    pub data_dir: PathBuf,
    /// Default directory for event logs and the application log
    pub log_dir: PathBuf,
}

/// HTTP control plane
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HttpConfig {
    /// Listen address
    pub bind: SocketAddr,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "rig_daq".to_string(),
            log_level: "info".to_string(),
            log_to_file: false,
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            reopen_settle_ms: 1000,
            handshake_settle_ms: 2000,
            unlink_grace_ms: 500,
            io_timeout_ms: 2000,
            read_retry_ms: 100,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            monitor_interval_ms: 100,
            queue_poll_ms: 1000,
            join_timeout_ms: 5000,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let root = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("rig_daq");
        Self {
            data_dir: root.join("DATA"),
            log_dir: root.join("LOG"),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 6229)),
        }
    }
}

impl SerialConfig {
    /// [`reopen_settle_ms`](Self::reopen_settle_ms) as a `Duration`.
    pub fn reopen_settle(&self) -> Duration {
        Duration::from_millis(self.reopen_settle_ms)
    }

    /// [`handshake_settle_ms`](Self::handshake_settle_ms) as a `Duration`.
    pub fn handshake_settle(&self) -> Duration {
        Duration::from_millis(self.handshake_settle_ms)
    }

    /// [`unlink_grace_ms`](Self::unlink_grace_ms) as a `Duration`.
    pub fn unlink_grace(&self) -> Duration {
        Duration::from_millis(self.unlink_grace_ms)
    }

    /// [`io_timeout_ms`](Self::io_timeout_ms) as a `Duration`.
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    /// [`read_retry_ms`](Self::read_retry_ms) as a `Duration`.
    pub fn read_retry(&self) -> Duration {
        Duration::from_millis(self.read_retry_ms)
    }
}

impl SessionConfig {
    /// [`monitor_interval_ms`](Self::monitor_interval_ms) as a `Duration`.
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    /// [`queue_poll_ms`](Self::queue_poll_ms) as a `Duration`.
    pub fn queue_poll(&self) -> Duration {
        Duration::from_millis(self.queue_poll_ms)
    }

    /// [`join_timeout_ms`](Self::join_timeout_ms) as a `Duration`.
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

impl RigConfig {
    /// Load configuration from the default file and environment variables
    ///
    /// A missing file is not an error; defaults and environment still apply.
    /// Example override: `RIG_DAQ_SERIAL__BAUD_RATE=9600`
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Self::figment(path.as_ref()).extract()
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(RigConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("RIG_DAQ_").split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.serial.baud_rate == 0 {
            return Err("Invalid baud_rate 0".to_string());
        }

        if self.session.monitor_interval_ms == 0 {
            return Err("monitor_interval_ms must be greater than 0".to_string());
        }

        if self.session.queue_poll_ms == 0 {
            return Err("queue_poll_ms must be greater than 0".to_string());
        }

        Ok(())
    }

    /// Configuration with all settle delays removed, for tests and simulators.
    pub fn without_settle_delays(mut self) -> Self {
        self.serial.reopen_settle_ms = 0;
        self.serial.handshake_settle_ms = 0;
        self.serial.unlink_grace_ms = 0;
        self
    }
}
