//! Configuration module for txn-server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::connection::ConnSettings;
use crate::frame::FrameTimeouts;
use clap::Parser;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Listen address used when none is configured.
pub const DEFAULT_LISTEN: &str = ":8080";

/// Bound on one whole connection cycle.
pub const DEFAULT_CONN_TIMEOUT: Duration = Duration::from_secs(30);

/// Budget for reading the length header (and the body, unless set apart).
pub const DEFAULT_READ_HEADER_TIMEOUT: Duration = Duration::from_secs(5);

/// Budget for writing one response frame.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Command-line arguments for the transaction server
#[derive(Parser, Debug)]
#[command(name = "txn-server")]
#[command(author = "txn-server authors")]
#[command(version = "0.1.0")]
#[command(about = "A framed TCP transaction server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:8080 or :8080)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error) [default: info]
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub timeouts: TimeoutsSection,
    #[serde(default)]
    pub logging: LoggingSection,
    /// Transaction code to handler name.
    #[serde(default = "default_routes")]
    pub routes: BTreeMap<String, String>,
}

impl Default for TomlConfig {
    fn default() -> Self {
        Self {
            server: ServerSection::default(),
            timeouts: TimeoutsSection::default(),
            logging: LoggingSection::default(),
            routes: default_routes(),
        }
    }
}

/// `[server]` section
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of worker threads
    pub workers: Option<usize>,
    /// Pause between listener restarts, in milliseconds
    #[serde(default)]
    pub restart_delay_ms: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: None,
            restart_delay_ms: 0,
        }
    }
}

/// `[timeouts]` section. Zero means "use the default".
#[derive(Debug, Deserialize, Default)]
pub struct TimeoutsSection {
    #[serde(default)]
    pub conn_ms: u64,
    #[serde(default)]
    pub read_header_ms: u64,
    /// Zero keeps the body read under the header deadline.
    #[serde(default)]
    pub read_body_ms: u64,
    #[serde(default)]
    pub write_ms: u64,
}

/// `[logging]` section
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    DEFAULT_LISTEN.to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_routes() -> BTreeMap<String, String> {
    BTreeMap::from([("1001".to_string(), "p1001".to_string())])
}

/// Listener and per-connection timing settings.
///
/// Zero durations are not separately set; the accessors substitute the
/// defaults on use. The value is never modified once serving starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerConfig {
    /// Listen address; empty means [`DEFAULT_LISTEN`].
    pub listen: String,
    pub conn_timeout: Duration,
    pub read_header_timeout: Duration,
    /// Zero keeps the body read under the header deadline.
    pub read_body_timeout: Duration,
    pub write_timeout: Duration,
    /// Pause between serve cycles after a listener failure.
    pub restart_delay: Duration,
}

impl ServerConfig {
    /// All defaults, listening on `listen`.
    pub fn new(listen: impl Into<String>) -> Self {
        Self {
            listen: listen.into(),
            ..Self::default()
        }
    }

    /// Bindable form of the listen address.
    ///
    /// The `:port` shorthand means every IPv4 interface (`0.0.0.0:port`).
    /// Listening on IPv6 needs an explicit address such as `[::]:8080`.
    pub fn listen_addr(&self) -> String {
        let listen = if self.listen.is_empty() {
            DEFAULT_LISTEN
        } else {
            self.listen.as_str()
        };
        match listen.strip_prefix(':') {
            Some(port) => format!("0.0.0.0:{port}"),
            None => listen.to_string(),
        }
    }

    pub fn conn_timeout(&self) -> Duration {
        or_default(self.conn_timeout, DEFAULT_CONN_TIMEOUT)
    }

    pub fn read_header_timeout(&self) -> Duration {
        or_default(self.read_header_timeout, DEFAULT_READ_HEADER_TIMEOUT)
    }

    /// `None` when the body shares the header deadline.
    pub fn read_body_timeout(&self) -> Option<Duration> {
        (!self.read_body_timeout.is_zero()).then_some(self.read_body_timeout)
    }

    pub fn write_timeout(&self) -> Duration {
        or_default(self.write_timeout, DEFAULT_WRITE_TIMEOUT)
    }

    /// Settings handed to every connection task.
    pub fn conn_settings(&self) -> ConnSettings {
        ConnSettings {
            conn_timeout: self.conn_timeout(),
            frame: FrameTimeouts {
                header: self.read_header_timeout(),
                body: self.read_body_timeout(),
                write: self.write_timeout(),
            },
        }
    }
}

fn or_default(value: Duration, default: Duration) -> Duration {
    if value.is_zero() {
        default
    } else {
        value
    }
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub workers: Option<usize>,
    pub log_level: String,
    pub routes: BTreeMap<String, String>,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Resolve already parsed CLI args against the optional TOML file.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Self::merge(cli, toml_config))
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let timeouts = &toml_config.timeouts;
        Config {
            server: ServerConfig {
                listen: cli.listen.unwrap_or(toml_config.server.listen),
                conn_timeout: Duration::from_millis(timeouts.conn_ms),
                read_header_timeout: Duration::from_millis(timeouts.read_header_ms),
                read_body_timeout: Duration::from_millis(timeouts.read_body_ms),
                write_timeout: Duration::from_millis(timeouts.write_ms),
                restart_delay: Duration::from_millis(toml_config.server.restart_delay_ms),
            },
            workers: cli.workers.or(toml_config.server.workers),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
            routes: toml_config.routes,
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
}
