//! Configuration module for the fanout relay.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values. With no
//! arguments at all the relay listens on port 1234 with 2048-byte reads.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments for the relay
#[derive(Parser, Debug)]
#[command(name = "fanout-relay")]
#[command(author = "fanout-relay authors")]
#[command(version = "0.1.0")]
#[command(about = "Broadcasts every received chunk to all other connected clients", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:1234)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Runtime backend
    #[arg(short = 'r', long, value_enum)]
    pub runtime: Option<RuntimeType>,

    /// Maximum number of simultaneous clients (unlimited when unset)
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Maximum bytes taken from a client per read
    #[arg(long)]
    pub read_chunk: Option<usize>,

    /// Maximum bytes queued for a slow client before it is disconnected
    #[arg(long)]
    pub outbound_limit: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Event loop implementation used to serve clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    /// Single-threaded readiness loop (epoll on Linux, kqueue on macOS).
    Mio,
    /// Tokio tasks on a current-thread runtime with a hub task.
    Tasks,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Runtime backend
    #[serde(default = "default_runtime")]
    pub runtime: RuntimeType,
    /// Connection cap
    pub max_connections: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            runtime: default_runtime(),
            max_connections: None,
        }
    }
}

/// Relay behaviour configuration
#[derive(Debug, Deserialize)]
pub struct RelayConfig {
    /// Bytes per read
    #[serde(default = "default_read_chunk")]
    pub read_chunk: usize,
    /// Reads per readiness event before yielding to other clients
    #[serde(default = "default_read_budget")]
    pub read_budget: usize,
    /// Per-connection outbound byte limit
    #[serde(default = "default_outbound_limit")]
    pub outbound_limit: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            read_chunk: default_read_chunk(),
            read_budget: default_read_budget(),
            outbound_limit: default_outbound_limit(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:1234".to_string()
}

fn default_runtime() -> RuntimeType {
    RuntimeType::Mio
}

fn default_read_chunk() -> usize {
    2048
}

fn default_read_budget() -> usize {
    16
}

fn default_outbound_limit() -> usize {
    1024 * 1024 // 1 MB
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub runtime: RuntimeType,
    pub max_connections: Option<usize>,
    pub read_chunk: usize,
    pub read_budget: usize,
    pub outbound_limit: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::parse_from(["fanout-relay"]), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            runtime: cli.runtime.unwrap_or(toml_config.server.runtime),
            max_connections: cli.max_connections.or(toml_config.server.max_connections),
            read_chunk: cli.read_chunk.unwrap_or(toml_config.relay.read_chunk),
            read_budget: toml_config.relay.read_budget,
            outbound_limit: cli
                .outbound_limit
                .unwrap_or(toml_config.relay.outbound_limit),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }

    /// Reject values the runtime cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.read_chunk == 0 {
            return Err(ConfigError::Invalid("read_chunk must be at least 1"));
        }
        if self.read_budget == 0 {
            return Err(ConfigError::Invalid("read_budget must be at least 1"));
        }
        if self.outbound_limit < self.read_chunk {
            return Err(ConfigError::Invalid(
                "outbound_limit must be at least read_chunk",
            ));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}
