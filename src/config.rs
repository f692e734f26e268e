//! Configuration module for the echo server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the echo server
#[derive(Parser, Debug)]
#[command(name = "tcp-echo")]
#[command(version = "0.1.0")]
#[command(about = "A TCP server that echoes every byte back to its sender", long_about = None)]
pub struct CliArgs {
    /// Port to listen on (default 443)
    #[arg(allow_negative_numbers = true)]
    pub port: Option<String>,

    /// Host or interface address to bind (default 0.0.0.0)
    pub host: Option<String>,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Listen backlog passed to the kernel
    #[arg(long)]
    pub backlog: Option<i32>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Close connections that stay silent this many seconds (0 = never)
    #[arg(long)]
    pub idle_timeout: Option<u64>,

    /// On shutdown, wait up to this many seconds for open connections (0 = don't wait)
    #[arg(long)]
    pub drain_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error; default info)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub connection: ConnectionSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Listener-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Number of worker threads
    pub workers: Option<usize>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            backlog: default_backlog(),
            workers: None,
        }
    }
}

/// Per-connection limits, both in seconds
#[derive(Debug, Deserialize, Default)]
pub struct ConnectionSection {
    #[serde(default)]
    pub idle_timeout: u64,
    #[serde(default)]
    pub drain_timeout: u64,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
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

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    443
}

fn default_backlog() -> i32 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Everything the listener and its connections need. Immutable once built.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub backlog: i32,
    pub idle_timeout: Option<Duration>,
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub workers: Option<usize>,
    pub drain_timeout: Option<Duration>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from the process arguments and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(std::env::args_os())
    }

    /// Parse an explicit argument list (program name first). Argument errors,
    /// including `--help` and `--version`, come back as `ConfigError::Args`.
    pub fn from_args<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        Self::from_cli(CliArgs::try_parse_from(args)?)
    }

    /// Merge parsed CLI args with the TOML file they point at, if any.
    /// CLI arguments take precedence over TOML file values.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let port = match cli.port {
            Some(ref text) => parse_port(text)?,
            None if toml_config.server.port == 0 => {
                return Err(ConfigError::InvalidPort("0".to_string()))
            }
            None => toml_config.server.port,
        };

        let idle_timeout = cli
            .idle_timeout
            .unwrap_or(toml_config.connection.idle_timeout);
        let drain_timeout = cli
            .drain_timeout
            .unwrap_or(toml_config.connection.drain_timeout);

        Ok(Config {
            server: ServerConfig {
                host: cli.host.unwrap_or(toml_config.server.host),
                port,
                backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
                idle_timeout: seconds(idle_timeout),
            },
            workers: cli.workers.or(toml_config.server.workers),
            drain_timeout: seconds(drain_timeout),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        })
    }
}

/// Parse a port argument. Zero is rejected since the server must listen
/// on a concrete, known port.
pub fn parse_port(text: &str) -> Result<u16, ConfigError> {
    match text.trim().parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(ConfigError::InvalidPort(text.to_string())),
    }
}

fn seconds(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid port number: {0}")]
    InvalidPort(String),
    #[error("{0}")]
    Args(#[from] clap::Error),
}

impl ConfigError {
    /// `--help` and `--version` surface as errors but are not failures.
    pub fn is_informational(&self) -> bool {
        matches!(self, ConfigError::Args(e) if e.exit_code() == 0)
    }
}
