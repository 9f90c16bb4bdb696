// src/config.rs

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use thiserror::Error;

pub const MAX_MESSAGE_BYTES_CEILING: usize = 1024 * 1024;

/// Allowance for the envelope fields around `content` in one text frame.
const FRAME_OVERHEAD_BYTES: usize = 1024;

/// Longest accepted token lifetime.
pub const MAX_TOKEN_TTL_SECONDS: u64 = 365 * 24 * 60 * 60;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid listen_addr '{0}'")]
    ListenAddr(String),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("max_message_bytes must be at most {MAX_MESSAGE_BYTES_CEILING}")]
    MessageTooLarge,
    #[error("token_ttl_seconds must be at most {MAX_TOKEN_TTL_SECONDS}")]
    TokenTtlTooLarge,
    #[error("invalid cors origin '{0}'")]
    CorsOrigin(String),
}

/// What happens when a recipient's outbound queue is full.
#[derive(Deserialize, ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum SlowConsumerPolicy {
    /// Evict the oldest queued frame to make room.
    #[default]
    DropOldest,
    /// Close the recipient with a policy violation.
    Close,
}

#[derive(Deserialize, ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Process-wide server configuration.
#[derive(Deserialize, Clone, Debug)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub listen_addr: String,
    /// Empty or `*` means permissive.
    pub cors_origins: Vec<String>,
    pub token_ttl_seconds: u64,
    pub history_capacity: usize,
    pub send_queue_capacity: usize,
    pub idle_timeout_seconds: u64,
    pub max_message_bytes: usize,
    pub echo_own_broadcast: bool,
    pub slow_consumer_policy: SlowConsumerPolicy,
    pub credential_store_path: Option<PathBuf>,
    pub flush_deadline_ms: u64,
    pub handshake_timeout_seconds: u64,
    pub room_grace_seconds: u64,
    pub snapshot_interval_seconds: u64,
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: String::from("0.0.0.0:8080"),
            cors_origins: Vec::new(),
            token_ttl_seconds: 24 * 60 * 60,
            history_capacity: 100,
            send_queue_capacity: 256,
            idle_timeout_seconds: 120,
            max_message_bytes: 4 * 1024,
            echo_own_broadcast: false,
            slow_consumer_policy: SlowConsumerPolicy::DropOldest,
            credential_store_path: None,
            flush_deadline_ms: 2_000,
            handshake_timeout_seconds: 10,
            room_grace_seconds: 60,
            snapshot_interval_seconds: 30,
            log_format: LogFormat::Text,
        }
    }
}

impl Config {
    pub fn from_toml_str(raw: &str, path: PathBuf) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|source| ConfigError::Parse { path, source })
    }

    pub fn load_file(path: PathBuf) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        Self::from_toml_str(&raw, path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.socket_addr()?;
        let positive = [
            ("token_ttl_seconds", self.token_ttl_seconds as usize),
            ("history_capacity", self.history_capacity),
            ("send_queue_capacity", self.send_queue_capacity),
            ("idle_timeout_seconds", self.idle_timeout_seconds as usize),
            ("max_message_bytes", self.max_message_bytes),
            ("flush_deadline_ms", self.flush_deadline_ms as usize),
            ("handshake_timeout_seconds", self.handshake_timeout_seconds as usize),
            ("snapshot_interval_seconds", self.snapshot_interval_seconds as usize),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Zero(*name));
        }
        if self.max_message_bytes > MAX_MESSAGE_BYTES_CEILING {
            return Err(ConfigError::MessageTooLarge);
        }
        if self.token_ttl_seconds > MAX_TOKEN_TTL_SECONDS {
            return Err(ConfigError::TokenTtlTooLarge);
        }
        for origin in &self.cors_origins {
            if origin != "*" && axum::http::HeaderValue::from_str(origin).is_err() {
                return Err(ConfigError::CorsOrigin(origin.clone()));
            }
        }
        Ok(())
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen_addr
            .parse()
            .map_err(|_| ConfigError::ListenAddr(self.listen_addr.clone()))
    }

    pub fn cors_is_permissive(&self) -> bool {
        self.cors_origins.is_empty() || self.cors_origins.iter().any(|o| o == "*")
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_seconds)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }

    pub fn flush_deadline(&self) -> Duration {
        Duration::from_millis(self.flush_deadline_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_seconds)
    }

    pub fn room_grace(&self) -> Duration {
        Duration::from_secs(self.room_grace_seconds)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_seconds)
    }

    /// Largest text frame accepted before parsing: the content limit plus
    /// room for the other envelope fields.
    pub fn max_frame_bytes(&self) -> usize {
        self.max_message_bytes + FRAME_OVERHEAD_BYTES
    }

    /// Message limit handed to the WebSocket transport. Kept well above any
    /// configurable frame limit so oversized frames reach `parse_frame` and
    /// are answered in-band.
    pub fn max_transport_bytes(&self) -> usize {
        2 * (MAX_MESSAGE_BYTES_CEILING + FRAME_OVERHEAD_BYTES)
    }
}

/// Command line interface. Every flag can also be set from the environment
/// and overrides the config file.
#[derive(Parser, Debug, Default)]
#[command(name = "room_relay", version, about = "Multi-room WebSocket chat relay")]
pub struct Cli {
    /// TOML config file.
    #[arg(long, env = "ROOM_RELAY_CONFIG")]
    pub config: Option<PathBuf>,
    #[arg(long, env = "ROOM_RELAY_LISTEN_ADDR")]
    pub listen_addr: Option<String>,
    /// Comma separated list of allowed origins.
    #[arg(long, env = "ROOM_RELAY_CORS_ORIGINS", value_delimiter = ',')]
    pub cors_origins: Option<Vec<String>>,
    #[arg(long, env = "ROOM_RELAY_TOKEN_TTL_SECONDS")]
    pub token_ttl_seconds: Option<u64>,
    #[arg(long, env = "ROOM_RELAY_HISTORY_CAPACITY")]
    pub history_capacity: Option<usize>,
    #[arg(long, env = "ROOM_RELAY_SEND_QUEUE_CAPACITY")]
    pub send_queue_capacity: Option<usize>,
    #[arg(long, env = "ROOM_RELAY_IDLE_TIMEOUT_SECONDS")]
    pub idle_timeout_seconds: Option<u64>,
    #[arg(long, env = "ROOM_RELAY_MAX_MESSAGE_BYTES")]
    pub max_message_bytes: Option<usize>,
    #[arg(long, env = "ROOM_RELAY_ECHO_OWN_BROADCAST")]
    pub echo_own_broadcast: Option<bool>,
    #[arg(long, env = "ROOM_RELAY_SLOW_CONSUMER_POLICY", value_enum)]
    pub slow_consumer_policy: Option<SlowConsumerPolicy>,
    #[arg(long, env = "ROOM_RELAY_CREDENTIAL_STORE_PATH")]
    pub credential_store_path: Option<PathBuf>,
    #[arg(long, env = "ROOM_RELAY_LOG_FORMAT", value_enum)]
    pub log_format: Option<LogFormat>,
}

impl Cli {
    /// Resolves the final configuration: defaults, then the file, then flags.
    pub fn into_config(self) -> Result<Config, ConfigError> {
        let mut config = match self.config {
            Some(path) => Config::load_file(path)?,
            None => Config::default(),
        };
        if let Some(v) = self.listen_addr {
            config.listen_addr = v;
        }
        if let Some(v) = self.cors_origins {
            config.cors_origins = v;
        }
        if let Some(v) = self.token_ttl_seconds {
            config.token_ttl_seconds = v;
        }
        if let Some(v) = self.history_capacity {
            config.history_capacity = v;
        }
        if let Some(v) = self.send_queue_capacity {
            config.send_queue_capacity = v;
        }
        if let Some(v) = self.idle_timeout_seconds {
            config.idle_timeout_seconds = v;
        }
        if let Some(v) = self.max_message_bytes {
            config.max_message_bytes = v;
        }
        if let Some(v) = self.echo_own_broadcast {
            config.echo_own_broadcast = v;
        }
        if let Some(v) = self.slow_consumer_policy {
            config.slow_consumer_policy = v;
        }
        if let Some(v) = self.credential_store_path {
            config.credential_store_path = Some(v);
        }
        if let Some(v) = self.log_format {
            config.log_format = v;
        }
        config.validate()?;
        Ok(config)
    }
}
