use std::{env, net::SocketAddr, str::FromStr};

use dockside_core::{Boat, Booking, PolicyError, SecurityPolicy};
use serde::{de::Error as DeError, Deserialize, Deserializer, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid bind address: {0}")]
    InvalidBindAddr(String),
    #[error("invalid messaging policy: {0}")]
    Policy(#[from] PolicyError),
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub bind_addr: Option<String>,
}

/// Boats and bookings served when no database is configured.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct DirectoryFixtures {
    pub boats: Vec<Boat>,
    pub bookings: Vec<Booking>,
}

impl DirectoryFixtures {
    pub fn is_empty(&self) -> bool {
        self.boats.is_empty() && self.bookings.is_empty()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: Option<String>,
    pub host: String,
    pub port: u16,
    pub log_format: LogFormat,
    pub metrics: MetricsConfig,
    pub database_url: Option<String>,
    pub messaging: SecurityPolicy,
    pub fixtures: DirectoryFixtures,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: None,
            host: "0.0.0.0".to_string(),
            port: 8080,
            log_format: LogFormat::Compact,
            metrics: MetricsConfig::default(),
            database_url: None,
            messaging: SecurityPolicy::default(),
            fixtures: DirectoryFixtures::default(),
        }
    }
}

/// Values supplied on the command line; they win over files and environment.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub bind_addr: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub log_format: Option<LogFormat>,
    pub metrics_enabled: Option<bool>,
    pub metrics_bind_addr: Option<String>,
    pub database_url: Option<String>,
    pub burst_max_messages: Option<usize>,
    pub burst_window_secs: Option<u64>,
    pub sustained_max_messages: Option<usize>,
    pub sustained_window_secs: Option<u64>,
}

impl ServerConfig {
    const ENV_PREFIX: &'static str = "DOCKSIDE_SERVER";
    pub const DEFAULT_PATH: &'static str = "config/server";

    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Self::DEFAULT_PATH)
    }

    /// Loads `<base>` and `<base>.local` (any format the `config` crate
    /// recognises), then `DOCKSIDE_SERVER__*` variables.
    pub fn load_from(base: &str) -> Result<Self, ConfigError> {
        let defaults = ServerConfig::default();
        let policy = &defaults.messaging;

        let builder = config::Config::builder()
            .add_source(config::File::with_name(base).required(false))
            .add_source(config::File::with_name(&format!("{base}.local")).required(false))
            .add_source(
                config::Environment::with_prefix(Self::ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .set_default("host", defaults.host.clone())?
            .set_default("port", defaults.port as i64)?
            .set_default("log_format", defaults.log_format.as_str())?
            .set_default("metrics.enabled", defaults.metrics.enabled)?
            .set_default(
                "messaging.rate_limit.burst.max_attempts",
                policy.rate_limit.burst.max_attempts as i64,
            )?
            .set_default(
                "messaging.rate_limit.burst.window_secs",
                policy.rate_limit.burst.window_secs as i64,
            )?
            .set_default(
                "messaging.rate_limit.sustained.max_attempts",
                policy.rate_limit.sustained.max_attempts as i64,
            )?
            .set_default(
                "messaging.rate_limit.sustained.window_secs",
                policy.rate_limit.sustained.window_secs as i64,
            )?;

        let settings: ServerConfig = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Names of `DOCKSIDE_SERVER__*` variables present in the environment.
    pub fn environment_override_keys() -> Vec<String> {
        let prefix = format!("{}__", Self::ENV_PREFIX);
        let mut keys: Vec<String> = env::vars()
            .filter_map(|(key, _)| key.strip_prefix(&prefix).map(str::to_owned))
            .collect();
        keys.sort();
        keys
    }

    pub fn apply_overrides(&mut self, overrides: &CliOverrides) -> Result<(), ConfigError> {
        if let Some(bind_addr) = &overrides.bind_addr {
            self.bind_addr = Some(bind_addr.clone());
        }
        if let Some(host) = &overrides.host {
            self.host = host.clone();
        }
        if let Some(port) = overrides.port {
            self.port = port;
        }
        if let Some(log_format) = overrides.log_format {
            self.log_format = log_format;
        }
        if let Some(enabled) = overrides.metrics_enabled {
            self.metrics.enabled = enabled;
        }
        if let Some(addr) = &overrides.metrics_bind_addr {
            self.metrics.bind_addr = Some(addr.clone());
        }
        if let Some(url) = &overrides.database_url {
            self.database_url = Some(url.clone());
        }

        let limits = &mut self.messaging.rate_limit;
        if let Some(max) = overrides.burst_max_messages {
            limits.burst.max_attempts = max;
        }
        if let Some(secs) = overrides.burst_window_secs {
            limits.burst.window_secs = secs;
        }
        if let Some(max) = overrides.sustained_max_messages {
            limits.sustained.max_attempts = max;
        }
        if let Some(secs) = overrides.sustained_window_secs {
            limits.sustained.window_secs = secs;
        }

        self.validate()
    }

    pub fn listener_addr(&self) -> Result<SocketAddr, ConfigError> {
        if let Some(addr) = &self.bind_addr {
            return addr
                .parse()
                .map_err(|_| ConfigError::InvalidBindAddr(addr.clone()));
        }

        let addr = format!("{}:{}", self.host, self.port);
        addr.parse().map_err(|_| ConfigError::InvalidBindAddr(addr))
    }

    pub fn log_format(&self) -> LogFormat {
        self.log_format
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidBindAddr("port cannot be zero".into()));
        }
        if let Some(addr) = &self.metrics.bind_addr {
            addr.parse::<SocketAddr>()
                .map_err(|_| ConfigError::InvalidBindAddr(addr.clone()))?;
        }
        self.messaging.validate()?;
        Ok(())
    }
}

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Compact => "compact",
            LogFormat::Json => "json",
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "compact" => Ok(LogFormat::Compact),
            other => Err(format!("unsupported log format '{other}'")),
        }
    }
}

impl<'de> Deserialize<'de> for LogFormat {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        LogFormat::from_str(&value).map_err(D::Error::custom)
    }
}
