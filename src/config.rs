//! # Settings File
//!
//! Loads the application settings from `<config dir>/mqttdemo/config.toml`. A
//! missing file is created with the defaults on first start, so the demo can be
//! launched without any preparation and then edited in place.
//!
//! ```toml
//! [broker]
//! host = "tf01696e.ala.cn-hangzhou.emqxsl.cn"
//! port = 8883
//! topic = "test/topic/from/android"
//! username = ""
//! password = ""
//!
//! [session]
//! message_log_capacity = 500   # omit for an unbounded log
//!
//! [logging]
//! level = "info"
//! ```
//!
//! `MQTTDEMO_USERNAME` and `MQTTDEMO_PASSWORD` override the credentials from the
//! file, which keeps secrets out of the settings file if preferred.

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, Level};

use crate::mqtt::config::{SessionConfig, TlsMode};

const CONFIG_DIR: &str = "mqttdemo";
const CONFIG_FILE: &str = "config.toml";
const USERNAME_ENV: &str = "MQTTDEMO_USERNAME";
const PASSWORD_ENV: &str = "MQTTDEMO_PASSWORD";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("No configuration directory available on this platform")]
    NoConfigDir,

    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid setting: {0}")]
    Invalid(String),
}

/// Broker endpoint and connection behaviour
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub topic: String,
    pub username: String,
    pub password: String,
    pub client_id_prefix: String,
    pub keep_alive_secs: u64,
    pub clean_session: bool,
    pub auto_reconnect: bool,
    pub reconnect_delay_ms: u64,
    pub tls: TlsMode,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            host: "tf01696e.ala.cn-hangzhou.emqxsl.cn".to_string(),
            port: 8883,
            topic: "test/topic/from/android".to_string(),
            username: String::new(),
            password: String::new(),
            client_id_prefix: "mqttdemo".to_string(),
            keep_alive_secs: 60,
            clean_session: true,
            auto_reconnect: true,
            reconnect_delay_ms: 5000,
            tls: TlsMode::Auto,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct SessionSettings {
    /// Keep at most this many received messages; unbounded when absent
    pub message_log_capacity: Option<usize>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub broker: BrokerSettings,
    pub session: SessionSettings,
    pub logging: LoggingSettings,
}

impl AppConfig {
    /// `<config dir>/mqttdemo/config.toml`
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let mut path = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        Ok(path)
    }

    /// Writes the default settings to `path` unless a file is already there
    pub async fn ensure_default_config(path: &Path) -> Result<(), ConfigError> {
        let exists = tokio::fs::try_exists(path).await.map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if exists {
            debug!("Settings file {} present", path.display());
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| ConfigError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let content = toml::to_string_pretty(&AppConfig::default())?;
        tokio::fs::write(path, content)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        info!("Created default settings at {}", path.display());
        Ok(())
    }

    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let config: AppConfig = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        debug!("Loaded settings from {}", path.display());
        Ok(config)
    }

    /// Replaces the credentials with the environment overrides, if set
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(
            std::env::var(USERNAME_ENV).ok(),
            std::env::var(PASSWORD_ENV).ok(),
        );
    }

    fn apply_overrides(&mut self, username: Option<String>, password: Option<String>) {
        if let Some(username) = username {
            debug!("Username taken from {}", USERNAME_ENV);
            self.broker.username = username;
        }
        if let Some(password) = password {
            debug!("Password taken from {}", PASSWORD_ENV);
            self.broker.password = password;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.port == 0 {
            return Err(ConfigError::Invalid("broker.port must be 1-65535".into()));
        }
        if self.broker.topic.is_empty() {
            return Err(ConfigError::Invalid("broker.topic must not be empty".into()));
        }
        if self.session.message_log_capacity == Some(0) {
            return Err(ConfigError::Invalid(
                "session.message_log_capacity must be positive".into(),
            ));
        }
        self.log_level()?;
        Ok(())
    }

    pub fn log_level(&self) -> Result<Level, ConfigError> {
        self.logging
            .level
            .parse::<Level>()
            .map_err(|_| ConfigError::Invalid(format!("unknown log level '{}'", self.logging.level)))
    }

    pub fn session_config(&self) -> SessionConfig {
        let broker = &self.broker;
        SessionConfig {
            host: broker.host.clone(),
            port: broker.port,
            topic: broker.topic.clone(),
            username: broker.username.clone(),
            password: SecretString::from(broker.password.clone()),
            client_id_prefix: broker.client_id_prefix.clone(),
            keep_alive: Duration::from_secs(broker.keep_alive_secs),
            clean_session: broker.clean_session,
            auto_reconnect: broker.auto_reconnect,
            reconnect_delay: Duration::from_millis(broker.reconnect_delay_ms),
            tls: broker.tls,
        }
    }
}
