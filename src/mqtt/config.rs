use std::fmt;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

/// Ports on which a broker is expected to speak MQTT over TLS
pub const ENCRYPTED_PORTS: [u16; 2] = [8883, 443];

/// How the transport decides whether to wrap the connection in TLS
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    /// TLS whenever the port implies an encrypted endpoint
    #[default]
    Auto,
    Always,
    Never,
}

/// Immutable snapshot of everything needed to open one broker session.
///
/// Handing a new `SessionConfig` to the manager never touches a session that is
/// already open; it only takes effect on the next connect.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    pub topic: String,
    pub username: String,
    pub password: SecretString,
    /// Client ids are `<prefix>_<unix millis>` so two instances never collide
    pub client_id_prefix: String,
    pub keep_alive: Duration,
    pub clean_session: bool,
    /// Let the transport silently re-establish a lost link
    pub auto_reconnect: bool,
    /// Pause between two transport reconnect attempts
    pub reconnect_delay: Duration,
    pub tls: TlsMode,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            topic: "test/topic/from/android".to_string(),
            username: String::new(),
            password: SecretString::from(String::new()),
            client_id_prefix: "mqttdemo".to_string(),
            keep_alive: Duration::from_secs(60),
            clean_session: true,
            auto_reconnect: true,
            reconnect_delay: Duration::from_secs(5),
            tls: TlsMode::Auto,
        }
    }
}

impl fmt::Display for SessionConfig {
    /// `user@host:port/topic`, as shown in status lines
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.username.is_empty() {
            write!(f, "{}:{}/{}", self.host, self.port, self.topic)
        } else {
            write!(
                f,
                "{}@{}:{}/{}",
                self.username, self.host, self.port, self.topic
            )
        }
    }
}

impl SessionConfig {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        topic: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            topic: topic.into(),
            username: username.into(),
            password: SecretString::from(password.into()),
            ..Self::default()
        }
    }

    /// Whether the connection must be wrapped in TLS
    pub fn uses_tls(&self) -> bool {
        match self.tls {
            TlsMode::Always => true,
            TlsMode::Never => false,
            TlsMode::Auto => ENCRYPTED_PORTS.contains(&self.port),
        }
    }

    /// Credentials to attach to the CONNECT packet, if any were configured
    pub fn credentials(&self) -> Option<(String, String)> {
        if self.username.is_empty() {
            return None;
        }
        Some((
            self.username.clone(),
            self.password.expose_secret().to_string(),
        ))
    }

    pub fn client_id(&self) -> String {
        format!(
            "{}_{}",
            self.client_id_prefix,
            chrono::Utc::now().timestamp_millis()
        )
    }

    /// Checks the parts of the snapshot the broker would reject outright.
    ///
    /// A topic with a leading `$` is accepted but reported, since brokers reserve
    /// that namespace.
    pub fn validate(&self) -> Result<(), String> {
        if self.host.trim().is_empty() {
            return Err("host is empty".to_string());
        }
        if self.port == 0 {
            return Err("port must be between 1 and 65535".to_string());
        }
        if self.topic.is_empty() {
            return Err("topic is empty".to_string());
        }
        if self.topic.contains(['+', '#']) {
            return Err(format!(
                "topic '{}' contains wildcards and cannot be published to",
                self.topic
            ));
        }
        if !self.keep_alive.is_zero() && self.keep_alive < Duration::from_secs(1) {
            return Err("keep alive must be zero or at least one second".to_string());
        }
        if self.topic.starts_with('$') {
            tracing::warn!(
                "Topic '{}' lies in the broker-reserved '$' namespace",
                self.topic
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_follows_port_in_auto_mode() {
        let secure = SessionConfig::new("b.example.com", 8883, "t/1", "u", "p");
        assert!(secure.uses_tls());

        let plain = SessionConfig::new("b.example.com", 1883, "t/1", "u", "p");
        assert!(!plain.uses_tls());
    }

    #[test]
    fn explicit_tls_mode_wins_over_port() {
        let mut config = SessionConfig::new("b.example.com", 1883, "t/1", "", "");
        config.tls = TlsMode::Always;
        assert!(config.uses_tls());

        config.port = 8883;
        config.tls = TlsMode::Never;
        assert!(!config.uses_tls());
    }

    #[test]
    fn credentials_only_when_username_set() {
        let anonymous = SessionConfig::new("h", 1883, "t", "", "ignored");
        assert!(anonymous.credentials().is_none());

        let with_user = SessionConfig::new("h", 1883, "t", "u", "p");
        assert_eq!(
            with_user.credentials(),
            Some(("u".to_string(), "p".to_string()))
        );
    }

    #[test]
    fn debug_output_hides_password() {
        let config = SessionConfig::new("h", 1883, "t", "u", "hunter2");
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("REDACTED"));
    }

    #[test]
    fn validate_rejects_unusable_snapshots() {
        assert!(SessionConfig::new("", 1883, "t", "", "").validate().is_err());
        assert!(SessionConfig::new("h", 0, "t", "", "").validate().is_err());
        assert!(SessionConfig::new("h", 1883, "", "", "").validate().is_err());
        assert!(SessionConfig::new("h", 1883, "a/#", "", "").validate().is_err());
        assert!(SessionConfig::new("h", 1883, "$SYS/x", "", "")
            .validate()
            .is_ok());
    }

    #[test]
    fn client_id_carries_prefix() {
        let config = SessionConfig::default();
        assert!(config.client_id().starts_with("mqttdemo_"));
    }
}
