//! Explicit client configuration.
//!
//! A [`LiveConfig`] is built once by the host and handed to every component
//! constructor. It derives `Deserialize` so the host can load it from any
//! source, but this crate never reads files or environment on its own.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use thiserror::Error;

/// Production open-platform API host.
pub const OPEN_PLATFORM_HOST: &str = "https://live-open.biliapi.com";

/// Default timings shared by the session and stream keep-alive loops.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LiveDefaults;

impl LiveDefaults {
    pub const SESSION_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);
    pub const STREAM_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
    pub const FRAME_QUEUE_CAPACITY: usize = 1024;
}

/// Credentials, identity, and timing for one live client.
#[derive(Clone, Debug, Deserialize)]
pub struct LiveConfig {
    /// Open-platform access key id, sent in clear as a signed header.
    pub access_key_id: String,
    /// Shared secret used to sign every request.
    pub access_key_secret: SecretString,
    /// Base URL of the open-platform HTTP API.
    #[serde(default = "default_api_host")]
    pub api_host: String,
    /// Broadcaster identity code.
    pub id_code: String,
    /// Registered application id.
    pub app_id: i64,
    #[serde(default = "default_session_heartbeat", with = "secs")]
    pub session_heartbeat_interval: Duration,
    #[serde(default = "default_stream_heartbeat", with = "secs")]
    pub stream_heartbeat_interval: Duration,
    /// Optional read deadline on the realtime socket.
    ///
    /// When set, a socket that stays silent for longer than this is treated
    /// as dead and the stream shuts down.
    #[serde(default, with = "opt_secs")]
    pub stream_read_timeout: Option<Duration>,
    #[serde(default = "default_connect_timeout", with = "secs")]
    pub connect_timeout: Duration,
    #[serde(default = "default_request_timeout", with = "secs")]
    pub request_timeout: Duration,
}

impl LiveConfig {
    /// Creates a configuration for the production host with default timings.
    pub fn new(
        access_key_id: impl Into<String>,
        access_key_secret: SecretString,
        id_code: impl Into<String>,
        app_id: i64,
    ) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            access_key_secret,
            api_host: default_api_host(),
            id_code: id_code.into(),
            app_id,
            session_heartbeat_interval: LiveDefaults::SESSION_HEARTBEAT_INTERVAL,
            stream_heartbeat_interval: LiveDefaults::STREAM_HEARTBEAT_INTERVAL,
            stream_read_timeout: None,
            connect_timeout: LiveDefaults::CONNECT_TIMEOUT,
            request_timeout: LiveDefaults::REQUEST_TIMEOUT,
        }
    }

    /// Overrides the API host. Trailing slashes and whitespace are dropped.
    pub fn with_api_host(mut self, api_host: impl Into<String>) -> Self {
        let api_host = api_host.into();
        self.api_host = api_host.trim_end().trim_end_matches('/').to_string();
        self
    }

    pub fn with_session_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.session_heartbeat_interval = interval;
        self
    }

    pub fn with_stream_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.stream_heartbeat_interval = interval;
        self
    }

    pub fn with_stream_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.stream_read_timeout = timeout;
        self
    }

    /// Rejects configurations that cannot possibly reach the platform.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_non_empty(&self.access_key_id, "access_key_id")?;
        require_non_empty(self.access_key_secret.expose_secret(), "access_key_secret")?;
        require_non_empty(&self.api_host, "api_host")?;
        require_non_empty(&self.id_code, "id_code")?;

        if !self.api_host.starts_with("http://") && !self.api_host.starts_with("https://") {
            return Err(ConfigError::Invalid {
                field: "api_host",
                reason: "must start with http:// or https://".to_string(),
            });
        }
        if self.app_id <= 0 {
            return Err(ConfigError::Invalid {
                field: "app_id",
                reason: "must be > 0".to_string(),
            });
        }
        require_non_zero(self.session_heartbeat_interval, "session_heartbeat_interval")?;
        require_non_zero(self.stream_heartbeat_interval, "stream_heartbeat_interval")?;
        if let Some(timeout) = self.stream_read_timeout {
            require_non_zero(timeout, "stream_read_timeout")?;
        }
        Ok(())
    }
}

/// Configuration rejected before any network activity.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting: {0}")]
    Missing(&'static str),

    #[error("invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn require_non_empty(value: &str, field: &'static str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::Missing(field));
    }
    Ok(())
}

fn require_non_zero(value: Duration, field: &'static str) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::Invalid {
            field,
            reason: "must be > 0".to_string(),
        });
    }
    Ok(())
}

fn default_api_host() -> String {
    OPEN_PLATFORM_HOST.to_string()
}

fn default_session_heartbeat() -> Duration {
    LiveDefaults::SESSION_HEARTBEAT_INTERVAL
}

fn default_stream_heartbeat() -> Duration {
    LiveDefaults::STREAM_HEARTBEAT_INTERVAL
}

fn default_connect_timeout() -> Duration {
    LiveDefaults::CONNECT_TIMEOUT
}

fn default_request_timeout() -> Duration {
    LiveDefaults::REQUEST_TIMEOUT
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

mod opt_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_secs))
    }
}
