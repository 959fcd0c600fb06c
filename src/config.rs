//! Configuration types for the beanstalkd client.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};

/// Default beanstalkd address.
pub const DEFAULT_ADDR: &str = "127.0.0.1:11300";

/// Configuration for a [`Client`](crate::Client) connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server address as `host:port`.
    pub addr: String,
    /// Upper bound on establishing the TCP connection. `None` waits for the OS.
    #[serde(with = "duration_secs")]
    pub connect_timeout: Option<Duration>,
    /// Disable Nagle's algorithm on the socket.
    pub tcp_nodelay: bool,
    /// Largest data block accepted in a reply (job bodies, stats, tube lists).
    pub max_reply_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            connect_timeout: Some(Duration::from_secs(5)),
            tcp_nodelay: true,
            max_reply_size: 1024 * 1024,
        }
    }
}

impl ClientConfig {
    /// Create a config for `addr` with default options.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            ..Default::default()
        }
    }

    /// Create a new builder.
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::new()
    }

    /// Reject configurations that cannot produce a working connection.
    pub fn validate(&self) -> Result<()> {
        if self.addr.trim().is_empty() {
            return Err(Error::Config("address must not be empty".to_string()));
        }
        if self.max_reply_size == 0 {
            return Err(Error::Config("max_reply_size must be positive".to_string()));
        }
        if self.connect_timeout == Some(Duration::ZERO) {
            return Err(Error::Config("connect_timeout must be positive".to_string()));
        }
        Ok(())
    }
}

/// Builder for ClientConfig.
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the server address.
    pub fn addr(mut self, addr: impl Into<String>) -> Self {
        self.config.addr = addr.into();
        self
    }

    /// Set the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = Some(timeout);
        self
    }

    /// Wait for the OS to give up instead of applying a connect timeout.
    pub fn no_connect_timeout(mut self) -> Self {
        self.config.connect_timeout = None;
        self
    }

    /// Set TCP_NODELAY on the socket.
    pub fn tcp_nodelay(mut self, nodelay: bool) -> Self {
        self.config.tcp_nodelay = nodelay;
        self
    }

    /// Set the reply size limit.
    pub fn max_reply_size(mut self, size: usize) -> Self {
        self.config.max_reply_size = size;
        self
    }

    /// Build the ClientConfig.
    pub fn build(self) -> ClientConfig {
        self.config
    }
}

/// Optional durations as fractional seconds.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => d.as_secs_f64().serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs: Option<f64> = Option::deserialize(deserializer)?;
        match secs {
            Some(s) if !s.is_finite() || s < 0.0 => Err(serde::de::Error::custom(
                "connect_timeout must be a non-negative number of seconds",
            )),
            Some(s) => Ok(Some(Duration::from_secs_f64(s))),
            None => Ok(None),
        }
    }
}
