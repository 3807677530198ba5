//! Client configuration

use crate::{ClientError, ClientResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Relay client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// How long an initiator waits for ACCEPT
    #[serde(with = "duration_millis")]
    pub handshake_timeout: Duration,
    /// How long a dial may wait for a free channel id
    #[serde(with = "duration_millis")]
    pub dial_timeout: Duration,
    /// Bound on best-effort writes (CLOSE frames, responder ACCEPT, stream shutdown)
    #[serde(with = "duration_millis")]
    pub write_timeout: Duration,
    /// How long the reader loop waits on a full transport buffer before
    /// closing that transport as stalled
    #[serde(with = "duration_millis")]
    pub deliver_timeout: Duration,
    /// Poll interval while waiting for discovery to list any relay server
    #[serde(with = "duration_millis")]
    pub discovery_retry_interval: Duration,
    /// Inbound frames buffered per transport
    pub transport_buffer: usize,
    /// Accepted transports buffered until `accept()` picks them up
    pub accept_queue: usize,
}

/// Helper module for serializing Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            dial_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(5),
            deliver_timeout: Duration::from_millis(250),
            discovery_retry_interval: Duration::from_secs(1),
            transport_buffer: 64,
            accept_queue: 16,
        }
    }
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    pub fn validate(&self) -> ClientResult<()> {
        let timeouts = [
            ("handshake_timeout", self.handshake_timeout),
            ("dial_timeout", self.dial_timeout),
            ("write_timeout", self.write_timeout),
            ("deliver_timeout", self.deliver_timeout),
            ("discovery_retry_interval", self.discovery_retry_interval),
        ];
        for (name, value) in timeouts {
            if value.is_zero() {
                return Err(ClientError::InvalidConfig(format!("{} must be non-zero", name)));
            }
        }
        if self.transport_buffer == 0 {
            return Err(ClientError::InvalidConfig(
                "transport_buffer must be at least 1".to_string(),
            ));
        }
        if self.accept_queue == 0 {
            return Err(ClientError::InvalidConfig(
                "accept_queue must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for ClientConfig
#[derive(Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    pub fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.config.dial_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.config.write_timeout = timeout;
        self
    }

    pub fn deliver_timeout(mut self, timeout: Duration) -> Self {
        self.config.deliver_timeout = timeout;
        self
    }

    pub fn discovery_retry_interval(mut self, interval: Duration) -> Self {
        self.config.discovery_retry_interval = interval;
        self
    }

    pub fn transport_buffer(mut self, frames: usize) -> Self {
        self.config.transport_buffer = frames;
        self
    }

    pub fn accept_queue(mut self, transports: usize) -> Self {
        self.config.accept_queue = transports;
        self
    }

    pub fn build(self) -> ClientResult<ClientConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
