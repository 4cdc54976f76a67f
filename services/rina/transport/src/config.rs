//! Listener and transport configuration.

use crate::{Result, TransportError};
use bytes::Bytes;
use rina_wire::{DEFAULT_FAST_BUFFER_SIZE, DEFAULT_MAX_MESSAGE_SIZE, KEEP_ALIVE_DATA};
use std::time::Duration;

/// Default interval between keep-alives on an idle flow
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(90);

/// Default lifetime of a send queued while the transport connects
pub const DEFAULT_DELAYED_SEND_TIMEOUT: Duration = Duration::from_secs(8);

/// Per-transport settings
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Keep-alive interval; zero disables keep-alives
    pub keepalive_interval: Duration,
    /// Heartbeat payload
    pub keepalive_data: Bytes,
    /// Fast receive buffer size (one "normal" SIP message)
    pub fast_buffer_size: usize,
    /// Largest message accepted on the receive path
    pub max_message_size: usize,
    /// How long a send may wait for the transport to connect
    pub delayed_send_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            keepalive_data: Bytes::from_static(KEEP_ALIVE_DATA),
            fast_buffer_size: DEFAULT_FAST_BUFFER_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            delayed_send_timeout: DEFAULT_DELAYED_SEND_TIMEOUT,
        }
    }
}

impl TransportConfig {
    /// Whether keep-alives are sent at all
    pub fn keepalive_enabled(&self) -> bool {
        !self.keepalive_interval.is_zero()
    }

    /// Check the settings for consistency
    pub fn validate(&self) -> Result<()> {
        if self.fast_buffer_size == 0 {
            return Err(TransportError::Config(
                "fast_buffer_size must be greater than zero".to_string(),
            ));
        }
        if self.max_message_size < self.fast_buffer_size {
            return Err(TransportError::Config(format!(
                "max_message_size ({}) is smaller than fast_buffer_size ({})",
                self.max_message_size, self.fast_buffer_size
            )));
        }
        if self.delayed_send_timeout.is_zero() {
            return Err(TransportError::Config(
                "delayed_send_timeout must be greater than zero".to_string(),
            ));
        }
        if self.keepalive_enabled() && self.keepalive_data.is_empty() {
            return Err(TransportError::Config(
                "keepalive_data must not be empty when keep-alives are enabled".to_string(),
            ));
        }
        Ok(())
    }
}

/// Settings for a listener (one local application)
#[derive(Clone, Debug)]
pub struct ListenerConfig {
    /// Local application name registered with the fabric
    pub local_app: String,
    /// DIF to register in; any DIF when unset
    pub dif: Option<String>,
    /// Settings applied to every transport the listener creates
    pub transport: TransportConfig,
}

impl ListenerConfig {
    /// Listener for `local_app` in any DIF with default transport settings
    pub fn new(local_app: impl Into<String>) -> Self {
        Self {
            local_app: local_app.into(),
            dif: None,
            transport: TransportConfig::default(),
        }
    }

    /// Restrict registration and allocation to `dif`
    pub fn with_dif(mut self, dif: impl Into<String>) -> Self {
        self.dif = Some(dif.into());
        self
    }

    /// Replace the transport settings
    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    /// Check the settings for consistency
    pub fn validate(&self) -> Result<()> {
        if self.local_app.trim().is_empty() {
            return Err(TransportError::Config(
                "local application name must not be empty".to_string(),
            ));
        }
        self.transport.validate()
    }
}
