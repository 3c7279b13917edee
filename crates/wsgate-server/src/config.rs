//! Server configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use wsgate_core::errors::{ConfigError, PoolError};

use crate::pool::PoolConfig;
use crate::timewheel::TimeWheelConfig;
use crate::websocket::bridge::BridgeConfig;

/// Configuration for the wsgate server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Seconds without inbound activity before a connection is evicted.
    pub idle_timeout_secs: u64,
    /// Time wheel tick interval in milliseconds.
    pub tick_interval_ms: u64,
    /// Time wheel slot count.
    pub wheel_slots: usize,
    /// Time wheel command queue capacity.
    pub timer_queue_capacity: usize,
    /// Timer jobs allowed to run at the same time.
    pub timer_max_jobs: usize,
    /// Maximum concurrent pool workers.
    pub pool_size: usize,
    /// Seconds an idle pool worker is kept before retirement.
    pub pool_expiry_secs: u64,
    /// Drop data messages instead of waiting when the pool is saturated.
    pub pool_nonblocking: bool,
    /// Outbound frame queue per connection.
    pub outbound_queue: usize,
    /// Max WebSocket message size in bytes.
    pub max_frame_bytes: usize,
    /// Max handshake header block in bytes.
    pub max_handshake_bytes: usize,
    /// Seconds between established-count log lines (`0` disables).
    pub readout_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            idle_timeout_secs: 60,
            tick_interval_ms: 1000,
            wheel_slots: 60,
            timer_queue_capacity: 1024,
            timer_max_jobs: 1024,
            pool_size: 10_000,
            pool_expiry_secs: 10,
            pool_nonblocking: true,
            outbound_queue: 256,
            max_frame_bytes: 16 * 1024 * 1024, // 16 MB
            max_handshake_bytes: 8 * 1024,
            readout_interval_secs: 1,
        }
    }
}

impl ServerConfig {
    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.wheel_config().validate()?;
        if self.pool_size == 0 {
            return Err(PoolError::InvalidSize.into());
        }
        if self.pool_expiry_secs == 0 {
            return Err(ConfigError::invalid("pool_expiry_secs", "must be positive"));
        }
        if self.idle_timeout_secs == 0 {
            return Err(ConfigError::invalid("idle_timeout_secs", "must be positive"));
        }
        if self.outbound_queue == 0 {
            return Err(ConfigError::invalid("outbound_queue", "must be positive"));
        }
        if self.max_frame_bytes == 0 {
            return Err(ConfigError::invalid("max_frame_bytes", "must be positive"));
        }
        if self.max_handshake_bytes == 0 {
            return Err(ConfigError::invalid(
                "max_handshake_bytes",
                "must be positive",
            ));
        }
        Ok(())
    }

    /// `host:port` for the listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Idle budget.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Time wheel parameters.
    pub fn wheel_config(&self) -> TimeWheelConfig {
        TimeWheelConfig {
            tick_interval: Duration::from_millis(self.tick_interval_ms),
            slots: self.wheel_slots,
            queue_capacity: self.timer_queue_capacity,
            max_jobs: self.timer_max_jobs,
        }
    }

    /// Worker pool parameters.
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            size: self.pool_size,
            expiry: Duration::from_secs(self.pool_expiry_secs),
            nonblocking: self.pool_nonblocking,
        }
    }

    /// Event bridge limits.
    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            idle_timeout: self.idle_timeout(),
            max_message_bytes: self.max_frame_bytes,
            max_handshake_bytes: self.max_handshake_bytes,
        }
    }
}
