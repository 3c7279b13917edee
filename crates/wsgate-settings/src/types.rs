//! Settings type definitions.
//!
//! Field names are `snake_case` so that `WSGATE_SECTION__FIELD` environment
//! variables map onto them directly. Every section implements [`Default`]
//! with production values and is `#[serde(default)]`, so partial JSON files
//! are accepted.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type for the wsgate server.
///
/// # JSON Format
///
/// ```json
/// {
///   "server": { "port": 9000 },
///   "idle": { "timeout_secs": 30 }
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateSettings {
    /// Listener settings.
    pub server: ServerSettings,
    /// Idle connection eviction.
    pub idle: IdleSettings,
    /// Timer wheel geometry.
    pub wheel: WheelSettings,
    /// Business worker pool.
    pub pool: PoolSettings,
    /// Connection registry.
    pub registry: RegistrySettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl GateSettings {
    /// Reject values the server cannot run with.
    ///
    /// Nothing is clamped: a zero slot count or tick interval is an error,
    /// not a silently corrected default.
    pub fn validate(&self) -> Result<()> {
        let checks: [(bool, &str); 10] = [
            (self.idle.timeout_secs > 0, "idle.timeout_secs must be positive"),
            (self.wheel.tick_ms > 0, "wheel.tick_ms must be positive"),
            (self.wheel.slots > 0, "wheel.slots must be positive"),
            (self.wheel.queue_capacity > 0, "wheel.queue_capacity must be positive"),
            (self.wheel.max_jobs > 0, "wheel.max_jobs must be positive"),
            (self.pool.size > 0, "pool.size must be positive"),
            (self.pool.expiry_secs > 0, "pool.expiry_secs must be positive"),
            (self.registry.queue_capacity > 0, "registry.queue_capacity must be positive"),
            (self.server.outbound_queue > 0, "server.outbound_queue must be positive"),
            (self.server.max_frame_bytes > 0, "server.max_frame_bytes must be positive"),
        ];
        match checks.iter().find(|(ok, _)| !ok) {
            Some((_, reason)) => Err(SettingsError::InvalidValue((*reason).to_string())),
            None => Ok(()),
        }
    }
}

/// Listener and transport settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// WebSocket listen port.
    pub port: u16,
    /// Port for `/health` and `/metrics`; disabled when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_port: Option<u16>,
    /// Outbound frames buffered per connection before writes are dropped.
    pub outbound_queue: usize,
    /// Largest accepted frame payload in bytes.
    pub max_frame_bytes: usize,
    /// Largest accepted handshake header block in bytes.
    pub max_handshake_bytes: usize,
    /// Interval of the established-connection log readout, 0 disables it.
    pub readout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8081,
            health_port: None,
            outbound_queue: 256,
            max_frame_bytes: 16 * 1024 * 1024,
            max_handshake_bytes: 8 * 1024,
            readout_secs: 1,
        }
    }
}

/// Idle eviction settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdleSettings {
    /// Seconds without inbound activity before a connection is closed.
    pub timeout_secs: u64,
}

impl Default for IdleSettings {
    fn default() -> Self {
        Self { timeout_secs: 60 }
    }
}

/// Timer wheel geometry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WheelSettings {
    /// Milliseconds per tick.
    pub tick_ms: u64,
    /// Number of slots in the ring.
    pub slots: usize,
    /// Capacity of the add/remove command queue.
    pub queue_capacity: usize,
    /// Timer jobs allowed to run at the same time.
    pub max_jobs: usize,
}

impl Default for WheelSettings {
    fn default() -> Self {
        Self {
            tick_ms: 1000,
            slots: 60,
            queue_capacity: 1024,
            max_jobs: 1024,
        }
    }
}

/// Business worker pool settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Maximum concurrent workers.
    pub size: usize,
    /// Seconds an idle worker lives before it is retired.
    pub expiry_secs: u64,
    /// Reject submissions when saturated instead of waiting.
    pub nonblocking: bool,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            size: 10_000,
            expiry_secs: 10,
            nonblocking: true,
        }
    }
}

/// Connection registry settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    /// Capacity of the registry message queue.
    pub queue_capacity: usize,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
        }
    }
}

/// Logging settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// `"compact"` or `"json"`.
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_fills_defaults() {
        let json = r#"{"server":{"port":9000},"pool":{"nonblocking":false}}"#;
        let settings: GateSettings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.server.port, 9000);
        assert_eq!(settings.server.host, "0.0.0.0");
        assert!(!settings.pool.nonblocking);
        assert_eq!(settings.pool.size, 10_000);
        assert_eq!(settings.wheel, WheelSettings::default());
    }

    #[test]
    fn health_port_omitted_when_none() {
        let json = serde_json::to_value(ServerSettings::default()).unwrap();
        assert!(json.get("health_port").is_none());
    }

    #[test]
    fn zero_slots_rejected() {
        let mut settings = GateSettings::default();
        settings.wheel.slots = 0;
        let err = settings.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid settings value: wheel.slots must be positive"
        );
    }

    #[test]
    fn zero_tick_rejected() {
        let mut settings = GateSettings::default();
        settings.wheel.tick_ms = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn zero_pool_rejected() {
        let mut settings = GateSettings::default();
        settings.pool.size = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn first_failure_reported() {
        let mut settings = GateSettings::default();
        settings.idle.timeout_secs = 0;
        settings.registry.queue_capacity = 0;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("idle.timeout_secs"));
    }
}
