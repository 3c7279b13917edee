//! Error hierarchy for the wsgate server.
//!
//! Provides one `thiserror` enum per failure domain plus the top-level
//! [`GateError`] that wraps them all:
//!
//! - [`HandshakeError`]: malformed or unsupported upgrade request (terminal)
//! - [`FrameError`]: malformed WebSocket frame (terminal)
//! - [`RegistryConflict`]: duplicate add or missing target (logged, dropped)
//! - [`PoolError`]: worker pool rejected a task
//! - [`TimerConfigError`]: invalid timer wheel parameters
//! - [`ConfigError`]: invalid server configuration
//! - [`HandlerError`]: error returned by application callbacks
//!
//! An incomplete handshake or frame is not an error at all: codecs report it
//! as `Ok(None)` and the bytes stay buffered until the next read.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

// ─────────────────────────────────────────────────────────────────────────────
// GateError - top-level error enum
// ─────────────────────────────────────────────────────────────────────────────

/// Top-level error type for the wsgate server.
#[derive(Debug, Error)]
pub enum GateError {
    /// Upgrade handshake failure.
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// Frame decode failure.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// Registry operation rejected.
    #[error(transparent)]
    Registry(#[from] RegistryConflict),

    /// Worker pool rejection.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// Invalid timer wheel parameters.
    #[error(transparent)]
    TimerConfig(#[from] TimerConfigError),

    /// Invalid server configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Application callback failure.
    #[error(transparent)]
    Handler(#[from] HandlerError),

    /// Transport I/O failure.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

impl GateError {
    /// Coarse classification used for log fields and metric labels.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Handshake(_) => ErrorKind::Handshake,
            Self::Frame(_) => ErrorKind::Frame,
            Self::Registry(_) => ErrorKind::Registry,
            Self::Pool(_) => ErrorKind::Pool,
            Self::TimerConfig(_) | Self::Config(_) => ErrorKind::Config,
            Self::Handler(_) => ErrorKind::Handler,
            Self::Io(_) => ErrorKind::Transport,
        }
    }

    /// Whether the error ends the connection it occurred on.
    ///
    /// Registry conflicts and pool rejections are logged and the connection
    /// carries on; everything connection-scoped closes it.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Handshake(_) | Self::Frame(_) | Self::Handler(_) | Self::Io(_)
        )
    }
}

/// Error classification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Upgrade handshake.
    Handshake,
    /// Frame codec.
    Frame,
    /// Connection registry.
    Registry,
    /// Worker pool.
    Pool,
    /// Startup configuration.
    Config,
    /// Application callback.
    Handler,
    /// Socket I/O.
    Transport,
}

impl ErrorKind {
    /// Stable lowercase label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Handshake => "handshake",
            Self::Frame => "frame",
            Self::Registry => "registry",
            Self::Pool => "pool",
            Self::Config => "config",
            Self::Handler => "handler",
            Self::Transport => "transport",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Protocol errors
// ─────────────────────────────────────────────────────────────────────────────

/// WebSocket upgrade handshake failure.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// Request line or header block could not be parsed.
    #[error("invalid upgrade request: {0}")]
    InvalidRequest(String),
    /// A required header is absent.
    #[error("missing required header: {0}")]
    MissingHeader(&'static str),
    /// `Sec-WebSocket-Version` is not 13.
    #[error("unsupported WebSocket version: {0}")]
    UnsupportedVersion(String),
    /// `Sec-WebSocket-Key` is not 16 bytes of base64.
    #[error("invalid Sec-WebSocket-Key")]
    InvalidKey,
    /// Header block grew past the configured limit without terminating.
    #[error("handshake header block too large: {size} bytes (max: {max})")]
    TooLarge {
        /// Bytes buffered so far.
        size: usize,
        /// Configured maximum.
        max: usize,
    },
}

/// Malformed WebSocket frame.
#[derive(Debug, Error)]
pub enum FrameError {
    /// RSV bits set without a negotiated extension.
    #[error("reserved bits set without extension")]
    ReservedBitsSet,
    /// Client-to-server frame without a mask.
    #[error("client frame must be masked")]
    UnmaskedClientFrame,
    /// Server-to-client frame carrying a mask.
    #[error("server frame must not be masked")]
    MaskedServerFrame,
    /// Payload larger than the configured maximum.
    #[error("payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge {
        /// Declared payload length.
        size: u64,
        /// Configured maximum.
        max: usize,
    },
    /// Control frame payload above 125 bytes.
    #[error("control frame payload too large: {0} bytes (max: 125)")]
    ControlFrameTooLarge(usize),
    /// Control frame with FIN unset.
    #[error("control frame cannot be fragmented")]
    FragmentedControlFrame,
    /// Continuation/data frame sequencing violated.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),
    /// Codec I/O failure (required by `tokio_util::codec`).
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ─────────────────────────────────────────────────────────────────────────────
// RegistryConflict
// ─────────────────────────────────────────────────────────────────────────────

/// Registry operation kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegistryOperation {
    /// Registering a connection.
    Add,
    /// Deregistering a connection.
    Free,
    /// Writing to a registered connection.
    Dispatch,
}

impl fmt::Display for RegistryOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add => write!(f, "add"),
            Self::Free => write!(f, "free"),
            Self::Dispatch => write!(f, "dispatch"),
        }
    }
}

/// A registry message that could not be applied.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("registry {operation} rejected for {id}: {reason}")]
pub struct RegistryConflict {
    /// Target connection identifier.
    pub id: String,
    /// Operation that was rejected.
    pub operation: RegistryOperation,
    /// Human-readable reason.
    pub reason: &'static str,
}

impl RegistryConflict {
    /// Identifier already registered.
    #[must_use]
    pub fn in_use(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            operation: RegistryOperation::Add,
            reason: "identifier already in use",
        }
    }

    /// Identifier not registered.
    #[must_use]
    pub fn not_found(id: impl Into<String>, operation: RegistryOperation) -> Self {
        Self {
            id: id.into(),
            operation,
            reason: "identifier not found",
        }
    }

    /// Connection found but its outbound queue refused the write.
    #[must_use]
    pub fn unwritable(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            operation: RegistryOperation::Dispatch,
            reason: "connection closed or outbound queue full",
        }
    }

    /// Identifier registered to a different connection.
    #[must_use]
    pub fn not_owner(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            operation: RegistryOperation::Free,
            reason: "identifier owned by another connection",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Runtime component errors
// ─────────────────────────────────────────────────────────────────────────────

/// Worker pool rejection.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    /// Every worker is busy and the pool is non-blocking.
    #[error("worker pool saturated ({capacity} workers busy)")]
    Saturated {
        /// Pool capacity.
        capacity: usize,
    },
    /// The pool has been released.
    #[error("worker pool is closed")]
    Closed,
    /// Pool size must be positive.
    #[error("worker pool size must be positive")]
    InvalidSize,
}

/// Invalid timer wheel parameters.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimerConfigError {
    /// Tick interval must be positive.
    #[error("tick interval must be positive, got {0:?}")]
    ZeroInterval(Duration),
    /// Slot count must be positive.
    #[error("slot count must be positive")]
    ZeroSlots,
    /// Command queue capacity must be positive.
    #[error("timer queue capacity must be positive")]
    ZeroQueue,
    /// Concurrent job limit must be positive.
    #[error("timer job limit must be positive")]
    ZeroJobs,
}

/// Invalid server configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A value is out of its accepted range.
    #[error("invalid config value for {field}: {reason}")]
    InvalidValue {
        /// Offending field.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },
    /// Timer wheel parameters rejected.
    #[error(transparent)]
    Timer(#[from] TimerConfigError),
    /// Worker pool parameters rejected.
    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl ConfigError {
    /// Build an [`ConfigError::InvalidValue`].
    #[must_use]
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

/// Error returned by an application callback.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HandlerError {
    /// Human-readable message.
    pub message: String,
    /// Original cause.
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl HandlerError {
    /// Create a handler error from a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Set the error cause.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

/// Result type for wsgate operations.
pub type Result<T> = std::result::Result<T, GateError>;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
