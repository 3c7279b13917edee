//! # wsgate-server
//!
//! Reactor-style `WebSocket` connection server.
//!
//! - Handshake and RFC 6455 frame codec
//! - Per-connection upgrade state machine bridging transport events to
//!   application callbacks
//! - Hashed time wheel driving idle eviction
//! - Single-consumer registry of established connections
//! - Bounded worker pool for data messages
//! - Health and Prometheus endpoints, graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod codec;
pub mod config;
pub mod health;
pub mod metrics;
pub mod pool;
pub mod registry;
pub mod server;
pub mod shutdown;
pub mod timewheel;
pub mod websocket;

pub use config::ServerConfig;
pub use registry::{Registry, RegistryHandle};
pub use server::WsServer;
pub use websocket::connection::ConnectionHandle;
pub use websocket::handler::{ConnectionHandler, DataRequest};
