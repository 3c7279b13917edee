//! WebSocket connection state, lifecycle and event dispatch.

pub mod bridge;
pub mod connection;
pub mod handler;
pub mod lifecycle;
