//! WebSocket wire codec: the upgrade handshake and RFC 6455 framing.

pub mod frame;
pub mod handshake;

pub use frame::{Frame, FrameCodec, OpCode, Role, encode_server_frame};
pub use handshake::{HandshakeRequest, PendingHandshake, Upgrade, Upgrader};
