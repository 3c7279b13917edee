//! Event bridge: the per-connection upgrade state machine.
//!
//! The reader task calls [`EventBridge::react`] every time new bytes land in
//! the connection's inbound buffer, and [`EventBridge::on_transport_closed`]
//! once the socket is gone. The bridge decides what the bytes mean for the
//! connection's current state:
//!
//! - `Unupgraded`: drive the handshake; reply 101 or 400
//! - `Upgraded`: decode frames; answer pings inline, hand data messages to
//!   the worker pool, tear down on close or malformed input
//! - `Closed`: nothing left to do
//!
//! Business callbacks never run on the reader task except `on_established`
//! and `on_close`.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio_util::codec::Decoder;
use tracing::{debug, info, warn};

use crate::codec::{Frame, OpCode, Upgrader};
use crate::metrics::{WS_DATA_DROPPED_TOTAL, WS_HANDSHAKES_TOTAL};
use crate::pool::WorkerPool;
use crate::websocket::connection::{ConnState, Connection, UpgradedState};
use crate::websocket::handler::{ConnectionHandler, DataRequest};
use crate::websocket::lifecycle::{CloseReason, IdleTimers, Lifecycle};

/// What the reader task should do after a `react` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Keep reading.
    Continue,
    /// Stop reading and release the transport.
    Close,
}

/// Limits applied by the bridge.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Inactivity budget before eviction.
    pub idle_timeout: Duration,
    /// Largest accepted message, assembled fragments included.
    pub max_message_bytes: usize,
    /// Largest accepted handshake header block.
    pub max_handshake_bytes: usize,
}

/// Connects transport events to the handshake, frame codec, worker pool and
/// application callbacks.
#[derive(Debug)]
pub struct EventBridge {
    lifecycle: Arc<Lifecycle>,
    pool: WorkerPool,
    upgrader: Upgrader,
    max_message_bytes: usize,
}

impl EventBridge {
    /// Wire the bridge to its collaborators.
    pub fn new(
        handler: Arc<dyn ConnectionHandler>,
        pool: WorkerPool,
        timers: IdleTimers,
        config: &BridgeConfig,
    ) -> Self {
        Self {
            lifecycle: Arc::new(Lifecycle::new(handler, timers, config.idle_timeout)),
            pool,
            upgrader: Upgrader::new(config.max_handshake_bytes),
            max_message_bytes: config.max_message_bytes,
        }
    }

    /// Worker pool used for data messages.
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Shared close and idle machinery.
    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    /// Consume whatever the inbound buffer holds.
    pub async fn react(&self, conn: &mut Connection) -> Action {
        if matches!(conn.state, ConnState::Unupgraded(_)) {
            if self.upgrade(conn).await == Action::Close {
                return Action::Close;
            }
            // Frames may be pipelined right behind the request.
            if !conn.is_upgraded() {
                return Action::Continue;
            }
        }

        if conn.is_upgraded() {
            self.read_frames(conn).await
        } else {
            Action::Close
        }
    }

    async fn upgrade(&self, conn: &mut Connection) -> Action {
        let ConnState::Unupgraded(pending) = &mut conn.state else {
            return Action::Continue;
        };

        match self.upgrader.upgrade(&mut conn.inbound, pending) {
            Ok(None) => Action::Continue,
            Ok(Some(upgrade)) => {
                let handle = conn.handle.clone();
                let _ = handle.send_raw(upgrade.response);
                conn.state = ConnState::Upgraded(UpgradedState::new(self.max_message_bytes));
                handle.touch();
                counter!(WS_HANDSHAKES_TOTAL, "outcome" => "upgraded").increment(1);
                debug!(
                    conn = handle.seq(),
                    uri = %upgrade.request.uri,
                    "handshake complete"
                );

                let handler = self.lifecycle.handler();
                if let Err(err) = handler.on_established(&handle, &upgrade.request).await {
                    warn!(conn = handle.seq(), error = %err, "connection rejected by handler");
                    conn.state = ConnState::Closed;
                    let _ = handle.mark_closed();
                    handle.shutdown();
                    return Action::Close;
                }
                self.lifecycle.activity(&handle).await;
                Action::Continue
            }
            Err(err) => {
                warn!(conn = conn.handle.seq(), error = %err, "handshake failed");
                counter!(WS_HANDSHAKES_TOTAL, "outcome" => "rejected").increment(1);
                let _ = conn.handle.send_raw(self.upgrader.reject(&err));
                conn.state = ConnState::Closed;
                let _ = conn.handle.mark_closed();
                conn.handle.shutdown();
                Action::Close
            }
        }
    }

    async fn read_frames(&self, conn: &mut Connection) -> Action {
        loop {
            let ConnState::Upgraded(upgraded) = &mut conn.state else {
                return Action::Close;
            };
            let frame = match upgraded.codec.decode(&mut conn.inbound) {
                Ok(Some(frame)) => frame,
                Ok(None) => return Action::Continue,
                Err(err) => {
                    warn!(conn = conn.handle.seq(), error = %err, "malformed frame");
                    return self.terminate(conn, CloseReason::ProtocolError).await;
                }
            };
            if self.handle_frame(conn, frame).await == Action::Close {
                return Action::Close;
            }
        }
    }

    async fn handle_frame(&self, conn: &mut Connection, frame: Frame) -> Action {
        let handle = conn.handle.clone();
        match frame.opcode {
            OpCode::Ping => {
                let _ = handle.send_frame(OpCode::Pong, frame.payload);
                self.lifecycle.activity(&handle).await;
                Action::Continue
            }
            OpCode::Text | OpCode::Binary | OpCode::Continuation => {
                let ConnState::Upgraded(upgraded) = &mut conn.state else {
                    return Action::Close;
                };
                match upgraded.assemble(frame) {
                    Ok(message) => {
                        self.lifecycle.activity(&handle).await;
                        if let Some((opcode, payload)) = message {
                            self.dispatch(DataRequest {
                                payload,
                                opcode,
                                conn: handle,
                            })
                            .await;
                        }
                        Action::Continue
                    }
                    Err(err) => {
                        warn!(conn = handle.seq(), error = %err, "malformed message");
                        self.terminate(conn, CloseReason::ProtocolError).await
                    }
                }
            }
            OpCode::Close => {
                debug!(conn = handle.seq(), code = ?frame.close_code(), "peer closed");
                self.terminate(conn, CloseReason::PeerClose).await
            }
            OpCode::Pong | OpCode::Reserved(_) => {
                debug!(conn = handle.seq(), opcode = ?frame.opcode, "frame ignored");
                Action::Continue
            }
        }
    }

    async fn dispatch(&self, request: DataRequest) {
        let seq = request.conn.seq();
        let handler = Arc::clone(self.lifecycle.handler());
        if let Err(err) = self
            .pool
            .submit(async move { handler.on_data(request).await })
            .await
        {
            warn!(conn = seq, error = %err, "data message dropped");
            counter!(WS_DATA_DROPPED_TOTAL).increment(1);
        }
    }

    async fn terminate(&self, conn: &mut Connection, reason: CloseReason) -> Action {
        conn.state = ConnState::Closed;
        let _ = self.lifecycle.close(&conn.handle, reason).await;
        Action::Close
    }

    /// The transport closed or failed underneath the connection.
    pub async fn on_transport_closed(&self, conn: &mut Connection, error: Option<&io::Error>) {
        let was_upgraded = conn.is_upgraded();
        conn.state = ConnState::Closed;
        if let Some(err) = error {
            info!(conn = conn.handle.seq(), error = %err, "transport error");
        }
        if was_upgraded {
            let _ = self
                .lifecycle
                .close(&conn.handle, CloseReason::Transport)
                .await;
        } else {
            let _ = conn.handle.mark_closed();
            conn.handle.shutdown();
        }
    }

    /// The server is stopping. Upgraded connections get a `1001` close frame.
    pub async fn on_server_shutdown(&self, conn: &mut Connection) {
        if conn.is_upgraded() {
            let _ = self.terminate(conn, CloseReason::Shutdown).await;
        } else {
            self.on_transport_closed(conn, None).await;
        }
    }
}
