//! Connection teardown and idle eviction.
//!
//! Every close path (peer close frame, malformed frame, transport loss, idle
//! eviction) funnels through [`Lifecycle::close`], which gates on the
//! connection's atomic closed flag so `on_close` runs at most once.
//!
//! Idle eviction keeps at most one check per connection in the time wheel,
//! keyed by the connection sequence number. A check that fires early
//! re-arms itself for the remaining idle budget.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use metrics::counter;
use tracing::{debug, info};

use crate::codec::frame::{CLOSE_GOING_AWAY, CLOSE_NORMAL};
use crate::metrics::{WS_CLOSED_TOTAL, WS_IDLE_EVICTIONS_TOTAL};
use crate::timewheel::{Job, TimerHandle};
use crate::websocket::connection::ConnectionHandle;
use crate::websocket::handler::ConnectionHandler;

/// Time wheel handle carrying idle checks keyed by connection sequence.
pub type IdleTimers = TimerHandle<u64, IdleCheck>;

/// Why a connection is being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer sent a close frame.
    PeerClose,
    /// No activity within the idle timeout.
    Idle,
    /// The peer sent a malformed frame.
    ProtocolError,
    /// The transport was closed or failed.
    Transport,
    /// The server is shutting down.
    Shutdown,
}

impl CloseReason {
    /// Metric label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PeerClose => "peer_close",
            Self::Idle => "idle",
            Self::ProtocolError => "protocol_error",
            Self::Transport => "transport",
            Self::Shutdown => "shutdown",
        }
    }

    /// Status of the close frame to send, if any. Protocol errors and lost
    /// transports close abruptly.
    pub fn close_code(self) -> Option<u16> {
        match self {
            Self::PeerClose => Some(CLOSE_NORMAL),
            Self::Idle | Self::Shutdown => Some(CLOSE_GOING_AWAY),
            Self::ProtocolError | Self::Transport => None,
        }
    }
}

/// State shared by the bridge and every idle check.
pub struct Lifecycle {
    handler: Arc<dyn ConnectionHandler>,
    timers: IdleTimers,
    idle_timeout: Duration,
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle")
            .field("idle_timeout", &self.idle_timeout)
            .finish_non_exhaustive()
    }
}

impl Lifecycle {
    /// Bundle the handler, the idle timer queue and the idle budget.
    pub fn new(
        handler: Arc<dyn ConnectionHandler>,
        timers: IdleTimers,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            handler,
            timers,
            idle_timeout,
        }
    }

    /// Application callbacks.
    pub fn handler(&self) -> &Arc<dyn ConnectionHandler> {
        &self.handler
    }

    /// Idle budget.
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Record activity and arm an idle check if none is outstanding.
    pub async fn activity(self: &Arc<Self>, conn: &ConnectionHandle) {
        conn.touch();
        if conn.arm_idle_check() {
            self.schedule(conn.clone(), self.idle_timeout).await;
        }
    }

    async fn schedule(self: &Arc<Self>, conn: ConnectionHandle, delay: Duration) {
        let key = conn.seq();
        let check = IdleCheck {
            conn,
            lifecycle: Arc::clone(self),
        };
        self.timers.add_timer(delay, Some(key), check).await;
    }

    /// Close `conn` once. Returns `false` if another path already closed it.
    pub async fn close(&self, conn: &ConnectionHandle, reason: CloseReason) -> bool {
        if !conn.mark_closed() {
            return false;
        }
        info!(
            conn = conn.seq(),
            id = conn.id().as_deref().unwrap_or("-"),
            reason = reason.as_str(),
            "connection closed"
        );
        self.handler.on_close(conn).await;
        if let Some(code) = reason.close_code() {
            let _ = conn.send_close(code);
        }
        conn.shutdown();
        self.timers.remove_timer(conn.seq()).await;
        counter!(WS_CLOSED_TOTAL, "reason" => reason.as_str()).increment(1);
        true
    }
}

/// A scheduled idle check for one connection.
pub struct IdleCheck {
    conn: ConnectionHandle,
    lifecycle: Arc<Lifecycle>,
}

impl fmt::Debug for IdleCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdleCheck")
            .field("conn", &self.conn.seq())
            .finish_non_exhaustive()
    }
}

impl IdleCheck {
    /// Evict the connection if it stayed idle for the whole budget, otherwise
    /// re-arm for the remainder.
    pub async fn run(self) {
        let Self { conn, lifecycle } = self;
        if conn.is_closed() {
            return;
        }
        let idle = conn.idle_for();
        let budget = lifecycle.idle_timeout;
        if idle >= budget {
            debug!(conn = conn.seq(), idle_ms = idle.as_millis(), "idle timeout");
            if lifecycle.close(&conn, CloseReason::Idle).await {
                counter!(WS_IDLE_EVICTIONS_TOTAL).increment(1);
            }
        } else {
            lifecycle.schedule(conn, budget - idle).await;
        }
    }
}

/// Time wheel job running idle checks.
pub fn idle_job() -> Job<IdleCheck> {
    Arc::new(|check: IdleCheck| check.run().boxed())
}
