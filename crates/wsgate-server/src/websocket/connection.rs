//! Per-connection state.
//!
//! [`ConnectionHandle`] is the shared half: the registry, timer payloads and
//! business tasks all hold clones. [`Connection`] is the half owned by the
//! connection's reader task, which is the only writer of its upgrade state.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use wsgate_core::errors::FrameError;

use crate::codec::{Frame, FrameCodec, OpCode, PendingHandshake, encode_server_frame};
use crate::metrics::WS_WRITES_DROPPED_TOTAL;

struct HandleInner {
    seq: u64,
    peer: Option<SocketAddr>,
    /// Application identifier, bound during `on_established`.
    id: Mutex<Option<String>>,
    /// Encoded frames for the writer task.
    tx: mpsc::Sender<Bytes>,
    closed: AtomicBool,
    last_active: Mutex<Instant>,
    /// Whether an idle check is outstanding in the time wheel.
    check_armed: AtomicBool,
    dropped_writes: AtomicU64,
    /// Fired once the transport should be released.
    shutdown: CancellationToken,
}

/// Shared, cheaply cloneable view of one connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("seq", &self.inner.seq)
            .field("peer", &self.inner.peer)
            .field("id", &self.id())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl ConnectionHandle {
    /// Create a handle writing encoded frames into `tx`.
    pub fn new(seq: u64, peer: Option<SocketAddr>, tx: mpsc::Sender<Bytes>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                seq,
                peer,
                id: Mutex::new(None),
                tx,
                closed: AtomicBool::new(false),
                last_active: Mutex::new(Instant::now()),
                check_armed: AtomicBool::new(false),
                dropped_writes: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Process-unique sequence number assigned at accept time.
    pub fn seq(&self) -> u64 {
        self.inner.seq
    }

    /// Remote address, if known.
    pub fn peer(&self) -> Option<SocketAddr> {
        self.inner.peer
    }

    /// Bind the application identifier.
    pub fn bind_id(&self, id: impl Into<String>) {
        *self.inner.id.lock() = Some(id.into());
    }

    /// Bound application identifier.
    pub fn id(&self) -> Option<String> {
        self.inner.id.lock().clone()
    }

    /// Whether the connection has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Set the closed flag. Returns `true` only for the caller that flipped it.
    pub fn mark_closed(&self) -> bool {
        !self.inner.closed.swap(true, Ordering::AcqRel)
    }

    /// Record inbound activity now.
    pub fn touch(&self) {
        *self.inner.last_active.lock() = Instant::now();
    }

    /// Time since the last recorded activity.
    pub fn idle_for(&self) -> Duration {
        self.inner.last_active.lock().elapsed()
    }

    /// Claim the single outstanding idle-check slot.
    ///
    /// Returns `true` if no check was armed and the caller must schedule one.
    pub fn arm_idle_check(&self) -> bool {
        self.inner
            .check_armed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Encode and queue a server frame.
    ///
    /// Returns `false` if the connection is closed or its queue is full.
    pub fn send_frame(&self, opcode: OpCode, payload: impl Into<Bytes>) -> bool {
        self.send_raw(encode_server_frame(Frame::new(opcode, payload)))
    }

    /// Queue a text frame.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.send_frame(OpCode::Text, text.into())
    }

    /// Queue pre-encoded bytes.
    ///
    /// Returns `false` if the connection is closed or its queue is full.
    pub fn send_raw(&self, bytes: Bytes) -> bool {
        if self.is_closed() {
            return false;
        }
        self.enqueue(bytes)
    }

    /// Queue a close frame regardless of the closed flag.
    pub(crate) fn send_close(&self, code: u16) -> bool {
        self.enqueue(encode_server_frame(Frame::close(Some(code))))
    }

    fn enqueue(&self, bytes: Bytes) -> bool {
        if self.inner.tx.try_send(bytes).is_ok() {
            true
        } else {
            let _ = self.inner.dropped_writes.fetch_add(1, Ordering::Relaxed);
            counter!(WS_WRITES_DROPPED_TOTAL).increment(1);
            false
        }
    }

    /// Writes dropped on a full or closed queue.
    pub fn dropped_writes(&self) -> u64 {
        self.inner.dropped_writes.load(Ordering::Relaxed)
    }

    /// Ask the transport tasks to flush queued frames and release the socket.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Whether `shutdown` has been requested.
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Token cancelled by `shutdown`.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }
}

/// Upgrade state of a connection.
#[derive(Debug)]
pub enum ConnState {
    /// Waiting for a complete upgrade request.
    Unupgraded(PendingHandshake),
    /// Exchanging frames.
    Upgraded(UpgradedState),
    /// Terminal.
    Closed,
}

/// Frame decoding state of an upgraded connection.
#[derive(Debug)]
pub struct UpgradedState {
    pub(crate) codec: FrameCodec,
    max_message: usize,
    /// Opcode and payload collected so far for a fragmented message.
    partial: Option<(OpCode, BytesMut)>,
}

impl UpgradedState {
    /// Decoder accepting messages up to `max_message` bytes.
    pub fn new(max_message: usize) -> Self {
        Self {
            codec: FrameCodec::server().max_payload(max_message),
            max_message,
            partial: None,
        }
    }

    /// Feed a data or continuation frame.
    ///
    /// Returns the whole message once its final fragment arrived.
    pub fn assemble(&mut self, frame: Frame) -> Result<Option<(OpCode, Bytes)>, FrameError> {
        match (frame.opcode, self.partial.take()) {
            (OpCode::Continuation, None) => Err(FrameError::ProtocolViolation(
                "continuation frame without a message in progress",
            )),
            (OpCode::Continuation, Some((opcode, mut buf))) => {
                let size = buf.len() + frame.payload.len();
                if size > self.max_message {
                    return Err(FrameError::PayloadTooLarge {
                        size: size as u64,
                        max: self.max_message,
                    });
                }
                buf.extend_from_slice(&frame.payload);
                if frame.fin {
                    Ok(Some((opcode, buf.freeze())))
                } else {
                    self.partial = Some((opcode, buf));
                    Ok(None)
                }
            }
            (_, Some(_)) => Err(FrameError::ProtocolViolation(
                "new data frame before the fragmented message finished",
            )),
            (opcode, None) if frame.fin => Ok(Some((opcode, frame.payload))),
            (opcode, None) => {
                self.partial = Some((opcode, BytesMut::from(&frame.payload[..])));
                Ok(None)
            }
        }
    }
}

/// Reader-task-owned record for one transport session.
#[derive(Debug)]
pub struct Connection {
    pub(crate) handle: ConnectionHandle,
    pub(crate) state: ConnState,
    /// Bytes read from the transport and not yet consumed.
    pub(crate) inbound: BytesMut,
}

impl Connection {
    /// A connection that has not upgraded yet.
    pub fn new(handle: ConnectionHandle) -> Self {
        Self {
            handle,
            state: ConnState::Unupgraded(PendingHandshake::new()),
            inbound: BytesMut::with_capacity(4096),
        }
    }

    /// Shared handle.
    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    /// Current upgrade state.
    pub fn state(&self) -> &ConnState {
        &self.state
    }

    /// Whether the connection completed its handshake and is not closed.
    pub fn is_upgraded(&self) -> bool {
        matches!(self.state, ConnState::Upgraded(_))
    }

    /// Whether the connection reached its terminal state.
    pub fn is_closed(&self) -> bool {
        matches!(self.state, ConnState::Closed)
    }

    /// Buffer the transport reads into.
    pub fn inbound_mut(&mut self) -> &mut BytesMut {
        &mut self.inbound
    }
}
