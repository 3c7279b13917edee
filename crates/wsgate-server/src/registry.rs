//! Connection registry actor.
//!
//! Maps application identifiers to live connections. Every mutation travels
//! through one bounded queue and is applied by a single consumer task, so the
//! map needs no lock and the established counter always equals its size.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use metrics::counter;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use wsgate_core::errors::{ConfigError, RegistryConflict, RegistryOperation};

use crate::codec::OpCode;
use crate::metrics::REGISTRY_CONFLICTS_TOTAL;
use crate::websocket::connection::ConnectionHandle;

/// Default queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// A registry mutation.
#[derive(Debug)]
pub enum RegistryMessage {
    /// Register `conn` under `id`.
    Add {
        /// Application identifier.
        id: String,
        /// Connection to register.
        conn: ConnectionHandle,
    },
    /// Deregister `id`.
    Free {
        /// Application identifier.
        id: String,
        /// Connection sequence the entry must belong to; `None` frees
        /// whatever is registered.
        owner: Option<u64>,
    },
    /// Write a frame to the connection registered under `id`.
    Dispatch {
        /// Application identifier.
        id: String,
        /// Frame opcode.
        opcode: OpCode,
        /// Frame payload.
        payload: Bytes,
    },
}

impl RegistryMessage {
    /// Target identifier.
    pub fn id(&self) -> &str {
        match self {
            Self::Add { id, .. } | Self::Free { id, .. } | Self::Dispatch { id, .. } => id,
        }
    }

    /// Operation kind.
    pub fn operation(&self) -> RegistryOperation {
        match self {
            Self::Add { .. } => RegistryOperation::Add,
            Self::Free { .. } => RegistryOperation::Free,
            Self::Dispatch { .. } => RegistryOperation::Dispatch,
        }
    }
}

/// The map and counter owned by the consumer.
#[derive(Debug)]
pub struct RegistryState {
    conns: HashMap<String, ConnectionHandle>,
    established: Arc<AtomicUsize>,
}

impl RegistryState {
    fn new(established: Arc<AtomicUsize>) -> Self {
        Self {
            conns: HashMap::new(),
            established,
        }
    }

    /// Apply one message.
    pub fn apply(&mut self, message: RegistryMessage) -> Result<(), RegistryConflict> {
        match message {
            RegistryMessage::Add { id, conn } => {
                if self.conns.contains_key(&id) {
                    return Err(RegistryConflict::in_use(id));
                }
                debug!(%id, conn = conn.seq(), "registered");
                let _ = self.conns.insert(id, conn);
                let _ = self.established.fetch_add(1, Ordering::Release);
            }
            RegistryMessage::Free { id, owner } => {
                let Some(conn) = self.conns.get(&id) else {
                    return Err(RegistryConflict::not_found(id, RegistryOperation::Free));
                };
                if owner.is_some_and(|seq| seq != conn.seq()) {
                    return Err(RegistryConflict::not_owner(id));
                }
                let _ = self.conns.remove(&id);
                debug!(%id, "deregistered");
                let _ = self.established.fetch_sub(1, Ordering::Release);
            }
            RegistryMessage::Dispatch {
                id,
                opcode,
                payload,
            } => {
                let Some(conn) = self.conns.get(&id) else {
                    return Err(RegistryConflict::not_found(
                        id,
                        RegistryOperation::Dispatch,
                    ));
                };
                if !conn.send_frame(opcode, payload) {
                    return Err(RegistryConflict::unwritable(id));
                }
            }
        }
        Ok(())
    }

    /// Registered connection for `id`.
    pub fn get(&self, id: &str) -> Option<&ConnectionHandle> {
        self.conns.get(id)
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }
}

/// Cloneable producer side of a [`Registry`].
#[derive(Clone, Debug)]
pub struct RegistryHandle {
    tx: mpsc::Sender<RegistryMessage>,
    established: Arc<AtomicUsize>,
}

impl RegistryHandle {
    /// Register `conn` under `id`.
    pub async fn add(&self, id: impl Into<String>, conn: ConnectionHandle) {
        self.enqueue(RegistryMessage::Add {
            id: id.into(),
            conn,
        })
        .await;
    }

    /// Deregister `id`, whichever connection holds it.
    pub async fn free(&self, id: impl Into<String>) {
        self.enqueue(RegistryMessage::Free {
            id: id.into(),
            owner: None,
        })
        .await;
    }

    /// Deregister the id bound to `conn`, only if `conn` is the connection
    /// registered under it.
    pub async fn release(&self, conn: &ConnectionHandle) {
        let Some(id) = conn.id() else {
            return;
        };
        self.enqueue(RegistryMessage::Free {
            id,
            owner: Some(conn.seq()),
        })
        .await;
    }

    /// Write a frame to the connection registered under `id`.
    pub async fn dispatch(&self, id: impl Into<String>, opcode: OpCode, payload: impl Into<Bytes>) {
        self.enqueue(RegistryMessage::Dispatch {
            id: id.into(),
            opcode,
            payload: payload.into(),
        })
        .await;
    }

    /// Number of registered connections, as last applied by the consumer.
    pub fn established_count(&self) -> usize {
        self.established.load(Ordering::Acquire)
    }

    /// Suspends while the queue is full.
    async fn enqueue(&self, message: RegistryMessage) {
        if let Err(err) = self.tx.send(message).await {
            let message = err.0;
            warn!(
                id = message.id(),
                operation = %message.operation(),
                "registry stopped, message dropped"
            );
        }
    }
}

/// The registry actor, ready to be started.
#[derive(Debug)]
pub struct Registry {
    state: RegistryState,
    rx: mpsc::Receiver<RegistryMessage>,
    handle: RegistryHandle,
}

impl Registry {
    /// Build a registry with a queue of `capacity` messages.
    pub fn new(capacity: usize) -> Result<Self, ConfigError> {
        if capacity == 0 {
            return Err(ConfigError::invalid(
                "registry.queue_capacity",
                "must be positive",
            ));
        }
        let (tx, rx) = mpsc::channel(capacity);
        let established = Arc::new(AtomicUsize::new(0));
        Ok(Self {
            state: RegistryState::new(Arc::clone(&established)),
            rx,
            handle: RegistryHandle { tx, established },
        })
    }

    /// Producer handle.
    pub fn handle(&self) -> RegistryHandle {
        self.handle.clone()
    }

    /// Spawn the consumer. It stops when `cancel` fires or every handle is
    /// dropped.
    pub fn start(self, cancel: CancellationToken) -> JoinHandle<()> {
        let Self {
            mut state, mut rx, ..
        } = self;
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    message = rx.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                };
                if let Err(conflict) = state.apply(message) {
                    warn!(
                        id = %conflict.id,
                        operation = %conflict.operation,
                        reason = conflict.reason,
                        "registry message rejected"
                    );
                    counter!(REGISTRY_CONFLICTS_TOTAL, "operation" => conflict.operation.to_string())
                        .increment(1);
                }
            }
            debug!(registered = state.len(), "registry stopped");
        })
    }
}
