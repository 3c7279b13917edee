//! Demo handler: registers each connection under its request path and echoes
//! every message back.

use async_trait::async_trait;
use tracing::{debug, info};
use wsgate_core::errors::HandlerError;
use wsgate_server::codec::HandshakeRequest;
use wsgate_server::{ConnectionHandle, ConnectionHandler, DataRequest, RegistryHandle};

/// Echo handler backed by the connection registry.
pub struct EchoHandler {
    registry: RegistryHandle,
}

impl EchoHandler {
    pub fn new(registry: RegistryHandle) -> Self {
        Self { registry }
    }
}

/// Registry key for a connection: the request path without its leading
/// slash, or `conn-<seq>` for a bare `/`.
pub fn connection_id(request: &HandshakeRequest, conn: &ConnectionHandle) -> String {
    match request.path().trim_start_matches('/') {
        "" => format!("conn-{}", conn.seq()),
        path => path.to_owned(),
    }
}

#[async_trait]
impl ConnectionHandler for EchoHandler {
    async fn on_data(&self, request: DataRequest) {
        debug!(
            conn = request.conn.seq(),
            opcode = ?request.opcode,
            len = request.payload.len(),
            "message received"
        );
        let _ = request.reply(request.payload.clone());
    }

    async fn on_established(
        &self,
        conn: &ConnectionHandle,
        request: &HandshakeRequest,
    ) -> Result<(), HandlerError> {
        let id = connection_id(request, conn);
        info!(conn = conn.seq(), id = %id, peer = ?conn.peer(), "connection established");
        conn.bind_id(id.clone());
        self.registry.add(id, conn.clone()).await;
        Ok(())
    }

    async fn on_close(&self, conn: &ConnectionHandle) {
        info!(conn = conn.seq(), id = ?conn.id(), "connection closed");
        self.registry.release(conn).await;
    }
}
