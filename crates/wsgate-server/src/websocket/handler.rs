//! Application callbacks.

use async_trait::async_trait;
use bytes::Bytes;
use wsgate_core::errors::HandlerError;

use crate::codec::{HandshakeRequest, OpCode};
use crate::websocket::connection::ConnectionHandle;

/// A complete data message handed to the worker pool.
#[derive(Debug, Clone)]
pub struct DataRequest {
    /// Message payload, owned by the request.
    pub payload: Bytes,
    /// `Text` or `Binary`.
    pub opcode: OpCode,
    /// Connection the message arrived on; also the reply channel.
    pub conn: ConnectionHandle,
}

impl DataRequest {
    /// Payload as UTF-8, for text messages.
    pub fn text(&self) -> Option<&str> {
        if self.opcode == OpCode::Text {
            std::str::from_utf8(&self.payload).ok()
        } else {
            None
        }
    }

    /// Reply on the same connection with the same opcode.
    pub fn reply(&self, payload: impl Into<Bytes>) -> bool {
        self.conn.send_frame(self.opcode, payload)
    }
}

/// Hooks the server calls over a connection's lifetime.
///
/// `on_established` and `on_close` run on the connection's reader task (or
/// on an eviction task); `on_data` runs on the worker pool.
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    /// A text or binary message arrived.
    async fn on_data(&self, request: DataRequest);

    /// The handshake completed. Returning an error closes the connection
    /// without calling `on_close`.
    async fn on_established(
        &self,
        conn: &ConnectionHandle,
        request: &HandshakeRequest,
    ) -> Result<(), HandlerError> {
        let _ = (conn, request);
        Ok(())
    }

    /// An upgraded connection closed. Called at most once per connection.
    async fn on_close(&self, conn: &ConnectionHandle) {
        let _ = conn;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    struct Silent;

    #[async_trait]
    impl ConnectionHandler for Silent {
        async fn on_data(&self, _request: DataRequest) {}
    }

    fn request(opcode: OpCode, payload: &'static [u8]) -> (DataRequest, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(4);
        let request = DataRequest {
            payload: Bytes::from_static(payload),
            opcode,
            conn: ConnectionHandle::new(1, None, tx),
        };
        (request, rx)
    }

    #[test]
    fn text_accessor() {
        let (req, _rx) = request(OpCode::Text, b"hi");
        assert_eq!(req.text(), Some("hi"));
        let (req, _rx) = request(OpCode::Binary, b"hi");
        assert_eq!(req.text(), None);
    }

    #[test]
    fn reply_keeps_opcode() {
        let (req, mut rx) = request(OpCode::Binary, b"x");
        assert!(req.reply(Bytes::from_static(b"y")));
        assert_eq!(&rx.try_recv().unwrap()[..], &[0x82, 0x01, b'y']);
    }

    #[tokio::test]
    async fn default_hooks() {
        let (tx, _rx) = mpsc::channel(1);
        let conn = ConnectionHandle::new(1, None, tx);
        let request = HandshakeRequest {
            method: "GET".into(),
            uri: "/".into(),
            headers: Vec::new(),
        };
        assert!(Silent.on_established(&conn, &request).await.is_ok());
        Silent.on_close(&conn).await;
    }
}
