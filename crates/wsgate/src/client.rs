//! Demo client: sends a message on a fixed interval and logs the replies.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client options.
pub struct ClientOptions {
    pub url: String,
    pub message: String,
    pub interval: Duration,
    /// Round trips before closing; unbounded when `None`.
    pub count: Option<u64>,
}

pub async fn run(options: ClientOptions) -> Result<()> {
    let (mut ws, _) = connect_async(options.url.as_str())
        .await
        .with_context(|| format!("Failed to connect to {}", options.url))?;
    info!(url = %options.url, "connected");

    let mut ticker = tokio::time::interval(options.interval);
    let mut sent = 0u64;
    while options.count.is_none_or(|count| sent < count) {
        let _ = ticker.tick().await;
        ws.send(Message::text(options.message.clone()))
            .await
            .context("Failed to send message")?;
        sent += 1;
        info!(message = %options.message, "sent");

        match next_reply(&mut ws).await? {
            Some(reply) => info!(reply = %reply, "received"),
            None => {
                info!("server closed the connection");
                return Ok(());
            }
        }
    }

    ws.close(None).await.context("Failed to close connection")?;
    Ok(())
}

/// Wait for the next data message, skipping control frames.
async fn next_reply(ws: &mut WsStream) -> Result<Option<String>> {
    while let Some(message) = ws.next().await {
        match message.context("Failed to read reply")? {
            Message::Text(text) => return Ok(Some(text.as_str().to_owned())),
            Message::Binary(data) => return Ok(Some(String::from_utf8_lossy(&data).into_owned())),
            Message::Close(frame) => {
                debug!(?frame, "close frame received");
                return Ok(None);
            }
            other => debug!(?other, "control frame skipped"),
        }
    }
    Ok(None)
}

/// Reject URLs the client cannot dial.
pub fn check_url(url: &str) -> Result<()> {
    if !url.starts_with("ws://") {
        bail!("unsupported url {url:?}: only ws:// is supported");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_plain_websocket_urls() {
        assert!(check_url("ws://127.0.0.1:8081/echo").is_ok());
        assert!(check_url("wss://example.com/").is_err());
        assert!(check_url("http://127.0.0.1/").is_err());
    }
}
