//! `WsServer`: TCP listener and per-connection reader/writer tasks.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use axum::Router;
use bytes::Bytes;
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusHandle;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wsgate_core::errors::ConfigError;

use crate::config::ServerConfig;
use crate::health::{self, HealthState};
use crate::metrics::{WS_ACCEPTED_TOTAL, WS_CONNECTIONS_ACTIVE};
use crate::pool::WorkerPool;
use crate::registry::{Registry, RegistryHandle};
use crate::shutdown::ShutdownCoordinator;
use crate::timewheel::TimeWheel;
use crate::websocket::bridge::{Action, EventBridge};
use crate::websocket::connection::{Connection, ConnectionHandle};
use crate::websocket::handler::ConnectionHandler;
use crate::websocket::lifecycle::{IdleCheck, idle_job};

/// State shared by the accept loop and every connection task.
struct Shared {
    bridge: EventBridge,
    live: Arc<AtomicUsize>,
    next_seq: AtomicU64,
    outbound_queue: usize,
}

/// The wsgate server.
pub struct WsServer {
    config: ServerConfig,
    shared: Arc<Shared>,
    /// Taken by the first `listen`.
    wheel: Mutex<Option<TimeWheel<u64, IdleCheck>>>,
    registry: Mutex<Option<Registry>>,
    registry_handle: RegistryHandle,
    shutdown: ShutdownCoordinator,
    start_time: Instant,
    metrics: Option<PrometheusHandle>,
}

impl WsServer {
    /// Validate `config` and build the wheel, pool and bridge.
    ///
    /// Nothing runs until [`WsServer::listen`].
    pub fn new(
        config: ServerConfig,
        handler: Arc<dyn ConnectionHandler>,
        registry: Registry,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let wheel = TimeWheel::new(config.wheel_config(), idle_job())?;
        let pool = WorkerPool::new(config.pool_config())?;
        let bridge = EventBridge::new(handler, pool, wheel.handle(), &config.bridge_config());

        Ok(Self {
            shared: Arc::new(Shared {
                bridge,
                live: Arc::new(AtomicUsize::new(0)),
                next_seq: AtomicU64::new(1),
                outbound_queue: config.outbound_queue,
            }),
            registry_handle: registry.handle(),
            wheel: Mutex::new(Some(wheel)),
            registry: Mutex::new(Some(registry)),
            shutdown: ShutdownCoordinator::new(),
            start_time: Instant::now(),
            metrics: None,
            config,
        })
    }

    /// Serve `/metrics` from this Prometheus handle.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Registry producer handle.
    pub fn registry(&self) -> &RegistryHandle {
        &self.registry_handle
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &ShutdownCoordinator {
        &self.shutdown
    }

    /// Worker pool running `on_data`.
    pub fn pool(&self) -> &WorkerPool {
        self.shared.bridge.pool()
    }

    /// Live transport sessions.
    pub fn live_connections(&self) -> usize {
        self.shared.live.load(Ordering::Relaxed)
    }

    /// Connections registered by the application.
    pub fn established_count(&self) -> usize {
        self.registry_handle.established_count()
    }

    /// Router serving `/health` and `/metrics`.
    pub fn health_router(&self) -> Router {
        health::router(HealthState {
            start_time: self.start_time,
            live: Arc::clone(&self.shared.live),
            registry: self.registry_handle.clone(),
            metrics: self.metrics.clone(),
        })
    }

    /// Bind the listener, start the background tasks and the accept loop.
    ///
    /// Returns the bound address and the accept loop handle.
    pub async fn listen(&self) -> io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(self.config.bind_addr()).await?;
        let addr = listener.local_addr()?;
        self.start_background();

        let accept = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.shared),
            self.shutdown.token(),
        ));
        info!(%addr, "websocket server listening");
        Ok((addr, accept))
    }

    /// Serve the health router on `addr` until shutdown.
    pub async fn serve_health(&self, addr: &str) -> io::Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let bound = listener.local_addr()?;
        let router = self.health_router();
        let token = self.shutdown.token();
        let handle = tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, router)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
            {
                warn!(error = %err, "health server failed");
            }
        });
        self.shutdown.track("health", handle);
        info!(addr = %bound, "health endpoint listening");
        Ok(bound)
    }

    /// Stop accepting, close upgraded connections with `1001`, stop the
    /// background tasks and release the pool.
    pub async fn shutdown_gracefully(&self, timeout: Option<Duration>) {
        self.shutdown.graceful_shutdown(timeout).await;
        self.pool().release();
        info!("websocket server stopped");
    }

    fn start_background(&self) {
        let token = self.shutdown.token();
        if let Some(wheel) = self.wheel.lock().take() {
            self.shutdown.track("time_wheel", wheel.start(token.child_token()));
        }
        if let Some(registry) = self.registry.lock().take() {
            self.shutdown
                .track("registry", registry.start(token.child_token()));
        }
        self.shutdown
            .track("pool_purger", self.pool().start_purger(token.child_token()));
        if self.config.readout_interval_secs > 0 {
            self.shutdown.track(
                "readout",
                health::spawn_readout(
                    Duration::from_secs(self.config.readout_interval_secs),
                    Arc::clone(&self.shared.live),
                    self.registry_handle.clone(),
                    token.child_token(),
                ),
            );
        }
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, cancel: CancellationToken) {
    loop {
        let (stream, peer) = tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    continue;
                }
            },
        };
        let seq = shared.next_seq.fetch_add(1, Ordering::Relaxed);
        counter!(WS_ACCEPTED_TOTAL).increment(1);
        let _ = tokio::spawn(drive(stream, peer, seq, Arc::clone(&shared), cancel.clone()));
    }
    debug!("accept loop stopped");
}

/// Reader side of one connection. Owns the `Connection` and is the only task
/// that changes its state.
async fn drive(
    stream: TcpStream,
    peer: SocketAddr,
    seq: u64,
    shared: Arc<Shared>,
    server_cancel: CancellationToken,
) {
    let _ = stream.set_nodelay(true);
    let (mut reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::channel(shared.outbound_queue);
    let handle = ConnectionHandle::new(seq, Some(peer), tx);
    let token = handle.shutdown_token();
    let writer_task = tokio::spawn(write_loop(writer, rx, token.clone()));

    let _ = shared.live.fetch_add(1, Ordering::Relaxed);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
    debug!(conn = seq, %peer, "accepted");

    let bridge = &shared.bridge;
    let mut conn = Connection::new(handle.clone());
    let error = loop {
        let read = tokio::select! {
            () = token.cancelled() => break None,
            () = server_cancel.cancelled() => None,
            read = reader.read_buf(conn.inbound_mut()) => Some(read),
        };
        let Some(read) = read else {
            bridge.on_server_shutdown(&mut conn).await;
            break None;
        };
        match read {
            Ok(0) => break None,
            Ok(_) => {
                if bridge.react(&mut conn).await == Action::Close {
                    break None;
                }
            }
            Err(err) => break Some(err),
        }
    };

    if !conn.is_closed() {
        bridge.on_transport_closed(&mut conn, error.as_ref()).await;
    }
    handle.shutdown();
    let _ = writer_task.await;

    let _ = shared.live.fetch_sub(1, Ordering::Relaxed);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    debug!(conn = seq, dropped_writes = handle.dropped_writes(), "released");
}

/// Writer side of one connection: drains the outbound queue, then flushes
/// what is left and shuts the socket down once the connection is released.
async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Bytes>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            frame = rx.recv() => {
                let Some(bytes) = frame else { break };
                if let Err(err) = writer.write_all(&bytes).await {
                    debug!(error = %err, "write failed");
                    token.cancel();
                    return;
                }
            }
            () = token.cancelled() => {
                while let Ok(bytes) = rx.try_recv() {
                    if writer.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;
    use wsgate_core::errors::TimerConfigError;

    use crate::websocket::handler::DataRequest;

    #[derive(Default)]
    struct Echo {
        closed: AtomicUsize,
    }

    #[async_trait]
    impl ConnectionHandler for Echo {
        async fn on_data(&self, request: DataRequest) {
            let _ = request.reply(request.payload.clone());
        }

        async fn on_close(&self, _conn: &ConnectionHandle) {
            let _ = self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn make_server(config: ServerConfig) -> WsServer {
        WsServer::new(config, Arc::new(Echo::default()), Registry::new(16).unwrap()).unwrap()
    }

    const REQUEST: &str = "GET /t HTTP/1.1\r\n\
        Host: localhost\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\r\n";

    async fn read_until_blank_line(stream: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        while !buf.ends_with(b"\r\n\r\n") {
            let n = stream.read(&mut byte).await.unwrap();
            assert_eq!(n, 1, "connection closed during handshake");
            buf.push(byte[0]);
        }
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn invalid_config_rejected() {
        let config = ServerConfig {
            wheel_slots: 0,
            ..ServerConfig::default()
        };
        let result = WsServer::new(config, Arc::new(Echo::default()), Registry::new(1).unwrap());
        assert!(matches!(
            result,
            Err(ConfigError::Timer(TimerConfigError::ZeroSlots))
        ));
    }

    #[tokio::test]
    async fn server_with_default_config() {
        let server = make_server(ServerConfig::default());
        assert_eq!(server.config().host, "127.0.0.1");
        assert_eq!(server.live_connections(), 0);
        assert_eq!(server.established_count(), 0);
        assert!(!server.shutdown().is_shutting_down());
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let server = make_server(ServerConfig::default());
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = server.health_router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn raw_tcp_handshake_and_echo() {
        let server = make_server(ServerConfig::default());
        let (addr, _accept) = server.listen().await.unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(REQUEST.as_bytes()).await.unwrap();
        let response = read_until_blank_line(&mut stream).await;
        assert!(response.starts_with("HTTP/1.1 101"));
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));

        // Masked "Hello" from RFC 6455 section 5.7.
        stream
            .write_all(&[0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58])
            .await
            .unwrap();
        let mut echo = [0u8; 7];
        stream.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo, &[0x81, 0x05, b'H', b'e', b'l', b'l', b'o']);

        server.shutdown_gracefully(Some(Duration::from_secs(2))).await;
    }

    #[tokio::test]
    async fn bad_handshake_gets_400_and_eof() {
        let server = make_server(ServerConfig::default());
        let (addr, _accept) = server.listen().await.unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        let _ = stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 400 Bad Request"));

        server.shutdown_gracefully(Some(Duration::from_secs(2))).await;
    }

    #[tokio::test]
    async fn shutdown_sends_going_away() {
        let server = make_server(ServerConfig::default());
        let (addr, _accept) = server.listen().await.unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(REQUEST.as_bytes()).await.unwrap();
        let _ = read_until_blank_line(&mut stream).await;

        server.shutdown_gracefully(Some(Duration::from_secs(2))).await;
        let mut tail = Vec::new();
        let _ = stream.read_to_end(&mut tail).await.unwrap();
        assert_eq!(tail, vec![0x88, 0x02, 0x03, 0xE9]);
        assert!(server.pool().is_closed());
    }
}
