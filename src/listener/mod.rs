/// Connection dispatcher
///
/// One TCP listener serves both client protocols. Each accepted connection is
/// peeked to classify it, then handed to exactly one path:
/// - HTTP request line: the axum server in [`http`], which upgrades web-sockets
/// - anything else: the connection handler directly, as a raw stream
///
/// Every connection runs on its own task tracked for draining on shutdown.
mod http;
pub mod peer;
pub mod sniff;
mod ws_stream;

pub use sniff::{classify, sniff, Protocol};
pub use ws_stream::WsStream;

use crate::errors::{ServiceError, ServiceResult};
use crate::logger::{self, LogTag};
use crate::session::{ClientConn, ConnectionHandler, Transport};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

const HTTP_BACKLOG: usize = 128;
const HTTP_STOP_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Dispatcher {
    listener: TcpListener,
    local_addr: SocketAddr,
    handler: Arc<dyn ConnectionHandler>,
    sniff_timeout: Duration,
    connections: TaskTracker,
}

impl Dispatcher {
    /// Create the listening socket. Failure is fatal to startup.
    pub async fn bind(
        addr: SocketAddr,
        handler: Arc<dyn ConnectionHandler>,
        sniff_timeout: Duration,
    ) -> ServiceResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServiceError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServiceError::Bind { addr, source })?;

        Ok(Self {
            listener,
            local_addr,
            handler,
            sniff_timeout,
            connections: TaskTracker::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Tracker of in-flight connection tasks
    pub fn connections(&self) -> TaskTracker {
        self.connections.clone()
    }

    /// Accept connections until closing fires
    pub async fn serve(&self, closing: CancellationToken) -> ServiceResult<()> {
        let (http_tx, http_rx) = mpsc::channel(HTTP_BACKLOG);
        let app = http::router(Arc::clone(&self.handler), self.connections.clone());
        let http_listener = http::ChannelListener::new(http_rx, self.local_addr);
        let http_closing = closing.clone();
        let http_server = tokio::spawn(async move {
            axum::serve(
                http_listener,
                app.into_make_service_with_connect_info::<http::PeerAddr>(),
            )
            .with_graceful_shutdown(async move { http_closing.cancelled().await })
            .await
        });

        logger::info(
            LogTag::Listener,
            &format!("Accepting client connections on {}", self.local_addr),
        );

        loop {
            let (stream, peer) = tokio::select! {
                biased;
                _ = closing.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        logger::warning(LogTag::Listener, &format!("Accept error: {}", e));
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                },
            };

            let http_tx = http_tx.clone();
            let handler = Arc::clone(&self.handler);
            let sniff_timeout = self.sniff_timeout;
            self.connections.spawn(async move {
                match sniff::sniff(&stream, sniff_timeout).await {
                    Protocol::Upgradable => {
                        logger::verbose(
                            LogTag::Listener,
                            &format!("HTTP connection from {}", peer),
                        );
                        if http_tx.send((stream, peer)).await.is_err() {
                            logger::debug(
                                LogTag::Listener,
                                &format!("HTTP server stopped, dropping {}", peer),
                            );
                        }
                    }
                    Protocol::Raw => {
                        logger::verbose(
                            LogTag::Listener,
                            &format!("Raw connection from {}", peer),
                        );
                        handler
                            .process(ClientConn::new(stream, peer, Transport::Raw))
                            .await;
                    }
                }
            });
        }

        drop(http_tx);
        match tokio::time::timeout(HTTP_STOP_TIMEOUT, http_server).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => {
                logger::warning(LogTag::Listener, &format!("HTTP server error: {}", e))
            }
            Ok(Err(e)) => {
                logger::warning(LogTag::Listener, &format!("HTTP server task failed: {}", e))
            }
            Err(_) => logger::warning(LogTag::Listener, "HTTP server did not stop in time"),
        }
        logger::info(LogTag::Listener, "Stopped accepting client connections");
        Ok(())
    }

    /// Wait for connection tasks to finish. Returns false on timeout.
    pub async fn drain(&self, timeout: Duration) -> bool {
        drain(&self.connections, timeout).await
    }
}

/// Close a connection tracker and wait for it to empty
pub async fn drain(connections: &TaskTracker, timeout: Duration) -> bool {
    connections.close();
    let drained = tokio::time::timeout(timeout, connections.wait())
        .await
        .is_ok();
    if !drained {
        logger::warning(
            LogTag::Listener,
            &format!(
                "{} client connections still open after {:?}",
                connections.len(),
                timeout
            ),
        );
    }
    drained
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::{SinkExt, StreamExt};
    use parking_lot::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    /// Records every session and echoes one chunk
    #[derive(Default)]
    struct Echo {
        seen: Mutex<Vec<Transport>>,
        peers: Mutex<Vec<SocketAddr>>,
    }

    #[async_trait]
    impl ConnectionHandler for Echo {
        async fn process(&self, conn: ClientConn) {
            self.seen.lock().push(conn.transport());
        self.peers.lock().push(conn.peer());
            let mut stream = conn.into_stream();
            let mut buf = [0u8; 64];
            if let Ok(n) = stream.read(&mut buf).await {
                let _ = stream.write_all(&buf[..n]).await;
                let _ = stream.flush().await;
            }
        }
    }

    async fn start() -> (Arc<Echo>, SocketAddr, CancellationToken, Arc<Dispatcher>) {
        let echo = Arc::new(Echo::default());
        let dispatcher = Arc::new(
            Dispatcher::bind(
                "127.0.0.1:0".parse().unwrap(),
                echo.clone(),
                Duration::from_millis(500),
            )
            .await
            .unwrap(),
        );
        let addr = dispatcher.local_addr();
        let closing = CancellationToken::new();
        let serving = Arc::clone(&dispatcher);
        let token = closing.clone();
        tokio::spawn(async move { serving.serve(token).await });
        (echo, addr, closing, dispatcher)
    }

    #[tokio::test]
    async fn test_raw_connection_reaches_handler() {
        let (echo, addr, closing, dispatcher) = start().await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(*echo.seen.lock(), vec![Transport::Raw]);

        closing.cancel();
        assert!(dispatcher.drain(Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_websocket_is_upgraded_and_bridged() {
        let (echo, addr, closing, dispatcher) = start().await;

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/", addr))
            .await
            .unwrap();
        let local = match ws.get_ref() {
            tokio_tungstenite::MaybeTlsStream::Plain(stream) => stream.local_addr().unwrap(),
            _ => unreachable!(),
        };
        ws.send(WsMessage::Binary(b"ping".to_vec())).await.unwrap();

        let reply = loop {
            match ws.next().await.unwrap().unwrap() {
                WsMessage::Binary(data) => break data,
                _ => continue,
            }
        };
        assert_eq!(reply, b"ping");
        assert_eq!(*echo.seen.lock(), vec![Transport::WebSocket]);
        assert_eq!(*echo.peers.lock(), vec![local]);

        drop(ws);
        closing.cancel();
        assert!(dispatcher.drain(Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_plain_http_request_is_answered_without_session() {
        let (echo, addr, closing, _dispatcher) = start().await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8_lossy(&response);

        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(echo.seen.lock().is_empty());
        closing.cancel();
    }

    #[tokio::test]
    async fn test_bind_conflict_is_fatal() {
        let (_echo, addr, closing, _dispatcher) = start().await;
        let result = Dispatcher::bind(addr, Arc::new(Echo::default()), Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ServiceError::Bind { .. })));
        closing.cancel();
    }
}
