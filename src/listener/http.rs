/// HTTP and web-socket path of the dispatcher
///
/// Connections classified as HTTP are pushed through a channel into an axum
/// server. Any request carrying web-socket upgrade headers is upgraded and
/// handed to the connection handler as a byte stream; everything else gets a
/// plain HTTP response.
use crate::listener::ws_stream::WsStream;
use crate::logger::{self, LogTag};
use crate::session::{ClientConn, ConnectionHandler, Transport};
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::connect_info::Connected;
use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::serve::IncomingStream;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;

/// Listener fed by the dispatcher's accept loop
pub(crate) struct ChannelListener {
    incoming: mpsc::Receiver<(TcpStream, SocketAddr)>,
    local_addr: SocketAddr,
}

impl ChannelListener {
    pub fn new(incoming: mpsc::Receiver<(TcpStream, SocketAddr)>, local_addr: SocketAddr) -> Self {
        Self {
            incoming,
            local_addr,
        }
    }
}

impl axum::serve::Listener for ChannelListener {
    type Io = TcpStream;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        match self.incoming.recv().await {
            Some(accepted) => accepted,
            // Dispatcher stopped; the server exits through graceful shutdown
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> std::io::Result<Self::Addr> {
        Ok(self.local_addr)
    }
}

/// Peer address of a connection handed over by the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PeerAddr(pub SocketAddr);

impl Connected<IncomingStream<'_, ChannelListener>> for PeerAddr {
    fn connect_info(stream: IncomingStream<'_, ChannelListener>) -> Self {
        PeerAddr(*stream.remote_addr())
    }
}

#[derive(Clone)]
struct HttpState {
    handler: Arc<dyn ConnectionHandler>,
    sessions: TaskTracker,
}

pub(crate) fn router(handler: Arc<dyn ConnectionHandler>, sessions: TaskTracker) -> Router {
    Router::new()
        .fallback(upgrade_or_respond)
        .with_state(HttpState { handler, sessions })
}

async fn upgrade_or_respond(
    State(state): State<HttpState>,
    ConnectInfo(PeerAddr(peer)): ConnectInfo<PeerAddr>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Ok(upgrade) = upgrade else {
        return (StatusCode::OK, "broker node\n").into_response();
    };

    upgrade.on_upgrade(move |socket| {
        logger::debug(
            LogTag::Listener,
            &format!("Web-socket upgraded for {}", peer),
        );
        let conn = ClientConn::new(WsStream::new(socket), peer, Transport::WebSocket);
        let HttpState { handler, sessions } = state;
        sessions.track_future(async move { handler.process(conn).await })
    })
}
