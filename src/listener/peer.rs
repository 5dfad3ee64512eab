/// Inter-node route listener
///
/// Peers open direct connections to the address advertised in their `route`
/// tag. Message forwarding between nodes is not implemented yet, so accepted
/// connections are logged and dropped.
use crate::errors::{ServiceError, ServiceResult};
use crate::logger::{self, LogTag};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

pub type RouteHandler = fn(TcpStream, SocketAddr);

pub async fn bind(addr: SocketAddr) -> ServiceResult<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServiceError::Bind { addr, source })
}

/// Accept peer connections until closing fires
pub async fn serve(listener: TcpListener, closing: CancellationToken, on_accept: RouteHandler) {
    if let Ok(addr) = listener.local_addr() {
        logger::info(LogTag::Listener, &format!("Route listener on {}", addr));
    }
    loop {
        tokio::select! {
            _ = closing.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => on_accept(stream, peer),
                Err(e) => logger::warning(
                    LogTag::Listener,
                    &format!("Route accept error: {}", e),
                ),
            },
        }
    }
    logger::debug(LogTag::Listener, "Route listener stopped");
}

/// Placeholder accept callback
pub fn drop_peer(stream: TcpStream, peer: SocketAddr) {
    logger::debug(
        LogTag::Listener,
        &format!("Peer connection from {} dropped (routing not enabled)", peer),
    );
    drop(stream);
}
