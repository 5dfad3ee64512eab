/// Client sessions
///
/// The dispatcher hands every accepted client connection, raw or upgraded
/// web-socket, to a [`ConnectionHandler`] as a [`ClientConn`]. The default
/// handler is [`Sessions`], which runs a [`conn::Conn`] per connection.
mod conn;

pub use conn::{ClientMessage, Conn, ServerMessage, Sessions};

use async_trait::async_trait;
use std::fmt;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};

/// Bidirectional byte stream a session runs over
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ByteStream for T {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Raw,
    WebSocket,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Raw => write!(f, "raw"),
            Transport::WebSocket => write!(f, "websocket"),
        }
    }
}

/// An accepted client connection
pub struct ClientConn {
    stream: Box<dyn ByteStream>,
    peer: SocketAddr,
    transport: Transport,
}

impl ClientConn {
    pub fn new<S: ByteStream + 'static>(stream: S, peer: SocketAddr, transport: Transport) -> Self {
        Self {
            stream: Box::new(stream),
            peer,
            transport,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn into_stream(self) -> Box<dyn ByteStream> {
        self.stream
    }
}

impl fmt::Debug for ClientConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConn")
            .field("peer", &self.peer)
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

/// Processes one client connection until it ends
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    async fn process(&self, conn: ClientConn);
}
