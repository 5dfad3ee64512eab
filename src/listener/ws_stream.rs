use axum::extract::ws::{Message, WebSocket};
use futures::{ready, Sink, Stream};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Byte stream over a web-socket
///
/// Reads concatenate the payloads of binary and text frames; writes go out as
/// binary frames. A close frame reads as end of stream.
pub struct WsStream {
    socket: WebSocket,
    pending: Vec<u8>,
    offset: usize,
    closed: bool,
}

impl WsStream {
    pub fn new(socket: WebSocket) -> Self {
        Self {
            socket,
            pending: Vec::new(),
            offset: 0,
            closed: false,
        }
    }
}

fn to_io(e: axum::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}

impl AsyncRead for WsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.offset < this.pending.len() {
                let n = buf.remaining().min(this.pending.len() - this.offset);
                buf.put_slice(&this.pending[this.offset..this.offset + n]);
                this.offset += n;
                return Poll::Ready(Ok(()));
            }
            if this.closed {
                return Poll::Ready(Ok(()));
            }

            match ready!(Pin::new(&mut this.socket).poll_next(cx)) {
                Some(Ok(Message::Binary(data))) => {
                    this.pending = data.to_vec();
                    this.offset = 0;
                }
                Some(Ok(Message::Text(text))) => {
                    this.pending = text.as_str().as_bytes().to_vec();
                    this.offset = 0;
                }
                Some(Ok(Message::Close(_))) | None => this.closed = true,
                Some(Ok(_)) => {}
                Some(Err(e)) => return Poll::Ready(Err(to_io(e))),
            }
        }
    }
}

impl AsyncWrite for WsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(Pin::new(&mut this.socket).poll_ready(cx)).map_err(to_io)?;
        Pin::new(&mut this.socket)
            .start_send(Message::Binary(buf.to_vec().into()))
            .map_err(to_io)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().socket)
            .poll_flush(cx)
            .map_err(to_io)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().socket)
            .poll_close(cx)
            .map_err(to_io)
    }
}
