use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;

/// Wire protocol of an accepted connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Broker's native stream protocol
    Raw,
    /// HTTP/1.x request line, possibly a web-socket upgrade
    Upgradable,
}

const METHODS: [&[u8]; 9] = [
    b"GET ",
    b"POST ",
    b"PUT ",
    b"DELETE ",
    b"HEAD ",
    b"OPTIONS ",
    b"PATCH ",
    b"CONNECT ",
    b"TRACE ",
];

/// Longest method token including the trailing space
const MAX_PREFIX: usize = 8;

const PEEK_RETRY: Duration = Duration::from_millis(5);

/// Classify a connection by its leading bytes. Undecided prefixes are raw.
pub fn classify(prefix: &[u8]) -> Protocol {
    decide(prefix).unwrap_or(Protocol::Raw)
}

/// `None` while more bytes could still complete a method token
fn decide(prefix: &[u8]) -> Option<Protocol> {
    let mut undecided = false;
    for method in METHODS {
        if prefix.len() >= method.len() {
            if prefix.starts_with(method) {
                return Some(Protocol::Upgradable);
            }
        } else if method.starts_with(prefix) {
            undecided = true;
        }
    }
    if undecided {
        None
    } else {
        Some(Protocol::Raw)
    }
}

/// Peek at a stream until its protocol is known, it closes, or `timeout` passes.
/// Never consumes bytes.
pub async fn sniff(stream: &TcpStream, timeout: Duration) -> Protocol {
    let deadline = Instant::now() + timeout;
    let mut buf = [0u8; MAX_PREFIX];
    let mut seen = 0;

    loop {
        let peeked = tokio::time::timeout_at(deadline, stream.peek(&mut buf)).await;
        match peeked {
            Ok(Ok(0)) | Ok(Err(_)) => return Protocol::Raw,
            Ok(Ok(n)) => {
                if let Some(protocol) = decide(&buf[..n]) {
                    return protocol;
                }
                seen = n;
            }
            Err(_) => return classify(&buf[..seen]),
        }

        // Partial prefix; wait for more bytes to arrive
        if Instant::now() + PEEK_RETRY >= deadline {
            return classify(&buf[..seen]);
        }
        tokio::time::sleep(PEEK_RETRY).await;
    }
}
