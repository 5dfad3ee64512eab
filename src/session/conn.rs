/// Default client session
///
/// Speaks newline-delimited JSON control messages:
/// - `{"type":"subscribe","topic":"chat/room1"}`
/// - `{"type":"unsubscribe","topic":"chat/room1"}`
/// - `{"type":"ping"}`
///
/// Each message gets one reply line (`ack`, `pong` or `error`). A line longer
/// than the session limit gets an `error` reply and closes the connection. When
/// the client disconnects, every topic it still holds is unsubscribed.
use crate::cluster::EventKind;
use crate::logger::{self, LogTag};
use crate::service::Registry;
use crate::session::{ClientConn, ConnectionHandler};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

/// Longest control line a client may send
pub const MAX_LINE_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    Ping,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Ack { op: String, topic: String },
    Pong,
    Error { message: String },
}

/// Default connection handler
pub struct Sessions {
    registry: Arc<Registry>,
    closing: CancellationToken,
    next_id: AtomicU64,
    max_line_len: usize,
}

impl Sessions {
    pub fn new(registry: Arc<Registry>, closing: CancellationToken) -> Self {
        Self {
            registry,
            closing,
            next_id: AtomicU64::new(1),
            max_line_len: MAX_LINE_LEN,
        }
    }

    pub fn with_max_line_len(mut self, max_line_len: usize) -> Self {
        self.max_line_len = max_line_len;
        self
    }
}

#[async_trait]
impl ConnectionHandler for Sessions {
    async fn process(&self, conn: ClientConn) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let peer = conn.peer();
        logger::debug(
            LogTag::Session,
            &format!("Session {} opened ({} from {})", id, conn.transport(), peer),
        );

        let mut session = Conn::new(id, Arc::clone(&self.registry));
        let (reader, mut writer) = tokio::io::split(conn.into_stream());
        let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(self.max_line_len));

        loop {
            let line = tokio::select! {
                biased;
                _ = self.closing.cancelled() => break,
                line = lines.next() => match line {
                    Some(Ok(line)) => line,
                    None => break,
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        logger::warning(
                            LogTag::Session,
                            &format!(
                                "Session {} from {} sent a line over {} bytes, closing",
                                id, peer, self.max_line_len
                            ),
                        );
                        let reply = ServerMessage::Error {
                            message: format!("line exceeds {} bytes", self.max_line_len),
                        };
                        let _ = write_message(&mut writer, &reply).await;
                        break;
                    }
                    Some(Err(LinesCodecError::Io(e))) => {
                        logger::debug(LogTag::Session, &format!("Session {} read error: {}", id, e));
                        break;
                    }
                },
            };
            if line.trim().is_empty() {
                continue;
            }

            let reply = session.handle_line(&line);
            if let Err(e) = write_message(&mut writer, &reply).await {
                logger::debug(
                    LogTag::Session,
                    &format!("Session {} write error: {}", id, e),
                );
                break;
            }
        }

        session.close();
        logger::debug(LogTag::Session, &format!("Session {} closed", id));
    }
}

async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &ServerMessage,
) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(message)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await
}

/// Per-connection subscription state
pub struct Conn {
    id: u64,
    registry: Arc<Registry>,
    topics: HashSet<String>,
}

impl Conn {
    pub fn new(id: u64, registry: Arc<Registry>) -> Self {
        Self {
            id,
            registry,
            topics: HashSet::new(),
        }
    }

    pub fn topics(&self) -> &HashSet<String> {
        &self.topics
    }

    pub fn handle_line(&mut self, line: &str) -> ServerMessage {
        match serde_json::from_str::<ClientMessage>(line) {
            Ok(message) => self.handle(message),
            Err(e) => ServerMessage::Error {
                message: format!("invalid message: {}", e),
            },
        }
    }

    pub fn handle(&mut self, message: ClientMessage) -> ServerMessage {
        match message {
            ClientMessage::Ping => ServerMessage::Pong,
            ClientMessage::Subscribe { topic } => self.subscribe(topic),
            ClientMessage::Unsubscribe { topic } => self.unsubscribe(topic),
        }
    }

    fn subscribe(&mut self, topic: String) -> ServerMessage {
        if topic.trim().is_empty() {
            return ServerMessage::Error {
                message: "topic must not be empty".to_string(),
            };
        }
        if self.topics.contains(&topic) {
            return ack("subscribe", topic);
        }

        match self
            .registry
            .broadcast_subscription(EventKind::Subscribe, &topic)
        {
            Ok(_) => {
                self.topics.insert(topic.clone());
                ack("subscribe", topic)
            }
            Err(e) => ServerMessage::Error {
                message: e.to_string(),
            },
        }
    }

    fn unsubscribe(&mut self, topic: String) -> ServerMessage {
        if !self.topics.remove(&topic) {
            return ack("unsubscribe", topic);
        }
        if let Err(e) = self
            .registry
            .broadcast_subscription(EventKind::Unsubscribe, &topic)
        {
            logger::warning(
                LogTag::Session,
                &format!("Session {}: failed to announce unsubscribe: {}", self.id, e),
            );
        }
        ack("unsubscribe", topic)
    }

    /// Release every topic still held by this connection
    pub fn close(&mut self) {
        for topic in std::mem::take(&mut self.topics) {
            if let Err(e) = self
                .registry
                .broadcast_subscription(EventKind::Unsubscribe, &topic)
            {
                logger::warning(
                    LogTag::Session,
                    &format!("Session {}: failed to announce unsubscribe: {}", self.id, e),
                );
            }
        }
    }
}

fn ack(op: &str, topic: String) -> ServerMessage {
    ServerMessage::Ack {
        op: op.to_string(),
        topic,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Transport;
    use tokio::io::{AsyncBufReadExt, BufReader};

    fn registry() -> Arc<Registry> {
        Arc::new(Registry::new("node-a".to_string()))
    }

    #[test]
    fn test_control_messages() {
        let registry = registry();
        let mut conn = Conn::new(1, Arc::clone(&registry));

        assert_eq!(conn.handle_line(r#"{"type":"ping"}"#), ServerMessage::Pong);
        assert_eq!(
            conn.handle_line(r#"{"type":"subscribe","topic":"chat/room1"}"#),
            ack("subscribe", "chat/room1".to_string())
        );
        assert!(registry.trie().contains("chat/room1", "node-a"));

        assert!(matches!(
            conn.handle_line("not json"),
            ServerMessage::Error { .. }
        ));
        assert!(matches!(
            conn.handle_line(r#"{"type":"subscribe","topic":""}"#),
            ServerMessage::Error { .. }
        ));

        conn.handle_line(r#"{"type":"unsubscribe","topic":"chat/room1"}"#);
        assert!(registry.trie().is_empty());
    }

    #[test]
    fn test_close_releases_topics() {
        let registry = registry();
        let mut first = Conn::new(1, Arc::clone(&registry));
        let mut second = Conn::new(2, Arc::clone(&registry));

        first.handle(ClientMessage::Subscribe {
            topic: "a".to_string(),
        });
        second.handle(ClientMessage::Subscribe {
            topic: "a".to_string(),
        });
        first.handle(ClientMessage::Subscribe {
            topic: "b".to_string(),
        });

        first.close();
        assert!(first.topics().is_empty());
        assert!(registry.trie().contains("a", "node-a"));
        assert!(!registry.trie().contains("b", "node-a"));

        second.close();
        assert!(registry.trie().is_empty());
    }

    #[tokio::test]
    async fn test_session_over_stream() {
        let registry = registry();
        let sessions = Sessions::new(Arc::clone(&registry), CancellationToken::new());
        let (mut client, server) = tokio::io::duplex(4096);

        let conn = ClientConn::new(server, "127.0.0.1:9".parse().unwrap(), Transport::Raw);
        let task = tokio::spawn(async move { sessions.process(conn).await });

        client
            .write_all(b"{\"type\":\"subscribe\",\"topic\":\"news\"}\n{\"type\":\"ping\"}\n")
            .await
            .unwrap();

        let mut reader = BufReader::new(&mut client);
        let mut first = String::new();
        reader.read_line(&mut first).await.unwrap();
        let mut second = String::new();
        reader.read_line(&mut second).await.unwrap();
        assert_eq!(
            serde_json::from_str::<ServerMessage>(&first).unwrap(),
            ack("subscribe", "news".to_string())
        );
        assert_eq!(
            serde_json::from_str::<ServerMessage>(&second).unwrap(),
            ServerMessage::Pong
        );
        assert!(registry.trie().contains("news", "node-a"));

        drop(reader);
        drop(client);
        task.await.unwrap();
        assert!(registry.trie().is_empty());
    }

    #[tokio::test]
    async fn test_overlong_line_is_rejected_and_closed() {
        let registry = registry();
        let sessions = Sessions::new(Arc::clone(&registry), CancellationToken::new())
            .with_max_line_len(64);
        let (mut client, server) = tokio::io::duplex(4096);

        let conn = ClientConn::new(server, "127.0.0.1:9".parse().unwrap(), Transport::Raw);
        let task = tokio::spawn(async move { sessions.process(conn).await });

        client.write_all(&[b'a'; 200]).await.unwrap();

        let mut reader = BufReader::new(&mut client);
        let mut reply = String::new();
        reader.read_line(&mut reply).await.unwrap();
        assert!(matches!(
            serde_json::from_str::<ServerMessage>(&reply).unwrap(),
            ServerMessage::Error { .. }
        ));

        let mut rest = String::new();
        assert_eq!(reader.read_line(&mut rest).await.unwrap(), 0);
        task.await.unwrap();
        assert!(registry.trie().is_empty());
    }
}
