//! Gossip wire format.
//!
//! Every datagram and every TCP frame is a bincode-encoded [`Packet`] followed
//! by an HMAC-SHA256 tag keyed with the cluster secret. Packets failing
//! verification are dropped by the receiver.
//!
//! TCP frames carry a big-endian `u32` length prefix.

use crate::cluster::types::MemberStatus;
use crate::errors::{ClusterError, ClusterResult};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

type HmacSha256 = Hmac<Sha256>;

pub(crate) const TAG_LEN: usize = 32;

/// Largest accepted TCP frame
pub(crate) const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// Datagrams stay within a 1400-byte UDP payload
const UDP_BUFFER_SIZE: usize = 1400;

/// Room kept for the message itself and the tag
const MESSAGE_RESERVE: usize = 168;

/// Byte budget for piggybacked broadcasts on a single datagram
pub(crate) const PIGGYBACK_BUDGET: usize = UDP_BUFFER_SIZE - MESSAGE_RESERVE - TAG_LEN;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Packet {
    pub message: Message,
    pub piggyback: Vec<Broadcast>,
}

impl Packet {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            piggyback: Vec::new(),
        }
    }

    pub fn with_piggyback(message: Message, piggyback: Vec<Broadcast>) -> Self {
        Self { message, piggyback }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) enum Message {
    Ping {
        seq: u32,
        from: String,
    },
    Ack {
        seq: u32,
        from: String,
    },
    /// Ask the receiver to probe `target` on our behalf
    PingReq {
        seq: u32,
        target: String,
        target_addr: SocketAddr,
        from: String,
    },
    /// Carrier for piggybacked broadcasts only
    Gossip,
    /// Full state exchange over TCP
    PushPull(PushPull),
}

/// State changes disseminated epidemically
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) enum Broadcast {
    Alive {
        name: String,
        addr: SocketAddr,
        incarnation: u64,
        tags: HashMap<String, String>,
    },
    Suspect {
        name: String,
        incarnation: u64,
        from: String,
    },
    /// `from == name` announces a graceful leave
    Dead {
        name: String,
        incarnation: u64,
        from: String,
    },
    UserEvent(UserEvent),
}

impl Broadcast {
    /// True if `self` makes a queued `other` redundant
    pub fn invalidates(&self, other: &Broadcast) -> bool {
        match (self, other) {
            (Broadcast::UserEvent(new), Broadcast::UserEvent(old)) => {
                new.coalesce && old.coalesce && new.name == old.name && new.payload == old.payload
            }
            (Broadcast::UserEvent(_), _) | (_, Broadcast::UserEvent(_)) => false,
            (new, old) => new.node() == old.node(),
        }
    }

    fn node(&self) -> Option<&str> {
        match self {
            Broadcast::Alive { name, .. }
            | Broadcast::Suspect { name, .. }
            | Broadcast::Dead { name, .. } => Some(name),
            Broadcast::UserEvent(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct UserEvent {
    pub ltime: u64,
    pub name: String,
    pub payload: Vec<u8>,
    pub coalesce: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct PushPull {
    pub join: bool,
    pub members: Vec<MemberState>,
    pub event_ltime: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct MemberState {
    pub name: String,
    pub addr: SocketAddr,
    pub incarnation: u64,
    pub status: MemberStatus,
    pub tags: HashMap<String, String>,
}

/// Serialize and sign a packet
pub(crate) fn seal(packet: &Packet, key: &[u8; 32]) -> ClusterResult<Vec<u8>> {
    let mut data = bincode::serialize(packet).map_err(|e| ClusterError::Encode(e.to_string()))?;
    let mut mac =
        HmacSha256::new_from_slice(key).map_err(|e| ClusterError::Encode(e.to_string()))?;
    mac.update(&data);
    data.extend_from_slice(&mac.finalize().into_bytes());
    Ok(data)
}

/// Verify the tag and deserialize a packet
pub(crate) fn open(data: &[u8], key: &[u8; 32]) -> ClusterResult<Packet> {
    if data.len() < TAG_LEN {
        return Err(ClusterError::Unauthenticated);
    }
    let (payload, tag) = data.split_at(data.len() - TAG_LEN);
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| ClusterError::Unauthenticated)?;
    mac.update(payload);
    mac.verify_slice(tag)
        .map_err(|_| ClusterError::Unauthenticated)?;

    bincode::deserialize(payload).map_err(|e| ClusterError::Decode(e.to_string()))
}

/// Approximate encoded size of a broadcast
pub(crate) fn encoded_len(broadcast: &Broadcast) -> usize {
    bincode::serialized_size(broadcast)
        .map(|n| n as usize)
        .unwrap_or(PIGGYBACK_BUDGET)
}

pub(crate) async fn write_frame<W>(writer: &mut W, packet: &Packet, key: &[u8; 32]) -> ClusterResult<()>
where
    W: AsyncWrite + Unpin,
{
    let data = seal(packet, key)?;
    writer.write_u32(data.len() as u32).await?;
    writer.write_all(&data).await?;
    writer.flush().await?;
    Ok(())
}

pub(crate) async fn read_frame<R>(reader: &mut R, key: &[u8; 32]) -> ClusterResult<Packet>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_LEN {
        return Err(ClusterError::Decode(format!(
            "frame of {} bytes exceeds {} byte limit",
            len, MAX_FRAME_LEN
        )));
    }
    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;
    open(&data, key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> [u8; 32] {
        [byte; 32]
    }

    #[test]
    fn test_open_rejects_wrong_key_and_tampering() {
        let packet = Packet::new(Message::Ping {
            seq: 9,
            from: "node-a".to_string(),
        });
        let sealed = seal(&packet, &key(1)).unwrap();
        assert_eq!(open(&sealed, &key(1)).unwrap(), packet);

        assert!(matches!(
            open(&sealed, &key(2)),
            Err(ClusterError::Unauthenticated)
        ));

        let mut tampered = sealed.clone();
        tampered[0] ^= 0xff;
        assert!(matches!(
            open(&tampered, &key(1)),
            Err(ClusterError::Unauthenticated)
        ));

        assert!(matches!(
            open(&sealed[..10], &key(1)),
            Err(ClusterError::Unauthenticated)
        ));
    }

    #[test]
    fn test_invalidation_rules() {
        let alive = Broadcast::Alive {
            name: "a".to_string(),
            addr: "127.0.0.1:1".parse().unwrap(),
            incarnation: 1,
            tags: HashMap::new(),
        };
        let dead = Broadcast::Dead {
            name: "a".to_string(),
            incarnation: 1,
            from: "b".to_string(),
        };
        let other = Broadcast::Suspect {
            name: "c".to_string(),
            incarnation: 0,
            from: "b".to_string(),
        };
        assert!(dead.invalidates(&alive));
        assert!(!other.invalidates(&alive));

        let event = |payload: &[u8], coalesce| {
            Broadcast::UserEvent(UserEvent {
                ltime: 1,
                name: "+".to_string(),
                payload: payload.to_vec(),
                coalesce,
            })
        };
        assert!(event(b"x", true).invalidates(&event(b"x", true)));
        assert!(!event(b"x", true).invalidates(&event(b"y", true)));
        assert!(!event(b"x", false).invalidates(&event(b"x", false)));
        assert!(!event(b"x", true).invalidates(&alive));
    }

    #[tokio::test]
    async fn test_frames_over_duplex_stream() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        let packet = Packet::new(Message::PushPull(PushPull {
            join: true,
            members: vec![MemberState {
                name: "a".to_string(),
                addr: "127.0.0.1:4000".parse().unwrap(),
                incarnation: 3,
                status: MemberStatus::Alive,
                tags: HashMap::new(),
            }],
            event_ltime: 12,
        }));

        write_frame(&mut client, &packet, &key(7)).await.unwrap();
        let received = read_frame(&mut server, &key(7)).await.unwrap();
        assert_eq!(received, packet);
    }
}
