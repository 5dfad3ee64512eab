use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

/// Tag carrying `advertise_addr:route_port` for direct peer connections
pub const ROUTE_TAG: &str = "route";

/// Identity of the local node within the cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    /// Stable host fingerprint derived from the external address
    pub fingerprint: String,
    /// Unique member key, also the origin of every emitted event
    pub name: String,
    pub gossip_port: u16,
}

impl NodeIdentity {
    /// Use the configured name, or synthesize one from fingerprint and port
    pub fn new(fingerprint: String, configured_name: Option<&str>, gossip_port: u16) -> Self {
        let name = match configured_name {
            Some(name) if !name.trim().is_empty() => name.trim().to_string(),
            _ => format!("{}{}", fingerprint, gossip_port),
        };
        Self {
            fingerprint,
            name,
            gossip_port,
        }
    }
}

/// Liveness of a member as seen by the failure detector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemberStatus {
    Alive,
    Suspect,
    Failed,
    Left,
}

impl MemberStatus {
    /// Alive and suspect members are still probed and gossiped to
    pub fn is_reachable(&self) -> bool {
        matches!(self, MemberStatus::Alive | MemberStatus::Suspect)
    }

    pub fn is_gone(&self) -> bool {
        matches!(self, MemberStatus::Failed | MemberStatus::Left)
    }
}

impl fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            MemberStatus::Alive => "alive",
            MemberStatus::Suspect => "suspect",
            MemberStatus::Failed => "failed",
            MemberStatus::Left => "left",
        };
        write!(f, "{}", label)
    }
}

/// A cluster member as known locally
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub name: String,
    /// Gossip address
    pub addr: SocketAddr,
    pub status: MemberStatus,
    pub incarnation: u64,
    pub tags: HashMap<String, String>,
}

impl Member {
    /// Address peers should open direct connections to
    pub fn route(&self) -> Option<&str> {
        self.tags.get(ROUTE_TAG).map(String::as_str)
    }
}

/// A user event delivered to the local event channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterEvent {
    pub name: String,
    pub payload: Vec<u8>,
    /// Lamport time assigned by the emitting node
    pub ltime: u64,
    pub coalesce: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_name_is_synthesized_when_missing() {
        let identity = NodeIdentity::new("abcdef0123456789".to_string(), None, 4000);
        assert_eq!(identity.name, "abcdef01234567894000");

        let blank = NodeIdentity::new("abcdef0123456789".to_string(), Some("  "), 4000);
        assert_eq!(blank.name, identity.name);

        let named = NodeIdentity::new("abcdef0123456789".to_string(), Some("node-a"), 4000);
        assert_eq!(named.name, "node-a");
    }
}
