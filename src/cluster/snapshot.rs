/// Membership snapshot persisted between restarts
///
/// Records the known live peers and whether this node left on purpose. On
/// startup a node rejoins its snapshot peers unless it left and rejoin after
/// leave is disabled.
use crate::logger::{self, LogTag};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub left: bool,
    #[serde(default)]
    pub peers: Vec<SocketAddr>,
}

impl Snapshot {
    /// Load a snapshot; a missing or unreadable file yields an empty one
    pub async fn load(path: &Path) -> Self {
        let data = match tokio::fs::read(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Self::default(),
            Err(e) => {
                logger::warning(
                    LogTag::Cluster,
                    &format!("Failed to read snapshot {}: {}", path.display(), e),
                );
                return Self::default();
            }
        };

        serde_json::from_slice(&data).unwrap_or_else(|e| {
            logger::warning(
                LogTag::Cluster,
                &format!("Ignoring corrupt snapshot {}: {}", path.display(), e),
            );
            Self::default()
        })
    }

    pub async fn save(&self, path: &Path) -> std::io::Result<()> {
        let data = serde_json::to_vec_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        // Write to temp file first, then rename
        let temp = path.with_extension("tmp");
        tokio::fs::write(&temp, data).await?;
        tokio::fs::rename(&temp, path).await
    }

    /// Peers to rejoin on startup
    pub fn rejoin_peers(&self, rejoin_after_leave: bool) -> &[SocketAddr] {
        if self.left && !rejoin_after_leave {
            &[]
        } else {
            &self.peers
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.json");

        assert_eq!(Snapshot::load(&path).await, Snapshot::default());

        let snapshot = Snapshot {
            left: true,
            peers: vec!["10.0.0.2:4000".parse().unwrap()],
        };
        snapshot.save(&path).await.unwrap();
        assert_eq!(Snapshot::load(&path).await, snapshot);
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();
        assert_eq!(Snapshot::load(&path).await, Snapshot::default());
    }

    #[test]
    fn test_rejoin_respects_leave_flag() {
        let snapshot = Snapshot {
            left: true,
            peers: vec!["10.0.0.2:4000".parse().unwrap()],
        };
        assert_eq!(snapshot.rejoin_peers(true).len(), 1);
        assert!(snapshot.rejoin_peers(false).is_empty());
    }
}
