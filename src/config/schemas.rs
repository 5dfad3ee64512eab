/// Configuration schemas - all config structures defined once with defaults
///
/// Each struct is defined using the `config_struct!` macro which provides
/// embedded defaults and serde support.
use crate::config_struct;
use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

// ============================================================================
// ROOT CONFIGURATION
// ============================================================================

config_struct! {
    /// Broker node configuration
    pub struct Config {
        /// Encoded license string
        license: String = String::new(),

        /// Client-facing port shared by the raw-stream and HTTP/WebSocket protocols
        listen_port: u16 = 8080,

        /// Upper bound for classifying a new connection by its leading bytes
        sniff_timeout_ms: u64 = 2000,

        /// How long shutdown waits for in-flight client connections
        drain_timeout_secs: u64 = 5,

        /// Membership status report period
        status_interval_secs: u64 = 1,

        /// Cluster settings; standalone node when absent
        cluster: Option<ClusterConfig> = None,
    }
}

impl Config {
    pub fn sniff_timeout(&self) -> Duration {
        Duration::from_millis(self.sniff_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs.max(1))
    }

    /// Reject configurations that would make the node unable to start
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(cluster) = &self.cluster {
            let ports = [
                ("listen_port", self.listen_port),
                ("cluster.gossip_port", cluster.gossip_port),
                ("cluster.route_port", cluster.route_port),
            ];
            for (i, (name_a, a)) in ports.iter().enumerate() {
                for (name_b, b) in ports.iter().skip(i + 1) {
                    if *a != 0 && a == b {
                        return Err(ConfigError::InvalidField {
                            field: name_b.to_string(),
                            reason: format!("port {} is already used by {}", b, name_a),
                        });
                    }
                }
            }

            if cluster.bind_addr.parse::<IpAddr>().is_err() {
                return Err(ConfigError::InvalidField {
                    field: "cluster.bind_addr".to_string(),
                    reason: format!("'{}' is not an IP address", cluster.bind_addr),
                });
            }

            if cluster.user_event_size_limit == 0 {
                return Err(ConfigError::InvalidField {
                    field: "cluster.user_event_size_limit".to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        Ok(())
    }
}

// ============================================================================
// CLUSTER CONFIGURATION
// ============================================================================

/// Which address the node advertises to its peers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AdvertiseMode {
    /// Advertise the externally reachable address
    Public,
    /// Advertise the bind address as resolved locally
    #[default]
    Private,
}

config_struct! {
    /// Gossip cluster configuration
    pub struct ClusterConfig {
        /// Seed peers to join at startup ("host:gossip_port")
        seed: Vec<String> = Vec::new(),

        /// UDP/TCP port for the gossip protocol
        gossip_port: u16 = 4000,

        /// TCP port for direct inter-node connections
        route_port: u16 = 4001,

        /// Interface the gossip sockets bind to
        bind_addr: String = "0.0.0.0".to_string(),

        advertise: AdvertiseMode = AdvertiseMode::Private,

        /// Pre-shared passphrase; the gossip key is derived from it
        passphrase: String = "broker-cluster".to_string(),

        /// Explicit node name; derived from the address fingerprint when empty
        node_name: String = String::new(),

        /// Membership snapshot file, enables rejoin after restart
        snapshot_path: Option<PathBuf> = None,

        // Failure detection
        probe_interval_ms: u64 = 1000,
        probe_timeout_ms: u64 = 500,
        indirect_checks: usize = 3,
        suspicion_mult: u32 = 5,

        // Dissemination
        gossip_interval_ms: u64 = 200,
        gossip_nodes: usize = 3,
        retransmit_mult: u32 = 4,
        max_queue_depth: usize = 4096,
        push_pull_interval_secs: u64 = 30,

        // User events
        user_event_size_limit: usize = 512,
        user_coalesce_period_ms: u64 = 0,

        // Timeouts
        tcp_timeout_ms: u64 = 5000,
        reap_after_secs: u64 = 15,
        leave_propagate_delay_ms: u64 = 1000,
    }
}

impl ClusterConfig {
    /// Symmetric key securing gossip traffic
    pub fn key(&self) -> [u8; 32] {
        let digest = Sha256::digest(self.passphrase.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            license = "abc"
            listen_port = 9000

            [cluster]
            seed = ["10.0.0.2:4000"]
            advertise = "public"
            "#,
        )
        .unwrap();

        assert_eq!(config.listen_port, 9000);
        assert_eq!(config.sniff_timeout_ms, 2000);
        let cluster = config.cluster.unwrap();
        assert_eq!(cluster.seed, vec!["10.0.0.2:4000".to_string()]);
        assert_eq!(cluster.advertise, AdvertiseMode::Public);
        assert_eq!(cluster.gossip_port, 4000);
        assert_eq!(cluster.user_event_size_limit, 512);
    }

    #[test]
    fn test_validate_rejects_port_collision() {
        let config = Config {
            listen_port: 4000,
            cluster: Some(ClusterConfig::default()),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidField { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_bad_bind_addr() {
        let config = Config {
            cluster: Some(ClusterConfig {
                bind_addr: "eth0".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };
        match config.validate() {
            Err(ConfigError::InvalidField { field, .. }) => assert_eq!(field, "cluster.bind_addr"),
            other => panic!("expected invalid bind_addr, got {:?}", other),
        }
    }

    #[test]
    fn test_key_is_stable() {
        let a = ClusterConfig::default();
        let b = ClusterConfig::default();
        assert_eq!(a.key(), b.key());

        let other = ClusterConfig {
            passphrase: "other".to_string(),
            ..Default::default()
        };
        assert_ne!(a.key(), other.key());
    }
}
