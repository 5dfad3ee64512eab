//! Membership transport configuration.
//!
//! [`MembershipConfig`] is the resolved form consumed by
//! [`super::membership::Membership::create`], produced from the `[cluster]`
//! section of the node configuration via [`MembershipConfig::from_cluster`].

use crate::address;
use crate::cluster::types::{NodeIdentity, ROUTE_TAG};
use crate::config::{AdvertiseMode, ClusterConfig};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct MembershipConfig {
    pub identity: NodeIdentity,
    pub bind_addr: IpAddr,
    /// 0 picks a free port
    pub bind_port: u16,
    pub advertise_addr: IpAddr,
    /// 0 advertises the bound port
    pub advertise_port: u16,
    pub secret_key: [u8; 32],
    /// A node that left may be re-admitted by its snapshot peers
    pub rejoin_after_leave: bool,
    pub snapshot_path: Option<PathBuf>,
    pub tags: HashMap<String, String>,

    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub indirect_checks: usize,
    pub suspicion_mult: u32,
    pub gossip_interval: Duration,
    pub gossip_nodes: usize,
    pub retransmit_mult: u32,
    /// Broadcasts kept queued before the oldest are dropped
    pub max_queue_depth: usize,
    pub push_pull_interval: Duration,
    pub user_event_size_limit: usize,
    pub user_coalesce_period: Duration,
    pub tcp_timeout: Duration,
    pub reap_after: Duration,
    pub leave_propagate_delay: Duration,
    /// Capacity of the inbound event channel
    pub event_buffer: usize,
}

impl MembershipConfig {
    /// Build the transport configuration for the `[cluster]` section
    pub fn from_cluster(cluster: &ClusterConfig) -> Self {
        let fingerprint = address::fingerprint();
        let identity = NodeIdentity::new(
            fingerprint,
            Some(cluster.node_name.as_str()),
            cluster.gossip_port,
        );

        let bind_addr: IpAddr = cluster
            .bind_addr
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

        let advertise_addr = match cluster.advertise {
            AdvertiseMode::Public => address::external(),
            AdvertiseMode::Private if !bind_addr.is_unspecified() => bind_addr,
            AdvertiseMode::Private => address::external(),
        };

        let mut tags = HashMap::new();
        tags.insert(
            ROUTE_TAG.to_string(),
            format!("{}:{}", advertise_addr, cluster.route_port),
        );

        Self {
            identity,
            bind_addr,
            bind_port: cluster.gossip_port,
            advertise_addr,
            advertise_port: cluster.gossip_port,
            secret_key: cluster.key(),
            rejoin_after_leave: true,
            snapshot_path: cluster.snapshot_path.clone(),
            tags,
            probe_interval: Duration::from_millis(cluster.probe_interval_ms),
            probe_timeout: Duration::from_millis(cluster.probe_timeout_ms),
            indirect_checks: cluster.indirect_checks,
            suspicion_mult: cluster.suspicion_mult.max(1),
            gossip_interval: Duration::from_millis(cluster.gossip_interval_ms),
            gossip_nodes: cluster.gossip_nodes.max(1),
            retransmit_mult: cluster.retransmit_mult.max(1),
            max_queue_depth: cluster.max_queue_depth.max(1),
            push_pull_interval: Duration::from_secs(cluster.push_pull_interval_secs.max(1)),
            user_event_size_limit: cluster.user_event_size_limit,
            user_coalesce_period: Duration::from_millis(cluster.user_coalesce_period_ms),
            tcp_timeout: Duration::from_millis(cluster.tcp_timeout_ms),
            reap_after: Duration::from_secs(cluster.reap_after_secs),
            leave_propagate_delay: Duration::from_millis(cluster.leave_propagate_delay_ms),
            event_buffer: 1024,
        }
    }

    /// Loopback configuration with short timers, for tests and local clusters
    pub fn local(name: &str) -> Self {
        let cluster = ClusterConfig {
            node_name: name.to_string(),
            gossip_port: 0,
            route_port: 0,
            bind_addr: "127.0.0.1".to_string(),
            probe_interval_ms: 200,
            probe_timeout_ms: 100,
            gossip_interval_ms: 50,
            push_pull_interval_secs: 2,
            tcp_timeout_ms: 1000,
            reap_after_secs: 2,
            leave_propagate_delay_ms: 300,
            ..Default::default()
        };
        Self::from_cluster(&cluster)
    }

    /// Time a suspect has to refute before it is declared failed
    pub fn suspicion_timeout(&self) -> Duration {
        self.probe_interval * self.suspicion_mult
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_cluster_sets_route_tag_and_rejoin() {
        let cluster = ClusterConfig {
            gossip_port: 4100,
            route_port: 4101,
            bind_addr: "10.1.2.3".to_string(),
            ..Default::default()
        };
        let config = MembershipConfig::from_cluster(&cluster);

        assert!(config.rejoin_after_leave);
        assert_eq!(config.bind_port, 4100);
        assert_eq!(config.advertise_port, 4100);
        assert_eq!(config.advertise_addr, "10.1.2.3".parse::<IpAddr>().unwrap());
        assert_eq!(config.tags.get(ROUTE_TAG).unwrap(), "10.1.2.3:4101");
        assert_eq!(config.secret_key, cluster.key());
        assert!(config.identity.name.ends_with("4100"));
    }

    #[test]
    fn test_public_mode_advertises_external_address() {
        let cluster = ClusterConfig {
            advertise: AdvertiseMode::Public,
            bind_addr: "10.1.2.3".to_string(),
            ..Default::default()
        };
        let config = MembershipConfig::from_cluster(&cluster);
        assert_eq!(config.advertise_addr, address::external());
    }
}
