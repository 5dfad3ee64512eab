/// Cluster membership and subscription propagation
///
/// - `membership`: SWIM-style gossip transport (join, leave, broadcast, members)
/// - `subscription`: `"+"` / `"-"` events carried over the transport
/// - `config`: transport configuration derived from `[cluster]`
/// - `snapshot`: peer list persisted for rejoin after restart
pub mod config;
mod messages;
pub mod membership;
mod queue;
pub mod snapshot;
pub mod subscription;
pub mod types;

pub use config::MembershipConfig;
pub use membership::Membership;
pub use subscription::{Applied, EventKind, SubscriptionEvent};
pub use types::{ClusterEvent, Member, MemberStatus, NodeIdentity};

use crate::errors::ClusterResult;
use async_trait::async_trait;

/// Operations the service needs from a membership transport
#[async_trait]
pub trait Cluster: Send + Sync {
    /// Local member name, the origin of emitted events
    fn name(&self) -> &str;

    async fn join(&self, seeds: &[String]) -> ClusterResult<usize>;

    fn broadcast(&self, name: &str, payload: Vec<u8>, coalesce: bool) -> ClusterResult<()>;

    async fn leave(&self) -> ClusterResult<()>;

    async fn shutdown(&self) -> ClusterResult<()>;

    fn members(&self) -> Vec<Member>;
}

#[async_trait]
impl Cluster for Membership {
    fn name(&self) -> &str {
        Membership::name(self)
    }

    async fn join(&self, seeds: &[String]) -> ClusterResult<usize> {
        Membership::join(self, seeds).await
    }

    fn broadcast(&self, name: &str, payload: Vec<u8>, coalesce: bool) -> ClusterResult<()> {
        Membership::broadcast(self, name, payload, coalesce)
    }

    async fn leave(&self) -> ClusterResult<()> {
        Membership::leave(self).await
    }

    async fn shutdown(&self) -> ClusterResult<()> {
        Membership::shutdown(self).await
    }

    fn members(&self) -> Vec<Member> {
        Membership::members(self)
    }
}
