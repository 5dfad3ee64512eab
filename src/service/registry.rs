use crate::cluster::subscription;
use crate::cluster::{Cluster, EventKind};
use crate::errors::EventError;
use crate::logger::{self, LogTag};
use crate::subscriptions::SubscriptionTrie;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

/// Local-origin subscription path shared by sessions and the service
///
/// Counts local subscribers per topic so the `(topic, local)` entry and its
/// cluster announcement only change on the first subscribe and the last
/// unsubscribe.
pub struct Registry {
    local: String,
    trie: Arc<SubscriptionTrie>,
    counts: Mutex<HashMap<String, usize>>,
    cluster: RwLock<Option<Arc<dyn Cluster>>>,
}

impl Registry {
    pub fn new(local: String) -> Self {
        Self {
            local,
            trie: Arc::new(SubscriptionTrie::new()),
            counts: Mutex::new(HashMap::new()),
            cluster: RwLock::new(None),
        }
    }

    /// Name of the local node, the origin of local entries
    pub fn local(&self) -> &str {
        &self.local
    }

    pub fn trie(&self) -> &Arc<SubscriptionTrie> {
        &self.trie
    }

    pub(crate) fn attach(&self, cluster: Arc<dyn Cluster>) {
        *self.cluster.write() = Some(cluster);
    }

    /// Stop emitting cluster events, returning the detached handle
    pub(crate) fn detach(&self) -> Option<Arc<dyn Cluster>> {
        self.cluster.write().take()
    }

    pub fn cluster(&self) -> Option<Arc<dyn Cluster>> {
        self.cluster.read().clone()
    }

    /// Record a local subscribe or unsubscribe and announce it when the local
    /// entry changes. Returns whether it changed.
    ///
    /// A subscribe the cluster rejects leaves local state untouched. An
    /// unsubscribe always releases local state; the announcement error is
    /// still returned.
    pub fn broadcast_subscription(&self, kind: EventKind, topic: &str) -> Result<bool, EventError> {
        let mut counts = self.counts.lock();
        let count = counts.get(topic).copied().unwrap_or(0);

        let changed = match kind {
            EventKind::Subscribe => count == 0,
            EventKind::Unsubscribe => count == 1,
        };

        let announced = match (changed, self.cluster()) {
            (true, Some(cluster)) => subscription::emit(cluster.as_ref(), kind, topic, &self.local),
            _ => Ok(()),
        };
        let announced = match (kind, announced) {
            (EventKind::Subscribe, Err(e)) => return Err(e),
            (_, announced) => announced,
        };

        if changed {
            match kind {
                EventKind::Subscribe => self.trie.insert(topic, &self.local),
                EventKind::Unsubscribe => self.trie.remove(topic, &self.local),
            };
            logger::debug(
                LogTag::Events,
                &format!("Local {} '{}' recorded", kind.name(), topic),
            );
        }

        match kind {
            EventKind::Subscribe => {
                counts.insert(topic.to_string(), count + 1);
            }
            EventKind::Unsubscribe if count <= 1 => {
                counts.remove(topic);
            }
            EventKind::Unsubscribe => {
                counts.insert(topic.to_string(), count - 1);
            }
        }

        announced.map(|_| changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterEvent, Member, SubscriptionEvent};
    use crate::errors::{ClusterError, ClusterResult};
    use async_trait::async_trait;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<ClusterEvent>>,
    }

    #[async_trait]
    impl Cluster for Recorder {
        fn name(&self) -> &str {
            "node-a"
        }
        async fn join(&self, _seeds: &[String]) -> ClusterResult<usize> {
            Ok(0)
        }
        fn broadcast(&self, name: &str, payload: Vec<u8>, coalesce: bool) -> ClusterResult<()> {
            if name.len() + payload.len() > 512 {
                return Err(ClusterError::EventTooLarge {
                    size: name.len() + payload.len(),
                    limit: 512,
                });
            }
            self.sent.lock().push(ClusterEvent {
                name: name.to_string(),
                payload,
                ltime: 0,
                coalesce,
            });
            Ok(())
        }
        async fn leave(&self) -> ClusterResult<()> {
            Ok(())
        }
        async fn shutdown(&self) -> ClusterResult<()> {
            Ok(())
        }
        fn members(&self) -> Vec<Member> {
            Vec::new()
        }
    }

    #[test]
    fn test_standalone_updates_trie_only() {
        let registry = Registry::new("node-a".to_string());
        assert!(registry
            .broadcast_subscription(EventKind::Subscribe, "news")
            .unwrap());
        assert!(registry.trie().contains("news", "node-a"));
    }

    #[test]
    fn test_announces_first_subscribe_and_last_unsubscribe() {
        let registry = Registry::new("node-a".to_string());
        let recorder = Arc::new(Recorder::default());
        registry.attach(recorder.clone());

        assert!(registry.broadcast_subscription(EventKind::Subscribe, "news").unwrap());
        assert!(!registry.broadcast_subscription(EventKind::Subscribe, "news").unwrap());
        assert!(!registry.broadcast_subscription(EventKind::Unsubscribe, "news").unwrap());
        assert!(registry.trie().contains("news", "node-a"));
        assert!(registry.broadcast_subscription(EventKind::Unsubscribe, "news").unwrap());
        assert!(registry.trie().is_empty());

        let sent = recorder.sent.lock();
        let names: Vec<&str> = sent.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["+", "-"]);
        let event = SubscriptionEvent::decode(&sent[0].payload).unwrap();
        assert_eq!(event.topic, "news");
        assert_eq!(event.node, "node-a");
    }

    #[test]
    fn test_failed_announcement_leaves_state_untouched() {
        let registry = Registry::new("node-a".to_string());
        registry.attach(Arc::new(Recorder::default()));

        let topic = "t".repeat(600);
        assert!(matches!(
            registry.broadcast_subscription(EventKind::Subscribe, &topic),
            Err(EventError::Broadcast(ClusterError::EventTooLarge { .. }))
        ));
        assert!(registry.trie().is_empty());
        assert!(registry.detach().is_some());
        assert!(registry.broadcast_subscription(EventKind::Subscribe, &topic).unwrap());
    }

    #[test]
    fn test_failed_unsubscribe_still_releases_local_entry() {
        let registry = Registry::new("node-a".to_string());
        let topic = "t".repeat(600);
        assert!(registry.broadcast_subscription(EventKind::Subscribe, &topic).unwrap());

        registry.attach(Arc::new(Recorder::default()));
        assert!(matches!(
            registry.broadcast_subscription(EventKind::Unsubscribe, &topic),
            Err(EventError::Broadcast(ClusterError::EventTooLarge { .. }))
        ));
        assert!(registry.trie().is_empty());
        assert!(registry.counts.lock().is_empty());

        assert!(registry
            .broadcast_subscription(EventKind::Subscribe, "news")
            .unwrap());
        assert!(registry.trie().contains("news", "node-a"));
    }
}
