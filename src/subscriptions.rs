/// Subscription index shared by local sessions and the cluster event loop
///
/// Entries are `(topic, origin)` pairs: the origin is the name of the node the
/// subscriber is connected to, which keeps remote entries distinguishable from
/// local ones. Insert and remove are idempotent because gossip may redeliver.
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Default)]
pub struct SubscriptionTrie {
    topics: RwLock<HashMap<String, HashSet<String>>>,
}

impl SubscriptionTrie {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry. Returns false if it was already present.
    pub fn insert(&self, topic: &str, origin: &str) -> bool {
        self.topics
            .write()
            .entry(topic.to_string())
            .or_default()
            .insert(origin.to_string())
    }

    /// Remove an entry. Returns false if it was not present.
    pub fn remove(&self, topic: &str, origin: &str) -> bool {
        let mut topics = self.topics.write();
        let Some(origins) = topics.get_mut(topic) else {
            return false;
        };
        let removed = origins.remove(origin);
        if origins.is_empty() {
            topics.remove(topic);
        }
        removed
    }

    pub fn contains(&self, topic: &str, origin: &str) -> bool {
        self.topics
            .read()
            .get(topic)
            .map(|origins| origins.contains(origin))
            .unwrap_or(false)
    }

    /// Nodes that hold subscribers for a topic, sorted
    pub fn origins(&self, topic: &str) -> Vec<String> {
        let mut origins: Vec<String> = self
            .topics
            .read()
            .get(topic)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        origins.sort();
        origins
    }

    /// Total number of entries
    pub fn len(&self) -> usize {
        self.topics.read().values().map(HashSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
