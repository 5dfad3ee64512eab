/// Subscription event protocol
///
/// Subscribe and unsubscribe actions travel as cluster user events named `"+"`
/// and `"-"`. The payload is a bincode `SubscriptionEvent` carrying the topic
/// and the node the subscriber is connected to. Receivers apply remote events to
/// their subscription index and discard echoes of their own broadcasts.
use crate::cluster::types::ClusterEvent;
use crate::cluster::Cluster;
use crate::errors::EventError;
use crate::logger::{self, LogTag};
use crate::subscriptions::SubscriptionTrie;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Subscribe,
    Unsubscribe,
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Subscribe => "+",
            EventKind::Unsubscribe => "-",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "+" => Some(EventKind::Subscribe),
            "-" => Some(EventKind::Unsubscribe),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionEvent {
    pub topic: String,
    /// Origin node
    pub node: String,
}

impl SubscriptionEvent {
    pub fn encode(&self) -> Result<Vec<u8>, EventError> {
        bincode::serialize(self).map_err(|e| EventError::Encode(e.to_string()))
    }

    pub fn decode(data: &[u8]) -> Result<Self, EventError> {
        bincode::deserialize(data).map_err(|e| EventError::Decode(e.to_string()))
    }
}

/// What `apply` did to the subscription index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Inserted,
    Removed,
    /// Already in the requested state
    Unchanged,
    /// Our own broadcast coming back; ignored
    Echo,
}

/// Broadcast a subscription change to the cluster
pub fn emit(
    cluster: &dyn Cluster,
    kind: EventKind,
    topic: &str,
    origin: &str,
) -> Result<(), EventError> {
    let payload = SubscriptionEvent {
        topic: topic.to_string(),
        node: origin.to_string(),
    }
    .encode()?;
    cluster.broadcast(kind.name(), payload, true)?;
    Ok(())
}

/// Apply a received cluster event to the subscription index
pub fn apply(
    trie: &SubscriptionTrie,
    local: &str,
    event: &ClusterEvent,
) -> Result<Applied, EventError> {
    let kind = EventKind::from_name(&event.name)
        .ok_or_else(|| EventError::UnknownEvent(event.name.clone()))?;
    let decoded = SubscriptionEvent::decode(&event.payload)?;

    if decoded.node == local {
        return Ok(Applied::Echo);
    }

    let changed = match kind {
        EventKind::Subscribe => trie.insert(&decoded.topic, &decoded.node),
        EventKind::Unsubscribe => trie.remove(&decoded.topic, &decoded.node),
    };

    Ok(match (kind, changed) {
        (_, false) => Applied::Unchanged,
        (EventKind::Subscribe, true) => Applied::Inserted,
        (EventKind::Unsubscribe, true) => Applied::Removed,
    })
}

/// Consume cluster events until closing fires or the channel closes
pub async fn run_event_loop(
    mut events: mpsc::Receiver<ClusterEvent>,
    trie: Arc<SubscriptionTrie>,
    local: String,
    closing: CancellationToken,
) {
    logger::debug(LogTag::Events, "Cluster event loop started");
    loop {
        let event = tokio::select! {
            biased;
            _ = closing.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match apply(&trie, &local, &event) {
            Ok(Applied::Echo) => {}
            Ok(applied) => logger::debug(
                LogTag::Events,
                &format!("Applied '{}' event: {:?}", event.name, applied),
            ),
            Err(e) => logger::warning(LogTag::Events, &e.to_string()),
        }
    }
    logger::debug(LogTag::Events, "Cluster event loop stopped");
}
