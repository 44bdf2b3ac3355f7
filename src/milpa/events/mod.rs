use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

use crate::milpa::api::types::MilpaObject;
use crate::milpa::observability::metrics;

const DEFAULT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutation {
    Added,
    Modified,
    Deleted,
}

impl Mutation {
    pub const fn as_str(self) -> &'static str {
        match self {
            Mutation::Added => "ADDED",
            Mutation::Modified => "MODIFIED",
            Mutation::Deleted => "DELETED",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegistryMutation {
    pub mutation: Mutation,
    pub object: MilpaObject,
}

/// In-process fan-out of registry writes. Emission never blocks: slow
/// subscribers shed the oldest events in their queue and the loss is
/// counted, so controller handlers must stay idempotent and re-list on
/// their periodic ticks anyway.
pub struct EventSystem {
    topics: Mutex<HashMap<&'static str, broadcast::Sender<RegistryMutation>>>,
    capacity: usize,
}

impl EventSystem {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            topics: Mutex::new(HashMap::new()),
            capacity: DEFAULT_CHANNEL_CAPACITY,
        })
    }

    fn sender_for(&self, kind: &'static str) -> broadcast::Sender<RegistryMutation> {
        let mut topics = self.topics.lock().expect("event system topics poisoned");
        topics
            .entry(kind)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    pub fn emit(&self, mutation: Mutation, object: MilpaObject) {
        let kind = object.kind();
        let sender = self.sender_for(kind);
        // No receivers is normal during startup and teardown.
        let _ = sender.send(RegistryMutation { mutation, object });
    }

    pub fn subscribe(&self, kind: &'static str) -> EventSubscription {
        EventSubscription {
            kind,
            receiver: self.sender_for(kind).subscribe(),
        }
    }
}

pub struct EventSubscription {
    kind: &'static str,
    receiver: broadcast::Receiver<RegistryMutation>,
}

impl EventSubscription {
    /// Next mutation for this subscriber, in emission order. Events shed
    /// while the subscriber lagged are recorded and skipped.
    pub async fn next(&mut self) -> Option<RegistryMutation> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    metrics::record_missed_events(self.kind, missed);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::milpa::api::types::{Node, Pod};

    #[tokio::test]
    async fn subscribers_see_their_kind_only() {
        let events = EventSystem::new();
        let mut pods = events.subscribe("Pod");
        let mut nodes = events.subscribe("Node");

        events.emit(Mutation::Added, MilpaObject::Node(Node::new("n1", "t2.small", "img")));
        events.emit(Mutation::Added, MilpaObject::Pod(Pod::new("p1", "default")));

        let pod_event = pods.next().await.expect("pod event");
        assert_eq!(pod_event.mutation, Mutation::Added);
        assert_eq!(pod_event.object.kind(), "Pod");

        let node_event = nodes.next().await.expect("node event");
        assert_eq!(node_event.object.kind(), "Node");
    }

    #[tokio::test]
    async fn emit_without_subscribers_does_not_block() {
        let events = EventSystem::new();
        for i in 0..1024 {
            events.emit(
                Mutation::Modified,
                MilpaObject::Pod(Pod::new(&format!("p{i}"), "default")),
            );
        }
    }

    #[tokio::test]
    async fn per_subscriber_order_is_fifo() {
        let events = EventSystem::new();
        let mut sub = events.subscribe("Pod");
        for i in 0..8 {
            events.emit(
                Mutation::Modified,
                MilpaObject::Pod(Pod::new(&format!("p{i}"), "default")),
            );
        }
        for i in 0..8 {
            let event = sub.next().await.expect("event");
            match event.object {
                MilpaObject::Pod(pod) => assert_eq!(pod.meta.name, format!("p{i}")),
                other => panic!("unexpected kind {}", other.kind()),
            }
        }
    }
}
