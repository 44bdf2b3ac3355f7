/*
 * Copyright (C) 2026 The Milpa Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::sync::Arc;

use crate::milpa::api::types::{Node, NodePhase};
use crate::milpa::events::EventSystem;
use crate::milpa::registry::kv::KvStore;
use crate::milpa::registry::{ObjectStore, RegistryError, RegistryWatch};

pub struct NodeRegistry {
    store: ObjectStore<Node>,
}

impl NodeRegistry {
    pub fn new(kv: Arc<dyn KvStore>, events: Arc<EventSystem>) -> Self {
        Self {
            store: ObjectStore::new(kv, events),
        }
    }

    pub fn create_node(&self, node: Node) -> Result<Node, RegistryError> {
        self.store.create(node)
    }

    pub fn get_node(&self, name: &str) -> Result<Node, RegistryError> {
        self.store.get("", name)
    }

    pub fn update_node(&self, node: &Node) -> Result<Node, RegistryError> {
        self.store.update(node)
    }

    pub async fn update_node_with_retry<F>(&self, name: &str, apply: F) -> Result<Node, RegistryError>
    where
        F: FnMut(&mut Node) -> Result<(), RegistryError>,
    {
        self.store.update_with_retry("", name, apply).await
    }

    pub fn delete_node(&self, name: &str) -> Result<Node, RegistryError> {
        self.store.delete("", name)
    }

    pub fn list_nodes<F>(&self, filter: F) -> Result<Vec<Node>, RegistryError>
    where
        F: Fn(&Node) -> bool,
    {
        self.store.list(filter)
    }

    pub fn nodes_in_phase(&self, phase: NodePhase) -> Result<Vec<Node>, RegistryError> {
        self.list_nodes(|node| node.status.phase == phase)
    }

    pub fn watch_nodes(&self, resume: Option<u64>) -> Result<RegistryWatch<Node>, RegistryError> {
        self.store.watch(resume)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::milpa::registry::kv::MemoryKvStore;

    fn registry() -> NodeRegistry {
        NodeRegistry::new(Arc::new(MemoryKvStore::new()), EventSystem::new())
    }

    #[test]
    fn nodes_are_cluster_scoped() {
        let nodes = registry();
        let created = nodes
            .create_node(Node::new("n1", "t2.small", "img-1"))
            .expect("create");
        assert!(created.meta.namespace.is_empty());
        assert_eq!(nodes.get_node("n1").unwrap().meta.uid, created.meta.uid);
    }

    #[tokio::test]
    async fn node_watch_sees_phase_transitions() {
        let nodes = registry();
        let created = nodes
            .create_node(Node::new("n1", "t2.small", "img-1"))
            .expect("create");
        let mut watch = nodes
            .watch_nodes(Some(created.meta.resource_version))
            .expect("watch");

        nodes
            .update_node_with_retry("n1", |node| {
                node.status.phase = NodePhase::Available;
                Ok(())
            })
            .await
            .expect("transition");

        let event = watch.next().await.expect("modified event");
        assert_eq!(
            event.object.unwrap().status.phase,
            NodePhase::Available
        );
    }

    #[tokio::test]
    async fn status_transitions_use_cas() {
        let nodes = registry();
        nodes
            .create_node(Node::new("n1", "t2.small", "img-1"))
            .expect("create");

        let updated = nodes
            .update_node_with_retry("n1", |node| {
                node.status.phase = NodePhase::Available;
                Ok(())
            })
            .await
            .expect("transition");
        assert_eq!(updated.status.phase, NodePhase::Available);
        assert_eq!(nodes.nodes_in_phase(NodePhase::Available).unwrap().len(), 1);
    }
}
