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

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::milpa::api::types::Node;
use crate::milpa::nodemanager::scaler::NodeBucket;

/// A pod waiting for a cell from a bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRequest {
    pub bucket: NodeBucket,
    pub pod_name: String,
    pub pod_namespace: String,
}

#[derive(Debug)]
pub enum NodeReply {
    Granted(Box<Node>),
    /// Deadline passed with no matching cell. A normal scheduling
    /// outcome, not an error: the requester re-queues and the next
    /// scaler pass creates capacity.
    NoNodeAvailable,
}

/// A claimed cell coming back after its pod ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeReturn {
    pub node_name: String,
    /// Whether the agent confirmed container teardown. Unconfirmed
    /// cells go through Cleaning instead of straight to Available.
    pub agent_confirmed: bool,
}

struct Waiter {
    id: u64,
    request: NodeRequest,
    reply: oneshot::Sender<Node>,
}

#[derive(Default)]
struct DispenserState {
    waiting: Vec<Waiter>,
    returns: Vec<NodeReturn>,
}

/// Request/reply queue between the pod controller (asking for cells)
/// and the node controller (owning the pool). The dispenser itself
/// never touches the registry; it only brokers.
pub struct NodeDispenser {
    state: Mutex<DispenserState>,
    next_id: AtomicU64,
}

impl NodeDispenser {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(DispenserState::default()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Parks until the node controller hands over a claimed cell from
    /// the bucket, or the deadline passes.
    pub async fn request(&self, request: NodeRequest, deadline: Duration) -> NodeReply {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock().expect("dispenser state poisoned");
            state.waiting.push(Waiter {
                id,
                request,
                reply: tx,
            });
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(node)) => NodeReply::Granted(Box::new(node)),
            _ => {
                let mut state = self.state.lock().expect("dispenser state poisoned");
                state.waiting.retain(|waiter| waiter.id != id);
                NodeReply::NoNodeAvailable
            }
        }
    }

    /// Buckets with parked requests, one entry per request. This is the
    /// demand half of the scaler input.
    pub fn pending_buckets(&self) -> Vec<NodeBucket> {
        let state = self.state.lock().expect("dispenser state poisoned");
        state
            .waiting
            .iter()
            .map(|waiter| waiter.request.bucket.clone())
            .collect()
    }

    /// First parked request for a bucket, if any. The node controller
    /// claims a cell for it before calling [`fulfill`].
    pub fn next_request(&self, bucket: &NodeBucket) -> Option<NodeRequest> {
        let state = self.state.lock().expect("dispenser state poisoned");
        state
            .waiting
            .iter()
            .find(|waiter| waiter.request.bucket == *bucket)
            .map(|waiter| waiter.request.clone())
    }

    /// Hands a claimed cell to the pod that asked for it. Returns the
    /// node if nobody is waiting anymore (requester timed out), so the
    /// caller can unclaim it.
    pub fn fulfill(&self, request: &NodeRequest, node: Node) -> Result<(), Node> {
        let waiter = {
            let mut state = self.state.lock().expect("dispenser state poisoned");
            let position = state.waiting.iter().position(|waiter| {
                waiter.request.pod_name == request.pod_name
                    && waiter.request.pod_namespace == request.pod_namespace
            });
            match position {
                Some(index) => state.waiting.remove(index),
                None => return Err(node),
            }
        };
        waiter.reply.send(node)
    }

    /// Drops any parked request for a pod whose requester gave up
    /// without waiting out the deadline (shutdown path).
    pub fn abandon(&self, pod_name: &str, pod_namespace: &str) {
        let mut state = self.state.lock().expect("dispenser state poisoned");
        state.waiting.retain(|waiter| {
            waiter.request.pod_name != pod_name || waiter.request.pod_namespace != pod_namespace
        });
    }

    /// Queues a cell for return to the pool. Duplicate releases of the
    /// same cell collapse into one pending return.
    pub fn release(&self, node_name: &str, agent_confirmed: bool) {
        let mut state = self.state.lock().expect("dispenser state poisoned");
        if state
            .returns
            .iter()
            .any(|pending| pending.node_name == node_name)
        {
            return;
        }
        state.returns.push(NodeReturn {
            node_name: node_name.to_string(),
            agent_confirmed,
        });
    }

    /// Drains queued returns; the node controller processes them on its
    /// pool tick.
    pub fn drain_returns(&self) -> Vec<NodeReturn> {
        let mut state = self.state.lock().expect("dispenser state poisoned");
        std::mem::take(&mut state.returns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::milpa::api::types::NodePhase;

    fn bucket() -> NodeBucket {
        NodeBucket {
            instance_type: "t2.small".into(),
            volume_gib: 10,
            boot_image: "img-1".into(),
        }
    }

    fn request(pod: &str) -> NodeRequest {
        NodeRequest {
            bucket: bucket(),
            pod_name: pod.to_string(),
            pod_namespace: "default".to_string(),
        }
    }

    #[tokio::test]
    async fn granted_request_receives_the_node() {
        let dispenser = NodeDispenser::new();
        let waiter = {
            let dispenser = Arc::clone(&dispenser);
            tokio::spawn(async move {
                dispenser
                    .request(request("p1"), Duration::from_secs(5))
                    .await
            })
        };

        // Wait for the request to park.
        loop {
            if !dispenser.pending_buckets().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let parked = dispenser.next_request(&bucket()).expect("parked request");
        assert_eq!(parked.pod_name, "p1");

        let mut node = Node::new("n1", "t2.small", "img-1");
        node.status.phase = NodePhase::Claimed;
        node.status.bound_pod_name = "p1".into();
        dispenser.fulfill(&parked, node).expect("fulfill");

        match waiter.await.expect("join") {
            NodeReply::Granted(node) => assert_eq!(node.meta.name, "n1"),
            NodeReply::NoNodeAvailable => panic!("expected a granted node"),
        }
        assert!(dispenser.pending_buckets().is_empty());
    }

    #[tokio::test]
    async fn timed_out_requests_report_no_node() {
        let dispenser = NodeDispenser::new();
        let reply = dispenser
            .request(request("p1"), Duration::from_millis(20))
            .await;
        assert!(matches!(reply, NodeReply::NoNodeAvailable));
        assert!(dispenser.pending_buckets().is_empty());
    }

    #[tokio::test]
    async fn fulfilling_a_vanished_waiter_returns_the_node() {
        let dispenser = NodeDispenser::new();
        let node = Node::new("n1", "t2.small", "img-1");
        let rejected = dispenser.fulfill(&request("ghost"), node).unwrap_err();
        assert_eq!(rejected.meta.name, "n1");
    }

    #[test]
    fn duplicate_releases_collapse() {
        let dispenser = NodeDispenser::new();
        dispenser.release("n1", true);
        dispenser.release("n1", false);
        let returns = dispenser.drain_returns();
        assert_eq!(returns.len(), 1);
        assert!(returns[0].agent_confirmed);
        assert!(dispenser.drain_returns().is_empty());
    }
}
