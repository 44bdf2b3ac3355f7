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

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::milpa::api::types::{
    node_reference, Node, NodePhase, ResourceSpec, REASON_IMAGE_NOT_FOUND,
    REASON_INSTANCE_LAUNCH_FAILED,
};
use crate::milpa::cloud::{CloudClient, StartNodeSpec, CONTROLLER_TAG, NODE_NAME_TAG};
use crate::milpa::logger::{log_error, log_info, log_warn};
use crate::milpa::nodeclient::NodeClientFactory;
use crate::milpa::nodemanager::dispenser::NodeDispenser;
use crate::milpa::nodemanager::scaler::{BindingNodeScaler, NodeBucket};
use crate::milpa::observability::metrics;
use crate::milpa::registry::{EventRegistry, NodeRegistry, RegistryError};
use crate::milpa::server::manager::Controller;
use crate::milpa::util::random_uid;

const COMPONENT: &str = "node-controller";
/// Heartbeats missed before a cell is written off.
const REAP_MISSES: u32 = 3;
const BOOT_IMAGE_POLL: Duration = Duration::from_secs(5);
const AGENT_BOOT_PROBES: u32 = 60;
const AGENT_BOOT_PROBE_DELAY: Duration = Duration::from_millis(500);

#[derive(Clone)]
pub struct NodeControllerConfig {
    pub pool_interval: Duration,
    pub heartbeat_interval: Duration,
    pub reaper_interval: Duration,
    /// How long Terminated records linger for inspection before the
    /// registry entry is removed.
    pub terminated_linger: Duration,
    pub boot_image_tag: String,
    /// Rendered cloud-init document handed to new instances: node
    /// agent version and download URL, cluster server URL and the
    /// pre-shared agent certificate. Templated outside this process.
    pub cloud_init: String,
    /// Node agent build booted onto cells; recorded in instance tags so
    /// operators can spot version skew from the cloud console.
    pub itzo_version: String,
    pub itzo_url: String,
}

impl Default for NodeControllerConfig {
    fn default() -> Self {
        Self {
            pool_interval: Duration::from_secs(7),
            heartbeat_interval: Duration::from_secs(10),
            reaper_interval: Duration::from_secs(10),
            terminated_linger: Duration::from_secs(60),
            boot_image_tag: String::new(),
            cloud_init: String::new(),
            itzo_version: "latest".to_string(),
            itzo_url: String::new(),
        }
    }
}

/// Drives the cell pool: boots instances for buckets below target,
/// retires surplus, claims cells for parked pod requests, heartbeats
/// agents and reaps the silent ones.
pub struct NodeController {
    config: NodeControllerConfig,
    nodes: Arc<NodeRegistry>,
    events: Arc<EventRegistry>,
    dispenser: Arc<NodeDispenser>,
    scaler: Arc<BindingNodeScaler>,
    cloud: Arc<dyn CloudClient>,
    clients: Arc<dyn NodeClientFactory>,
    controller_id: String,
}

impl NodeController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: NodeControllerConfig,
        nodes: Arc<NodeRegistry>,
        events: Arc<EventRegistry>,
        dispenser: Arc<NodeDispenser>,
        scaler: Arc<BindingNodeScaler>,
        cloud: Arc<dyn CloudClient>,
        clients: Arc<dyn NodeClientFactory>,
        controller_id: &str,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            nodes,
            events,
            dispenser,
            scaler,
            cloud,
            clients,
            controller_id: controller_id.to_string(),
        })
    }

    /// Blocks the pool until the boot image exists; cells launched from
    /// a missing image would never come up.
    async fn wait_for_boot_image(&self, quit: &CancellationToken) {
        if self.config.boot_image_tag.is_empty() {
            return;
        }
        let mut reported = false;
        loop {
            if quit.is_cancelled() {
                return;
            }
            match self.cloud.boot_image_available(&self.config.boot_image_tag).await {
                Ok(true) => {
                    log_info(
                        COMPONENT,
                        "boot image available",
                        &[("image", &self.config.boot_image_tag)],
                    );
                    return;
                }
                Ok(false) => {
                    if !reported {
                        reported = true;
                        log_warn(
                            COMPONENT,
                            "boot image not found, waiting",
                            &[("image", &self.config.boot_image_tag)],
                        );
                        let reference = crate::milpa::api::types::ObjectReference {
                            kind: "Node".to_string(),
                            name: "pool".to_string(),
                            namespace: String::new(),
                            uid: self.controller_id.clone(),
                        };
                        let _ = self.events.create_event(
                            reference,
                            REASON_IMAGE_NOT_FOUND,
                            &format!("boot image {} not available", self.config.boot_image_tag),
                        );
                    }
                }
                Err(error) => {
                    log_warn(
                        COMPONENT,
                        "boot image lookup failed",
                        &[("error", &error.to_string())],
                    );
                }
            }
            tokio::select! {
                _ = quit.cancelled() => return,
                _ = tokio::time::sleep(BOOT_IMAGE_POLL) => {}
            }
        }
    }

    async fn pool_tick(self: &Arc<Self>, quit: &CancellationToken, tasks: &TaskTracker) {
        let ok = self.pool_pass(quit, tasks).await.is_ok();
        metrics::record_controller_tick("NodeController", ok);
    }

    async fn pool_pass(
        self: &Arc<Self>,
        quit: &CancellationToken,
        tasks: &TaskTracker,
    ) -> Result<(), RegistryError> {
        self.process_returns().await;

        let nodes = self.nodes.list_nodes(|_| true)?;
        self.publish_pool_gauges(&nodes);

        let demand = self.dispenser.pending_buckets();
        let plan = self.scaler.compute(&nodes, &demand);

        for (bucket, count) in &plan.to_create {
            for _ in 0..*count {
                match self.create_pool_node(bucket) {
                    Ok(node) => {
                        let controller = Arc::clone(self);
                        let quit = quit.clone();
                        tasks.spawn(async move {
                            controller.launch_cell(node, quit).await;
                        });
                    }
                    Err(error) => log_error(
                        COMPONENT,
                        "failed to create pool node",
                        &[("bucket", &bucket.label()), ("error", &error.to_string())],
                    ),
                }
            }
        }

        for name in &plan.to_terminate {
            let result = self
                .nodes
                .update_node_with_retry(name, |node| {
                    if node.status.phase != NodePhase::Available {
                        return Err(RegistryError::Validation(
                            "node left Available before retirement".into(),
                        ));
                    }
                    node.status.phase = NodePhase::Terminating;
                    Ok(())
                })
                .await;
            if let Err(error) = result {
                if !matches!(error, RegistryError::Validation(_)) && !error.is_not_found() {
                    log_warn(
                        COMPONENT,
                        "failed to retire node",
                        &[("node", name), ("error", &error.to_string())],
                    );
                }
            }
        }

        self.progress_terminating().await?;
        self.sweep_terminated()?;
        self.fulfill_requests().await?;
        Ok(())
    }

    /// Claimed cells handed back by the pod controller return to the
    /// pool, through Cleaning when teardown was not confirmed.
    async fn process_returns(&self) {
        for pending in self.dispenser.drain_returns() {
            let target = if pending.agent_confirmed {
                NodePhase::Available
            } else {
                NodePhase::Cleaning
            };
            let result = self
                .nodes
                .update_node_with_retry(&pending.node_name, |node| {
                    if node.status.phase != NodePhase::Claimed {
                        return Err(RegistryError::Validation(
                            "returned node is not Claimed".into(),
                        ));
                    }
                    node.status.phase = target;
                    node.status.bound_pod_name = String::new();
                    Ok(())
                })
                .await;
            match result {
                Ok(node) => log_info(
                    COMPONENT,
                    "node returned to pool",
                    &[
                        ("node", &pending.node_name),
                        ("phase", node.status.phase.as_str()),
                    ],
                ),
                Err(error) if error.is_not_found() => {}
                Err(error) => log_warn(
                    COMPONENT,
                    "failed to return node",
                    &[("node", &pending.node_name), ("error", &error.to_string())],
                ),
            }
        }
    }

    fn create_pool_node(&self, bucket: &NodeBucket) -> Result<Node, RegistryError> {
        let name = format!("cell-{}", &random_uid()[..12]);
        let mut node = Node::new(&name, &bucket.instance_type, &bucket.boot_image);
        node.spec.resources = ResourceSpec {
            volume_size: Some(format!("{}Gi", bucket.volume_gib)),
            ..Default::default()
        };
        node.status.phase = NodePhase::Creating;
        let created = self.nodes.create_node(node)?;
        log_info(
            COMPONENT,
            "creating cell",
            &[("node", &name), ("bucket", &bucket.label())],
        );
        Ok(created)
    }

    /// Realizes a Creating node as a cloud instance and promotes it to
    /// Available once the agent answers. Runs off the pool loop so a
    /// slow boot never stalls a tick; in-flight cloud calls complete on
    /// shutdown to avoid leaking instances.
    async fn launch_cell(self: Arc<Self>, node: Node, quit: CancellationToken) {
        let name = node.meta.name.clone();
        let mut tags = HashMap::new();
        tags.insert(CONTROLLER_TAG.to_string(), self.controller_id.clone());
        tags.insert(NODE_NAME_TAG.to_string(), name.clone());
        if !self.config.itzo_version.is_empty() {
            tags.insert("milpa-itzo-version".to_string(), self.config.itzo_version.clone());
        }
        let spec = StartNodeSpec {
            node: node.clone(),
            cloud_init: self.config.cloud_init.clone(),
            tags,
        };

        let instance_id = match self.cloud.start_node(&spec).await {
            Ok(id) => id,
            Err(error) => {
                log_error(
                    COMPONENT,
                    "instance launch failed",
                    &[("node", &name), ("error", &error.to_string())],
                );
                let _ = self.events.create_event(
                    node_reference(&node),
                    REASON_INSTANCE_LAUNCH_FAILED,
                    &error.to_string(),
                );
                let _ = self.nodes.delete_node(&name);
                return;
            }
        };
        if quit.is_cancelled() {
            // Shutting down: the instance exists but this process will
            // not manage it. Leave the Creating record for the next
            // leader to adopt or the garbage controller to reap.
            return;
        }

        let update = self
            .nodes
            .update_node_with_retry(&name, |n| {
                n.status.instance_id = instance_id.clone();
                Ok(())
            })
            .await;
        if let Err(error) = update {
            log_warn(
                COMPONENT,
                "failed to record instance id",
                &[("node", &name), ("error", &error.to_string())],
            );
            return;
        }

        let instance = match self.cloud.wait_for_running(&instance_id).await {
            Ok(instance) => instance,
            Err(error) => {
                let _ = self.events.create_event(
                    node_reference(&node),
                    REASON_INSTANCE_LAUNCH_FAILED,
                    &error.to_string(),
                );
                let _ = self.mark_terminating(&name).await;
                return;
            }
        };

        let probe_node = match self
            .nodes
            .update_node_with_retry(&name, |n| {
                n.status.addresses = crate::milpa::api::types::NetworkAddresses::new(
                    &instance.private_ip,
                    &instance.public_ip,
                );
                Ok(())
            })
            .await
        {
            Ok(updated) => updated,
            Err(_) => return,
        };

        if !self.probe_until_healthy(&probe_node, &quit).await {
            log_warn(COMPONENT, "agent never became healthy", &[("node", &name)]);
            let _ = self.mark_terminating(&name).await;
            return;
        }

        let promoted = self
            .nodes
            .update_node_with_retry(&name, |n| {
                if n.status.phase != NodePhase::Creating {
                    return Err(RegistryError::Validation(
                        "node left Creating during boot".into(),
                    ));
                }
                n.status.phase = NodePhase::Available;
                n.status.last_heartbeat = Some(Utc::now());
                Ok(())
            })
            .await;
        match promoted {
            Ok(_) => log_info(
                COMPONENT,
                "cell available",
                &[("node", &name), ("instance", &instance_id)],
            ),
            Err(error) => log_warn(
                COMPONENT,
                "failed to promote cell",
                &[("node", &name), ("error", &error.to_string())],
            ),
        }
    }

    async fn probe_until_healthy(&self, node: &Node, quit: &CancellationToken) -> bool {
        let client = self.clients.client_for(node);
        for _ in 0..AGENT_BOOT_PROBES {
            if quit.is_cancelled() {
                return false;
            }
            if client.health_check().await.is_ok() {
                return true;
            }
            tokio::select! {
                _ = quit.cancelled() => return false,
                _ = tokio::time::sleep(AGENT_BOOT_PROBE_DELAY) => {}
            }
        }
        false
    }

    async fn mark_terminating(&self, name: &str) -> Result<(), RegistryError> {
        self.nodes
            .update_node_with_retry(name, |node| {
                node.status.phase = NodePhase::Terminating;
                node.status.bound_pod_name = String::new();
                Ok(())
            })
            .await
            .map(|_| ())
    }

    async fn progress_terminating(&self) -> Result<(), RegistryError> {
        for node in self.nodes.nodes_in_phase(NodePhase::Terminating)? {
            if !node.status.instance_id.is_empty() {
                match self.cloud.stop_instance(&node.status.instance_id).await {
                    Ok(()) => metrics::record_instance_terminated("scale_down"),
                    // Already gone is the state we wanted.
                    Err(crate::milpa::cloud::CloudError::InstanceNotFound(_)) => {}
                    Err(error) => {
                        log_warn(
                            COMPONENT,
                            "instance stop failed, will retry",
                            &[
                                ("node", &node.meta.name),
                                ("instance", &node.status.instance_id),
                                ("error", &error.to_string()),
                            ],
                        );
                        continue;
                    }
                }
            }
            let _ = self
                .nodes
                .update_node_with_retry(&node.meta.name, |n| {
                    n.status.phase = NodePhase::Terminated;
                    n.status.last_heartbeat = Some(Utc::now());
                    Ok(())
                })
                .await;
        }
        Ok(())
    }

    /// Terminated records are kept for a short linger, then dropped.
    fn sweep_terminated(&self) -> Result<(), RegistryError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.terminated_linger)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
        for node in self.nodes.nodes_in_phase(NodePhase::Terminated)? {
            let expired = node
                .status
                .last_heartbeat
                .or(node.meta.creation_timestamp)
                .map(|ts| ts < cutoff)
                .unwrap_or(true);
            if expired {
                match self.nodes.delete_node(&node.meta.name) {
                    Ok(_) => {}
                    Err(error) if error.is_not_found() => {}
                    Err(error) => return Err(error),
                }
            }
        }
        Ok(())
    }

    /// Matches parked pod requests with Available cells. The claim is a
    /// CAS transition, so a cell can never serve two pods.
    async fn fulfill_requests(&self) -> Result<(), RegistryError> {
        let mut buckets = self.dispenser.pending_buckets();
        buckets.sort();
        buckets.dedup();
        for bucket in buckets {
            loop {
                let Some(request) = self.dispenser.next_request(&bucket) else {
                    break;
                };
                let available = self.nodes.list_nodes(|node| {
                    node.status.phase == NodePhase::Available
                        && node.status.bound_pod_name.is_empty()
                        && self.scaler.bucket_for_node(node) == bucket
                })?;
                let Some(candidate) = available.into_iter().next() else {
                    break;
                };

                let claim = self
                    .nodes
                    .update_node_with_retry(&candidate.meta.name, |node| {
                        if node.status.phase != NodePhase::Available
                            || !node.status.bound_pod_name.is_empty()
                        {
                            return Err(RegistryError::Validation(
                                "node no longer available".into(),
                            ));
                        }
                        node.status.phase = NodePhase::Claimed;
                        node.status.bound_pod_name = request.pod_name.clone();
                        Ok(())
                    })
                    .await;

                match claim {
                    Ok(claimed) => {
                        let name = claimed.meta.name.clone();
                        if self.dispenser.fulfill(&request, claimed).is_err() {
                            // Requester gave up while we were claiming.
                            let _ = self
                                .nodes
                                .update_node_with_retry(&name, |node| {
                                    node.status.phase = NodePhase::Available;
                                    node.status.bound_pod_name = String::new();
                                    Ok(())
                                })
                                .await;
                        } else {
                            log_info(
                                COMPONENT,
                                "cell claimed",
                                &[("node", &name), ("pod", &request.pod_name)],
                            );
                        }
                    }
                    // Lost the race for this cell; try the next one.
                    Err(_) => continue,
                }
            }
        }
        Ok(())
    }

    async fn heartbeat_tick(&self) {
        let nodes = match self.nodes.list_nodes(|node| node.status.phase.is_running()) {
            Ok(nodes) => nodes,
            Err(error) => {
                log_warn(COMPONENT, "heartbeat listing failed", &[("error", &error.to_string())]);
                metrics::record_controller_tick("NodeController.heartbeat", false);
                return;
            }
        };
        for node in nodes {
            let client = self.clients.client_for(&node);
            let healthy = client.health_check().await.is_ok();
            metrics::record_agent_probe(healthy);
            if healthy {
                let _ = self
                    .nodes
                    .update_node_with_retry(&node.meta.name, |n| {
                        n.status.last_heartbeat = Some(Utc::now());
                        Ok(())
                    })
                    .await;
            }
        }
        metrics::record_controller_tick("NodeController.heartbeat", true);
    }

    async fn reaper_tick(&self) {
        // Cells that failed cleanup last round move on to termination.
        if let Ok(cleaning) = self.nodes.nodes_in_phase(NodePhase::Cleaning) {
            for node in cleaning {
                let _ = self.mark_terminating(&node.meta.name).await;
            }
        }

        let deadline = self.config.reaper_interval * REAP_MISSES;
        let cutoff = Utc::now()
            - chrono::Duration::from_std(deadline).unwrap_or_else(|_| chrono::Duration::seconds(30));
        let stale = match self.nodes.list_nodes(|node| {
            node.status.phase.is_running()
                && node
                    .status
                    .last_heartbeat
                    .or(node.meta.creation_timestamp)
                    .map(|ts| ts < cutoff)
                    .unwrap_or(true)
        }) {
            Ok(nodes) => nodes,
            Err(_) => return,
        };

        for node in stale {
            log_warn(
                COMPONENT,
                "reaping silent cell",
                &[("node", &node.meta.name)],
            );
            let _ = self
                .nodes
                .update_node_with_retry(&node.meta.name, |n| {
                    n.status.phase = NodePhase::Cleaning;
                    n.status.bound_pod_name = String::new();
                    Ok(())
                })
                .await;
        }
    }

    fn publish_pool_gauges(&self, nodes: &[Node]) {
        let phases = [
            NodePhase::Creating,
            NodePhase::Available,
            NodePhase::Claimed,
            NodePhase::Cleaning,
            NodePhase::Terminating,
            NodePhase::Terminated,
        ];
        for phase in phases {
            let count = nodes.iter().filter(|n| n.status.phase == phase).count();
            metrics::set_node_pool_size(phase.as_str(), count as i64);
        }
    }
}

impl Controller for NodeController {
    fn name(&self) -> &'static str {
        "NodeController"
    }

    fn start(self: Arc<Self>, quit: CancellationToken, tasks: &TaskTracker) {
        let pool = Arc::clone(&self);
        let pool_quit = quit.clone();
        let pool_tasks = tasks.clone();
        tasks.spawn(async move {
            pool.wait_for_boot_image(&pool_quit).await;
            let mut ticker = tokio::time::interval(pool.config.pool_interval);
            loop {
                tokio::select! {
                    _ = pool_quit.cancelled() => break,
                    _ = ticker.tick() => pool.pool_tick(&pool_quit, &pool_tasks).await,
                }
            }
        });

        let heartbeat = Arc::clone(&self);
        let heartbeat_quit = quit.clone();
        tasks.spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat.config.heartbeat_interval);
            loop {
                tokio::select! {
                    _ = heartbeat_quit.cancelled() => break,
                    _ = ticker.tick() => heartbeat.heartbeat_tick().await,
                }
            }
        });

        let reaper = Arc::clone(&self);
        tasks.spawn(async move {
            let mut ticker = tokio::time::interval(reaper.config.reaper_interval);
            loop {
                tokio::select! {
                    _ = quit.cancelled() => break,
                    _ = ticker.tick() => reaper.reaper_tick().await,
                }
            }
        });
    }

    fn dump(&self) -> Vec<u8> {
        let nodes = self.nodes.list_nodes(|_| true).unwrap_or_default();
        let mut by_phase: HashMap<&str, usize> = HashMap::new();
        for node in &nodes {
            *by_phase.entry(node.status.phase.as_str()).or_default() += 1;
        }
        let pending: Vec<String> = self
            .dispenser
            .pending_buckets()
            .into_iter()
            .map(|bucket| bucket.label())
            .collect();
        serde_json::to_vec_pretty(&serde_json::json!({
            "nodesByPhase": by_phase,
            "pendingRequests": pending,
            "bootImage": self.config.boot_image_tag,
            "itzoVersion": self.config.itzo_version,
            "itzoURL": self.config.itzo_url,
        }))
        .unwrap_or_default()
    }
}
