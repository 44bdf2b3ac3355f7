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

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::milpa::api::types::{pod_reference, PodPhase, REASON_NODE_LOST};
use crate::milpa::cloud::{CloudClient, CloudStatusKeeper};
use crate::milpa::logger::{log_info, log_warn};
use crate::milpa::observability::metrics;
use crate::milpa::registry::{
    EventRegistry, LogRegistry, NodeRegistry, PodRegistry, RegistryError,
};
use crate::milpa::server::manager::Controller;

const COMPONENT: &str = "garbage-controller";

#[derive(Clone)]
pub struct GarbageControllerConfig {
    pub clean_instances_interval: Duration,
    pub clean_terminated_interval: Duration,
    /// Instances younger than this are never reaped: a node record and
    /// its instance are created in two steps, and the instance can
    /// briefly exist before the registry knows its ID.
    pub instance_grace: Duration,
    /// Terminal pods older than this are removed from the registry.
    pub terminated_pod_ttl: Duration,
    /// Audit events older than this are dropped from the store. The
    /// event list cap is query-time only; this bounds the storage.
    pub event_ttl: Duration,
}

impl Default for GarbageControllerConfig {
    fn default() -> Self {
        Self {
            clean_instances_interval: Duration::from_secs(60),
            clean_terminated_interval: Duration::from_secs(10),
            instance_grace: Duration::from_secs(300),
            terminated_pod_ttl: Duration::from_secs(600),
            event_ttl: Duration::from_secs(3600),
        }
    }
}

/// Reconciles leaked resources: cloud instances with no registry node
/// and registry pods whose lifecycle already ended. Deliberately the
/// only component allowed to delete a cloud instance without going
/// through the node controller, and only past the grace window.
pub struct GarbageController {
    config: GarbageControllerConfig,
    pods: Arc<PodRegistry>,
    nodes: Arc<NodeRegistry>,
    logs: Arc<LogRegistry>,
    events: Arc<EventRegistry>,
    cloud: Arc<dyn CloudClient>,
    cloud_status: CloudStatusKeeper,
}

impl GarbageController {
    pub fn new(
        config: GarbageControllerConfig,
        pods: Arc<PodRegistry>,
        nodes: Arc<NodeRegistry>,
        logs: Arc<LogRegistry>,
        events: Arc<EventRegistry>,
        cloud: Arc<dyn CloudClient>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            pods,
            nodes,
            logs,
            events,
            cloud,
            cloud_status: CloudStatusKeeper::new(),
        })
    }

    /// Terminate tagged instances no registry node accounts for.
    pub async fn clean_instances(&self) {
        if let Err(error) = self.cloud_status.refresh(self.cloud.as_ref()).await {
            log_warn(
                COMPONENT,
                "instance listing failed",
                &[("error", &error.to_string())],
            );
            metrics::record_controller_tick("GarbageController.instances", false);
            return;
        }
        let instances = self.cloud_status.instances();

        let known: HashSet<String> = match self.nodes.list_nodes(|_| true) {
            Ok(nodes) => nodes
                .into_iter()
                .map(|node| node.status.instance_id)
                .filter(|id| !id.is_empty())
                .collect(),
            Err(_) => {
                metrics::record_controller_tick("GarbageController.instances", false);
                return;
            }
        };

        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.instance_grace)
                .unwrap_or_else(|_| chrono::Duration::seconds(300));

        for instance in instances {
            if known.contains(&instance.id) {
                continue;
            }
            if instance.launch_time > cutoff {
                // Inside the grace window: likely a node whose create
                // is still in flight.
                continue;
            }
            log_info(
                COMPONENT,
                "terminating orphan instance",
                &[("instance", &instance.id), ("node", &instance.node_name)],
            );
            match self.cloud.stop_instance(&instance.id).await {
                Ok(()) => metrics::record_instance_terminated("orphan"),
                Err(error) => log_warn(
                    COMPONENT,
                    "orphan terminate failed",
                    &[("instance", &instance.id), ("error", &error.to_string())],
                ),
            }
        }
        metrics::record_controller_tick("GarbageController.instances", true);
    }

    /// Drop terminal pods past their TTL and fail pods whose node is
    /// gone from the registry.
    pub async fn clean_pods(&self) {
        let pods = match self.pods.list_pods(|_| true) {
            Ok(pods) => pods,
            Err(_) => {
                metrics::record_controller_tick("GarbageController.pods", false);
                return;
            }
        };
        let node_names: HashSet<String> = match self.nodes.list_nodes(|_| true) {
            Ok(nodes) => nodes.into_iter().map(|node| node.meta.name).collect(),
            Err(_) => {
                metrics::record_controller_tick("GarbageController.pods", false);
                return;
            }
        };

        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.terminated_pod_ttl)
                .unwrap_or_else(|_| chrono::Duration::seconds(600));

        for pod in pods {
            if pod.status.phase.is_terminal() {
                let since = pod
                    .status
                    .last_phase_change
                    .or(pod.meta.creation_timestamp);
                if since.map(|ts| ts < cutoff).unwrap_or(true) {
                    match self.pods.delete_pod(&pod.meta.namespace, &pod.meta.name) {
                        Ok(_) => {
                            let _ = self.logs.delete_logs_for_parent(&pod.meta.name);
                            log_info(
                                COMPONENT,
                                "expired terminal pod removed",
                                &[("pod", &pod.meta.name)],
                            );
                        }
                        Err(error) if error.is_not_found() => {}
                        Err(error) => log_warn(
                            COMPONENT,
                            "terminal pod delete failed",
                            &[("pod", &pod.meta.name), ("error", &error.to_string())],
                        ),
                    }
                }
                continue;
            }

            // Bound to a node that no longer exists.
            let bound = &pod.status.bound_node_name;
            if !bound.is_empty() && !node_names.contains(bound) {
                let _ = self.events.create_event(
                    pod_reference(&pod),
                    REASON_NODE_LOST,
                    &format!("node {} no longer exists", bound),
                );
                let result = self
                    .pods
                    .update_pod_with_retry(&pod.meta.namespace, &pod.meta.name, |current| {
                        if current.status.phase.is_terminal() {
                            return Err(RegistryError::Validation("pod already terminal".into()));
                        }
                        current.status.phase = PodPhase::Failed;
                        current.status.reason = REASON_NODE_LOST.to_string();
                        current.status.last_phase_change = Some(Utc::now());
                        Ok(())
                    })
                    .await;
                if result.is_ok() {
                    log_warn(
                        COMPONENT,
                        "pod failed, bound node lost",
                        &[("pod", &pod.meta.name), ("node", bound)],
                    );
                }
            }
        }
        let event_cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.event_ttl)
                .unwrap_or_else(|_| chrono::Duration::hours(1));
        if let Err(error) = self.events.delete_events_older_than(event_cutoff) {
            log_warn(
                COMPONENT,
                "event pruning failed",
                &[("error", &error.to_string())],
            );
        }

        metrics::record_controller_tick("GarbageController.pods", true);
    }
}

impl Controller for GarbageController {
    fn name(&self) -> &'static str {
        "GarbageController"
    }

    fn start(self: Arc<Self>, quit: CancellationToken, tasks: &TaskTracker) {
        let instances = Arc::clone(&self);
        let instances_quit = quit.clone();
        tasks.spawn(async move {
            let mut ticker = tokio::time::interval(instances.config.clean_instances_interval);
            loop {
                tokio::select! {
                    _ = instances_quit.cancelled() => break,
                    _ = ticker.tick() => instances.clean_instances().await,
                }
            }
        });

        let pods = Arc::clone(&self);
        tasks.spawn(async move {
            let mut ticker = tokio::time::interval(pods.config.clean_terminated_interval);
            loop {
                tokio::select! {
                    _ = quit.cancelled() => break,
                    _ = ticker.tick() => pods.clean_pods().await,
                }
            }
        });
    }

    fn dump(&self) -> Vec<u8> {
        serde_json::to_vec_pretty(&serde_json::json!({
            "instanceGraceSeconds": self.config.instance_grace.as_secs(),
            "terminatedPodTTLSeconds": self.config.terminated_pod_ttl.as_secs(),
            "eventTTLSeconds": self.config.event_ttl.as_secs(),
            "lastCloudSync": self.cloud_status.refreshed_at(),
        }))
        .unwrap_or_default()
    }
}
