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
use std::error::Error;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::milpa::api::types::{Pod, PodStatus};
use crate::milpa::registry::RegistryError;
use crate::milpa::server::pod_controller::PodNotifier;
use crate::milpa::server::InstanceProvider;
use crate::milpa::util::with_context;

/// Synthesized Kubernetes node status for the virtual node. The shim
/// layer serializes this straight into the `v1.Node` it owns.
#[derive(Debug, Clone, Serialize)]
pub struct VirtualNodeStatus {
    pub capacity: HashMap<String, String>,
    pub allocatable: HashMap<String, String>,
    pub conditions: Vec<NodeCondition>,
    pub addresses: Vec<NodeAddress>,
    #[serde(rename = "nodeInfo")]
    pub node_info: NodeInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeCondition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: String,
    pub reason: String,
    pub message: String,
    #[serde(rename = "lastHeartbeatTime")]
    pub last_heartbeat_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeAddress {
    #[serde(rename = "type")]
    pub address_type: String,
    pub address: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeInfo {
    #[serde(rename = "operatingSystem")]
    pub operating_system: String,
    pub architecture: String,
}

fn condition(condition_type: &str, status: &str, reason: &str, message: &str) -> NodeCondition {
    NodeCondition {
        condition_type: condition_type.to_string(),
        status: status.to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        last_heartbeat_time: Utc::now(),
    }
}

/// Pod lifecycle surface the virtual-kubelet shim calls into. Every
/// operation translates to a registry write; the registry is the
/// source of truth, whether the write originated in Kubernetes or in
/// a direct API client.
impl InstanceProvider {
    pub fn create_pod(&self, pod: Pod) -> Result<Pod, Box<dyn Error + Send + Sync>> {
        self.pods
            .create_pod(pod)
            .map_err(|e| with_context(e, "creating pod"))
    }

    /// Spec updates only; status stays owned by the pod controller.
    pub async fn update_pod(&self, pod: Pod) -> Result<Pod, Box<dyn Error + Send + Sync>> {
        self.pods
            .update_pod_with_retry(&pod.meta.namespace, &pod.meta.name, |current| {
                current.spec = pod.spec.clone();
                current.meta.labels = pod.meta.labels.clone();
                Ok(())
            })
            .await
            .map_err(|e| with_context(e, "updating pod"))
    }

    pub async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.pod_controller
            .delete_pod(namespace, name)
            .await
            .map_err(|e| with_context(e, "deleting pod"))
    }

    pub fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, RegistryError> {
        match self.pods.get_pod(namespace, name) {
            Ok(pod) => Ok(Some(pod)),
            Err(error) if error.is_not_found() => Ok(None),
            Err(error) => Err(error),
        }
    }

    pub fn get_pod_status(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PodStatus>, RegistryError> {
        Ok(self.get_pod(namespace, name)?.map(|pod| pod.status))
    }

    pub fn get_pods(&self) -> Result<Vec<Pod>, RegistryError> {
        self.pods.list_pods(|_| true)
    }

    /// Registers the status-change callback; the pod controller invokes
    /// it on every phase transition.
    pub fn notify_pods(&self, notifier: PodNotifier) {
        self.pod_controller.set_notifier(notifier);
    }

    pub async fn run_in_container(
        &self,
        namespace: &str,
        pod_name: &str,
        container: &str,
        command: &[String],
    ) -> Result<String, Box<dyn Error + Send + Sync>> {
        let pod = self
            .pods
            .get_pod(namespace, pod_name)
            .map_err(|e| with_context(e, "looking up pod for exec"))?;
        let node = self
            .nodes
            .get_node(&pod.status.bound_node_name)
            .map_err(|e| with_context(e, "looking up node for exec"))?;
        let client = self.clients.client_for(&node);
        client
            .exec(pod_name, container, command)
            .await
            .map_err(|e| with_context(e, "exec on node agent"))
    }

    pub async fn get_container_logs(
        &self,
        pod_name: &str,
        container: &str,
        tail: u32,
    ) -> Result<String, Box<dyn Error + Send + Sync>> {
        self.find_log(pod_name, container, tail)
            .await
            .map(|log| log.content)
    }

    /// Node status for the synthetic Kubernetes node: configured
    /// capacity, fixed conditions with only Ready true, and the
    /// process's outbound address.
    pub fn configure_node(&self) -> VirtualNodeStatus {
        let config = self.provider_config();
        let mut capacity = HashMap::new();
        capacity.insert("cpu".to_string(), config.cpu.clone());
        capacity.insert("memory".to_string(), config.memory.clone());
        capacity.insert("pods".to_string(), config.pods.clone());

        VirtualNodeStatus {
            allocatable: capacity.clone(),
            capacity,
            conditions: vec![
                condition("Ready", "True", "KubeletReady", "kubelet is ready"),
                condition(
                    "OutOfDisk",
                    "False",
                    "KubeletHasSufficientDisk",
                    "kubelet has sufficient disk space available",
                ),
                condition(
                    "MemoryPressure",
                    "False",
                    "KubeletHasSufficientMemory",
                    "kubelet has sufficient memory available",
                ),
                condition(
                    "DiskPressure",
                    "False",
                    "KubeletHasNoDiskPressure",
                    "kubelet has no disk pressure",
                ),
                condition(
                    "NetworkUnavailable",
                    "False",
                    "RouteCreated",
                    "RouteController created a route",
                ),
            ],
            addresses: vec![NodeAddress {
                address_type: "InternalIP".to_string(),
                address: self.internal_ip().to_string(),
            }],
            node_info: NodeInfo {
                operating_system: "Linux".to_string(),
                architecture: "amd64".to_string(),
            },
        }
    }
}
