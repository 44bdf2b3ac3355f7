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
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::milpa::util::{new_error, random_uid};

/// Event reasons surfaced to users.
pub const REASON_FAILED_SCHEDULING: &str = "FailedScheduling";
pub const REASON_NODE_LOST: &str = "NodeLost";
pub const REASON_INSTANCE_LAUNCH_FAILED: &str = "InstanceLaunchFailed";
pub const REASON_IMAGE_NOT_FOUND: &str = "ImageNotFound";
pub const REASON_POD_FAILED: &str = "PodFailed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Pod,
    Node,
    Event,
    LogFile,
    Metric,
}

impl ResourceKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Pod => "Pod",
            ResourceKind::Node => "Node",
            ResourceKind::Event => "Event",
            ResourceKind::LogFile => "LogFile",
            ResourceKind::Metric => "Metric",
        }
    }

    /// Path segment used when building registry keys. Namespaced kinds
    /// store under `milpa/<segment>/<namespace>/<name>`, cluster-scoped
    /// kinds under `milpa/<segment>/<name>`.
    pub const fn key_segment(self) -> &'static str {
        match self {
            ResourceKind::Pod => "pods",
            ResourceKind::Node => "nodes",
            ResourceKind::Event => "events",
            ResourceKind::LogFile => "logs",
            ResourceKind::Metric => "metrics",
        }
    }

    pub const fn namespaced(self) -> bool {
        matches!(
            self,
            ResourceKind::Pod | ResourceKind::Event | ResourceKind::LogFile
        )
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ObjectMeta {
    pub uid: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(rename = "creationTimestamp")]
    pub creation_timestamp: Option<DateTime<Utc>>,
    #[serde(rename = "resourceVersion", default)]
    pub resource_version: u64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
}

impl ObjectMeta {
    pub fn new(name: &str, namespace: &str) -> Self {
        Self {
            uid: random_uid(),
            name: name.to_string(),
            namespace: namespace.to_string(),
            creation_timestamp: Some(Utc::now()),
            resource_version: 0,
            labels: HashMap::new(),
        }
    }
}

/// Link from a dependent object (Event, LogFile) back to its parent.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ObjectReference {
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    pub uid: String,
}

/// Resource demands used for instance selection and node bucketing.
/// Quantities use Kubernetes notation ("100m" CPU, "128Mi" memory).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResourceSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub gpu: u32,
    #[serde(rename = "volumeSize", skip_serializing_if = "Option::is_none")]
    pub volume_size: Option<String>,
}

fn is_zero_u32(value: &u32) -> bool {
    *value == 0
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpotPolicy {
    #[default]
    Never,
    Preferred,
    Always,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Volume {
    pub name: String,
    #[serde(rename = "sizeLimit", skip_serializing_if = "Option::is_none")]
    pub size_limit: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PodSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub containers: Vec<ContainerSpec>,
    #[serde(default)]
    pub resources: ResourceSpec,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
    #[serde(rename = "instanceType", skip_serializing_if = "Option::is_none")]
    pub instance_type: Option<String>,
    #[serde(default)]
    pub spot: SpotPolicy,
    #[serde(rename = "privateIPOnly", default, skip_serializing_if = "std::ops::Not::not")]
    pub private_ip_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    Waiting,
    Dispatching,
    Running,
    Succeeded,
    Failed,
    Terminated,
}

impl PodPhase {
    pub const fn as_str(self) -> &'static str {
        match self {
            PodPhase::Waiting => "Waiting",
            PodPhase::Dispatching => "Dispatching",
            PodPhase::Running => "Running",
            PodPhase::Succeeded => "Succeeded",
            PodPhase::Failed => "Failed",
            PodPhase::Terminated => "Terminated",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            PodPhase::Succeeded | PodPhase::Failed | PodPhase::Terminated
        )
    }
}

impl fmt::Display for PodPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state")]
pub enum ContainerState {
    Waiting {
        #[serde(default, skip_serializing_if = "String::is_empty")]
        reason: String,
    },
    Running {
        #[serde(rename = "startedAt")]
        started_at: Option<DateTime<Utc>>,
    },
    Terminated {
        #[serde(rename = "exitCode")]
        exit_code: i32,
        #[serde(rename = "finishedAt")]
        finished_at: Option<DateTime<Utc>>,
    },
}

impl Default for ContainerState {
    fn default() -> Self {
        ContainerState::Waiting {
            reason: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ContainerStatus {
    pub name: String,
    #[serde(default)]
    pub state: ContainerState,
    #[serde(rename = "restartCount", default)]
    pub restart_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PodStatus {
    pub phase: PodPhase,
    #[serde(rename = "boundNodeName", default, skip_serializing_if = "String::is_empty")]
    pub bound_node_name: String,
    #[serde(rename = "boundInstanceID", default, skip_serializing_if = "String::is_empty")]
    pub bound_instance_id: String,
    #[serde(
        rename = "boundInstanceType",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub bound_instance_type: String,
    #[serde(rename = "containerStatuses", default, skip_serializing_if = "Vec::is_empty")]
    pub container_statuses: Vec<ContainerStatus>,
    #[serde(rename = "startFailures", default)]
    pub start_failures: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(rename = "lastPhaseChange")]
    pub last_phase_change: Option<DateTime<Utc>>,
}

impl Default for PodStatus {
    fn default() -> Self {
        Self {
            phase: PodPhase::Waiting,
            bound_node_name: String::new(),
            bound_instance_id: String::new(),
            bound_instance_type: String::new(),
            container_statuses: Vec::new(),
            start_failures: 0,
            reason: String::new(),
            last_phase_change: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Pod {
    #[serde(flatten)]
    pub meta: ObjectMeta,
    pub spec: PodSpec,
    #[serde(default)]
    pub status: PodStatus,
}

impl Pod {
    pub fn new(name: &str, namespace: &str) -> Self {
        Self {
            meta: ObjectMeta::new(name, namespace),
            spec: PodSpec::default(),
            status: PodStatus::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodePhase {
    Creating,
    Available,
    Claimed,
    Cleaning,
    Terminating,
    Terminated,
}

impl NodePhase {
    pub const fn as_str(self) -> &'static str {
        match self {
            NodePhase::Creating => "Creating",
            NodePhase::Available => "Available",
            NodePhase::Claimed => "Claimed",
            NodePhase::Cleaning => "Cleaning",
            NodePhase::Terminating => "Terminating",
            NodePhase::Terminated => "Terminated",
        }
    }

    /// Phases whose cloud instance is expected to be running.
    pub const fn is_running(self) -> bool {
        matches!(self, NodePhase::Available | NodePhase::Claimed)
    }
}

impl fmt::Display for NodePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NetworkAddresses {
    #[serde(rename = "privateIP", default, skip_serializing_if = "String::is_empty")]
    pub private_ip: String,
    #[serde(rename = "publicIP", default, skip_serializing_if = "String::is_empty")]
    pub public_ip: String,
}

impl NetworkAddresses {
    pub fn new(private_ip: &str, public_ip: &str) -> Self {
        Self {
            private_ip: private_ip.to_string(),
            public_ip: public_ip.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NodeSpec {
    #[serde(rename = "instanceType")]
    pub instance_type: String,
    #[serde(rename = "bootImage")]
    pub boot_image: String,
    #[serde(default)]
    pub spot: bool,
    #[serde(default)]
    pub resources: ResourceSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeStatus {
    pub phase: NodePhase,
    #[serde(rename = "instanceID", default, skip_serializing_if = "String::is_empty")]
    pub instance_id: String,
    #[serde(default)]
    pub addresses: NetworkAddresses,
    #[serde(rename = "boundPodName", default, skip_serializing_if = "String::is_empty")]
    pub bound_pod_name: String,
    #[serde(rename = "lastHeartbeat")]
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl Default for NodeStatus {
    fn default() -> Self {
        Self {
            phase: NodePhase::Creating,
            instance_id: String::new(),
            addresses: NetworkAddresses::default(),
            bound_pod_name: String::new(),
            last_heartbeat: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Node {
    #[serde(flatten)]
    pub meta: ObjectMeta,
    pub spec: NodeSpec,
    #[serde(default)]
    pub status: NodeStatus,
}

impl Node {
    pub fn new(name: &str, instance_type: &str, boot_image: &str) -> Self {
        Self {
            meta: ObjectMeta::new(name, ""),
            spec: NodeSpec {
                instance_type: instance_type.to_string(),
                boot_image: boot_image.to_string(),
                spot: false,
                resources: ResourceSpec::default(),
            },
            status: NodeStatus::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Event {
    #[serde(flatten)]
    pub meta: ObjectMeta,
    #[serde(rename = "involvedObject")]
    pub involved_object: ObjectReference,
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EventList {
    pub items: Vec<Event>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LogFile {
    #[serde(flatten)]
    pub meta: ObjectMeta,
    #[serde(rename = "parentObject")]
    pub parent_object: ObjectReference,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content: String,
}

/// In-memory only; never round-trips through the codec or the KV store.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Metric {
    pub name: String,
    #[serde(default)]
    pub values: HashMap<String, f64>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Every object the registry persists, discriminated by a `kind` tag so
/// the codec can pick the decoder without type introspection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind")]
pub enum MilpaObject {
    Pod(Pod),
    Node(Node),
    Event(Event),
    LogFile(LogFile),
    EventList(EventList),
}

impl MilpaObject {
    pub fn kind(&self) -> &'static str {
        match self {
            MilpaObject::Pod(_) => "Pod",
            MilpaObject::Node(_) => "Node",
            MilpaObject::Event(_) => "Event",
            MilpaObject::LogFile(_) => "LogFile",
            MilpaObject::EventList(_) => "EventList",
        }
    }
}

pub fn pod_reference(pod: &Pod) -> ObjectReference {
    ObjectReference {
        kind: ResourceKind::Pod.as_str().to_string(),
        name: pod.meta.name.clone(),
        namespace: pod.meta.namespace.clone(),
        uid: pod.meta.uid.clone(),
    }
}

pub fn node_reference(node: &Node) -> ObjectReference {
    ObjectReference {
        kind: ResourceKind::Node.as_str().to_string(),
        name: node.meta.name.clone(),
        namespace: String::new(),
        uid: node.meta.uid.clone(),
    }
}

/// Parses a CPU quantity into millicores. Accepts "250m", "2", "0.5".
pub fn parse_cpu_millis(input: &str) -> Result<u64, Box<dyn std::error::Error + Send + Sync>> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(new_error("empty CPU quantity"));
    }
    if let Some(millis) = trimmed.strip_suffix('m') {
        return millis
            .parse::<u64>()
            .map_err(|_| new_error(format!("invalid CPU quantity {trimmed:?}")));
    }
    trimmed
        .parse::<f64>()
        .ok()
        .filter(|cores| *cores >= 0.0)
        .map(|cores| (cores * 1000.0).round() as u64)
        .ok_or_else(|| new_error(format!("invalid CPU quantity {trimmed:?}")))
}

/// Parses a memory/storage quantity into bytes. Accepts binary ("128Mi")
/// and decimal ("1G") suffixes as well as plain byte counts.
pub fn parse_memory_bytes(input: &str) -> Result<u64, Box<dyn std::error::Error + Send + Sync>> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(new_error("empty memory quantity"));
    }
    let suffixes: [(&str, u64); 8] = [
        ("Ki", 1 << 10),
        ("Mi", 1 << 20),
        ("Gi", 1 << 30),
        ("Ti", 1 << 40),
        ("K", 1_000),
        ("M", 1_000_000),
        ("G", 1_000_000_000),
        ("T", 1_000_000_000_000),
    ];
    for (suffix, factor) in suffixes {
        if let Some(number) = trimmed.strip_suffix(suffix) {
            let value = number
                .parse::<f64>()
                .ok()
                .filter(|v| *v >= 0.0)
                .ok_or_else(|| new_error(format!("invalid memory quantity {trimmed:?}")))?;
            return Ok((value * factor as f64).round() as u64);
        }
    }
    trimmed
        .parse::<u64>()
        .map_err(|_| new_error(format!("invalid memory quantity {trimmed:?}")))
}

/// Volume sizes round up to whole GiB, the granularity cloud providers
/// allocate block storage in.
pub fn parse_volume_gib(input: &str) -> Result<u32, Box<dyn std::error::Error + Send + Sync>> {
    let bytes = parse_memory_bytes(input)?;
    let gib = bytes.div_ceil(1 << 30);
    Ok(gib as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_quantities() {
        assert_eq!(parse_cpu_millis("100m").unwrap(), 100);
        assert_eq!(parse_cpu_millis("2").unwrap(), 2000);
        assert_eq!(parse_cpu_millis("0.5").unwrap(), 500);
        assert!(parse_cpu_millis("lots").is_err());
        assert!(parse_cpu_millis("").is_err());
    }

    #[test]
    fn memory_quantities() {
        assert_eq!(parse_memory_bytes("128Mi").unwrap(), 128 << 20);
        assert_eq!(parse_memory_bytes("1Gi").unwrap(), 1 << 30);
        assert_eq!(parse_memory_bytes("1G").unwrap(), 1_000_000_000);
        assert_eq!(parse_memory_bytes("512").unwrap(), 512);
        assert!(parse_memory_bytes("12Qi").is_err());
    }

    #[test]
    fn volume_sizes_round_up() {
        assert_eq!(parse_volume_gib("1Gi").unwrap(), 1);
        assert_eq!(parse_volume_gib("1500Mi").unwrap(), 2);
        assert_eq!(parse_volume_gib("5G").unwrap(), 5);
    }

    #[test]
    fn kind_tag_discriminates_objects() {
        let pod = Pod::new("p1", "default");
        let encoded = serde_json::to_string(&MilpaObject::Pod(pod.clone())).unwrap();
        assert!(encoded.contains("\"kind\":\"Pod\""));
        let decoded: MilpaObject = serde_json::from_str(&encoded).unwrap();
        match decoded {
            MilpaObject::Pod(p) => assert_eq!(p.meta.name, "p1"),
            other => panic!("unexpected kind {}", other.kind()),
        }
    }

    #[test]
    fn terminal_phases() {
        assert!(PodPhase::Succeeded.is_terminal());
        assert!(PodPhase::Failed.is_terminal());
        assert!(PodPhase::Terminated.is_terminal());
        assert!(!PodPhase::Running.is_terminal());
        assert!(!PodPhase::Dispatching.is_terminal());
    }
}
