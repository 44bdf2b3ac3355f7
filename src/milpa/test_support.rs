#![allow(dead_code)]

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

use tokio_util::sync::CancellationToken;

use crate::milpa::api::types::{ContainerSpec, Node, NodePhase, Pod, ResourceSpec};
use crate::milpa::cloud::mock::MockCloudClient;
use crate::milpa::cloud::CloudClient;
use crate::milpa::config::{ProviderConfig, ServerConfig};
use crate::milpa::nodeclient::mock::MockNodeClientFactory;
use crate::milpa::registry::kv::{KvStore, MemoryKvStore};
use crate::milpa::server::{InstanceProvider, ProviderDeps};

pub const TEST_REGION: &str = "us-east-1";
pub const TEST_BOOT_IMAGE: &str = "img-1";

/// Pod with one container and a small resource request, the shape most
/// tests start from.
pub fn fake_pod(name: &str) -> Pod {
    let mut pod = Pod::new(name, "default");
    pod.spec.containers.push(ContainerSpec {
        name: "main".to_string(),
        image: "library/busybox".to_string(),
        command: vec!["sleep".to_string(), "3600".to_string()],
        ..Default::default()
    });
    pod.spec.resources = ResourceSpec {
        cpu: Some("100m".to_string()),
        memory: Some("128Mi".to_string()),
        ..Default::default()
    };
    pod.spec.instance_type = Some("t2.small".to_string());
    pod
}

/// Available cell with addresses set, ready to be claimed.
pub fn fake_node(name: &str, instance_type: &str) -> Node {
    let mut node = Node::new(name, instance_type, TEST_BOOT_IMAGE);
    node.status.phase = NodePhase::Available;
    node.status.instance_id = format!("i-{name}");
    node.status.addresses =
        crate::milpa::api::types::NetworkAddresses::new("10.0.0.10", "54.1.0.10");
    node
}

pub fn test_server_config() -> ServerConfig {
    serde_json::from_str(
        r#"{
            "nodes": {"defaultInstanceType": "t2.small", "bootImageTags": ["img-1"]},
            "testing": {"controllerID": "test-controller"}
        }"#,
    )
    .expect("test server config")
}

/// A fully wired provider over in-memory collaborators, plus handles
/// to every mock so tests can script and inspect them.
pub struct TestProvider {
    pub provider: Arc<InstanceProvider>,
    pub kv: Arc<dyn KvStore>,
    pub cloud: Arc<MockCloudClient>,
    pub agents: Arc<MockNodeClientFactory>,
    pub quit: CancellationToken,
}

pub fn test_instance_provider() -> TestProvider {
    test_instance_provider_with(&test_server_config())
}

pub fn test_instance_provider_with(config: &ServerConfig) -> TestProvider {
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
    let cloud = Arc::new(MockCloudClient::new(TEST_REGION).with_boot_image(TEST_BOOT_IMAGE));
    let agents = MockNodeClientFactory::new();
    let quit = CancellationToken::new();
    let provider = InstanceProvider::new(
        "vk-node",
        "192.0.2.10",
        config,
        ProviderConfig::default(),
        ProviderDeps {
            kv: Arc::clone(&kv),
            cloud: cloud.clone() as Arc<dyn CloudClient>,
            clients: agents.clone(),
            quit: quit.clone(),
        },
    )
    .expect("test instance provider");
    TestProvider {
        provider,
        kv,
        cloud,
        agents,
        quit,
    }
}
