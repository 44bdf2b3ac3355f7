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
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;

use crate::milpa::api::types::{ContainerState, ContainerStatus, Node, Pod};

use super::{AgentError, AgentFuture, AgentPodStatus, NodeAgentClient, NodeClientFactory};

/// One scripted agent per node name. Deployed pods immediately report
/// all containers running unless the agent is marked unreachable.
#[derive(Default)]
pub struct MockNodeAgent {
    state: Mutex<MockAgentState>,
    unreachable: AtomicBool,
}

#[derive(Default)]
struct MockAgentState {
    deployed: Option<Pod>,
    removed: Vec<String>,
    logs: HashMap<String, String>,
    exec_output: String,
    exit_code: Option<i32>,
}

impl MockNodeAgent {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn set_log(&self, container: &str, content: &str) {
        self.state
            .lock()
            .expect("mock agent poisoned")
            .logs
            .insert(container.to_string(), content.to_string());
    }

    pub fn set_exec_output(&self, output: &str) {
        self.state.lock().expect("mock agent poisoned").exec_output = output.to_string();
    }

    /// From now on every container reports Terminated with this exit
    /// code, the shape of a finished workload.
    pub fn set_containers_exited(&self, exit_code: i32) {
        self.state.lock().expect("mock agent poisoned").exit_code = Some(exit_code);
    }

    pub fn deployed_pod(&self) -> Option<Pod> {
        self.state.lock().expect("mock agent poisoned").deployed.clone()
    }

    pub fn removed_pods(&self) -> Vec<String> {
        self.state.lock().expect("mock agent poisoned").removed.clone()
    }

    fn gate(&self) -> Result<(), AgentError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(AgentError::Unreachable("connection timed out".to_string()));
        }
        Ok(())
    }
}

impl NodeAgentClient for MockNodeAgent {
    fn health_check<'a>(&'a self) -> AgentFuture<'a, ()> {
        Box::pin(async move { self.gate() })
    }

    fn get_status<'a>(&'a self) -> AgentFuture<'a, AgentPodStatus> {
        Box::pin(async move {
            self.gate()?;
            let state = self.state.lock().expect("mock agent poisoned");
            let Some(pod) = state.deployed.as_ref() else {
                return Ok(AgentPodStatus::default());
            };
            let container_state = || match state.exit_code {
                Some(exit_code) => ContainerState::Terminated {
                    exit_code,
                    finished_at: Some(Utc::now()),
                },
                None => ContainerState::Running {
                    started_at: Some(Utc::now()),
                },
            };
            Ok(AgentPodStatus {
                pod_name: pod.meta.name.clone(),
                pod_uid: pod.meta.uid.clone(),
                container_statuses: pod
                    .spec
                    .containers
                    .iter()
                    .map(|container| ContainerStatus {
                        name: container.name.clone(),
                        state: container_state(),
                        restart_count: 0,
                    })
                    .collect(),
                start_time: Some(Utc::now()),
            })
        })
    }

    fn deploy_pod<'a>(&'a self, pod: &'a Pod) -> AgentFuture<'a, ()> {
        Box::pin(async move {
            self.gate()?;
            self.state.lock().expect("mock agent poisoned").deployed = Some(pod.clone());
            Ok(())
        })
    }

    fn remove_pod<'a>(&'a self, pod_name: &'a str) -> AgentFuture<'a, ()> {
        Box::pin(async move {
            self.gate()?;
            let mut state = self.state.lock().expect("mock agent poisoned");
            if state
                .deployed
                .as_ref()
                .map(|pod| pod.meta.name == pod_name)
                .unwrap_or(false)
            {
                state.deployed = None;
            }
            state.removed.push(pod_name.to_string());
            Ok(())
        })
    }

    fn get_logs<'a>(
        &'a self,
        _pod_name: &'a str,
        container: &'a str,
        _tail: u32,
    ) -> AgentFuture<'a, String> {
        Box::pin(async move {
            self.gate()?;
            let state = self.state.lock().expect("mock agent poisoned");
            state.logs.get(container).cloned().ok_or(AgentError::Rejected {
                status: 404,
                message: format!("no logs for container {container}"),
            })
        })
    }

    fn exec<'a>(
        &'a self,
        _pod_name: &'a str,
        _container: &'a str,
        _command: &'a [String],
    ) -> AgentFuture<'a, String> {
        Box::pin(async move {
            self.gate()?;
            Ok(self.state.lock().expect("mock agent poisoned").exec_output.clone())
        })
    }
}

/// Factory returning the same scripted agent for a node name across
/// calls, so tests can inspect what controllers sent.
#[derive(Default)]
pub struct MockNodeClientFactory {
    agents: Mutex<HashMap<String, Arc<MockNodeAgent>>>,
}

impl MockNodeClientFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn agent_for(&self, node_name: &str) -> Arc<MockNodeAgent> {
        let mut agents = self.agents.lock().expect("mock factory poisoned");
        agents
            .entry(node_name.to_string())
            .or_insert_with(MockNodeAgent::new)
            .clone()
    }
}

impl NodeClientFactory for MockNodeClientFactory {
    fn client_for(&self, node: &Node) -> Arc<dyn NodeAgentClient> {
        self.agent_for(&node.meta.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deployed_pods_report_running_containers() {
        let factory = MockNodeClientFactory::new();
        let node = Node::new("n1", "t2.small", "img-1");
        let client = factory.client_for(&node);

        let mut pod = Pod::new("p1", "default");
        pod.spec.containers.push(crate::milpa::api::types::ContainerSpec {
            name: "main".into(),
            image: "busybox".into(),
            ..Default::default()
        });
        client.deploy_pod(&pod).await.expect("deploy");

        let status = client.get_status().await.expect("status");
        assert_eq!(status.pod_name, "p1");
        assert!(status.all_containers_running());
    }

    #[tokio::test]
    async fn unreachable_agents_fail_probes() {
        let factory = MockNodeClientFactory::new();
        factory.agent_for("n1").set_unreachable(true);
        let node = Node::new("n1", "t2.small", "img-1");
        let client = factory.client_for(&node);
        assert!(client.health_check().await.is_err());
    }
}
