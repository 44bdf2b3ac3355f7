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

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::milpa::api::types::{
    pod_reference, ContainerState, Pod, PodPhase, REASON_FAILED_SCHEDULING, REASON_POD_FAILED,
};
use crate::milpa::cloud::instanceselector::{InstanceNeeds, InstanceSelector};
use crate::milpa::events::{EventSystem, Mutation};
use crate::milpa::logger::{log_info, log_warn};
use crate::milpa::nodeclient::{AgentPodStatus, NodeClientFactory};
use crate::milpa::nodemanager::dispenser::{NodeDispenser, NodeReply, NodeRequest};
use crate::milpa::nodemanager::scaler::BindingNodeScaler;
use crate::milpa::observability::metrics;
use crate::milpa::registry::{
    EventRegistry, LogRegistry, NodeRegistry, PodRegistry, RegistryError,
};
use crate::milpa::server::manager::Controller;

const COMPONENT: &str = "pod-controller";
const FINAL_LOG_TAIL: u32 = 0;

/// Invoked on every pod status transition so the virtual-kubelet layer
/// can push fresh status to Kubernetes instead of being polled.
pub type PodNotifier = Arc<dyn Fn(&Pod) + Send + Sync>;

#[derive(Clone)]
pub struct PodControllerConfig {
    /// Full reconcile sweep over all non-terminal pods.
    pub sweep_interval: Duration,
    /// How long a binding waits for a cell before re-queueing.
    pub dispense_deadline: Duration,
    /// Minimum gap between status polls of the same node.
    pub status_poll_gap: Duration,
    /// Agent silence on a Running pod tolerated before the pod fails.
    pub unreachable_threshold: Duration,
}

impl Default for PodControllerConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(5),
            dispense_deadline: Duration::from_secs(30),
            status_poll_gap: Duration::from_secs(5),
            unreachable_threshold: Duration::from_secs(60),
        }
    }
}

/// Reconciles pod state: binds Waiting pods onto cells, pushes specs to
/// node agents, mirrors agent-reported container state back into the
/// registry and tears pods down. Owns `Pod.status`; node lifecycle
/// stays with the node controller.
pub struct PodController {
    config: PodControllerConfig,
    pods: Arc<PodRegistry>,
    nodes: Arc<NodeRegistry>,
    logs: Arc<LogRegistry>,
    events: Arc<EventRegistry>,
    event_system: Arc<EventSystem>,
    dispenser: Arc<NodeDispenser>,
    selector: Arc<InstanceSelector>,
    scaler: Arc<BindingNodeScaler>,
    clients: Arc<dyn NodeClientFactory>,
    notifier: Mutex<Option<PodNotifier>>,
    /// Pods with a bind or dispatch already in flight; the event loop
    /// and the sweep would otherwise double-dispatch.
    in_flight: Mutex<HashSet<String>>,
    /// Last successful agent reply per node, for the poll budget and
    /// the unreachable threshold.
    last_reply: Mutex<HashMap<String, Instant>>,
    last_poll: Mutex<HashMap<String, Instant>>,
}

impl PodController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: PodControllerConfig,
        pods: Arc<PodRegistry>,
        nodes: Arc<NodeRegistry>,
        logs: Arc<LogRegistry>,
        events: Arc<EventRegistry>,
        event_system: Arc<EventSystem>,
        dispenser: Arc<NodeDispenser>,
        selector: Arc<InstanceSelector>,
        scaler: Arc<BindingNodeScaler>,
        clients: Arc<dyn NodeClientFactory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            pods,
            nodes,
            logs,
            events,
            event_system,
            dispenser,
            selector,
            scaler,
            clients,
            notifier: Mutex::new(None),
            in_flight: Mutex::new(HashSet::new()),
            last_reply: Mutex::new(HashMap::new()),
            last_poll: Mutex::new(HashMap::new()),
        })
    }

    pub fn set_notifier(&self, notifier: PodNotifier) {
        *self.notifier.lock().expect("notifier poisoned") = Some(notifier);
    }

    fn notify(&self, pod: &Pod) {
        if let Some(notifier) = self.notifier.lock().expect("notifier poisoned").as_ref() {
            notifier(pod);
        }
    }

    fn pod_key(pod: &Pod) -> String {
        format!("{}/{}", pod.meta.namespace, pod.meta.name)
    }

    fn try_claim_work(&self, key: &str) -> bool {
        self.in_flight
            .lock()
            .expect("in-flight set poisoned")
            .insert(key.to_string())
    }

    fn release_work(&self, key: &str) {
        self.in_flight
            .lock()
            .expect("in-flight set poisoned")
            .remove(key);
    }

    /// One full pass over every non-terminal pod.
    pub async fn sweep(self: &Arc<Self>, quit: &CancellationToken, tasks: &TaskTracker) {
        let pods = match self.pods.non_terminal_pods() {
            Ok(pods) => pods,
            Err(error) => {
                log_warn(COMPONENT, "pod listing failed", &[("error", &error.to_string())]);
                metrics::record_controller_tick("PodController", false);
                return;
            }
        };

        for pod in pods {
            if quit.is_cancelled() {
                return;
            }
            match pod.status.phase {
                PodPhase::Waiting => self.spawn_bind(pod, quit, tasks),
                PodPhase::Dispatching => self.spawn_dispatch(pod, quit, tasks),
                PodPhase::Running => self.reconcile_running(&pod).await,
                _ => {}
            }
        }
        metrics::record_controller_tick("PodController", true);
        self.reconcile_terminating().await;
    }

    fn spawn_bind(self: &Arc<Self>, pod: Pod, quit: &CancellationToken, tasks: &TaskTracker) {
        let key = Self::pod_key(&pod);
        if !self.try_claim_work(&key) {
            return;
        }
        let controller = Arc::clone(self);
        let quit = quit.clone();
        tasks.spawn(async move {
            if !quit.is_cancelled() {
                controller.bind_pod(pod, &quit).await;
            }
            controller.release_work(&key);
        });
    }

    fn spawn_dispatch(self: &Arc<Self>, pod: Pod, quit: &CancellationToken, tasks: &TaskTracker) {
        let key = Self::pod_key(&pod);
        if !self.try_claim_work(&key) {
            return;
        }
        let controller = Arc::clone(self);
        let quit = quit.clone();
        tasks.spawn(async move {
            if !quit.is_cancelled() {
                controller.dispatch_pod(pod).await;
            }
            controller.release_work(&key);
        });
    }

    /// Waiting → Dispatching: pick a bucket, ask the dispenser for a
    /// cell, record the binding, then push the spec to the agent.
    async fn bind_pod(&self, pod: Pod, quit: &CancellationToken) {
        // Work from fresh state; the event that queued us may be old.
        let pod = match self.pods.get_pod(&pod.meta.namespace, &pod.meta.name) {
            Ok(current) if current.status.phase == PodPhase::Waiting => current,
            _ => return,
        };

        let needs = match InstanceNeeds::from_pod_spec(&pod.spec) {
            Ok(needs) => needs,
            Err(error) => {
                // Malformed resource quantities can never schedule.
                let _ = self.events.create_event(
                    pod_reference(&pod),
                    REASON_FAILED_SCHEDULING,
                    &error.to_string(),
                );
                let _ = self
                    .update_pod_status(&pod, |status| {
                        status.phase = PodPhase::Failed;
                        status.reason = error.to_string();
                    })
                    .await;
                return;
            }
        };

        let instance_type = match self.selector.select(&needs) {
            Ok(instance_type) => instance_type,
            Err(error) => {
                // A normal scheduling outcome: surface the event, leave
                // the pod Waiting, retry on the next sweep.
                let _ = self.events.create_event(
                    pod_reference(&pod),
                    REASON_FAILED_SCHEDULING,
                    &error.to_string(),
                );
                return;
            }
        };

        let bucket = self
            .scaler
            .bucket_for(&instance_type, pod.spec.resources.volume_size.as_deref());
        let request = NodeRequest {
            bucket,
            pod_name: pod.meta.name.clone(),
            pod_namespace: pod.meta.namespace.clone(),
        };
        // Shutdown must not wait out the dispense deadline; an
        // unanswered request just leaves the pod Waiting for the next
        // leader.
        let reply = tokio::select! {
            reply = self
                .dispenser
                .request(request, self.config.dispense_deadline) => reply,
            _ = quit.cancelled() => {
                self.dispenser.abandon(&pod.meta.name, &pod.meta.namespace);
                return;
            }
        };

        let node = match reply {
            NodeReply::Granted(node) => *node,
            NodeReply::NoNodeAvailable => {
                let _ = self.events.create_event(
                    pod_reference(&pod),
                    REASON_FAILED_SCHEDULING,
                    &format!("no {} node available before deadline", instance_type),
                );
                return;
            }
        };

        let bound = self
            .pods
            .update_pod_with_retry(&pod.meta.namespace, &pod.meta.name, |current| {
                if current.status.phase != PodPhase::Waiting {
                    return Err(RegistryError::Validation("pod left Waiting".into()));
                }
                current.status.phase = PodPhase::Dispatching;
                current.status.bound_node_name = node.meta.name.clone();
                current.status.bound_instance_id = node.status.instance_id.clone();
                current.status.bound_instance_type = node.spec.instance_type.clone();
                Ok(())
            })
            .await;

        let bound = match bound {
            Ok(bound) => bound,
            Err(_) => {
                // The pod vanished or changed while we held the cell;
                // give the cell straight back.
                self.dispenser.release(&node.meta.name, true);
                return;
            }
        };
        log_info(
            COMPONENT,
            "pod bound",
            &[
                ("pod", &bound.meta.name),
                ("node", &node.meta.name),
                ("instanceType", &node.spec.instance_type),
            ],
        );
        self.notify(&bound);
        self.dispatch_pod(bound).await;
    }

    /// Dispatching → Running/Failed: push the spec and promote once the
    /// agent reports containers started.
    async fn dispatch_pod(&self, pod: Pod) {
        let pod = match self.pods.get_pod(&pod.meta.namespace, &pod.meta.name) {
            Ok(current) if current.status.phase == PodPhase::Dispatching => current,
            _ => return,
        };
        let node = match self.nodes.get_node(&pod.status.bound_node_name) {
            Ok(node) => node,
            Err(_) => return,
        };
        let client = self.clients.client_for(&node);

        match client.deploy_pod(&pod).await {
            Ok(()) => {
                self.mark_reply(&node.meta.name);
            }
            Err(error) if error.is_permanent() => {
                let _ = self.events.create_event(
                    pod_reference(&pod),
                    REASON_POD_FAILED,
                    &error.to_string(),
                );
                if let Ok(failed) = self
                    .update_pod_status(&pod, |status| {
                        status.phase = PodPhase::Failed;
                        status.reason = error.to_string();
                    })
                    .await
                {
                    self.notify(&failed);
                }
                // The agent answered, so teardown state is known: the
                // cell never accepted the pod.
                self.dispenser.release(&node.meta.name, true);
                return;
            }
            Err(error) => {
                // Agent still booting or briefly unreachable; the next
                // sweep redelivers.
                log_warn(
                    COMPONENT,
                    "pod dispatch will retry",
                    &[("pod", &pod.meta.name), ("error", &error.to_string())],
                );
                return;
            }
        }

        if let Ok(status) = client.get_status().await {
            self.promote_if_started(&pod, &status).await;
        }
    }

    async fn promote_if_started(&self, pod: &Pod, agent: &AgentPodStatus) {
        if !agent.all_containers_running() {
            return;
        }
        if !agent.pod_uid.is_empty() && agent.pod_uid != pod.meta.uid {
            return;
        }
        let result = self
            .update_pod_status(pod, |status| {
                status.phase = PodPhase::Running;
                status.container_statuses = agent.container_statuses.clone();
            })
            .await;
        if let Ok(running) = result {
            log_info(COMPONENT, "pod running", &[("pod", &running.meta.name)]);
            self.notify(&running);
        }
    }

    /// Poll the bound agent within the per-node budget and mirror
    /// container state. Agent silence past the threshold fails the pod
    /// but leaves the node for its own reaper.
    async fn reconcile_running(&self, pod: &Pod) {
        let node_name = pod.status.bound_node_name.clone();
        if node_name.is_empty() || !self.should_poll(&node_name) {
            return;
        }
        let node = match self.nodes.get_node(&node_name) {
            Ok(node) => node,
            Err(_) => return,
        };
        let client = self.clients.client_for(&node);

        let status = match client.get_status().await {
            Ok(status) => {
                self.mark_reply(&node_name);
                status
            }
            Err(error) => {
                metrics::record_agent_probe(false);
                if self.silent_too_long(&node_name) {
                    let _ = self.events.create_event(
                        pod_reference(pod),
                        REASON_POD_FAILED,
                        &format!("node agent unreachable: {}", error),
                    );
                    if let Ok(failed) = self
                        .update_pod_status(pod, |status| {
                            status.phase = PodPhase::Failed;
                            status.reason = "node agent unreachable".into();
                        })
                        .await
                    {
                        self.notify(&failed);
                    }
                }
                return;
            }
        };

        // A different pod UID on the cell means the agent state is
        // stale; redeliver instead of trusting it.
        if !status.pod_uid.is_empty() && status.pod_uid != pod.meta.uid {
            if let Err(error) = client.deploy_pod(pod).await {
                log_warn(
                    COMPONENT,
                    "pod redelivery failed",
                    &[("pod", &pod.meta.name), ("error", &error.to_string())],
                );
            }
            return;
        }

        let terminated: Vec<i32> = status
            .container_statuses
            .iter()
            .filter_map(|container| match container.state {
                ContainerState::Terminated { exit_code, .. } => Some(exit_code),
                _ => None,
            })
            .collect();

        if !status.container_statuses.is_empty()
            && terminated.len() == status.container_statuses.len()
        {
            let all_zero = terminated.iter().all(|code| *code == 0);
            self.capture_final_logs(pod, &node).await;
            let result = self
                .update_pod_status(pod, |pod_status| {
                    pod_status.phase = if all_zero {
                        PodPhase::Succeeded
                    } else {
                        PodPhase::Failed
                    };
                    pod_status.container_statuses = status.container_statuses.clone();
                    if !all_zero {
                        pod_status.reason = "container exited nonzero".into();
                    }
                })
                .await;
            if let Ok(finished) = result {
                log_info(
                    COMPONENT,
                    "pod finished",
                    &[
                        ("pod", &finished.meta.name),
                        ("phase", finished.status.phase.as_str()),
                    ],
                );
                self.notify(&finished);
                self.dispenser.release(&node.meta.name, true);
            }
            return;
        }

        // Still running: keep container statuses current.
        let _ = self
            .update_pod_status(pod, |pod_status| {
                pod_status.container_statuses = status.container_statuses.clone();
            })
            .await;
    }

    /// Terminating pods: stop containers, hand the cell back, persist
    /// final status, then drop the record.
    async fn reconcile_terminating(&self) {
        let terminating = match self
            .pods
            .list_pods(|pod| pod.status.phase == PodPhase::Terminating)
        {
            Ok(pods) => pods,
            Err(_) => return,
        };
        for pod in terminating {
            self.finish_termination(&pod).await;
        }
    }

    async fn finish_termination(&self, pod: &Pod) {
        let mut agent_confirmed = true;
        if !pod.status.bound_node_name.is_empty() {
            if let Ok(node) = self.nodes.get_node(&pod.status.bound_node_name) {
                let client = self.clients.client_for(&node);
                self.capture_final_logs(pod, &node).await;
                agent_confirmed = client.remove_pod(&pod.meta.name).await.is_ok();
            }
            self.dispenser
                .release(&pod.status.bound_node_name, agent_confirmed);
        }

        let final_status = self
            .update_pod_status(pod, |status| {
                status.phase = PodPhase::Terminated;
            })
            .await;
        if let Ok(terminated) = final_status {
            self.notify(&terminated);
        }
        match self.pods.delete_pod(&pod.meta.namespace, &pod.meta.name) {
            Ok(_) => log_info(COMPONENT, "pod deleted", &[("pod", &pod.meta.name)]),
            Err(error) if error.is_not_found() => {}
            Err(error) => log_warn(
                COMPONENT,
                "pod delete failed",
                &[("pod", &pod.meta.name), ("error", &error.to_string())],
            ),
        }
    }

    /// Marks a pod for deletion. Waiting pods go straight away; bound
    /// pods go through Terminating so the agent stops containers first.
    pub async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), RegistryError> {
        let pod = self.pods.get_pod(namespace, name)?;
        match pod.status.phase {
            PodPhase::Waiting | PodPhase::Succeeded | PodPhase::Failed | PodPhase::Terminated => {
                self.pods.delete_pod(namespace, name).map(|_| ())
            }
            PodPhase::Dispatching | PodPhase::Running | PodPhase::Terminating => {
                let marked = self
                    .pods
                    .update_pod_with_retry(namespace, name, |current| {
                        current.status.phase = PodPhase::Terminating;
                        Ok(())
                    })
                    .await?;
                self.notify(&marked);
                Ok(())
            }
        }
    }

    /// Snapshot agent logs into the registry so they survive the cell.
    async fn capture_final_logs(&self, pod: &Pod, node: &crate::milpa::api::types::Node) {
        let client = self.clients.client_for(node);
        for container in &pod.spec.containers {
            if let Ok(content) = client
                .get_logs(&pod.meta.name, &container.name, FINAL_LOG_TAIL)
                .await
            {
                let _ = self
                    .logs
                    .put_log(pod_reference(pod), &container.name, &content);
            }
        }
    }

    async fn update_pod_status<F>(&self, pod: &Pod, mut apply: F) -> Result<Pod, RegistryError>
    where
        F: FnMut(&mut crate::milpa::api::types::PodStatus),
    {
        self.pods
            .update_pod_with_retry(&pod.meta.namespace, &pod.meta.name, |current| {
                let before = current.status.phase;
                apply(&mut current.status);
                if current.status.phase != before {
                    current.status.last_phase_change = Some(chrono::Utc::now());
                }
                Ok(())
            })
            .await
    }

    fn mark_reply(&self, node_name: &str) {
        self.last_reply
            .lock()
            .expect("last reply poisoned")
            .insert(node_name.to_string(), Instant::now());
    }

    fn should_poll(&self, node_name: &str) -> bool {
        let mut last_poll = self.last_poll.lock().expect("last poll poisoned");
        let now = Instant::now();
        match last_poll.get(node_name) {
            Some(last) if now.duration_since(*last) < self.config.status_poll_gap => false,
            _ => {
                last_poll.insert(node_name.to_string(), now);
                true
            }
        }
    }

    fn silent_too_long(&self, node_name: &str) -> bool {
        let mut last_reply = self.last_reply.lock().expect("last reply poisoned");
        match last_reply.get(node_name) {
            Some(last) => last.elapsed() > self.config.unreachable_threshold,
            None => {
                // No reply on record (fresh leader); start the clock
                // now instead of failing the pod on the first miss.
                last_reply.insert(node_name.to_string(), Instant::now());
                false
            }
        }
    }
}

impl Controller for PodController {
    fn name(&self) -> &'static str {
        "PodController"
    }

    fn start(self: Arc<Self>, quit: CancellationToken, tasks: &TaskTracker) {
        // Event-driven path: react to pod writes as they happen.
        let watcher = Arc::clone(&self);
        let watcher_quit = quit.clone();
        let watcher_tasks = tasks.clone();
        tasks.spawn(async move {
            let mut subscription = watcher.event_system.subscribe("Pod");
            loop {
                tokio::select! {
                    _ = watcher_quit.cancelled() => break,
                    event = subscription.next() => {
                        let Some(event) = event else { break };
                        if event.mutation == Mutation::Deleted {
                            continue;
                        }
                        if let crate::milpa::api::types::MilpaObject::Pod(pod) = event.object {
                            match pod.status.phase {
                                PodPhase::Waiting => {
                                    watcher.spawn_bind(pod, &watcher_quit, &watcher_tasks)
                                }
                                PodPhase::Terminating => watcher.finish_termination(&pod).await,
                                _ => {}
                            }
                        }
                    }
                }
            }
        });

        // Periodic path: handlers are idempotent, so the sweep both
        // catches missed events and drives polling.
        let sweeper = Arc::clone(&self);
        let sweeper_tasks = tasks.clone();
        tasks.spawn(async move {
            let mut ticker = tokio::time::interval(sweeper.config.sweep_interval);
            loop {
                tokio::select! {
                    _ = quit.cancelled() => break,
                    _ = ticker.tick() => sweeper.sweep(&quit, &sweeper_tasks).await,
                }
            }
        });
    }

    fn dump(&self) -> Vec<u8> {
        let mut by_phase: HashMap<&str, usize> = HashMap::new();
        if let Ok(pods) = self.pods.list_pods(|_| true) {
            for pod in &pods {
                *by_phase.entry(pod.status.phase.as_str()).or_default() += 1;
            }
        }
        let in_flight = self.in_flight.lock().expect("in-flight set poisoned").len();
        serde_json::to_vec_pretty(&serde_json::json!({
            "podsByPhase": by_phase,
            "bindsInFlight": in_flight,
        }))
        .unwrap_or_default()
    }
}
