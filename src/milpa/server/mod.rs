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

pub mod debug;
pub mod garbage;
pub mod logs;
pub mod manager;
pub mod metrics_controller;
pub mod pod_controller;
pub mod provider;

use std::error::Error;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::milpa::api::types::{EventList, MilpaObject};
use crate::milpa::cloud::instanceselector::{InstanceNeeds, InstanceSelector};
use crate::milpa::cloud::CloudClient;
use crate::milpa::config::{ProviderConfig, ServerConfig};
use crate::milpa::events::EventSystem;
use crate::milpa::logger::log_info;
use crate::milpa::nodeclient::NodeClientFactory;
use crate::milpa::nodemanager::{
    BindingNodeScaler, NodeController, NodeControllerConfig, NodeDispenser,
};
use crate::milpa::registry::kv::{KvError, KvStore};
use crate::milpa::registry::metrics::DEFAULT_METRIC_WINDOW;
use crate::milpa::registry::{
    EventRegistry, LogRegistry, MetricsRegistry, NodeRegistry, PodRegistry,
    CLUSTER_REGION_KEY, CONTROLLER_ID_KEY, STARTUP_KEY,
};
use crate::milpa::server::garbage::GarbageController;
use crate::milpa::server::manager::{Controller, ControllerManager};
use crate::milpa::server::metrics_controller::MetricsController;
use crate::milpa::server::pod_controller::{PodController, PodControllerConfig};
use crate::milpa::util::{new_error, random_uid, with_context};

const COMPONENT: &str = "server";

/// Query-time cap on event list replies.
pub const MAX_EVENT_LIST_SIZE: usize = 4000;

/// One Kubernetes node backed by a fleet of cloud cells. Holds the
/// registries, the controller set and the virtual-kubelet surface.
pub struct InstanceProvider {
    pub pods: Arc<PodRegistry>,
    pub nodes: Arc<NodeRegistry>,
    pub events: Arc<EventRegistry>,
    pub logs: Arc<LogRegistry>,
    pub metrics_window: Arc<MetricsRegistry>,
    pub event_system: Arc<EventSystem>,
    pub pod_controller: Arc<PodController>,
    pub manager: Arc<ControllerManager>,
    pub clients: Arc<dyn NodeClientFactory>,
    node_name: String,
    internal_ip: String,
    provider_config: ProviderConfig,
    controller_id: String,
    start_time: DateTime<Utc>,
}

/// Injected collaborators: the KV store, the cloud and the node agent
/// channel. Tests wire mocks here; production wires the real clients.
pub struct ProviderDeps {
    pub kv: Arc<dyn KvStore>,
    pub cloud: Arc<dyn CloudClient>,
    pub clients: Arc<dyn NodeClientFactory>,
    pub quit: CancellationToken,
}

impl InstanceProvider {
    pub fn new(
        node_name: &str,
        internal_ip: &str,
        server_config: &ServerConfig,
        provider_config: ProviderConfig,
        deps: ProviderDeps,
    ) -> Result<Arc<Self>, Box<dyn Error + Send + Sync>> {
        let errors = server_config.validate();
        if !errors.is_empty() {
            return Err(new_error(format!(
                "invalid server config: {}",
                errors.join("; ")
            )));
        }

        validate_store_writable(deps.kv.as_ref())?;

        let mut controller_id = stored_controller_id(deps.kv.as_ref())?;
        if !server_config.testing.controller_id.is_empty() {
            controller_id = server_config.testing.controller_id.clone();
        }
        let nametag = if server_config.nodes.nametag.is_empty() {
            controller_id.clone()
        } else {
            server_config.nodes.nametag.clone()
        };
        log_info(COMPONENT, "controller identity", &[("controllerID", &controller_id)]);

        let attributes = deps.cloud.get_attributes();
        ensure_region_unchanged(deps.kv.as_ref(), &attributes.region)?;

        let selector = Arc::new(InstanceSelector::new(
            attributes.provider,
            &attributes.region,
            &server_config.nodes.default_instance_type,
        )?);

        let event_system = EventSystem::new();
        // Admission rejects only what can never be scheduled as
        // written (malformed quantities). Instance type problems are a
        // scheduling outcome: the pod is admitted, stays Waiting and
        // collects FailedScheduling events until the spec is fixed.
        let pods = Arc::new(
            PodRegistry::new(Arc::clone(&deps.kv), Arc::clone(&event_system)).with_validator(
                Arc::new(move |pod| {
                    InstanceNeeds::from_pod_spec(&pod.spec)
                        .map(|_| ())
                        .map_err(|e| e.to_string())
                }),
            ),
        );
        let nodes = Arc::new(NodeRegistry::new(
            Arc::clone(&deps.kv),
            Arc::clone(&event_system),
        ));
        let events = Arc::new(EventRegistry::new(
            Arc::clone(&deps.kv),
            Arc::clone(&event_system),
            &nametag,
        ));
        let logs = Arc::new(LogRegistry::new(
            Arc::clone(&deps.kv),
            Arc::clone(&event_system),
        ));
        let metrics_window = Arc::new(MetricsRegistry::new(DEFAULT_METRIC_WINDOW));

        let dispenser = NodeDispenser::new();
        let scaler = Arc::new(BindingNodeScaler::new(
            server_config.nodes.standby_nodes.clone(),
            &server_config.nodes.default_volume_size,
            attributes.fixed_size_volume,
            server_config.nodes.boot_image_tag(),
        ));

        let node_controller = NodeController::new(
            NodeControllerConfig {
                boot_image_tag: server_config.nodes.boot_image_tag().to_string(),
                cloud_init: server_config.nodes.rendered_cloud_init()?,
                itzo_version: server_config.nodes.itzo.version.clone(),
                itzo_url: server_config.nodes.itzo.url.clone(),
                ..server_config.node_controller_intervals()?
            },
            Arc::clone(&nodes),
            Arc::clone(&events),
            Arc::clone(&dispenser),
            Arc::clone(&scaler),
            Arc::clone(&deps.cloud),
            Arc::clone(&deps.clients),
            &controller_id,
        );

        let pod_controller = PodController::new(
            PodControllerConfig::default(),
            Arc::clone(&pods),
            Arc::clone(&nodes),
            Arc::clone(&logs),
            Arc::clone(&events),
            Arc::clone(&event_system),
            Arc::clone(&dispenser),
            Arc::clone(&selector),
            Arc::clone(&scaler),
            Arc::clone(&deps.clients),
        );

        let garbage_controller = GarbageController::new(
            server_config.garbage_controller_intervals()?,
            Arc::clone(&pods),
            Arc::clone(&nodes),
            Arc::clone(&logs),
            Arc::clone(&events),
            Arc::clone(&deps.cloud),
        );

        let metrics_controller =
            MetricsController::new(Arc::clone(&pods), Arc::clone(&metrics_window));

        let controllers: Vec<Arc<dyn Controller>> = vec![
            node_controller as Arc<dyn Controller>,
            Arc::clone(&pod_controller) as Arc<dyn Controller>,
            garbage_controller as Arc<dyn Controller>,
            metrics_controller as Arc<dyn Controller>,
        ];
        let manager = ControllerManager::new(
            controllers,
            Arc::clone(&deps.kv),
            &controller_id,
            deps.quit,
        );

        Ok(Arc::new(Self {
            pods,
            nodes,
            events,
            logs,
            metrics_window,
            event_system,
            pod_controller,
            manager,
            clients: deps.clients,
            node_name: node_name.to_string(),
            internal_ip: internal_ip.to_string(),
            provider_config,
            controller_id,
            start_time: Utc::now(),
        }))
    }

    pub fn controller_id(&self) -> &str {
        &self.controller_id
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn internal_ip(&self) -> &str {
        &self.internal_ip
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub(crate) fn provider_config(&self) -> &ProviderConfig {
        &self.provider_config
    }

    /// Wins leadership, then runs the controller set until shutdown.
    pub async fn run(self: &Arc<Self>, shutdown_grace: std::time::Duration) -> bool {
        if !self.manager.wait_for_leadership().await {
            return true;
        }
        self.manager.start_controllers();
        self.manager.wait_for_shutdown(shutdown_grace).await
    }
}

/// The store must accept writes before anything else starts; a
/// read-only or unreachable store is fatal.
fn validate_store_writable(kv: &dyn KvStore) -> Result<(), Box<dyn Error + Send + Sync>> {
    kv.put(STARTUP_KEY, b"OK")
        .map(|_| ())
        .map_err(|e| with_context(e, "store write validation failed"))
}

/// Loads the stable cluster controller ID, minting one on first boot.
fn stored_controller_id(kv: &dyn KvStore) -> Result<String, Box<dyn Error + Send + Sync>> {
    match kv.get(CONTROLLER_ID_KEY) {
        Ok(pair) => Ok(String::from_utf8_lossy(&pair.value).to_string()),
        Err(KvError::NotFound { .. }) => {
            let id = random_uid();
            kv.atomic_put(CONTROLLER_ID_KEY, id.as_bytes(), None, None)
                .map_err(|e| with_context(e, "storing controller id"))?;
            Ok(id)
        }
        Err(error) => Err(with_context(error, "loading controller id")),
    }
}

/// The cluster region is written once; every later startup must match.
/// Cells, volumes and images are regional, so a moved cluster would
/// silently leak everything it ever created.
pub fn ensure_region_unchanged(
    kv: &dyn KvStore,
    region: &str,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    match kv.get(CLUSTER_REGION_KEY) {
        Ok(pair) => {
            let saved = String::from_utf8_lossy(&pair.value).to_string();
            if saved != region {
                return Err(new_error(format!(
                    "cluster region changed from {} to {}; this is unsupported, delete all cluster resources and rename the cluster",
                    saved, region
                )));
            }
            Ok(())
        }
        Err(KvError::NotFound { .. }) => kv
            .atomic_put(CLUSTER_REGION_KEY, region.as_bytes(), None, None)
            .map(|_| ())
            .map_err(|e| with_context(e, "storing cluster region")),
        Err(error) => Err(with_context(error, "reading cluster region")),
    }
}

/// Caps event list replies at the newest [`MAX_EVENT_LIST_SIZE`] items:
/// ascending sort by creation time, keep the tail. Query-time only, the
/// store is never trimmed here.
pub fn filter_event_list(mut list: EventList) -> EventList {
    if list.items.len() > MAX_EVENT_LIST_SIZE {
        list.items
            .sort_by_key(|event| event.meta.creation_timestamp);
        let start = list.items.len() - MAX_EVENT_LIST_SIZE;
        list.items.drain(..start);
    }
    list
}

/// Reply-side filtering dispatched on the object's kind tag.
pub fn filter_reply_object(object: MilpaObject) -> MilpaObject {
    match object {
        MilpaObject::EventList(list) => MilpaObject::EventList(filter_event_list(list)),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::milpa::api::types::Event;
    use crate::milpa::registry::kv::MemoryKvStore;

    fn event_at(seconds: i64) -> Event {
        let mut event = Event::default();
        event.meta.name = format!("e{seconds}");
        event.meta.creation_timestamp =
            Some(Utc::now() - chrono::Duration::seconds(seconds));
        event
    }

    #[test]
    fn region_guard_allows_first_write_then_pins() {
        let kv = MemoryKvStore::new();
        ensure_region_unchanged(&kv, "us-east-1").expect("first region write");
        ensure_region_unchanged(&kv, "us-east-1").expect("same region ok");

        let err = ensure_region_unchanged(&kv, "us-west-2").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("us-east-1"), "old region missing: {message}");
        assert!(message.contains("us-west-2"), "new region missing: {message}");
    }

    #[test]
    fn controller_id_is_stable_across_reads() {
        let kv = MemoryKvStore::new();
        let first = stored_controller_id(&kv).unwrap();
        let second = stored_controller_id(&kv).unwrap();
        assert_eq!(first, second);
        assert!(!first.is_empty());
    }

    #[test]
    fn event_filter_keeps_the_newest_tail() {
        let mut list = EventList::default();
        for age in 0..(MAX_EVENT_LIST_SIZE + 50) {
            list.items.push(event_at(age as i64));
        }
        let filtered = filter_event_list(list);
        assert_eq!(filtered.items.len(), MAX_EVENT_LIST_SIZE);
        // Oldest survivors are newer than every dropped event.
        let oldest_kept = filtered.items.first().unwrap().meta.creation_timestamp;
        assert!(oldest_kept > Some(Utc::now() - chrono::Duration::seconds(4001)));
    }

    #[test]
    fn event_filter_is_idempotent_and_monotone() {
        let mut list = EventList::default();
        for age in 0..10 {
            list.items.push(event_at(age));
        }
        let once = filter_event_list(list.clone());
        let twice = filter_event_list(once.clone());
        assert_eq!(once, twice);
        assert_eq!(once.items.len(), list.items.len().min(MAX_EVENT_LIST_SIZE));
    }

    #[test]
    fn non_event_objects_pass_through_unfiltered() {
        let pod = crate::milpa::api::types::Pod::new("p1", "default");
        match filter_reply_object(MilpaObject::Pod(pod.clone())) {
            MilpaObject::Pod(passed) => assert_eq!(passed, pod),
            other => panic!("unexpected kind {}", other.kind()),
        }
    }
}
