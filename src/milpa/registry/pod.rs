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

use crate::milpa::api::types::{Pod, PodPhase};
use crate::milpa::events::EventSystem;
use crate::milpa::registry::kv::KvStore;
use crate::milpa::registry::{ObjectStore, RegistryError, RegistryWatch};

/// Admission hook run before a pod is persisted. Wired to the instance
/// selector at startup so impossible placements are rejected up front.
pub type PodValidator = Arc<dyn Fn(&Pod) -> Result<(), String> + Send + Sync>;

pub struct PodRegistry {
    store: ObjectStore<Pod>,
    validator: Option<PodValidator>,
}

impl PodRegistry {
    pub fn new(kv: Arc<dyn KvStore>, events: Arc<EventSystem>) -> Self {
        Self {
            store: ObjectStore::new(kv, events),
            validator: None,
        }
    }

    pub fn with_validator(mut self, validator: PodValidator) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn create_pod(&self, mut pod: Pod) -> Result<Pod, RegistryError> {
        if let Some(validator) = &self.validator {
            validator(&pod).map_err(RegistryError::Validation)?;
        }
        pod.status.phase = PodPhase::Waiting;
        self.store.create(pod)
    }

    pub fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, RegistryError> {
        self.store.get(namespace, name)
    }

    pub fn update_pod(&self, pod: &Pod) -> Result<Pod, RegistryError> {
        self.store.update(pod)
    }

    pub async fn update_pod_with_retry<F>(
        &self,
        namespace: &str,
        name: &str,
        apply: F,
    ) -> Result<Pod, RegistryError>
    where
        F: FnMut(&mut Pod) -> Result<(), RegistryError>,
    {
        self.store.update_with_retry(namespace, name, apply).await
    }

    pub fn delete_pod(&self, namespace: &str, name: &str) -> Result<Pod, RegistryError> {
        self.store.delete(namespace, name)
    }

    pub fn list_pods<F>(&self, filter: F) -> Result<Vec<Pod>, RegistryError>
    where
        F: Fn(&Pod) -> bool,
    {
        self.store.list(filter)
    }

    pub fn non_terminal_pods(&self) -> Result<Vec<Pod>, RegistryError> {
        self.list_pods(|pod| !pod.status.phase.is_terminal())
    }

    pub fn pods_in_phase(&self, phase: PodPhase) -> Result<Vec<Pod>, RegistryError> {
        self.list_pods(|pod| pod.status.phase == phase)
    }

    pub fn watch_pods(&self, resume: Option<u64>) -> Result<RegistryWatch<Pod>, RegistryError> {
        self.store.watch(resume)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::milpa::registry::kv::MemoryKvStore;

    fn registry() -> PodRegistry {
        PodRegistry::new(Arc::new(MemoryKvStore::new()), EventSystem::new())
    }

    #[test]
    fn created_pods_start_waiting() {
        let pods = registry();
        let mut pod = Pod::new("p1", "default");
        pod.status.phase = PodPhase::Running;
        let created = pods.create_pod(pod).expect("create");
        assert_eq!(created.status.phase, PodPhase::Waiting);
    }

    #[test]
    fn validator_rejections_surface_as_validation_errors() {
        let pods = registry().with_validator(Arc::new(|pod: &Pod| {
            if pod.spec.instance_type.as_deref() == Some("x9.huge") {
                Err("unknown instance type x9.huge".to_string())
            } else {
                Ok(())
            }
        }));

        let mut pod = Pod::new("p1", "default");
        pod.spec.instance_type = Some("x9.huge".to_string());
        match pods.create_pod(pod) {
            Err(RegistryError::Validation(message)) => {
                assert!(message.contains("x9.huge"));
            }
            other => panic!("expected validation error, got {:?}", other.map(|p| p.meta.name)),
        }
    }

    #[test]
    fn phase_listing_filters() {
        let pods = registry();
        pods.create_pod(Pod::new("a", "default")).unwrap();
        let waiting = pods.pods_in_phase(PodPhase::Waiting).unwrap();
        assert_eq!(waiting.len(), 1);
        assert!(pods.pods_in_phase(PodPhase::Running).unwrap().is_empty());
        assert_eq!(pods.non_terminal_pods().unwrap().len(), 1);
    }
}
