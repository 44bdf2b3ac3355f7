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
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::Utc;

use super::{
    CloudAttributes, CloudClient, CloudError, CloudFuture, CloudInstance, CloudProvider,
    InstanceState, StartNodeSpec,
};

/// Scriptable in-memory cloud. Instances launch straight into Running;
/// tests can inject arbitrary instances (orphans, stale launch times)
/// and force launch failures.
pub struct MockCloudClient {
    attributes: CloudAttributes,
    instances: Mutex<Vec<CloudInstance>>,
    boot_images: Mutex<HashSet<String>>,
    next_id: AtomicU64,
    fail_starts: AtomicBool,
}

impl MockCloudClient {
    pub fn new(region: &str) -> Self {
        Self {
            attributes: CloudAttributes {
                provider: CloudProvider::Aws,
                region: region.to_string(),
                fixed_size_volume: false,
                controller_inside_vpc: false,
            },
            instances: Mutex::new(Vec::new()),
            boot_images: Mutex::new(HashSet::new()),
            next_id: AtomicU64::new(1),
            fail_starts: AtomicBool::new(false),
        }
    }

    pub fn with_boot_image(self, image_tag: &str) -> Self {
        self.register_boot_image(image_tag);
        self
    }

    pub fn register_boot_image(&self, image_tag: &str) {
        self.boot_images
            .lock()
            .expect("mock images poisoned")
            .insert(image_tag.to_string());
    }

    pub fn fail_next_starts(&self, fail: bool) {
        self.fail_starts.store(fail, Ordering::SeqCst);
    }

    /// Drops an instance into the cloud without a registry node, the
    /// shape the garbage controller hunts for.
    pub fn inject_instance(&self, instance: CloudInstance) {
        self.instances
            .lock()
            .expect("mock instances poisoned")
            .push(instance);
    }

    pub fn instance(&self, instance_id: &str) -> Option<CloudInstance> {
        self.instances
            .lock()
            .expect("mock instances poisoned")
            .iter()
            .find(|instance| instance.id == instance_id)
            .cloned()
    }

    pub fn running_count(&self) -> usize {
        self.instances
            .lock()
            .expect("mock instances poisoned")
            .iter()
            .filter(|instance| instance.state == InstanceState::Running)
            .count()
    }
}

impl CloudClient for MockCloudClient {
    fn get_attributes(&self) -> CloudAttributes {
        self.attributes.clone()
    }

    fn get_vpc_cidrs(&self) -> Vec<String> {
        vec!["10.0.0.0/16".to_string()]
    }

    fn start_node<'a>(&'a self, spec: &'a StartNodeSpec) -> CloudFuture<'a, String> {
        Box::pin(async move {
            if self.fail_starts.load(Ordering::SeqCst) {
                return Err(CloudError::Transient(
                    "insufficient capacity in availability zone".to_string(),
                ));
            }
            let sequence = self.next_id.fetch_add(1, Ordering::SeqCst);
            let id = format!("i-{sequence:08x}");
            let instance = CloudInstance {
                id: id.clone(),
                node_name: spec.node.meta.name.clone(),
                instance_type: spec.node.spec.instance_type.clone(),
                state: InstanceState::Running,
                launch_time: Utc::now(),
                private_ip: format!("10.0.0.{}", (sequence % 250) + 1),
                public_ip: format!("54.1.0.{}", (sequence % 250) + 1),
            };
            self.instances
                .lock()
                .expect("mock instances poisoned")
                .push(instance);
            Ok(id)
        })
    }

    fn wait_for_running<'a>(&'a self, instance_id: &'a str) -> CloudFuture<'a, CloudInstance> {
        Box::pin(async move {
            self.instance(instance_id)
                .filter(|instance| instance.state == InstanceState::Running)
                .ok_or_else(|| CloudError::InstanceNotFound(instance_id.to_string()))
        })
    }

    fn stop_instance<'a>(&'a self, instance_id: &'a str) -> CloudFuture<'a, ()> {
        Box::pin(async move {
            let mut instances = self.instances.lock().expect("mock instances poisoned");
            match instances.iter_mut().find(|i| i.id == instance_id) {
                Some(instance) => {
                    instance.state = InstanceState::Terminated;
                    Ok(())
                }
                None => Err(CloudError::InstanceNotFound(instance_id.to_string())),
            }
        })
    }

    fn list_instances<'a>(&'a self) -> CloudFuture<'a, Vec<CloudInstance>> {
        Box::pin(async move {
            Ok(self
                .instances
                .lock()
                .expect("mock instances poisoned")
                .iter()
                .filter(|instance| instance.state != InstanceState::Terminated)
                .cloned()
                .collect())
        })
    }

    fn boot_image_available<'a>(&'a self, image_tag: &'a str) -> CloudFuture<'a, bool> {
        Box::pin(async move {
            Ok(self
                .boot_images
                .lock()
                .expect("mock images poisoned")
                .contains(image_tag))
        })
    }
}
