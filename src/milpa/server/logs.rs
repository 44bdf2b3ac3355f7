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

use std::error::Error;

use crate::milpa::api::types::{pod_reference, LogFile, PodPhase};
use crate::milpa::server::InstanceProvider;
use crate::milpa::util::new_error;

impl InstanceProvider {
    /// Finds a log for a parent object. Live pods are served straight
    /// from their node agent; anything else falls back to the last
    /// snapshot the registry kept, which is how logs survive pods whose
    /// cell is already gone.
    pub async fn find_log(
        &self,
        parent_name: &str,
        log_name: &str,
        tail: u32,
    ) -> Result<LogFile, Box<dyn Error + Send + Sync>> {
        if let Some(log) = self.agent_log(parent_name, log_name, tail).await {
            return Ok(log);
        }

        let snapshots = self.logs.logs_for_parent(parent_name)?;
        snapshots
            .into_iter()
            .find(|snapshot| log_name.is_empty() || snapshot.meta.name.ends_with(log_name))
            .ok_or_else(|| new_error(format!("no log found for {parent_name}")))
    }

    async fn agent_log(&self, parent_name: &str, log_name: &str, tail: u32) -> Option<LogFile> {
        let pod = self
            .pods
            .list_pods(|pod| pod.meta.name == parent_name)
            .ok()?
            .into_iter()
            .next()?;
        if !matches!(pod.status.phase, PodPhase::Running | PodPhase::Dispatching) {
            return None;
        }
        let node = self.nodes.get_node(&pod.status.bound_node_name).ok()?;
        let client = self.clients.client_for(&node);

        let container = if log_name.is_empty() {
            pod.spec
                .containers
                .first()
                .map(|container| container.name.clone())
                .unwrap_or_default()
        } else {
            log_name.to_string()
        };
        let content = client.get_logs(&pod.meta.name, &container, tail).await.ok()?;

        let mut log = LogFile {
            parent_object: pod_reference(&pod),
            content,
            ..Default::default()
        };
        log.meta.name = container;
        log.meta.namespace = pod.meta.namespace.clone();
        Some(log)
    }
}
