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

use chrono::Utc;

use crate::milpa::api::types::{LogFile, ObjectMeta, ObjectReference};
use crate::milpa::events::EventSystem;
use crate::milpa::registry::kv::KvStore;
use crate::milpa::registry::{ObjectStore, RegistryError};
use crate::milpa::util::random_uid;

/// Keeps the most recent log snapshot per (parent, log name). Later
/// snapshots for the same pair replace the stored one.
pub struct LogRegistry {
    store: ObjectStore<LogFile>,
}

impl LogRegistry {
    pub fn new(kv: Arc<dyn KvStore>, events: Arc<EventSystem>) -> Self {
        Self {
            store: ObjectStore::new(kv, events),
        }
    }

    fn snapshot_name(parent: &ObjectReference, log_name: &str) -> String {
        Self::snapshot_name_for(&parent.name, log_name)
    }

    pub fn put_log(
        &self,
        parent: ObjectReference,
        log_name: &str,
        content: &str,
    ) -> Result<LogFile, RegistryError> {
        let name = Self::snapshot_name(&parent, log_name);
        let namespace = parent.namespace.clone();
        let log = LogFile {
            meta: ObjectMeta {
                uid: random_uid(),
                name: name.clone(),
                namespace: namespace.clone(),
                creation_timestamp: Some(Utc::now()),
                resource_version: 0,
                labels: Default::default(),
            },
            parent_object: parent,
            content: content.to_string(),
        };

        match self.store.create(log.clone()) {
            Ok(created) => Ok(created),
            Err(error) if error.is_conflict() => {
                // Replace in place. Writers race only against other
                // snapshots of the same log, so last-writer-wins is the
                // wanted outcome; a handful of re-reads settles it.
                let mut last = error;
                for _ in 0..5 {
                    let mut existing = self.store.get(&namespace, &name)?;
                    existing.content = log.content.clone();
                    existing.parent_object = log.parent_object.clone();
                    match self.store.update(&existing) {
                        Ok(updated) => return Ok(updated),
                        Err(retry) if retry.is_conflict() => last = retry,
                        Err(retry) => return Err(retry),
                    }
                }
                Err(last)
            }
            Err(error) => Err(error),
        }
    }

    pub fn get_log(
        &self,
        namespace: &str,
        parent_name: &str,
        log_name: &str,
    ) -> Result<LogFile, RegistryError> {
        self.store
            .get(namespace, &Self::snapshot_name_for(parent_name, log_name))
    }

    fn snapshot_name_for(parent_name: &str, log_name: &str) -> String {
        if log_name.is_empty() {
            parent_name.to_string()
        } else {
            format!("{}.{}", parent_name, log_name)
        }
    }

    /// All snapshots recorded for a parent, any log name.
    pub fn logs_for_parent(&self, parent_name: &str) -> Result<Vec<LogFile>, RegistryError> {
        self.store
            .list(|log| log.parent_object.name == parent_name)
    }

    pub fn delete_logs_for_parent(&self, parent_name: &str) -> Result<usize, RegistryError> {
        let logs = self.logs_for_parent(parent_name)?;
        let mut removed = 0;
        for log in logs {
            match self.store.delete(&log.meta.namespace, &log.meta.name) {
                Ok(_) => removed += 1,
                Err(error) if error.is_not_found() => {}
                Err(error) => return Err(error),
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::milpa::api::types::{pod_reference, Pod};
    use crate::milpa::registry::kv::MemoryKvStore;

    fn registry() -> LogRegistry {
        LogRegistry::new(Arc::new(MemoryKvStore::new()), EventSystem::new())
    }

    #[test]
    fn later_snapshots_replace_earlier_ones() {
        let logs = registry();
        let pod = Pod::new("p1", "default");
        logs.put_log(pod_reference(&pod), "main", "first lines")
            .expect("first snapshot");
        logs.put_log(pod_reference(&pod), "main", "second lines")
            .expect("second snapshot");

        let stored = logs.get_log("default", "p1", "main").expect("get");
        assert_eq!(stored.content, "second lines");
        assert_eq!(logs.logs_for_parent("p1").unwrap().len(), 1);
    }

    #[test]
    fn parent_cleanup_removes_all_snapshots() {
        let logs = registry();
        let pod = Pod::new("p1", "default");
        logs.put_log(pod_reference(&pod), "main", "a").unwrap();
        logs.put_log(pod_reference(&pod), "sidecar", "b").unwrap();
        assert_eq!(logs.delete_logs_for_parent("p1").unwrap(), 2);
        assert!(logs.logs_for_parent("p1").unwrap().is_empty());
    }
}
