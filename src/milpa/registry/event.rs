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

use chrono::{DateTime, Utc};

use crate::milpa::api::types::{Event, ObjectMeta, ObjectReference};
use crate::milpa::events::EventSystem;
use crate::milpa::registry::kv::KvStore;
use crate::milpa::registry::{ObjectStore, RegistryError};
use crate::milpa::util::random_uid;

pub struct EventRegistry {
    store: ObjectStore<Event>,
    source: String,
}

impl EventRegistry {
    pub fn new(kv: Arc<dyn KvStore>, events: Arc<EventSystem>, source: &str) -> Self {
        Self {
            store: ObjectStore::new(kv, events),
            source: source.to_string(),
        }
    }

    /// Records an audit event against a parent object. Names embed a
    /// fresh uid so repeated reasons never collide.
    pub fn create_event(
        &self,
        involved: ObjectReference,
        reason: &str,
        message: &str,
    ) -> Result<Event, RegistryError> {
        let uid = random_uid();
        let name = format!("{}.{}", involved.name, &uid[..12]);
        let event = Event {
            meta: ObjectMeta {
                uid,
                name,
                namespace: involved.namespace.clone(),
                creation_timestamp: Some(Utc::now()),
                resource_version: 0,
                labels: Default::default(),
            },
            involved_object: involved,
            reason: reason.to_string(),
            message: message.to_string(),
            source: self.source.clone(),
        };
        self.store.create(event)
    }

    pub fn list_events<F>(&self, filter: F) -> Result<Vec<Event>, RegistryError>
    where
        F: Fn(&Event) -> bool,
    {
        self.store.list(filter)
    }

    pub fn events_for_object(&self, uid: &str) -> Result<Vec<Event>, RegistryError> {
        self.list_events(|event| event.involved_object.uid == uid)
    }

    pub fn delete_events_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, RegistryError> {
        let stale = self.list_events(|event| {
            event
                .meta
                .creation_timestamp
                .map(|ts| ts < cutoff)
                .unwrap_or(false)
        })?;
        let mut removed = 0;
        for event in stale {
            match self.store.delete(&event.meta.namespace, &event.meta.name) {
                Ok(_) => removed += 1,
                // Concurrent cleanup; nothing left to do.
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
    use crate::milpa::api::types::{pod_reference, Pod, REASON_FAILED_SCHEDULING};
    use crate::milpa::registry::kv::MemoryKvStore;

    fn registry() -> EventRegistry {
        EventRegistry::new(Arc::new(MemoryKvStore::new()), EventSystem::new(), "unit")
    }

    #[test]
    fn repeated_reasons_do_not_collide() {
        let events = registry();
        let pod = Pod::new("p1", "default");
        for _ in 0..3 {
            events
                .create_event(pod_reference(&pod), REASON_FAILED_SCHEDULING, "no capacity")
                .expect("event");
        }
        let recorded = events.events_for_object(&pod.meta.uid).expect("list");
        assert_eq!(recorded.len(), 3);
        assert!(recorded
            .iter()
            .all(|e| e.reason == REASON_FAILED_SCHEDULING && e.source == "unit"));
    }

    #[test]
    fn stale_events_are_pruned() {
        let events = registry();
        let pod = Pod::new("p1", "default");
        events
            .create_event(pod_reference(&pod), "Reason", "old")
            .expect("event");
        let removed = events
            .delete_events_older_than(Utc::now() + chrono::Duration::seconds(5))
            .expect("prune");
        assert_eq!(removed, 1);
        assert!(events.events_for_object(&pod.meta.uid).unwrap().is_empty());
    }
}
