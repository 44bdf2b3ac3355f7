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

pub mod event;
pub mod kv;
pub mod log;
pub mod metrics;
pub mod node;
pub mod pod;

use std::error::Error;
use std::fmt;
use std::sync::Arc;

use chrono::Utc;

use crate::milpa::api::codec::{CodecError, VersioningCodec};
use crate::milpa::api::types::{
    Event, LogFile, MilpaObject, Node, ObjectMeta, Pod, ResourceKind,
};
use crate::milpa::events::{EventSystem, Mutation};
use crate::milpa::observability::metrics as telemetry;
use crate::milpa::util::random_uid;
use kv::{KvError, KvEventType, KvStore, KvWatchStream};

pub use event::EventRegistry;
pub use log::LogRegistry;
pub use metrics::MetricsRegistry;
pub use node::NodeRegistry;
pub use pod::PodRegistry;

/// All persisted keys live under this root.
pub const KEY_ROOT: &str = "milpa";
/// Cluster region, written once and immutable afterwards.
pub const CLUSTER_REGION_KEY: &str = "milpa/cluster/region";
/// Leader-election lease key.
pub const ELECTION_KEY: &str = "milpa/election";
/// Probe key used to verify store writability at startup.
pub const STARTUP_KEY: &str = "milpa/startup";
/// Stable cluster controller ID.
pub const CONTROLLER_ID_KEY: &str = "milpa/cluster/controller-id";

const CAS_RETRY_ATTEMPTS: u32 = 5;
const CAS_RETRY_BASE_DELAY_MS: u64 = 20;

#[derive(Debug)]
pub enum RegistryError {
    Conflict { kind: ResourceKind, name: String },
    NotFound { kind: ResourceKind, name: String },
    ResumeExpired,
    IncompatibleVersion { found: String },
    Validation(String),
    TransientIo(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::Conflict { kind, name } => {
                write!(f, "conflicting write to {} {}", kind, name)
            }
            RegistryError::NotFound { kind, name } => write!(f, "{} {} not found", kind, name),
            RegistryError::ResumeExpired => write!(f, "watch resume version expired, re-list"),
            RegistryError::IncompatibleVersion { found } => {
                write!(f, "stored object uses incompatible wire version {}", found)
            }
            RegistryError::Validation(message) => write!(f, "validation failed: {}", message),
            RegistryError::TransientIo(message) => write!(f, "store I/O: {}", message),
        }
    }
}

impl Error for RegistryError {}

impl RegistryError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, RegistryError::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RegistryError::NotFound { .. })
    }

    fn from_kv(error: KvError, kind: ResourceKind, name: &str) -> Self {
        match error {
            KvError::Conflict { .. } => RegistryError::Conflict {
                kind,
                name: name.to_string(),
            },
            KvError::NotFound { .. } => RegistryError::NotFound {
                kind,
                name: name.to_string(),
            },
            KvError::ResumeExpired { .. } => RegistryError::ResumeExpired,
            KvError::Io(message) => RegistryError::TransientIo(message),
        }
    }

    fn from_codec(error: CodecError) -> Self {
        match error {
            CodecError::IncompatibleVersion { found } => {
                RegistryError::IncompatibleVersion { found }
            }
            CodecError::Malformed(message) => RegistryError::TransientIo(message),
        }
    }
}

/// Implemented by every kind the registry persists.
pub trait MilpaResource: Clone + Send + Sync + 'static {
    const KIND: ResourceKind;

    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;
    fn into_object(self) -> MilpaObject;
    fn from_object(object: MilpaObject) -> Option<Self>;
}

impl MilpaResource for Pod {
    const KIND: ResourceKind = ResourceKind::Pod;

    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.meta
    }

    fn into_object(self) -> MilpaObject {
        MilpaObject::Pod(self)
    }

    fn from_object(object: MilpaObject) -> Option<Self> {
        match object {
            MilpaObject::Pod(pod) => Some(pod),
            _ => None,
        }
    }
}

impl MilpaResource for Node {
    const KIND: ResourceKind = ResourceKind::Node;

    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.meta
    }

    fn into_object(self) -> MilpaObject {
        MilpaObject::Node(self)
    }

    fn from_object(object: MilpaObject) -> Option<Self> {
        match object {
            MilpaObject::Node(node) => Some(node),
            _ => None,
        }
    }
}

impl MilpaResource for Event {
    const KIND: ResourceKind = ResourceKind::Event;

    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.meta
    }

    fn into_object(self) -> MilpaObject {
        MilpaObject::Event(self)
    }

    fn from_object(object: MilpaObject) -> Option<Self> {
        match object {
            MilpaObject::Event(event) => Some(event),
            _ => None,
        }
    }
}

impl MilpaResource for LogFile {
    const KIND: ResourceKind = ResourceKind::LogFile;

    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.meta
    }

    fn into_object(self) -> MilpaObject {
        MilpaObject::LogFile(self)
    }

    fn from_object(object: MilpaObject) -> Option<Self> {
        match object {
            MilpaObject::LogFile(log) => Some(log),
            _ => None,
        }
    }
}

/// Watch event at the registry level. Deletions carry the key path only;
/// watchers needing the final object state re-read before it vanishes.
#[derive(Debug, Clone)]
pub struct RegistryWatchEvent<T> {
    pub mutation: Mutation,
    pub key: String,
    pub object: Option<T>,
}

pub struct RegistryWatch<T: MilpaResource> {
    stream: KvWatchStream,
    codec: VersioningCodec,
    _marker: std::marker::PhantomData<T>,
}

impl<T: MilpaResource> RegistryWatch<T> {
    pub async fn next(&mut self) -> Option<RegistryWatchEvent<T>> {
        loop {
            let event = self.stream.next().await?;
            let mutation = match event.event_type {
                KvEventType::Added => Mutation::Added,
                KvEventType::Modified => Mutation::Modified,
                KvEventType::Deleted => Mutation::Deleted,
            };
            let object = match event.value.as_deref() {
                Some(bytes) => match self.codec.decode(bytes) {
                    Ok(decoded) => {
                        let Some(mut resource) = T::from_object(decoded) else {
                            continue;
                        };
                        resource.meta_mut().resource_version = event.index;
                        Some(resource)
                    }
                    // A frame this process cannot read; skip rather than
                    // wedge the watch loop.
                    Err(_) => continue,
                },
                None => None,
            };
            return Some(RegistryWatchEvent {
                mutation,
                key: event.key,
                object,
            });
        }
    }
}

/// Shared typed CRUD plumbing: codec framing, key layout, CAS mapping,
/// event emission. Kind-specific registries wrap this and add their own
/// lifecycle semantics.
pub struct ObjectStore<T: MilpaResource> {
    kv: Arc<dyn KvStore>,
    codec: VersioningCodec,
    events: Arc<EventSystem>,
    _marker: std::marker::PhantomData<T>,
}

impl<T: MilpaResource> ObjectStore<T> {
    pub fn new(kv: Arc<dyn KvStore>, events: Arc<EventSystem>) -> Self {
        Self {
            kv,
            codec: VersioningCodec,
            events,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn prefix() -> String {
        format!("{}/{}/", KEY_ROOT, T::KIND.key_segment())
    }

    pub fn key_for(namespace: &str, name: &str) -> String {
        if T::KIND.namespaced() && !namespace.is_empty() {
            format!("{}/{}/{}/{}", KEY_ROOT, T::KIND.key_segment(), namespace, name)
        } else {
            format!("{}/{}/{}", KEY_ROOT, T::KIND.key_segment(), name)
        }
    }

    fn encode(&self, resource: &T) -> Result<Vec<u8>, RegistryError> {
        self.codec
            .encode(&resource.clone().into_object())
            .map_err(RegistryError::from_codec)
    }

    fn decode(&self, bytes: &[u8], index: u64) -> Result<T, RegistryError> {
        let object = self.codec.decode(bytes).map_err(RegistryError::from_codec)?;
        let mut resource = T::from_object(object).ok_or_else(|| {
            RegistryError::TransientIo(format!("stored object is not a {}", T::KIND))
        })?;
        resource.meta_mut().resource_version = index;
        Ok(resource)
    }

    pub fn create(&self, mut resource: T) -> Result<T, RegistryError> {
        if resource.meta().name.is_empty() {
            return Err(RegistryError::Validation("object name must be set".into()));
        }
        if resource.meta().uid.is_empty() {
            resource.meta_mut().uid = random_uid();
        }
        if resource.meta().creation_timestamp.is_none() {
            resource.meta_mut().creation_timestamp = Some(Utc::now());
        }
        let key = Self::key_for(&resource.meta().namespace, &resource.meta().name);
        let bytes = self.encode(&resource)?;
        let index = self
            .kv
            .atomic_put(&key, &bytes, None, None)
            .map_err(|e| RegistryError::from_kv(e, T::KIND, &resource.meta().name))?;
        resource.meta_mut().resource_version = index;
        self.events
            .emit(Mutation::Added, resource.clone().into_object());
        Ok(resource)
    }

    pub fn get(&self, namespace: &str, name: &str) -> Result<T, RegistryError> {
        let key = Self::key_for(namespace, name);
        let pair = self
            .kv
            .get(&key)
            .map_err(|e| RegistryError::from_kv(e, T::KIND, name))?;
        self.decode(&pair.value, pair.index)
    }

    /// CAS update: the caller passes the object as read, carrying the
    /// `resource_version` the change was computed against.
    pub fn update(&self, resource: &T) -> Result<T, RegistryError> {
        let prev = resource.meta().resource_version;
        if prev == 0 {
            return Err(RegistryError::Validation(
                "update requires the resource version read from the store".into(),
            ));
        }
        let key = Self::key_for(&resource.meta().namespace, &resource.meta().name);
        let bytes = self.encode(resource)?;
        let index = self
            .kv
            .atomic_put(&key, &bytes, Some(prev), None)
            .map_err(|e| {
                if matches!(e, KvError::Conflict { .. }) {
                    telemetry::record_cas_conflict(T::KIND.as_str());
                }
                RegistryError::from_kv(e, T::KIND, &resource.meta().name)
            })?;
        let mut updated = resource.clone();
        updated.meta_mut().resource_version = index;
        self.events
            .emit(Mutation::Modified, updated.clone().into_object());
        Ok(updated)
    }

    /// Re-read / re-apply / re-attempt loop around [`update`]. Bounded
    /// so two livelocked writers cannot spin forever; the next
    /// controller tick picks up whatever was lost.
    pub async fn update_with_retry<F>(
        &self,
        namespace: &str,
        name: &str,
        mut apply: F,
    ) -> Result<T, RegistryError>
    where
        F: FnMut(&mut T) -> Result<(), RegistryError>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut current = self.get(namespace, name)?;
            apply(&mut current)?;
            match self.update(&current) {
                Ok(updated) => return Ok(updated),
                Err(error) if error.is_conflict() && attempt < CAS_RETRY_ATTEMPTS => {
                    let backoff = std::time::Duration::from_millis(
                        CAS_RETRY_BASE_DELAY_MS * u64::from(attempt),
                    );
                    tokio::time::sleep(crate::milpa::util::retry::jittered(backoff)).await;
                }
                Err(error) => return Err(error),
            }
        }
    }

    pub fn delete(&self, namespace: &str, name: &str) -> Result<T, RegistryError> {
        let existing = self.get(namespace, name)?;
        let key = Self::key_for(namespace, name);
        self.kv
            .delete(&key)
            .map_err(|e| RegistryError::from_kv(e, T::KIND, name))?;
        self.events
            .emit(Mutation::Deleted, existing.clone().into_object());
        Ok(existing)
    }

    pub fn list<F>(&self, filter: F) -> Result<Vec<T>, RegistryError>
    where
        F: Fn(&T) -> bool,
    {
        let pairs = self
            .kv
            .list(&Self::prefix())
            .map_err(|e| RegistryError::from_kv(e, T::KIND, ""))?;
        let mut items = Vec::with_capacity(pairs.len());
        for pair in pairs {
            let resource = self.decode(&pair.value, pair.index)?;
            if filter(&resource) {
                items.push(resource);
            }
        }
        Ok(items)
    }

    pub fn watch(&self, resume: Option<u64>) -> Result<RegistryWatch<T>, RegistryError> {
        let stream = self
            .kv
            .watch(&Self::prefix(), resume)
            .map_err(|e| RegistryError::from_kv(e, T::KIND, ""))?;
        Ok(RegistryWatch {
            stream,
            codec: self.codec,
            _marker: std::marker::PhantomData,
        })
    }
}
