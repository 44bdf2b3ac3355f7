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

use std::collections::{BTreeMap, VecDeque};
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;

const WATCH_HISTORY_LIMIT: usize = 512;
const WATCH_CHANNEL_CAPACITY: usize = 128;

#[derive(Debug, PartialEq, Eq)]
pub enum KvError {
    /// Atomic put lost: the stored index differs from the expected one.
    Conflict { key: String },
    NotFound { key: String },
    /// Watch resume point predates the retained event history.
    ResumeExpired { since: u64, oldest: u64 },
    Io(String),
}

impl fmt::Display for KvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KvError::Conflict { key } => write!(f, "atomic put conflict on {}", key),
            KvError::NotFound { key } => write!(f, "key not found: {}", key),
            KvError::ResumeExpired { since, oldest } => write!(
                f,
                "watch resume version {} expired (oldest retained {})",
                since, oldest
            ),
            KvError::Io(message) => write!(f, "kv store I/O: {}", message),
        }
    }
}

impl Error for KvError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: String,
    pub value: Vec<u8>,
    pub index: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvEventType {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEvent {
    pub event_type: KvEventType,
    pub key: String,
    pub value: Option<Vec<u8>>,
    pub index: u64,
}

impl KvEvent {
    fn matches_prefix(&self, prefix: &str) -> bool {
        prefix.is_empty() || self.key.starts_with(prefix)
    }
}

/// The store contract the registries are written against. The embedded
/// etcd client implements the same operations; tests and single-process
/// deployments use [`MemoryKvStore`].
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<KvPair, KvError>;

    /// Unconditional write. Returns the new store index.
    fn put(&self, key: &str, value: &[u8]) -> Result<u64, KvError>;

    /// Compare-and-swap write. `prev_index == None` means create-only;
    /// `Some(i)` succeeds only while the stored index is still `i`.
    /// A TTL makes the key vanish after the duration (election keys).
    fn atomic_put(
        &self,
        key: &str,
        value: &[u8],
        prev_index: Option<u64>,
        ttl: Option<Duration>,
    ) -> Result<u64, KvError>;

    fn delete(&self, key: &str) -> Result<(), KvError>;

    fn list(&self, prefix: &str) -> Result<Vec<KvPair>, KvError>;

    fn watch(&self, prefix: &str, since: Option<u64>) -> Result<KvWatchStream, KvError>;
}

struct Entry {
    value: Vec<u8>,
    index: u64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

struct WatchHub {
    sender: broadcast::Sender<KvEvent>,
    history: RwLock<VecDeque<KvEvent>>,
    compacted_through: AtomicU64,
}

impl WatchHub {
    fn new() -> Self {
        let (sender, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            sender,
            history: RwLock::new(VecDeque::new()),
            compacted_through: AtomicU64::new(0),
        }
    }

    fn record(&self, event: KvEvent) {
        {
            let mut history = self.history.write().expect("kv watch history poisoned");
            history.push_back(event.clone());
            if history.len() > WATCH_HISTORY_LIMIT {
                if let Some(dropped) = history.pop_front() {
                    self.compacted_through.store(dropped.index, Ordering::SeqCst);
                }
            }
        }
        let _ = self.sender.send(event);
    }

    fn snapshot_since(&self, since: u64, prefix: &str) -> VecDeque<KvEvent> {
        let history = self.history.read().expect("kv watch history poisoned");
        history
            .iter()
            .filter(|event| event.index > since && event.matches_prefix(prefix))
            .cloned()
            .collect()
    }
}

/// Stream of store mutations under a prefix, resumable by index. Late
/// subscribers replay from the bounded history ring; beyond that the
/// resume point is expired and the caller must re-list.
pub struct KvWatchStream {
    prefix: String,
    receiver: broadcast::Receiver<KvEvent>,
    backlog: VecDeque<KvEvent>,
    last_index: u64,
}

impl KvWatchStream {
    pub async fn next(&mut self) -> Option<KvEvent> {
        if let Some(event) = self.backlog.pop_front() {
            self.last_index = event.index;
            return Some(event);
        }

        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if event.index <= self.last_index {
                        continue;
                    }
                    self.last_index = event.index;
                    if event.matches_prefix(&self.prefix) {
                        return Some(event);
                    }
                }
                // Skipped events were already published to the history
                // ring by the writer; the subscriber simply lost pace.
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// In-memory [`KvStore`] with CAS, lazy TTL expiry and resumable watch.
pub struct MemoryKvStore {
    state: Mutex<BTreeMap<String, Entry>>,
    index: AtomicU64,
    watch: Arc<WatchHub>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BTreeMap::new()),
            index: AtomicU64::new(0),
            watch: Arc::new(WatchHub::new()),
        }
    }

    fn next_index(&self) -> u64 {
        self.index.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn prune_expired(&self, state: &mut BTreeMap<String, Entry>, now: Instant) {
        let expired: Vec<String> = state
            .iter()
            .filter(|(_, entry)| entry.expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            state.remove(&key);
            self.watch.record(KvEvent {
                event_type: KvEventType::Deleted,
                key,
                value: None,
                index: self.next_index(),
            });
        }
    }

    fn write(
        &self,
        key: &str,
        value: &[u8],
        prev_index: Option<Option<u64>>,
        ttl: Option<Duration>,
    ) -> Result<u64, KvError> {
        let mut state = self.state.lock().expect("kv state poisoned");
        let now = Instant::now();
        self.prune_expired(&mut state, now);

        let existing = state.get(key).map(|entry| entry.index);
        if let Some(expected) = prev_index {
            match (expected, existing) {
                (None, None) => {}
                (Some(want), Some(have)) if want == have => {}
                _ => {
                    return Err(KvError::Conflict {
                        key: key.to_string(),
                    })
                }
            }
        }

        let index = self.next_index();
        state.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                index,
                expires_at: ttl.map(|d| now + d),
            },
        );
        self.watch.record(KvEvent {
            event_type: if existing.is_some() {
                KvEventType::Modified
            } else {
                KvEventType::Added
            },
            key: key.to_string(),
            value: Some(value.to_vec()),
            index,
        });
        Ok(index)
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &str) -> Result<KvPair, KvError> {
        let mut state = self.state.lock().expect("kv state poisoned");
        self.prune_expired(&mut state, Instant::now());
        state
            .get(key)
            .map(|entry| KvPair {
                key: key.to_string(),
                value: entry.value.clone(),
                index: entry.index,
            })
            .ok_or_else(|| KvError::NotFound {
                key: key.to_string(),
            })
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<u64, KvError> {
        self.write(key, value, None, None)
    }

    fn atomic_put(
        &self,
        key: &str,
        value: &[u8],
        prev_index: Option<u64>,
        ttl: Option<Duration>,
    ) -> Result<u64, KvError> {
        self.write(key, value, Some(prev_index), ttl)
    }

    fn delete(&self, key: &str) -> Result<(), KvError> {
        let mut state = self.state.lock().expect("kv state poisoned");
        self.prune_expired(&mut state, Instant::now());
        if state.remove(key).is_none() {
            return Err(KvError::NotFound {
                key: key.to_string(),
            });
        }
        self.watch.record(KvEvent {
            event_type: KvEventType::Deleted,
            key: key.to_string(),
            value: None,
            index: self.next_index(),
        });
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<KvPair>, KvError> {
        let mut state = self.state.lock().expect("kv state poisoned");
        self.prune_expired(&mut state, Instant::now());
        Ok(state
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| KvPair {
                key: key.clone(),
                value: entry.value.clone(),
                index: entry.index,
            })
            .collect())
    }

    fn watch(&self, prefix: &str, since: Option<u64>) -> Result<KvWatchStream, KvError> {
        let since = since.unwrap_or_else(|| self.index.load(Ordering::SeqCst));
        let oldest = self.watch.compacted_through.load(Ordering::SeqCst);
        if since < oldest {
            return Err(KvError::ResumeExpired { since, oldest });
        }
        let receiver = self.watch.sender.subscribe();
        let backlog = self.watch.snapshot_since(since, prefix);
        Ok(KvWatchStream {
            prefix: prefix.to_string(),
            receiver,
            backlog,
            last_index: since,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn create_only_put_rejects_existing_keys() {
        let store = MemoryKvStore::new();
        store.atomic_put("a", b"1", None, None).expect("create");
        let err = store.atomic_put("a", b"2", None, None).unwrap_err();
        assert!(matches!(err, KvError::Conflict { .. }));
    }

    #[test]
    fn cas_has_exactly_one_winner() {
        let store = Arc::new(MemoryKvStore::new());
        let start = store.atomic_put("contended", b"0", None, None).expect("seed");

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = Arc::clone(&store);
            handles.push(thread::spawn(move || {
                store
                    .atomic_put("contended", format!("{i}").as_bytes(), Some(start), None)
                    .is_ok()
            }));
        }
        let winners = handles
            .into_iter()
            .filter(|h| *h.join().expect("join"))
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn ttl_keys_vanish() {
        let store = MemoryKvStore::new();
        store
            .atomic_put("lease", b"owner", None, Some(Duration::from_millis(10)))
            .expect("lease");
        assert!(store.get("lease").is_ok());
        thread::sleep(Duration::from_millis(25));
        assert!(matches!(
            store.get("lease"),
            Err(KvError::NotFound { .. })
        ));
        // An expired lease is free to claim again with create-only put.
        assert!(store.atomic_put("lease", b"other", None, None).is_ok());
    }

    #[test]
    fn list_is_prefix_scoped() {
        let store = MemoryKvStore::new();
        store.put("milpa/pods/default/a", b"1").unwrap();
        store.put("milpa/pods/default/b", b"2").unwrap();
        store.put("milpa/nodes/n1", b"3").unwrap();
        let pods = store.list("milpa/pods/").unwrap();
        assert_eq!(pods.len(), 2);
        assert!(pods.iter().all(|p| p.key.starts_with("milpa/pods/")));
    }

    #[tokio::test]
    async fn watch_replays_backlog_then_streams() {
        let store = MemoryKvStore::new();
        let first = store.put("milpa/pods/default/a", b"1").unwrap();
        store.put("milpa/nodes/n1", b"x").unwrap();
        store.put("milpa/pods/default/b", b"2").unwrap();

        let mut stream = store.watch("milpa/pods/", Some(first)).unwrap();
        let replayed = stream.next().await.expect("backlog event");
        assert_eq!(replayed.key, "milpa/pods/default/b");

        store.put("milpa/pods/default/c", b"3").unwrap();
        let live = stream.next().await.expect("live event");
        assert_eq!(live.key, "milpa/pods/default/c");
        assert_eq!(live.event_type, KvEventType::Added);
    }

    #[test]
    fn resume_past_history_is_expired() {
        let store = MemoryKvStore::new();
        for i in 0..(WATCH_HISTORY_LIMIT + 16) {
            store.put(&format!("k{i}"), b"v").unwrap();
        }
        match store.watch("", Some(1)) {
            Err(KvError::ResumeExpired { .. }) => {}
            other => panic!("expected ResumeExpired, got {:?}", other.err()),
        }
    }
}
