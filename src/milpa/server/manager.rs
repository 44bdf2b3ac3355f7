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

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::milpa::logger::{log_error, log_info, log_warn};
use crate::milpa::registry::kv::{KvError, KvStore};
use crate::milpa::registry::ELECTION_KEY;
use crate::milpa::util::retry::jittered;

const COMPONENT: &str = "controller-manager";
const ELECTION_TTL: Duration = Duration::from_secs(30);
const ELECTION_POLL: Duration = Duration::from_secs(8);
const RENEWAL_INTERVAL: Duration = Duration::from_secs(10);

/// Capability every controller exposes to the manager: a start hook
/// that spawns its workers and a debug dump.
pub trait Controller: Send + Sync {
    fn name(&self) -> &'static str;

    /// Spawns the controller's workers on `tasks`. Workers watch `quit`
    /// and drain when it fires.
    fn start(self: Arc<Self>, quit: CancellationToken, tasks: &TaskTracker);

    /// Human-readable internal state for the debug endpoint.
    fn dump(&self) -> Vec<u8>;
}

/// Owns the controller set's lifecycle: wins leadership before anything
/// starts, keeps the lease renewed, and coordinates shutdown. Losing
/// the lease mid-flight cancels the quit token; this process is
/// crash-only and the TTL hands the lock to the next contender.
pub struct ControllerManager {
    controllers: BTreeMap<&'static str, Arc<dyn Controller>>,
    kv: Arc<dyn KvStore>,
    controller_id: String,
    quit: CancellationToken,
    tasks: TaskTracker,
    is_leader: AtomicBool,
}

impl ControllerManager {
    pub fn new(
        controllers: Vec<Arc<dyn Controller>>,
        kv: Arc<dyn KvStore>,
        controller_id: &str,
        quit: CancellationToken,
    ) -> Arc<Self> {
        let mut map = BTreeMap::new();
        for controller in controllers {
            map.insert(controller.name(), controller);
        }
        Arc::new(Self {
            controllers: map,
            kv,
            controller_id: controller_id.to_string(),
            quit,
            tasks: TaskTracker::new(),
            is_leader: AtomicBool::new(false),
        })
    }

    pub fn quit_token(&self) -> CancellationToken {
        self.quit.clone()
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    pub fn controller_names(&self) -> Vec<&'static str> {
        self.controllers.keys().copied().collect()
    }

    pub fn dump(&self, name: &str) -> Option<Vec<u8>> {
        self.controllers
            .get(name)
            .map(|controller| controller.dump())
    }

    fn try_acquire(&self) -> Result<bool, KvError> {
        match self.kv.atomic_put(
            ELECTION_KEY,
            self.controller_id.as_bytes(),
            None,
            Some(ELECTION_TTL),
        ) {
            Ok(_) => Ok(true),
            Err(KvError::Conflict { .. }) => {
                // A previous incarnation of this process may still hold
                // the lease; take it back rather than waiting it out.
                let holder = self.kv.get(ELECTION_KEY)?;
                if holder.value == self.controller_id.as_bytes() {
                    self.kv
                        .atomic_put(
                            ELECTION_KEY,
                            self.controller_id.as_bytes(),
                            Some(holder.index),
                            Some(ELECTION_TTL),
                        )
                        .map(|_| true)
                        .or(Ok(false))
                } else {
                    Ok(false)
                }
            }
            Err(error) => Err(error),
        }
    }

    /// Blocks until this process wins the election or shutdown starts.
    /// Returns whether leadership was won.
    pub async fn wait_for_leadership(&self) -> bool {
        loop {
            if self.quit.is_cancelled() {
                return false;
            }
            match self.try_acquire() {
                Ok(true) => {
                    self.is_leader.store(true, Ordering::SeqCst);
                    log_info(
                        COMPONENT,
                        "leadership acquired",
                        &[("controllerID", &self.controller_id)],
                    );
                    return true;
                }
                Ok(false) => {}
                Err(error) => log_warn(
                    COMPONENT,
                    "election attempt failed",
                    &[("error", &error.to_string())],
                ),
            }
            tokio::select! {
                _ = self.quit.cancelled() => return false,
                _ = tokio::time::sleep(jittered(ELECTION_POLL)) => {}
            }
        }
    }

    fn renew_lease(&self) -> Result<(), KvError> {
        let holder = self.kv.get(ELECTION_KEY)?;
        if holder.value != self.controller_id.as_bytes() {
            return Err(KvError::Conflict {
                key: ELECTION_KEY.to_string(),
            });
        }
        self.kv
            .atomic_put(
                ELECTION_KEY,
                self.controller_id.as_bytes(),
                Some(holder.index),
                Some(ELECTION_TTL),
            )
            .map(|_| ())
    }

    /// Starts every controller concurrently plus the lease-renewal
    /// worker. Only call after [`wait_for_leadership`] returned true.
    pub fn start_controllers(self: &Arc<Self>) {
        for (name, controller) in &self.controllers {
            log_info(COMPONENT, "starting controller", &[("controller", name)]);
            Arc::clone(controller).start(self.quit.clone(), &self.tasks);
        }

        let manager = Arc::clone(self);
        self.tasks.spawn(async move {
            let mut ticker = tokio::time::interval(RENEWAL_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = manager.quit.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(error) = manager.renew_lease() {
                            log_error(
                                COMPONENT,
                                "lost controller leadership, shutting down",
                                &[("error", &error.to_string())],
                            );
                            manager.is_leader.store(false, Ordering::SeqCst);
                            manager.quit.cancel();
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Blocks until shutdown is requested, then joins every worker with
    /// a bounded grace period. Returns false when workers had to be
    /// abandoned (the caller exits nonzero and the OS reaps them).
    pub async fn wait_for_shutdown(&self, grace: Duration) -> bool {
        self.quit.cancelled().await;
        log_info(COMPONENT, "shutting down controllers", &[]);
        self.tasks.close();
        match tokio::time::timeout(grace, self.tasks.wait()).await {
            Ok(()) => {
                log_info(COMPONENT, "controllers drained", &[]);
                true
            }
            Err(_) => {
                log_error(
                    COMPONENT,
                    "controllers did not drain in time, abandoning",
                    &[("graceSeconds", &grace.as_secs().to_string())],
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::milpa::registry::kv::MemoryKvStore;

    struct NopController(&'static str);

    impl Controller for NopController {
        fn name(&self) -> &'static str {
            self.0
        }

        fn start(self: Arc<Self>, quit: CancellationToken, tasks: &TaskTracker) {
            tasks.spawn(async move {
                quit.cancelled().await;
            });
        }

        fn dump(&self) -> Vec<u8> {
            b"{}".to_vec()
        }
    }

    fn manager(kv: Arc<dyn KvStore>, id: &str) -> Arc<ControllerManager> {
        ControllerManager::new(
            vec![Arc::new(NopController("Nop"))],
            kv,
            id,
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn only_one_contender_wins() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let first = manager(Arc::clone(&kv), "ctl-a");
        let second = manager(Arc::clone(&kv), "ctl-b");

        assert!(first.wait_for_leadership().await);
        assert!(first.is_leader());

        // The second contender cannot acquire while the lease lives.
        assert!(!second.try_acquire().unwrap());
        assert!(!second.is_leader());
    }

    #[tokio::test]
    async fn same_id_reacquires_its_own_lease() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let first = manager(Arc::clone(&kv), "ctl-a");
        assert!(first.wait_for_leadership().await);

        // A restarted process with the same ID takes the lease back.
        let reborn = manager(Arc::clone(&kv), "ctl-a");
        assert!(reborn.try_acquire().unwrap());
    }

    #[tokio::test]
    async fn shutdown_joins_started_controllers() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let mgr = manager(kv, "ctl-a");
        assert!(mgr.wait_for_leadership().await);
        mgr.start_controllers();

        let quit = mgr.quit_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            quit.cancel();
        });
        assert!(mgr.wait_for_shutdown(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn renewal_detects_a_stolen_lease() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let mgr = manager(Arc::clone(&kv), "ctl-a");
        assert!(mgr.wait_for_leadership().await);

        // Another process overwrites the lease out from under us.
        kv.put(ELECTION_KEY, b"ctl-b").unwrap();
        assert!(mgr.renew_lease().is_err());
    }
}
