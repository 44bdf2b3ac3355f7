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
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::milpa::api::types::{Metric, PodPhase};
use crate::milpa::observability::metrics;
use crate::milpa::registry::{MetricsRegistry, PodRegistry};
use crate::milpa::server::manager::Controller;

const SAMPLE_INTERVAL: Duration = Duration::from_secs(30);

/// Samples pod phase counts into the rolling metric window and the
/// prometheus gauges.
pub struct MetricsController {
    pods: Arc<PodRegistry>,
    window: Arc<MetricsRegistry>,
}

impl MetricsController {
    pub fn new(pods: Arc<PodRegistry>, window: Arc<MetricsRegistry>) -> Arc<Self> {
        Arc::new(Self { pods, window })
    }

    pub fn sample(&self) {
        let Ok(pods) = self.pods.list_pods(|_| true) else {
            return;
        };
        let phases = [
            PodPhase::Waiting,
            PodPhase::Dispatching,
            PodPhase::Running,
            PodPhase::Succeeded,
            PodPhase::Failed,
            PodPhase::Terminated,
        ];
        let mut values = std::collections::HashMap::new();
        for phase in phases {
            let count = pods.iter().filter(|p| p.status.phase == phase).count();
            metrics::set_pods_by_phase(phase.as_str(), count as i64);
            values.insert(phase.as_str().to_string(), count as f64);
        }
        self.window.add(Metric {
            name: "pods".to_string(),
            values,
            timestamp: Some(Utc::now()),
        });
    }
}

impl Controller for MetricsController {
    fn name(&self) -> &'static str {
        "MetricsController"
    }

    fn start(self: Arc<Self>, quit: CancellationToken, tasks: &TaskTracker) {
        tasks.spawn(async move {
            let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);
            loop {
                tokio::select! {
                    _ = quit.cancelled() => break,
                    _ = ticker.tick() => self.sample(),
                }
            }
        });
    }

    fn dump(&self) -> Vec<u8> {
        serde_json::to_vec_pretty(&self.window.snapshot()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::milpa::api::types::Pod;
    use crate::milpa::events::EventSystem;
    use crate::milpa::registry::kv::MemoryKvStore;
    use crate::milpa::registry::metrics::DEFAULT_METRIC_WINDOW;

    #[tokio::test]
    async fn samples_land_in_the_window() {
        let kv = Arc::new(MemoryKvStore::new());
        let pods = Arc::new(PodRegistry::new(kv, EventSystem::new()));
        pods.create_pod(Pod::new("p1", "default")).unwrap();
        let window = Arc::new(MetricsRegistry::new(DEFAULT_METRIC_WINDOW));
        let controller = MetricsController::new(pods, Arc::clone(&window));

        controller.sample();
        let latest = window.latest().expect("sample");
        assert_eq!(latest.values.get("Waiting"), Some(&1.0));
        assert_eq!(latest.values.get("Running"), Some(&0.0));
    }
}
