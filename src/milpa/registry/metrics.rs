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

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::milpa::api::types::Metric;

pub const DEFAULT_METRIC_WINDOW: usize = 240;

/// Rolling window of samples, memory only. Unlike the other registries
/// nothing here survives a restart and nothing is versioned.
pub struct MetricsRegistry {
    window: Mutex<VecDeque<Metric>>,
    capacity: usize,
}

impl MetricsRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            window: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn add(&self, metric: Metric) {
        let mut window = self.window.lock().expect("metrics window poisoned");
        if window.len() == self.capacity {
            window.pop_front();
        }
        window.push_back(metric);
    }

    pub fn snapshot(&self) -> Vec<Metric> {
        let window = self.window.lock().expect("metrics window poisoned");
        window.iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<Metric> {
        let window = self.window.lock().expect("metrics window poisoned");
        window.back().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample(name: &str) -> Metric {
        Metric {
            name: name.to_string(),
            values: Default::default(),
            timestamp: Some(Utc::now()),
        }
    }

    #[test]
    fn window_drops_oldest_at_capacity() {
        let registry = MetricsRegistry::new(3);
        for i in 0..5 {
            registry.add(sample(&format!("m{i}")));
        }
        let names: Vec<String> = registry.snapshot().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["m2", "m3", "m4"]);
        assert_eq!(registry.latest().unwrap().name, "m4");
    }
}
