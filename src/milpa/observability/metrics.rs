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

use std::sync::OnceLock;

use prometheus::core::Collector;
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static EVENTS_MISSED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static CAS_CONFLICTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static CONTROLLER_TICKS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static NODE_POOL_GAUGE: OnceLock<IntGaugeVec> = OnceLock::new();
static POD_PHASE_GAUGE: OnceLock<IntGaugeVec> = OnceLock::new();
static AGENT_PROBES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static INSTANCES_TERMINATED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| {
        Registry::new_custom(Some("milpa".to_string()), None)
            .expect("failed to initialise milpa metrics registry")
    })
}

fn register_collector<C>(collector: C) -> C
where
    C: Clone + Collector + Send + Sync + 'static,
{
    registry()
        .register(Box::new(collector.clone()))
        .expect("failed to register milpa metric collector");
    collector
}

fn events_missed_total() -> &'static IntCounterVec {
    EVENTS_MISSED_TOTAL.get_or_init(|| {
        let opts = Opts::new(
            "events_missed_total",
            "Registry mutations dropped past a slow subscriber's queue",
        );
        register_collector(IntCounterVec::new(opts, &["kind"]).expect("missed events counter"))
    })
}

fn cas_conflicts_total() -> &'static IntCounterVec {
    CAS_CONFLICTS_TOTAL.get_or_init(|| {
        let opts = Opts::new(
            "registry_cas_conflicts_total",
            "Optimistic-concurrency write collisions by object kind",
        );
        register_collector(IntCounterVec::new(opts, &["kind"]).expect("cas conflict counter"))
    })
}

fn controller_ticks_total() -> &'static IntCounterVec {
    CONTROLLER_TICKS_TOTAL.get_or_init(|| {
        let opts = Opts::new(
            "controller_ticks_total",
            "Controller tick executions grouped by result",
        );
        register_collector(
            IntCounterVec::new(opts, &["controller", "result"]).expect("tick counter"),
        )
    })
}

fn node_pool_gauge() -> &'static IntGaugeVec {
    NODE_POOL_GAUGE.get_or_init(|| {
        let opts = Opts::new("node_pool_size", "Registry nodes by phase");
        register_collector(IntGaugeVec::new(opts, &["phase"]).expect("node pool gauge"))
    })
}

fn pod_phase_gauge() -> &'static IntGaugeVec {
    POD_PHASE_GAUGE.get_or_init(|| {
        let opts = Opts::new("pods_by_phase", "Registry pods by phase");
        register_collector(IntGaugeVec::new(opts, &["phase"]).expect("pod phase gauge"))
    })
}

fn agent_probes_total() -> &'static IntCounterVec {
    AGENT_PROBES_TOTAL.get_or_init(|| {
        let opts = Opts::new(
            "node_agent_probes_total",
            "Heartbeat probes against node agents grouped by result",
        );
        register_collector(IntCounterVec::new(opts, &["result"]).expect("probe counter"))
    })
}

fn instances_terminated_total() -> &'static IntCounterVec {
    INSTANCES_TERMINATED_TOTAL.get_or_init(|| {
        let opts = Opts::new(
            "cloud_instances_terminated_total",
            "Cloud instances terminated grouped by cause",
        );
        register_collector(IntCounterVec::new(opts, &["cause"]).expect("terminate counter"))
    })
}

pub fn record_missed_events(kind: &str, missed: u64) {
    events_missed_total()
        .with_label_values(&[kind])
        .inc_by(missed);
}

pub fn record_cas_conflict(kind: &str) {
    cas_conflicts_total().with_label_values(&[kind]).inc();
}

pub fn record_controller_tick(controller: &str, ok: bool) {
    let result = if ok { "ok" } else { "error" };
    controller_ticks_total()
        .with_label_values(&[controller, result])
        .inc();
}

pub fn set_node_pool_size(phase: &str, count: i64) {
    node_pool_gauge().with_label_values(&[phase]).set(count);
}

pub fn set_pods_by_phase(phase: &str, count: i64) {
    pod_phase_gauge().with_label_values(&[phase]).set(count);
}

pub fn record_agent_probe(ok: bool) {
    let result = if ok { "ok" } else { "error" };
    agent_probes_total().with_label_values(&[result]).inc();
}

pub fn record_instance_terminated(cause: &str) {
    instances_terminated_total().with_label_values(&[cause]).inc();
}

/// Text-format scrape body for the debug server.
pub fn render() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder
        .encode(&registry().gather(), &mut buffer)
        .is_err()
    {
        buffer.clear();
    }
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collectors_register_once_and_render() {
        record_missed_events("Pod", 3);
        record_missed_events("Pod", 2);
        record_cas_conflict("Node");
        record_controller_tick("PodController", true);
        set_node_pool_size("Available", 4);
        record_agent_probe(false);
        record_instance_terminated("orphan");

        let body = String::from_utf8(render()).expect("utf8 scrape");
        assert!(body.contains("milpa_events_missed_total"));
        assert!(body.contains("milpa_registry_cas_conflicts_total"));
        assert!(body.contains("milpa_node_pool_size"));
    }
}
