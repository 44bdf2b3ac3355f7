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

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::milpa::api::types::{parse_volume_gib, Node, NodePhase};

/// Equivalence class nodes are pooled by. Pods can only bind to a cell
/// from the bucket their resource request maps to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeBucket {
    pub instance_type: String,
    pub volume_gib: u32,
    pub boot_image: String,
}

impl NodeBucket {
    pub fn label(&self) -> String {
        format!("{}/{}Gi/{}", self.instance_type, self.volume_gib, self.boot_image)
    }
}

/// Configured warm pool: keep `count` idle cells of `instance_type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StandbySpec {
    #[serde(rename = "instanceType")]
    pub instance_type: String,
    pub count: usize,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ScalePlan {
    pub to_create: Vec<(NodeBucket, usize)>,
    /// Specific surplus nodes, by name.
    pub to_terminate: Vec<String>,
    pub unchanged: Vec<String>,
}

/// Pure sizing arithmetic: given the node listing and current demand,
/// produce the deltas that bring each bucket to
/// `max(configured standby, demand)`. Called on every pool tick, so the
/// same inputs must always produce the same plan.
pub struct BindingNodeScaler {
    standby: Vec<StandbySpec>,
    default_volume_gib: u32,
    fixed_size_volume: bool,
    boot_image: String,
}

impl BindingNodeScaler {
    pub fn new(
        standby: Vec<StandbySpec>,
        default_volume_size: &str,
        fixed_size_volume: bool,
        boot_image: &str,
    ) -> Self {
        let default_volume_gib = parse_volume_gib(default_volume_size).unwrap_or(10);
        Self {
            standby,
            default_volume_gib,
            fixed_size_volume,
            boot_image: boot_image.to_string(),
        }
    }

    /// Bucket a new cell for this instance type and volume request
    /// would land in. Clouds with fixed-size boot volumes collapse the
    /// volume dimension to the default.
    pub fn bucket_for(&self, instance_type: &str, volume_size: Option<&str>) -> NodeBucket {
        let volume_gib = if self.fixed_size_volume {
            self.default_volume_gib
        } else {
            volume_size
                .and_then(|size| parse_volume_gib(size).ok())
                .unwrap_or(self.default_volume_gib)
        };
        NodeBucket {
            instance_type: instance_type.to_string(),
            volume_gib,
            boot_image: self.boot_image.clone(),
        }
    }

    pub fn bucket_for_node(&self, node: &Node) -> NodeBucket {
        let mut bucket = self.bucket_for(
            &node.spec.instance_type,
            node.spec.resources.volume_size.as_deref(),
        );
        if !node.spec.boot_image.is_empty() {
            bucket.boot_image = node.spec.boot_image.clone();
        }
        bucket
    }

    fn configured_standby(&self, bucket: &NodeBucket) -> usize {
        self.standby
            .iter()
            .filter(|spec| *bucket == self.bucket_for(&spec.instance_type, None))
            .map(|spec| spec.count)
            .sum()
    }

    pub fn compute(&self, nodes: &[Node], demand: &[NodeBucket]) -> ScalePlan {
        // Supply: unbound cells that exist or are already on their way.
        // Counting Creating nodes keeps one tick from launching the
        // same capacity twice.
        let mut supply: HashMap<NodeBucket, Vec<&Node>> = HashMap::new();
        for node in nodes {
            let countable = node.status.bound_pod_name.is_empty()
                && matches!(
                    node.status.phase,
                    NodePhase::Creating | NodePhase::Available
                );
            if countable {
                supply.entry(self.bucket_for_node(node)).or_default().push(node);
            }
        }

        let mut demand_counts: BTreeMap<NodeBucket, usize> = BTreeMap::new();
        for bucket in demand {
            *demand_counts.entry(bucket.clone()).or_default() += 1;
        }
        // Buckets with supply but no demand still need standby sizing.
        for bucket in supply.keys() {
            demand_counts.entry(bucket.clone()).or_default();
        }
        for spec in &self.standby {
            demand_counts
                .entry(self.bucket_for(&spec.instance_type, None))
                .or_default();
        }

        let mut plan = ScalePlan::default();
        for (bucket, wanted) in demand_counts {
            let target = wanted.max(self.configured_standby(&bucket));
            let mut have = supply.remove(&bucket).unwrap_or_default();
            if have.len() < target {
                plan.to_create.push((bucket, target - have.len()));
                plan.unchanged
                    .extend(have.iter().map(|node| node.meta.name.clone()));
                continue;
            }
            // Keep the oldest cells, retire the rest. Only Available
            // cells can be retired; Creating ones finish their boot.
            have.sort_by_key(|node| node.meta.creation_timestamp);
            for (position, node) in have.iter().enumerate() {
                if position < target || node.status.phase != NodePhase::Available {
                    plan.unchanged.push(node.meta.name.clone());
                } else {
                    plan.to_terminate.push(node.meta.name.clone());
                }
            }
        }
        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn scaler(standby: Vec<StandbySpec>) -> BindingNodeScaler {
        BindingNodeScaler::new(standby, "10Gi", false, "img-1")
    }

    fn available_node(name: &str, instance_type: &str, age_secs: i64) -> Node {
        let mut node = Node::new(name, instance_type, "img-1");
        node.status.phase = NodePhase::Available;
        node.meta.creation_timestamp = Some(Utc::now() - Duration::seconds(age_secs));
        node
    }

    #[test]
    fn zero_demand_zero_standby_is_a_noop() {
        let plan = scaler(vec![]).compute(&[], &[]);
        assert!(plan.to_create.is_empty());
        assert!(plan.to_terminate.is_empty());
    }

    #[test]
    fn demand_without_supply_creates() {
        let s = scaler(vec![]);
        let bucket = s.bucket_for("t2.small", None);
        let plan = s.compute(&[], &[bucket.clone(), bucket.clone()]);
        assert_eq!(plan.to_create, vec![(bucket, 2)]);
    }

    #[test]
    fn standby_floor_applies_without_demand() {
        let s = scaler(vec![StandbySpec {
            instance_type: "t2.small".into(),
            count: 2,
        }]);
        let nodes = vec![available_node("n1", "t2.small", 60)];
        let plan = s.compute(&nodes, &[]);
        assert_eq!(plan.to_create.len(), 1);
        assert_eq!(plan.to_create[0].1, 1);
        assert_eq!(plan.unchanged, vec!["n1".to_string()]);
    }

    #[test]
    fn surplus_retires_the_youngest_available() {
        let s = scaler(vec![]);
        let nodes = vec![
            available_node("old", "t2.small", 600),
            available_node("young", "t2.small", 5),
        ];
        let bucket = s.bucket_for("t2.small", None);
        let plan = s.compute(&nodes, &[bucket]);
        assert_eq!(plan.unchanged, vec!["old".to_string()]);
        assert_eq!(plan.to_terminate, vec!["young".to_string()]);
    }

    #[test]
    fn creating_nodes_count_as_supply_but_never_retire() {
        let s = scaler(vec![]);
        let mut creating = available_node("boot", "t2.small", 5);
        creating.status.phase = NodePhase::Creating;
        let nodes = vec![creating];

        // Demand of one is already covered by the booting cell.
        let bucket = s.bucket_for("t2.small", None);
        let plan = s.compute(&nodes, &[bucket]);
        assert!(plan.to_create.is_empty());

        // And with no demand at all, a booting cell is left to finish.
        let plan = s.compute(&nodes, &[]);
        assert!(plan.to_terminate.is_empty());
        assert_eq!(plan.unchanged, vec!["boot".to_string()]);
    }

    #[test]
    fn claimed_nodes_are_not_supply() {
        let s = scaler(vec![]);
        let mut claimed = available_node("busy", "t2.small", 60);
        claimed.status.phase = NodePhase::Claimed;
        claimed.status.bound_pod_name = "p1".into();
        let bucket = s.bucket_for("t2.small", None);
        let plan = s.compute(&[claimed], &[bucket.clone()]);
        assert_eq!(plan.to_create, vec![(bucket, 1)]);
    }

    #[test]
    fn buckets_split_by_volume_size() {
        let s = scaler(vec![]);
        let small = s.bucket_for("t2.small", Some("10Gi"));
        let large = s.bucket_for("t2.small", Some("50Gi"));
        assert_ne!(small, large);

        let fixed = BindingNodeScaler::new(vec![], "10Gi", true, "img-1");
        assert_eq!(
            fixed.bucket_for("t2.small", Some("50Gi")),
            fixed.bucket_for("t2.small", None)
        );
    }

    #[test]
    fn plan_is_idempotent_over_inputs() {
        let s = scaler(vec![StandbySpec {
            instance_type: "t2.small".into(),
            count: 1,
        }]);
        let nodes = vec![available_node("n1", "t2.small", 60)];
        let demand = vec![s.bucket_for("m5.large", None)];
        let first = s.compute(&nodes, &demand);
        let second = s.compute(&nodes, &demand);
        assert_eq!(first, second);
    }
}
