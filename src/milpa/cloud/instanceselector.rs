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
use std::fmt;

use crate::milpa::api::types::{
    parse_cpu_millis, parse_memory_bytes, PodSpec, SpotPolicy,
};
use crate::milpa::cloud::CloudProvider;
use crate::milpa::util::{new_error, with_context};

#[derive(Debug, PartialEq, Eq)]
pub enum SelectorError {
    /// No catalog entry satisfies every requested dimension.
    NoMatchingInstance,
    /// An explicitly named type is not in the catalog at all.
    UnknownInstanceType(String),
    /// The type exists but is not offered in the configured region.
    RegionUnavailable(String),
}

impl fmt::Display for SelectorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectorError::NoMatchingInstance => {
                write!(f, "no instance type satisfies the resource request")
            }
            SelectorError::UnknownInstanceType(name) => {
                write!(f, "unknown instance type {}", name)
            }
            SelectorError::RegionUnavailable(name) => {
                write!(f, "instance type {} is not offered in this region", name)
            }
        }
    }
}

impl Error for SelectorError {}

#[derive(Debug, Clone)]
pub struct InstanceOffering {
    pub name: &'static str,
    pub cpu_millis: u64,
    pub memory_bytes: u64,
    pub gpus: u32,
    /// On-demand price, USD per hour. Used for ranking only.
    pub price: f64,
    pub supports_spot: bool,
    pub regions: &'static [&'static str],
}

const GIB: u64 = 1 << 30;
const MIB: u64 = 1 << 20;

const AWS_REGIONS: &[&str] = &["us-east-1", "us-east-2", "us-west-2", "eu-west-1"];
const AWS_LIMITED: &[&str] = &["us-east-1", "us-west-2"];

const AWS_CATALOG: &[InstanceOffering] = &[
    InstanceOffering { name: "t2.nano", cpu_millis: 1000, memory_bytes: 512 * MIB, gpus: 0, price: 0.0058, supports_spot: true, regions: AWS_REGIONS },
    InstanceOffering { name: "t2.micro", cpu_millis: 1000, memory_bytes: GIB, gpus: 0, price: 0.0116, supports_spot: true, regions: AWS_REGIONS },
    InstanceOffering { name: "t2.small", cpu_millis: 1000, memory_bytes: 2 * GIB, gpus: 0, price: 0.023, supports_spot: true, regions: AWS_REGIONS },
    InstanceOffering { name: "t2.medium", cpu_millis: 2000, memory_bytes: 4 * GIB, gpus: 0, price: 0.0464, supports_spot: true, regions: AWS_REGIONS },
    InstanceOffering { name: "t3.small", cpu_millis: 2000, memory_bytes: 2 * GIB, gpus: 0, price: 0.0208, supports_spot: true, regions: AWS_REGIONS },
    InstanceOffering { name: "t3.medium", cpu_millis: 2000, memory_bytes: 4 * GIB, gpus: 0, price: 0.0416, supports_spot: true, regions: AWS_REGIONS },
    InstanceOffering { name: "m5.large", cpu_millis: 2000, memory_bytes: 8 * GIB, gpus: 0, price: 0.096, supports_spot: true, regions: AWS_REGIONS },
    InstanceOffering { name: "m5.xlarge", cpu_millis: 4000, memory_bytes: 16 * GIB, gpus: 0, price: 0.192, supports_spot: true, regions: AWS_REGIONS },
    InstanceOffering { name: "c5.large", cpu_millis: 2000, memory_bytes: 4 * GIB, gpus: 0, price: 0.085, supports_spot: true, regions: AWS_REGIONS },
    InstanceOffering { name: "c5.xlarge", cpu_millis: 4000, memory_bytes: 8 * GIB, gpus: 0, price: 0.17, supports_spot: true, regions: AWS_REGIONS },
    InstanceOffering { name: "p2.xlarge", cpu_millis: 4000, memory_bytes: 61 * GIB, gpus: 1, price: 0.9, supports_spot: false, regions: AWS_LIMITED },
    InstanceOffering { name: "p3.2xlarge", cpu_millis: 8000, memory_bytes: 61 * GIB, gpus: 1, price: 3.06, supports_spot: false, regions: AWS_LIMITED },
];

const AZURE_REGIONS: &[&str] = &["eastus", "westus2", "westeurope"];

const AZURE_CATALOG: &[InstanceOffering] = &[
    InstanceOffering { name: "Standard_B1s", cpu_millis: 1000, memory_bytes: GIB, gpus: 0, price: 0.0104, supports_spot: true, regions: AZURE_REGIONS },
    InstanceOffering { name: "Standard_B2s", cpu_millis: 2000, memory_bytes: 4 * GIB, gpus: 0, price: 0.0416, supports_spot: true, regions: AZURE_REGIONS },
    InstanceOffering { name: "Standard_D2s_v3", cpu_millis: 2000, memory_bytes: 8 * GIB, gpus: 0, price: 0.096, supports_spot: true, regions: AZURE_REGIONS },
    InstanceOffering { name: "Standard_D4s_v3", cpu_millis: 4000, memory_bytes: 16 * GIB, gpus: 0, price: 0.192, supports_spot: true, regions: AZURE_REGIONS },
    InstanceOffering { name: "Standard_NC6", cpu_millis: 6000, memory_bytes: 56 * GIB, gpus: 1, price: 0.9, supports_spot: false, regions: &["eastus", "westus2"] },
];

/// Resource dimensions extracted from a pod spec.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstanceNeeds {
    pub cpu_millis: u64,
    pub memory_bytes: u64,
    pub gpus: u32,
    pub spot: SpotPolicy,
    pub explicit_type: Option<String>,
}

impl InstanceNeeds {
    pub fn from_pod_spec(spec: &PodSpec) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let cpu_millis = match spec.resources.cpu.as_deref() {
            Some(quantity) => parse_cpu_millis(quantity)
                .map_err(|e| with_context(e, "invalid pod CPU request"))?,
            None => 0,
        };
        let memory_bytes = match spec.resources.memory.as_deref() {
            Some(quantity) => parse_memory_bytes(quantity)
                .map_err(|e| with_context(e, "invalid pod memory request"))?,
            None => 0,
        };
        Ok(Self {
            cpu_millis,
            memory_bytes,
            gpus: spec.resources.gpu,
            spot: spec.spot,
            explicit_type: spec.instance_type.clone(),
        })
    }
}

/// Maps resource requests onto the cheapest satisfying cloud SKU for
/// one (provider, region) pair. Constructed once at startup and handed
/// to controllers through their context, never a global.
pub struct InstanceSelector {
    region: String,
    default_instance_type: String,
    catalog: &'static [InstanceOffering],
}

impl InstanceSelector {
    pub fn new(
        provider: CloudProvider,
        region: &str,
        default_instance_type: &str,
    ) -> Result<Self, Box<dyn Error + Send + Sync>> {
        if region.is_empty() {
            return Err(new_error("instance selector requires a region"));
        }
        let catalog = match provider {
            CloudProvider::Aws => AWS_CATALOG,
            CloudProvider::Azure => AZURE_CATALOG,
        };
        let selector = Self {
            region: region.to_string(),
            default_instance_type: default_instance_type.to_string(),
            catalog,
        };
        selector.validate_type(default_instance_type).map_err(|e| {
            with_context(
                e,
                format!("default instance type {default_instance_type:?} is unusable"),
            )
        })?;
        Ok(selector)
    }

    pub fn default_instance_type(&self) -> &str {
        &self.default_instance_type
    }

    fn offering(&self, name: &str) -> Option<&'static InstanceOffering> {
        self.catalog.iter().find(|offering| offering.name == name)
    }

    fn offered_here(&self, offering: &InstanceOffering) -> bool {
        offering.regions.contains(&self.region.as_str())
    }

    /// Checks a named type exists and is offered in the region.
    pub fn validate_type(&self, name: &str) -> Result<(), SelectorError> {
        let offering = self
            .offering(name)
            .ok_or_else(|| SelectorError::UnknownInstanceType(name.to_string()))?;
        if !self.offered_here(offering) {
            return Err(SelectorError::RegionUnavailable(name.to_string()));
        }
        Ok(())
    }

    /// Cheapest SKU covering every requested dimension. An explicit
    /// type on the pod is validated against the request, never
    /// substituted.
    pub fn select(&self, needs: &InstanceNeeds) -> Result<String, SelectorError> {
        if let Some(explicit) = &needs.explicit_type {
            self.validate_type(explicit)?;
            let offering = self.offering(explicit).expect("validated above");
            if !fits(offering, needs) {
                return Err(SelectorError::NoMatchingInstance);
            }
            return Ok(explicit.clone());
        }

        self.catalog
            .iter()
            .filter(|offering| self.offered_here(offering) && fits(offering, needs))
            .min_by(|a, b| {
                a.price
                    .partial_cmp(&b.price)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.name.cmp(b.name))
            })
            .map(|offering| offering.name.to_string())
            .ok_or(SelectorError::NoMatchingInstance)
    }
}

fn fits(offering: &InstanceOffering, needs: &InstanceNeeds) -> bool {
    offering.cpu_millis >= needs.cpu_millis
        && offering.memory_bytes >= needs.memory_bytes
        && offering.gpus >= needs.gpus
        && (needs.spot != SpotPolicy::Always || offering.supports_spot)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selector() -> InstanceSelector {
        InstanceSelector::new(CloudProvider::Aws, "us-east-1", "t2.small").expect("selector")
    }

    fn needs(cpu: &str, memory: &str) -> InstanceNeeds {
        InstanceNeeds {
            cpu_millis: parse_cpu_millis(cpu).unwrap(),
            memory_bytes: parse_memory_bytes(memory).unwrap(),
            ..Default::default()
        }
    }

    #[test]
    fn empty_region_is_a_startup_error() {
        assert!(InstanceSelector::new(CloudProvider::Aws, "", "t2.small").is_err());
    }

    #[test]
    fn unknown_default_is_a_startup_error() {
        assert!(InstanceSelector::new(CloudProvider::Aws, "us-east-1", "y5.imaginary").is_err());
    }

    #[test]
    fn picks_the_cheapest_satisfying_sku() {
        let selector = selector();
        assert_eq!(selector.select(&needs("100m", "128Mi")).unwrap(), "t2.nano");
        assert_eq!(selector.select(&needs("2", "3Gi")).unwrap(), "t3.medium");
        assert_eq!(selector.select(&needs("1500m", "6Gi")).unwrap(), "m5.large");
    }

    #[test]
    fn gpu_requests_reach_gpu_skus() {
        let selector = selector();
        let gpu_needs = InstanceNeeds {
            gpus: 1,
            ..needs("2", "16Gi")
        };
        assert_eq!(selector.select(&gpu_needs).unwrap(), "p2.xlarge");
    }

    #[test]
    fn spot_always_filters_non_spot_skus() {
        let selector = selector();
        let spot_gpu = InstanceNeeds {
            gpus: 1,
            spot: SpotPolicy::Always,
            ..Default::default()
        };
        assert_eq!(selector.select(&spot_gpu), Err(SelectorError::NoMatchingInstance));
    }

    #[test]
    fn explicit_type_is_validated_not_substituted() {
        let selector = selector();
        let mut explicit = needs("100m", "128Mi");
        explicit.explicit_type = Some("m5.large".to_string());
        assert_eq!(selector.select(&explicit).unwrap(), "m5.large");

        explicit.explicit_type = Some("x9.huge".to_string());
        assert_eq!(
            selector.select(&explicit),
            Err(SelectorError::UnknownInstanceType("x9.huge".to_string()))
        );

        let mut oversized = needs("64", "1Ti");
        oversized.explicit_type = Some("t2.nano".to_string());
        assert_eq!(selector.select(&oversized), Err(SelectorError::NoMatchingInstance));
    }

    #[test]
    fn region_limited_skus_fail_elsewhere() {
        let eu = InstanceSelector::new(CloudProvider::Aws, "eu-west-1", "t2.small").unwrap();
        let mut gpu = InstanceNeeds::default();
        gpu.explicit_type = Some("p2.xlarge".to_string());
        assert_eq!(
            eu.select(&gpu),
            Err(SelectorError::RegionUnavailable("p2.xlarge".to_string()))
        );
    }

    #[test]
    fn dominated_skus_are_never_selected() {
        let selector = selector();
        // For every pair (a, b) where a is at least as large in every
        // dimension and strictly cheaper, any request satisfied by b is
        // answered with a sku costing no more than a.
        for b in AWS_CATALOG {
            for a in AWS_CATALOG {
                let dominates = a.cpu_millis >= b.cpu_millis
                    && a.memory_bytes >= b.memory_bytes
                    && a.gpus >= b.gpus
                    && a.price < b.price
                    && a.regions.contains(&"us-east-1")
                    && a.supports_spot >= b.supports_spot;
                if !dominates {
                    continue;
                }
                let request = InstanceNeeds {
                    cpu_millis: b.cpu_millis,
                    memory_bytes: b.memory_bytes,
                    gpus: b.gpus,
                    ..Default::default()
                };
                if let Ok(chosen) = selector.select(&request) {
                    assert_ne!(chosen, b.name, "{} dominates {} but {} was chosen", a.name, b.name, b.name);
                }
            }
        }
    }
}
