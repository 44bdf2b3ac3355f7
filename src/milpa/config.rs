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

use std::collections::HashMap;
use std::error::Error;
use std::fs;

use serde::Deserialize;

use crate::milpa::api::types::{parse_cpu_millis, parse_memory_bytes, parse_volume_gib};
use crate::milpa::nodemanager::scaler::StandbySpec;
use crate::milpa::nodemanager::NodeControllerConfig;
use crate::milpa::util::{new_error, with_context};

const DEFAULT_VOLUME_SIZE: &str = "10Gi";
const DEFAULT_ITZO_VERSION: &str = "latest";
const DEFAULT_ITZO_URL: &str = "https://itzo-download.s3.amazonaws.com";

/// Server configuration, one JSON file. Cloud credentials never appear
/// here; they come from the environment.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub etcd: EtcdConfig,
    #[serde(default)]
    pub nodes: NodesConfig,
    #[serde(default)]
    pub testing: TestingConfig,
    #[serde(default)]
    pub cloud: CloudConfig,
    #[serde(default)]
    pub garbage: GarbageConfig,
}

/// Overrides for the garbage controller's sweep timing; defaults are
/// 60s for instance reconciliation and 10s for terminated pods.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GarbageConfig {
    #[serde(rename = "cleanInstancesInterval", default)]
    pub clean_instances_interval: Option<String>,
    #[serde(rename = "cleanTerminatedInterval", default)]
    pub clean_terminated_interval: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EtcdConfig {
    #[serde(default)]
    pub internal: EtcdInternalConfig,
}

/// Settings handed to the embedded store when it runs in-process.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EtcdInternalConfig {
    #[serde(rename = "configFile", default)]
    pub config_file: String,
    #[serde(rename = "dataDir", default)]
    pub data_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodesConfig {
    #[serde(rename = "defaultInstanceType", default)]
    pub default_instance_type: String,
    #[serde(rename = "standbyNodes", default)]
    pub standby_nodes: Vec<StandbySpec>,
    #[serde(rename = "defaultVolumeSize", default = "default_volume_size")]
    pub default_volume_size: String,
    /// Path to the rendered cloud-init document cells boot with;
    /// templating happens outside this process.
    #[serde(rename = "cloudInitFile", default)]
    pub cloud_init_file: String,
    #[serde(rename = "bootImageTags", default)]
    pub boot_image_tags: Vec<String>,
    #[serde(default)]
    pub itzo: ItzoConfig,
    #[serde(default)]
    pub nametag: String,
    #[serde(rename = "poolInterval", default)]
    pub pool_interval: Option<String>,
    #[serde(rename = "heartbeatInterval", default)]
    pub heartbeat_interval: Option<String>,
    #[serde(rename = "reaperInterval", default)]
    pub reaper_interval: Option<String>,
}

impl Default for NodesConfig {
    fn default() -> Self {
        Self {
            default_instance_type: String::new(),
            standby_nodes: Vec::new(),
            default_volume_size: default_volume_size(),
            cloud_init_file: String::new(),
            boot_image_tags: Vec::new(),
            itzo: ItzoConfig::default(),
            nametag: String::new(),
            pool_interval: None,
            heartbeat_interval: None,
            reaper_interval: None,
        }
    }
}

fn default_volume_size() -> String {
    DEFAULT_VOLUME_SIZE.to_string()
}

/// Node agent build the cells download at boot.
#[derive(Debug, Clone, Deserialize)]
pub struct ItzoConfig {
    #[serde(default = "default_itzo_version")]
    pub version: String,
    #[serde(default = "default_itzo_url")]
    pub url: String,
}

impl Default for ItzoConfig {
    fn default() -> Self {
        Self {
            version: default_itzo_version(),
            url: default_itzo_url(),
        }
    }
}

fn default_itzo_version() -> String {
    DEFAULT_ITZO_VERSION.to_string()
}

fn default_itzo_url() -> String {
    DEFAULT_ITZO_URL.to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TestingConfig {
    #[serde(rename = "controllerID", default)]
    pub controller_id: String,
}

/// Which cloud to drive. Provider-specific SDK settings live in the
/// nested maps and are interpreted by the client implementations.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CloudConfig {
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub aws: HashMap<String, String>,
    #[serde(default)]
    pub azure: HashMap<String, String>,
}

impl ServerConfig {
    pub fn load(path: &str) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let data = fs::read_to_string(path)
            .map_err(|e| with_context(e, format!("reading config file {path:?}")))?;
        serde_json::from_str(&data)
            .map_err(|e| with_context(e, format!("parsing config file {path:?}")))
    }

    /// Field-level validation; every entry is one user-actionable
    /// problem. A non-empty result is fatal at startup.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.nodes.default_instance_type.is_empty() {
            errors.push("nodes.defaultInstanceType must be set".to_string());
        }
        if parse_volume_gib(&self.nodes.default_volume_size).is_err() {
            errors.push(format!(
                "nodes.defaultVolumeSize {:?} is not a valid size",
                self.nodes.default_volume_size
            ));
        }
        for standby in &self.nodes.standby_nodes {
            if standby.instance_type.is_empty() {
                errors.push("nodes.standbyNodes entries need an instanceType".to_string());
            }
        }
        for interval in [
            &self.nodes.pool_interval,
            &self.nodes.heartbeat_interval,
            &self.nodes.reaper_interval,
            &self.garbage.clean_instances_interval,
            &self.garbage.clean_terminated_interval,
        ]
        .into_iter()
        .flatten()
        {
            if humantime::parse_duration(interval).is_err() {
                errors.push(format!("{interval:?} is not a valid duration"));
            }
        }
        errors
    }

    /// Node controller timing, config overrides applied on top of the
    /// built-in defaults (7s pool, 10s heartbeat, 10s reaper).
    pub fn node_controller_intervals(
        &self,
    ) -> Result<NodeControllerConfig, Box<dyn Error + Send + Sync>> {
        let mut config = NodeControllerConfig::default();
        if let Some(interval) = &self.nodes.pool_interval {
            config.pool_interval = humantime::parse_duration(interval)
                .map_err(|e| with_context(e, "nodes.poolInterval"))?;
        }
        if let Some(interval) = &self.nodes.heartbeat_interval {
            config.heartbeat_interval = humantime::parse_duration(interval)
                .map_err(|e| with_context(e, "nodes.heartbeatInterval"))?;
        }
        if let Some(interval) = &self.nodes.reaper_interval {
            config.reaper_interval = humantime::parse_duration(interval)
                .map_err(|e| with_context(e, "nodes.reaperInterval"))?;
        }
        Ok(config)
    }

    /// Garbage controller timing with config overrides applied.
    pub fn garbage_controller_intervals(
        &self,
    ) -> Result<crate::milpa::server::garbage::GarbageControllerConfig, Box<dyn Error + Send + Sync>>
    {
        let mut config = crate::milpa::server::garbage::GarbageControllerConfig::default();
        if let Some(interval) = &self.garbage.clean_instances_interval {
            config.clean_instances_interval = humantime::parse_duration(interval)
                .map_err(|e| with_context(e, "garbage.cleanInstancesInterval"))?;
        }
        if let Some(interval) = &self.garbage.clean_terminated_interval {
            config.clean_terminated_interval = humantime::parse_duration(interval)
                .map_err(|e| with_context(e, "garbage.cleanTerminatedInterval"))?;
        }
        Ok(config)
    }
}

impl NodesConfig {
    /// The cloud-init document handed to new instances, as rendered
    /// by the external tooling. Absent file means bare cells (useful
    /// with the mock cloud).
    pub fn rendered_cloud_init(&self) -> Result<String, Box<dyn Error + Send + Sync>> {
        if self.cloud_init_file.is_empty() {
            return Ok(String::new());
        }
        fs::read_to_string(&self.cloud_init_file).map_err(|e| {
            with_context(
                e,
                format!("reading cloud-init file {:?}", self.cloud_init_file),
            )
        })
    }

    /// The boot image the pool launches from: first configured tag.
    /// Later entries are fallbacks operators can promote by reordering.
    pub fn boot_image_tag(&self) -> &str {
        self.boot_image_tags.first().map(String::as_str).unwrap_or("")
    }
}

/// Capacity this provider advertises to Kubernetes, overridable per
/// node name through a JSON map file.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ProviderConfig {
    #[serde(default = "default_cpu_capacity")]
    pub cpu: String,
    #[serde(default = "default_memory_capacity")]
    pub memory: String,
    #[serde(default = "default_pod_capacity")]
    pub pods: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            cpu: default_cpu_capacity(),
            memory: default_memory_capacity(),
            pods: default_pod_capacity(),
        }
    }
}

fn default_cpu_capacity() -> String {
    "20".to_string()
}

fn default_memory_capacity() -> String {
    "100Gi".to_string()
}

fn default_pod_capacity() -> String {
    "20".to_string()
}

impl ProviderConfig {
    fn validate(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        parse_cpu_millis(&self.cpu).map_err(|e| with_context(e, "provider cpu capacity"))?;
        parse_memory_bytes(&self.memory)
            .map_err(|e| with_context(e, "provider memory capacity"))?;
        self.pods
            .parse::<u32>()
            .map_err(|_| new_error(format!("invalid pod capacity {:?}", self.pods)))?;
        Ok(())
    }
}

/// Loads the per-node capacity map; nodes without an entry get the
/// defaults (cpu=20, memory=100Gi, pods=20).
pub fn load_provider_config(
    path: &str,
    node_name: &str,
) -> Result<ProviderConfig, Box<dyn Error + Send + Sync>> {
    let config = if path.is_empty() {
        ProviderConfig::default()
    } else {
        let data = fs::read_to_string(path)
            .map_err(|e| with_context(e, format!("reading provider config {path:?}")))?;
        let map: HashMap<String, ProviderConfig> = serde_json::from_str(&data)
            .map_err(|e| with_context(e, format!("parsing provider config {path:?}")))?;
        map.get(node_name).cloned().unwrap_or_default()
    };
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn minimal_config_validates() {
        let config: ServerConfig = serde_json::from_str(
            r#"{"nodes": {"defaultInstanceType": "t2.small"}}"#,
        )
        .unwrap();
        assert!(config.validate().is_empty());
        assert_eq!(config.nodes.default_volume_size, "10Gi");
        assert_eq!(config.nodes.itzo.version, "latest");
    }

    #[test]
    fn missing_instance_type_is_reported() {
        let config = ServerConfig::default();
        let errors = config.validate();
        assert!(errors.iter().any(|e| e.contains("defaultInstanceType")));
    }

    #[test]
    fn interval_overrides_parse() {
        let config: ServerConfig = serde_json::from_str(
            r#"{"nodes": {"defaultInstanceType": "t2.small", "poolInterval": "3s"}}"#,
        )
        .unwrap();
        assert!(config.validate().is_empty());
        let intervals = config.node_controller_intervals().unwrap();
        assert_eq!(intervals.pool_interval, std::time::Duration::from_secs(3));
        assert_eq!(
            intervals.heartbeat_interval,
            std::time::Duration::from_secs(10)
        );
    }

    #[test]
    fn bad_interval_fails_validation() {
        let config: ServerConfig = serde_json::from_str(
            r#"{"nodes": {"defaultInstanceType": "t2.small", "poolInterval": "sometimes"}}"#,
        )
        .unwrap();
        assert!(!config.validate().is_empty());
    }

    #[test]
    fn provider_config_defaults_and_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"vk-node-1": {{"cpu": "40", "memory": "200Gi", "pods": "50"}}}}"#
        )
        .unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let custom = load_provider_config(&path, "vk-node-1").unwrap();
        assert_eq!(custom.cpu, "40");
        assert_eq!(custom.pods, "50");

        let fallback = load_provider_config(&path, "other-node").unwrap();
        assert_eq!(fallback, ProviderConfig::default());

        let bare = load_provider_config("", "any").unwrap();
        assert_eq!(bare.memory, "100Gi");
    }
}
