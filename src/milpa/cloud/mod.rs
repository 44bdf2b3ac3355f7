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

pub mod instanceselector;
pub mod mock;

use std::collections::HashMap;
use std::env;
use std::error::Error;
use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::milpa::api::types::Node;
use crate::milpa::util::new_error;

/// Tag attached to every instance this controller launches; the garbage
/// controller only ever reasons about instances carrying its own ID.
pub const CONTROLLER_TAG: &str = "milpa-controller-id";
pub const NODE_NAME_TAG: &str = "milpa-node-name";

pub type CloudFuture<'a, T> = BoxFuture<'a, Result<T, CloudError>>;

#[derive(Debug)]
pub enum CloudError {
    Transient(String),
    InstanceNotFound(String),
    Denied(String),
}

impl fmt::Display for CloudError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloudError::Transient(message) => write!(f, "cloud API: {}", message),
            CloudError::InstanceNotFound(id) => write!(f, "instance {} not found", id),
            CloudError::Denied(message) => write!(f, "cloud API denied request: {}", message),
        }
    }
}

impl Error for CloudError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloudProvider {
    Aws,
    Azure,
}

impl CloudProvider {
    pub const fn as_str(self) -> &'static str {
        match self {
            CloudProvider::Aws => "aws",
            CloudProvider::Azure => "azure",
        }
    }
}

impl fmt::Display for CloudProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct CloudAttributes {
    pub provider: CloudProvider,
    pub region: String,
    pub fixed_size_volume: bool,
    pub controller_inside_vpc: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Pending,
    Running,
    ShuttingDown,
    Terminated,
}

#[derive(Debug, Clone)]
pub struct CloudInstance {
    pub id: String,
    pub node_name: String,
    pub instance_type: String,
    pub state: InstanceState,
    pub launch_time: DateTime<Utc>,
    pub private_ip: String,
    pub public_ip: String,
}

/// Everything the cloud needs to boot a cell: the registry node being
/// realized plus the rendered cloud-init document (agent version,
/// server URL, pre-shared node certificate).
#[derive(Debug, Clone)]
pub struct StartNodeSpec {
    pub node: Node,
    pub cloud_init: String,
    pub tags: HashMap<String, String>,
}

/// Capability set the controllers program against. SDK-backed
/// implementations live out of tree; [`mock::MockCloudClient`] backs
/// tests and single-process development.
pub trait CloudClient: Send + Sync {
    fn get_attributes(&self) -> CloudAttributes;

    fn get_vpc_cidrs(&self) -> Vec<String>;

    /// Launches an instance for the node, returning the cloud ID.
    fn start_node<'a>(&'a self, spec: &'a StartNodeSpec) -> CloudFuture<'a, String>;

    /// Resolves once the instance reports running, with addresses set.
    fn wait_for_running<'a>(&'a self, instance_id: &'a str) -> CloudFuture<'a, CloudInstance>;

    fn stop_instance<'a>(&'a self, instance_id: &'a str) -> CloudFuture<'a, ()>;

    /// Instances tagged with this controller's ID, any state.
    fn list_instances<'a>(&'a self) -> CloudFuture<'a, Vec<CloudInstance>>;

    fn boot_image_available<'a>(&'a self, image_tag: &'a str) -> CloudFuture<'a, bool>;
}

/// Cached view of cloud instance state so every controller tick does
/// not turn into a cloud API list call.
pub struct CloudStatusKeeper {
    snapshot: Mutex<(Vec<CloudInstance>, Option<DateTime<Utc>>)>,
}

impl CloudStatusKeeper {
    pub fn new() -> Self {
        Self {
            snapshot: Mutex::new((Vec::new(), None)),
        }
    }

    pub async fn refresh(&self, client: &dyn CloudClient) -> Result<(), CloudError> {
        let instances = client.list_instances().await?;
        let mut guard = self.snapshot.lock().expect("status keeper poisoned");
        *guard = (instances, Some(Utc::now()));
        Ok(())
    }

    pub fn instances(&self) -> Vec<CloudInstance> {
        self.snapshot.lock().expect("status keeper poisoned").0.clone()
    }

    pub fn refreshed_at(&self) -> Option<DateTime<Utc>> {
        self.snapshot.lock().expect("status keeper poisoned").1
    }
}

impl Default for CloudStatusKeeper {
    fn default() -> Self {
        Self::new()
    }
}

/// Provider credentials come from the environment, never from the
/// config file. Missing credentials are fatal at setup.
pub fn verify_credentials(
    provider: CloudProvider,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let required: &[&str] = match provider {
        CloudProvider::Aws => &["AWS_ACCESS_KEY_ID", "AWS_SECRET_ACCESS_KEY"],
        CloudProvider::Azure => &["AZURE_CLIENT_ID", "AZURE_CLIENT_SECRET", "AZURE_TENANT_ID"],
    };
    for name in required {
        if env::var(name).map(|v| v.is_empty()).unwrap_or(true) {
            return Err(new_error(format!(
                "missing {} credential {}",
                provider, name
            )));
        }
    }
    Ok(())
}
