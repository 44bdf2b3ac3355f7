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

pub mod mock;

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::PKey;
use openssl::x509::X509;
use reqwest::tls::{Certificate, Identity};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::milpa::api::types::{ContainerStatus, Node, Pod};
use crate::milpa::util::with_context;

/// Port the node agent listens on inside every cell.
pub const NODE_AGENT_PORT: u16 = 6421;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub type AgentFuture<'a, T> = BoxFuture<'a, Result<T, AgentError>>;

#[derive(Debug)]
pub enum AgentError {
    /// Network-level failure; the agent may be booting or unreachable.
    Unreachable(String),
    /// The agent answered with a non-success status.
    Rejected { status: u16, message: String },
}

impl AgentError {
    /// 4xx replies mean the request itself was bad; retrying the same
    /// payload will not help.
    pub fn is_permanent(&self) -> bool {
        matches!(self, AgentError::Rejected { status, .. } if (400..500).contains(status))
    }
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentError::Unreachable(message) => write!(f, "node agent unreachable: {}", message),
            AgentError::Rejected { status, message } => {
                write!(f, "node agent rejected request ({}): {}", status, message)
            }
        }
    }
}

impl Error for AgentError {}

/// Status document the agent serves at `GET /rest/v1/status`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentPodStatus {
    #[serde(rename = "podName", default, skip_serializing_if = "String::is_empty")]
    pub pod_name: String,
    #[serde(rename = "podUID", default, skip_serializing_if = "String::is_empty")]
    pub pod_uid: String,
    #[serde(rename = "containerStatuses", default, skip_serializing_if = "Vec::is_empty")]
    pub container_statuses: Vec<ContainerStatus>,
    #[serde(rename = "startTime")]
    pub start_time: Option<DateTime<Utc>>,
}

impl AgentPodStatus {
    pub fn all_containers_running(&self) -> bool {
        !self.container_statuses.is_empty()
            && self.container_statuses.iter().all(|status| {
                matches!(
                    status.state,
                    crate::milpa::api::types::ContainerState::Running { .. }
                )
            })
    }
}

pub trait NodeAgentClient: Send + Sync {
    /// Cheap liveness probe; succeeds once the agent is serving.
    fn health_check<'a>(&'a self) -> AgentFuture<'a, ()>;

    fn get_status<'a>(&'a self) -> AgentFuture<'a, AgentPodStatus>;

    /// Pushes the full pod spec; the agent converges containers on it.
    fn deploy_pod<'a>(&'a self, pod: &'a Pod) -> AgentFuture<'a, ()>;

    fn remove_pod<'a>(&'a self, pod_name: &'a str) -> AgentFuture<'a, ()>;

    fn get_logs<'a>(
        &'a self,
        pod_name: &'a str,
        container: &'a str,
        tail: u32,
    ) -> AgentFuture<'a, String>;

    fn exec<'a>(
        &'a self,
        pod_name: &'a str,
        container: &'a str,
        command: &'a [String],
    ) -> AgentFuture<'a, String>;
}

/// Hands out an agent client per node; controllers never build URLs
/// themselves. Whether the private or public address is dialed depends
/// on where this controller runs relative to the VPC.
pub trait NodeClientFactory: Send + Sync {
    fn client_for(&self, node: &Node) -> Arc<dyn NodeAgentClient>;
}

/// PEM material for the mTLS channel to node agents. The issuing CA and
/// the client certificate come from the certificate factory, which is
/// provisioned outside this process.
#[derive(Clone)]
pub struct TlsMaterial {
    pub root_ca_pem: Vec<u8>,
    pub client_cert_pem: Vec<u8>,
    pub client_key_pem: Vec<u8>,
}

impl TlsMaterial {
    fn identity(&self) -> Result<Identity, Box<dyn Error + Send + Sync>> {
        let cert = X509::from_pem(&self.client_cert_pem)
            .map_err(|e| with_context(e, "parsing node client certificate"))?;
        let key = PKey::private_key_from_pem(&self.client_key_pem)
            .map_err(|e| with_context(e, "parsing node client key"))?;
        let pkcs12 = Pkcs12::builder()
            .name("milpa-node-client")
            .pkey(&key)
            .cert(&cert)
            .build2("")
            .map_err(|e| with_context(e, "bundling node client identity"))?;
        let der = pkcs12
            .to_der()
            .map_err(|e| with_context(e, "serializing node client identity"))?;
        Identity::from_pkcs12_der(&der, "")
            .map_err(|e| with_context(e, "loading node client identity"))
    }
}

pub struct HttpNodeAgentClient {
    http: Client,
    base_url: String,
}

impl HttpNodeAgentClient {
    fn new(http: Client, address: &str) -> Self {
        Self {
            http,
            base_url: format!("https://{}:{}/rest/v1", address, NODE_AGENT_PORT),
        }
    }

    async fn check_reply(response: reqwest::Response) -> Result<reqwest::Response, AgentError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(AgentError::Rejected {
            status: status.as_u16(),
            message,
        })
    }

    fn network(error: reqwest::Error) -> AgentError {
        AgentError::Unreachable(error.to_string())
    }
}

impl NodeAgentClient for HttpNodeAgentClient {
    fn health_check<'a>(&'a self) -> AgentFuture<'a, ()> {
        Box::pin(async move {
            let response = self
                .http
                .get(format!("{}/status", self.base_url))
                .send()
                .await
                .map_err(Self::network)?;
            Self::check_reply(response).await.map(|_| ())
        })
    }

    fn get_status<'a>(&'a self) -> AgentFuture<'a, AgentPodStatus> {
        Box::pin(async move {
            let response = self
                .http
                .get(format!("{}/status", self.base_url))
                .send()
                .await
                .map_err(Self::network)?;
            let response = Self::check_reply(response).await?;
            response
                .json::<AgentPodStatus>()
                .await
                .map_err(|e| AgentError::Unreachable(e.to_string()))
        })
    }

    fn deploy_pod<'a>(&'a self, pod: &'a Pod) -> AgentFuture<'a, ()> {
        Box::pin(async move {
            let response = self
                .http
                .put(format!("{}/pod", self.base_url))
                .json(pod)
                .send()
                .await
                .map_err(Self::network)?;
            Self::check_reply(response).await.map(|_| ())
        })
    }

    fn remove_pod<'a>(&'a self, pod_name: &'a str) -> AgentFuture<'a, ()> {
        Box::pin(async move {
            let response = self
                .http
                .delete(format!("{}/pod/{}", self.base_url, pod_name))
                .send()
                .await
                .map_err(Self::network)?;
            match Self::check_reply(response).await {
                Ok(_) => Ok(()),
                // The pod already being gone is the goal state.
                Err(AgentError::Rejected { status, .. })
                    if status == StatusCode::NOT_FOUND.as_u16() =>
                {
                    Ok(())
                }
                Err(error) => Err(error),
            }
        })
    }

    fn get_logs<'a>(
        &'a self,
        pod_name: &'a str,
        container: &'a str,
        tail: u32,
    ) -> AgentFuture<'a, String> {
        Box::pin(async move {
            let mut url = format!("{}/logs/{}/{}", self.base_url, pod_name, container);
            if tail > 0 {
                url.push_str(&format!("?tail={}", tail));
            }
            let response = self.http.get(url).send().await.map_err(Self::network)?;
            let response = Self::check_reply(response).await?;
            response
                .text()
                .await
                .map_err(|e| AgentError::Unreachable(e.to_string()))
        })
    }

    fn exec<'a>(
        &'a self,
        pod_name: &'a str,
        container: &'a str,
        command: &'a [String],
    ) -> AgentFuture<'a, String> {
        Box::pin(async move {
            let response = self
                .http
                .post(format!("{}/exec/{}/{}", self.base_url, pod_name, container))
                .json(&serde_json::json!({ "command": command }))
                .send()
                .await
                .map_err(Self::network)?;
            let response = Self::check_reply(response).await?;
            response
                .text()
                .await
                .map_err(|e| AgentError::Unreachable(e.to_string()))
        })
    }
}

pub struct HttpNodeClientFactory {
    http: Client,
    use_public_ips: bool,
    cache: Mutex<HashMap<String, Arc<dyn NodeAgentClient>>>,
}

impl HttpNodeClientFactory {
    pub fn new(
        tls: &TlsMaterial,
        use_public_ips: bool,
    ) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let root = Certificate::from_pem(&tls.root_ca_pem)
            .map_err(|e| with_context(e, "parsing node agent CA certificate"))?;
        let http = Client::builder()
            .add_root_certificate(root)
            .identity(tls.identity()?)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| with_context(e, "building node agent HTTP client"))?;
        Ok(Self {
            http,
            use_public_ips,
            cache: Mutex::new(HashMap::new()),
        })
    }

    fn address_for(&self, node: &Node) -> String {
        if self.use_public_ips && !node.status.addresses.public_ip.is_empty() {
            node.status.addresses.public_ip.clone()
        } else {
            node.status.addresses.private_ip.clone()
        }
    }
}

impl NodeClientFactory for HttpNodeClientFactory {
    fn client_for(&self, node: &Node) -> Arc<dyn NodeAgentClient> {
        let address = self.address_for(node);
        let mut cache = self.cache.lock().expect("node client cache poisoned");
        cache
            .entry(address.clone())
            .or_insert_with(|| {
                Arc::new(HttpNodeAgentClient::new(self.http.clone(), &address))
                    as Arc<dyn NodeAgentClient>
            })
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_4xx_is_permanent() {
        let bad_request = AgentError::Rejected {
            status: 400,
            message: "no".into(),
        };
        let server_error = AgentError::Rejected {
            status: 503,
            message: "busy".into(),
        };
        assert!(bad_request.is_permanent());
        assert!(!server_error.is_permanent());
        assert!(!AgentError::Unreachable("timeout".into()).is_permanent());
    }

    #[test]
    fn running_requires_every_container() {
        use crate::milpa::api::types::{ContainerState, ContainerStatus};
        let mut status = AgentPodStatus::default();
        assert!(!status.all_containers_running());

        status.container_statuses = vec![
            ContainerStatus {
                name: "a".into(),
                state: ContainerState::Running { started_at: None },
                restart_count: 0,
            },
            ContainerStatus {
                name: "b".into(),
                state: ContainerState::Waiting { reason: "".into() },
                restart_count: 0,
            },
        ];
        assert!(!status.all_containers_running());

        status.container_statuses[1].state = ContainerState::Running { started_at: None };
        assert!(status.all_containers_running());
    }
}
