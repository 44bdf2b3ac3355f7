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

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use milpa::milpa::cloud::mock::MockCloudClient;
use milpa::milpa::cloud::{verify_credentials, CloudClient, CloudProvider};
use milpa::milpa::config::{load_provider_config, ServerConfig};
use milpa::milpa::logger::{
    log_error, log_info, set_log_format, set_min_level, LogFormat, LogLevel,
};
use milpa::milpa::nodeclient::mock::MockNodeClientFactory;
use milpa::milpa::nodeclient::{HttpNodeClientFactory, NodeClientFactory, TlsMaterial};
use milpa::milpa::registry::kv::MemoryKvStore;
use milpa::milpa::server::{debug, InstanceProvider, ProviderDeps};
use milpa::milpa::util::detect_internal_ip;

const COMPONENT: &str = "main";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Run the Milpa provider: one virtual Kubernetes node backed by a
/// fleet of cloud cells.
#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = env!("CARGO_PKG_DESCRIPTION"))]
struct Args {
    /// Path to the server configuration file
    #[arg(long)]
    config: String,

    /// Per-node capacity overrides, a JSON map keyed by node name
    #[arg(long, default_value = "")]
    provider_config: String,

    /// Name the virtual node registers under
    #[arg(long, default_value = "milpa")]
    node_name: String,

    /// Address for the debug and metrics listener
    #[arg(long, default_value = "127.0.0.1:6061")]
    debug_addr: SocketAddr,

    /// CA bundle that signed the node agent server certificates.
    /// When unset the provider talks to mock agents (development mode)
    #[arg(long, default_value = "")]
    node_ca: String,

    /// Client certificate presented to node agents
    #[arg(long, default_value = "")]
    node_cert: String,

    /// Private key for the node agent client certificate
    #[arg(long, default_value = "")]
    node_key: String,

    /// Emit JSON log lines instead of key=value text
    #[arg(long)]
    json_logs: bool,

    /// Lowest log level emitted (debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn build_cloud_client(config: &ServerConfig) -> Result<Arc<dyn CloudClient>, String> {
    match config.cloud.provider.as_str() {
        "" | "mock" => {
            let region = if config.cloud.region.is_empty() {
                "us-east-1"
            } else {
                &config.cloud.region
            };
            let mock = MockCloudClient::new(region);
            for tag in &config.nodes.boot_image_tags {
                mock.register_boot_image(tag);
            }
            Ok(Arc::new(mock))
        }
        "aws" => {
            verify_credentials(CloudProvider::Aws).map_err(|e| e.to_string())?;
            Err("the aws client ships in the cloud provider bundle; link it and register it here".to_string())
        }
        "azure" => {
            verify_credentials(CloudProvider::Azure).map_err(|e| e.to_string())?;
            Err("the azure client ships in the cloud provider bundle; link it and register it here".to_string())
        }
        other => Err(format!("unknown cloud provider {other:?}")),
    }
}

fn build_client_factory(
    args: &Args,
    cloud: &dyn CloudClient,
) -> Result<Arc<dyn NodeClientFactory>, String> {
    if args.node_ca.is_empty() {
        // No agent TLS material: development mode against mock agents.
        return Ok(MockNodeClientFactory::new());
    }
    let read = |path: &str| std::fs::read(path).map_err(|e| format!("reading {path:?}: {e}"));
    let tls = TlsMaterial {
        root_ca_pem: read(&args.node_ca)?,
        client_cert_pem: read(&args.node_cert)?,
        client_key_pem: read(&args.node_key)?,
    };
    // A controller outside the VPC cannot reach private addresses.
    let use_public_ips = !cloud.get_attributes().controller_inside_vpc;
    let factory = HttpNodeClientFactory::new(&tls, use_public_ips).map_err(|e| e.to_string())?;
    Ok(Arc::new(factory))
}

async fn run() -> i32 {
    let args = Args::parse();
    if args.json_logs {
        set_log_format(LogFormat::Json);
    }
    match LogLevel::parse(&args.log_level) {
        Some(level) => set_min_level(level),
        None => {
            eprintln!("milpa: unknown log level {:?}", args.log_level);
            return 2;
        }
    }

    let server_config = match ServerConfig::load(&args.config) {
        Ok(config) => config,
        Err(error) => {
            log_error(COMPONENT, "config load failed", &[("error", &error.to_string())]);
            return 1;
        }
    };
    let provider_config =
        match load_provider_config(&args.provider_config, &args.node_name) {
            Ok(config) => config,
            Err(error) => {
                log_error(
                    COMPONENT,
                    "provider config load failed",
                    &[("error", &error.to_string())],
                );
                return 1;
            }
        };

    let cloud = match build_cloud_client(&server_config) {
        Ok(cloud) => cloud,
        Err(message) => {
            log_error(COMPONENT, "cloud client setup failed", &[("error", &message)]);
            return 1;
        }
    };
    let clients = match build_client_factory(&args, cloud.as_ref()) {
        Ok(clients) => clients,
        Err(message) => {
            log_error(COMPONENT, "node client setup failed", &[("error", &message)]);
            return 1;
        }
    };

    let internal_ip = detect_internal_ip().unwrap_or_else(|| "127.0.0.1".to_string());
    let quit = CancellationToken::new();

    let provider = match InstanceProvider::new(
        &args.node_name,
        &internal_ip,
        &server_config,
        provider_config,
        ProviderDeps {
            kv: Arc::new(MemoryKvStore::new()),
            cloud,
            clients,
            quit: quit.clone(),
        },
    ) {
        Ok(provider) => provider,
        Err(error) => {
            log_error(COMPONENT, "startup failed", &[("error", &error.to_string())]);
            return 1;
        }
    };

    // Signals fan into the one process-wide quit token.
    {
        let quit = quit.clone();
        tokio::spawn(async move {
            let mut term = match signal(SignalKind::terminate()) {
                Ok(term) => term,
                Err(_) => return,
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
            log_info(COMPONENT, "shutdown signal received", &[]);
            quit.cancel();
        });
    }

    tokio::spawn(debug::serve(
        Arc::clone(&provider),
        args.debug_addr,
        quit.clone(),
    ));

    log_info(
        COMPONENT,
        "milpa provider starting",
        &[
            ("nodeName", &args.node_name),
            ("internalIP", &internal_ip),
            ("controllerID", provider.controller_id()),
        ],
    );
    if provider.run(SHUTDOWN_GRACE).await {
        0
    } else {
        1
    }
}

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}
