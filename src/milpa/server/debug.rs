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

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tokio_util::sync::CancellationToken;

use crate::milpa::logger::{log_info, log_warn};
use crate::milpa::observability::metrics;
use crate::milpa::server::InstanceProvider;

const COMPONENT: &str = "debug-server";

pub fn router(provider: Arc<InstanceProvider>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(scrape))
        .route("/debug/controllers", get(list_controllers))
        .route("/debug/controllers/:name", get(dump_controller))
        .with_state(provider)
}

async fn healthz(State(provider): State<Arc<InstanceProvider>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "leader": provider.manager.is_leader(),
        "controllerID": provider.controller_id(),
        "startTime": provider.start_time(),
    }))
}

async fn scrape() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render(),
    )
}

async fn list_controllers(State(provider): State<Arc<InstanceProvider>>) -> impl IntoResponse {
    Json(provider.manager.controller_names())
}

async fn dump_controller(
    State(provider): State<Arc<InstanceProvider>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match provider.manager.dump(&name) {
        Some(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            body,
        ),
        None => (
            StatusCode::NOT_FOUND,
            [(header::CONTENT_TYPE, "application/json")],
            format!("{{\"error\": \"unknown controller {name}\"}}").into_bytes(),
        ),
    }
}

/// Serves the debug endpoints until shutdown. Failures here are logged
/// and tolerated; the control loops do not depend on this listener.
pub async fn serve(provider: Arc<InstanceProvider>, addr: SocketAddr, quit: CancellationToken) {
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(error) => {
            log_warn(
                COMPONENT,
                "debug listener bind failed",
                &[("addr", &addr.to_string()), ("error", &error.to_string())],
            );
            return;
        }
    };
    log_info(COMPONENT, "debug server listening", &[("addr", &addr.to_string())]);
    let app = router(provider);
    let shutdown = async move { quit.cancelled().await };
    if let Err(error) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        log_warn(COMPONENT, "debug server exited", &[("error", &error.to_string())]);
    }
}
