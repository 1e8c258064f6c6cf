/*
Copyright 2024 The Kubernetes Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use http::{Method, StatusCode};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response};
use tracing::info;
use tracing_subscriber::{reload, EnvFilter, Registry};

use crate::pool::DialinPool;
use crate::{Error, Result};

pub type LogLevelHandle = reload::Handle<EnvFilter, Registry>;

/// State behind the operational HTTP endpoints.
pub struct OpsState {
    pub pool: Arc<DialinPool>,
    pub log_level: LogLevelHandle,
    pub pod_name: String,
}

/// Serves `/dialins`, `/health` and `/loglevel` on a plain HTTP listener.
pub async fn run_ops_server(addr: SocketAddr, state: Arc<OpsState>) -> Result<()> {
    let make_svc = make_service_fn(move |_| {
        let state = state.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let state = state.clone();
                async move { Ok::<_, Infallible>(handle(state, req)) }
            }))
        }
    });

    info!(%addr, "starting ops server");
    hyper::Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Tunnel(format!("ops server failed: {e}")))
}

fn handle(state: Arc<OpsState>, req: Request<Body>) -> Response<Body> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/health") => text_response(StatusCode::OK, "ok"),
        (&Method::GET, "/dialins") => {
            let metrics = state.pool.snapshot(state.pod_name.clone());
            match serde_json::to_string(&metrics) {
                Ok(body) => Response::builder()
                    .status(StatusCode::OK)
                    .header(http::header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body))
                    .unwrap_or_default(),
                Err(_) => text_response(StatusCode::INTERNAL_SERVER_ERROR, "serialization failed"),
            }
        }
        (&Method::GET, "/loglevel") => {
            let level = req
                .uri()
                .query()
                .and_then(|q| {
                    q.split('&')
                        .find_map(|pair| pair.strip_prefix("level="))
                })
                .and_then(|v| v.parse::<u8>().ok());
            match level {
                Some(level) => {
                    let directive = match level {
                        0 => "error",
                        1 => "warn",
                        2 => "info",
                        3 => "debug",
                        _ => "trace",
                    };
                    match state.log_level.reload(EnvFilter::new(directive)) {
                        Ok(()) => {
                            info!(%directive, "log level changed");
                            text_response(StatusCode::OK, directive)
                        }
                        Err(_) => text_response(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            "failed to reload log level",
                        ),
                    }
                }
                None => text_response(StatusCode::BAD_REQUEST, "missing level parameter"),
            }
        }
        _ => text_response(StatusCode::NOT_FOUND, "not found"),
    }
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::from(body))
        .unwrap_or_default()
}
