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

use std::time::Duration;

use thiserror::Error;

pub mod backoff;
pub mod client;
pub mod config;
pub mod proxy;

/// Default number of physical tunnel connections per relay network.
pub const MAX_DIALS: usize = 10;

/// Floor for the configured connection count.
pub const MIN_DIALS: usize = 8;

/// Concurrent in-flight streams beyond which a scale-up is signalled.
pub const SCALING_STREAMS_THRESHOLD: i64 = 400;

/// New-streams-per-second rate beyond which a scale-up is signalled.
pub const SCALING_STREAMS_RATE_THRESHOLD: i64 = 200;

/// Cap on scaled connections, as a multiple of the base pool.
pub const MAX_SCALE_MULTIPLIER: usize = 3;

/// How long a scaled connection must sit idle before it is closed.
pub const HEALING_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Maximum read/write idle time on a proxied stream.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Dial timeout for the local upstream.
pub const UPSTREAM_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Prefix for the agent-local upstream unix socket.
pub const UNIX_AGENT_SOCKET_PREFIX: &str = "/tmp/relay-agent-unix-";

#[derive(Error, Debug)]
pub enum Error {
    #[error("dial failed: `{0}`")]
    Dial(String),
    #[error("backoff limit exceeded: `{0}`")]
    BackoffExhausted(String),
    #[error("tunnel error: `{0}`")]
    Tunnel(String),
    #[error("protocol error: {0}")]
    Protocol(#[from] protocol::Error),
    #[error("invalid configuration: `{0}`")]
    InvalidConfig(String),
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
