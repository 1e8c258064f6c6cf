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

pub mod authz;
pub mod config;
pub mod ops;
pub mod peer;
pub mod pool;
pub mod proxy;
pub mod router;
pub mod server;
pub mod sessions;
pub mod tlsutil;

/// General purpose timeout for handshakes and short exchanges.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Maximum read/write idle time before a proxied stream is torn down.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// How long the SNI muxer waits for a ClientHello.
pub const MUX_TIMEOUT: Duration = Duration::from_secs(10);

/// Prefix for the dial-in stitching unix sockets.
pub const UNIX_SOCKET_PREFIX: &str = "/tmp/relay-unix-";

/// Field manager used for server-side apply of provisioned RBAC.
pub const FIELD_MANAGER: &str = "relay-authz-provisioner";

#[derive(Error, Debug)]
pub enum Error {
    #[error("connector key {0} already in dialin pool")]
    ConnectorExists(String),
    #[error("empty dialin pool for sni {0}")]
    NoDialins(String),
    #[error("tunnel error: `{0}`")]
    Tunnel(String),
    #[error("protocol error: {0}")]
    Protocol(#[from] protocol::Error),
    #[error("kube error: {0}")]
    Kube(#[source] kube::Error),
    #[error("authorization error: `{0}`")]
    Authz(String),
    #[error("unable to provision cluster rbac: `{0}`")]
    ProvisionFailed(String),
    #[error("invalid configuration: `{0}`")]
    InvalidConfig(String),
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
