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

use std::fs;
use std::path::PathBuf;

use clap::Parser;

use crate::{Error, Result, MAX_DIALS, MIN_DIALS, UNIX_AGENT_SOCKET_PREFIX};

#[derive(Debug, Parser)]
#[clap(name = "relay-agent")]
pub struct AgentOpt {
    /// Unique id of the cluster this agent runs in. Substituted into the
    /// relay endpoint wildcard and used as the tunnel SNI prefix.
    #[clap(long, env = "CLUSTER_ID")]
    pub cluster_id: String,

    /// Dialout domain of the relay's cluster-facing server.
    #[clap(long, default_value = "*.connector.relay.local")]
    pub relay_endpoint: String,

    #[clap(long, default_value = "8443")]
    pub relay_port: u16,

    /// Dial address override (host:port) for setups where the relay
    /// endpoint name does not resolve from inside the cluster. The SNI
    /// stays derived from the endpoint.
    #[clap(long, default_value = "")]
    pub relay_address: String,

    /// Service carried over the tunnel.
    #[clap(long, default_value = "kubectl")]
    pub service_name: String,

    #[clap(long)]
    pub client_certificate_path: PathBuf,
    #[clap(long)]
    pub client_private_key_path: PathBuf,
    #[clap(long)]
    pub certificate_authority_root_path: PathBuf,

    /// host:port of the local upstream service. Empty means the agent-local
    /// unix socket for this cluster.
    #[clap(long, default_value = "")]
    pub upstream: String,

    /// Egress HTTP CONNECT proxy (host:port) for restricted networks.
    #[clap(long, env = "EGRESS_PROXY", default_value = "")]
    pub egress_proxy: String,

    /// Base64 user:password for Proxy-Authorization, if the proxy wants it.
    #[clap(long, env = "EGRESS_PROXY_AUTH", default_value = "")]
    pub egress_proxy_auth: String,

    /// Physical tunnel connections to hold open.
    #[clap(long, default_value_t = MAX_DIALS)]
    pub max_dials: usize,
}

/// Where proxied streams terminate inside the cluster.
#[derive(Debug, Clone)]
pub enum Upstream {
    Tcp(String),
    Unix(String),
}

/// Fully loaded agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub cluster_id: String,
    pub service_name: String,
    /// host:port the tunnels dial out to.
    pub server_addr: String,
    /// Dial override used in place of server_addr when set.
    pub relay_address: Option<String>,
    /// SNI presented on the tunnel TLS session.
    pub server_name: String,
    pub client_cert: Vec<u8>,
    pub client_key: Vec<u8>,
    pub root_ca: Vec<u8>,
    pub upstream: Upstream,
    pub egress_proxy: Option<String>,
    pub egress_proxy_auth: Option<String>,
    pub max_dials: usize,
}

fn read(path: &PathBuf) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| Error::InvalidConfig(format!("cannot read {path:?}: {e}")))
}

impl AgentConfig {
    pub fn load(opt: AgentOpt) -> Result<Self> {
        if opt.cluster_id.is_empty() {
            return Err(Error::InvalidConfig("cluster id must not be empty".to_string()));
        }
        if !opt.relay_endpoint.starts_with("*.") {
            return Err(Error::InvalidConfig(format!(
                "relay endpoint must be a wildcard, got {}",
                opt.relay_endpoint
            )));
        }

        let server_name = opt.relay_endpoint.replace('*', &opt.cluster_id);
        let upstream = if opt.upstream.is_empty() {
            Upstream::Unix(format!("{UNIX_AGENT_SOCKET_PREFIX}{}", opt.cluster_id))
        } else {
            Upstream::Tcp(opt.upstream)
        };

        Ok(AgentConfig {
            cluster_id: opt.cluster_id,
            service_name: opt.service_name,
            server_addr: format!("{server_name}:{}", opt.relay_port),
            relay_address: (!opt.relay_address.is_empty()).then_some(opt.relay_address),
            server_name,
            client_cert: read(&opt.client_certificate_path)?,
            client_key: read(&opt.client_private_key_path)?,
            root_ca: read(&opt.certificate_authority_root_path)?,
            upstream,
            egress_proxy: (!opt.egress_proxy.is_empty()).then_some(opt.egress_proxy),
            egress_proxy_auth: (!opt.egress_proxy_auth.is_empty()).then_some(opt.egress_proxy_auth),
            max_dials: opt.max_dials.max(MIN_DIALS),
        })
    }
}
