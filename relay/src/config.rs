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
use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

use crate::{Error, Result};

#[derive(Debug, Parser)]
#[clap(name = "relay")]
pub struct RelayOpt {
    /// TLS listener shared by the user-facing and cluster-facing servers;
    /// SNI picks the server.
    #[clap(long, default_value = "0.0.0.0:8443")]
    pub listen_address: SocketAddr,

    /// Wildcard server name terminating user traffic.
    #[clap(long, default_value = "*.user.relay.local")]
    pub user_server_name: String,

    /// Wildcard server name terminating agent tunnels.
    #[clap(long, default_value = "*.connector.relay.local")]
    pub dialin_server_name: String,

    /// Service exposed through the tunnels.
    #[clap(long, default_value = "kubectl")]
    pub service_name: String,

    #[clap(long)]
    pub user_certificate_path: PathBuf,
    #[clap(long)]
    pub user_private_key_path: PathBuf,
    #[clap(long)]
    pub user_certificate_authority_root_path: PathBuf,

    #[clap(long)]
    pub connector_certificate_path: PathBuf,
    #[clap(long)]
    pub connector_private_key_path: PathBuf,
    #[clap(long)]
    pub connector_certificate_authority_root_path: PathBuf,

    /// URI of the peer discovery / authorization service.
    #[clap(long, default_value = "https://peering.relay.local:7001")]
    pub peer_service_uri: String,

    #[clap(long)]
    pub peer_certificate_path: PathBuf,
    #[clap(long)]
    pub peer_private_key_path: PathBuf,
    #[clap(long)]
    pub peer_certificate_authority_root_path: PathBuf,

    /// Hex-encoded 32-byte key shared by all relay replicas, used to seal
    /// the relay-to-relay security headers.
    #[clap(long)]
    pub peer_auth_key_path: PathBuf,

    /// Address other relays use to reach this relay's user-facing server.
    /// Advertised through the discovery service.
    #[clap(long, default_value = "")]
    pub relay_ip: String,

    /// Plain HTTP listener for /dialins, /health and /loglevel.
    #[clap(long, default_value = "0.0.0.0:7080")]
    pub ops_address: SocketAddr,

    #[clap(long, env = "POD_NAME", default_value = "")]
    pub pod_name: String,
}

/// Fully loaded relay configuration with all PEM material in memory.
pub struct RelayConfig {
    pub listen_address: SocketAddr,
    pub user_server_name: String,
    pub dialin_server_name: String,
    pub service_name: String,

    pub user_cert: Vec<u8>,
    pub user_key: Vec<u8>,
    pub user_ca: Vec<u8>,

    pub connector_cert: Vec<u8>,
    pub connector_key: Vec<u8>,
    pub connector_ca: Vec<u8>,

    pub peer_service_uri: String,
    pub peer_cert: Vec<u8>,
    pub peer_key: Vec<u8>,
    pub peer_ca: Vec<u8>,
    pub peer_auth_key: String,

    pub relay_ip: String,
    pub ops_address: SocketAddr,
    pub pod_name: String,
}

fn read(path: &PathBuf) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| Error::InvalidConfig(format!("cannot read {path:?}: {e}")))
}

impl RelayConfig {
    pub fn load(opt: RelayOpt) -> Result<Self> {
        if !opt.user_server_name.starts_with("*.") {
            return Err(Error::InvalidConfig(format!(
                "user server name must be a wildcard, got {}",
                opt.user_server_name
            )));
        }
        if !opt.dialin_server_name.starts_with("*.") {
            return Err(Error::InvalidConfig(format!(
                "dialin server name must be a wildcard, got {}",
                opt.dialin_server_name
            )));
        }

        let peer_auth_key = fs::read_to_string(&opt.peer_auth_key_path)
            .map_err(|e| {
                Error::InvalidConfig(format!("cannot read {:?}: {e}", opt.peer_auth_key_path))
            })?
            .trim()
            .to_string();

        Ok(RelayConfig {
            listen_address: opt.listen_address,
            user_server_name: opt.user_server_name,
            dialin_server_name: opt.dialin_server_name,
            service_name: opt.service_name,
            user_cert: read(&opt.user_certificate_path)?,
            user_key: read(&opt.user_private_key_path)?,
            user_ca: read(&opt.user_certificate_authority_root_path)?,
            connector_cert: read(&opt.connector_certificate_path)?,
            connector_key: read(&opt.connector_private_key_path)?,
            connector_ca: read(&opt.connector_certificate_authority_root_path)?,
            peer_service_uri: opt.peer_service_uri,
            peer_cert: read(&opt.peer_certificate_path)?,
            peer_key: read(&opt.peer_private_key_path)?,
            peer_ca: read(&opt.peer_certificate_authority_root_path)?,
            peer_auth_key,
            relay_ip: opt.relay_ip,
            ops_address: opt.ops_address,
            pod_name: opt.pod_name,
        })
    }

    /// ip:port advertised to peers. Falls back to the listen port when the
    /// configured address has no port of its own.
    pub fn relay_ip_port(&self) -> String {
        if self.relay_ip.is_empty() || self.relay_ip.contains(':') {
            return self.relay_ip.clone();
        }
        format!("{}:{}", self.relay_ip, self.listen_address.port())
    }
}
