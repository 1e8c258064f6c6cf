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

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Identity};
use tracing::{info, warn};

use peering::client::{
    client_hello_rpc, client_probe_rpc, client_survey_rpc, DialinLookup, PeerCache,
};
use peering::pb::relay_peer_service_client::RelayPeerServiceClient;
use peering::{Error, Result, PEER_CACHE_EXPIRY, PEER_HELLO_INTERVAL};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const DISCOVERY_DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything the peering manager needs to reach the discovery service.
#[derive(Clone)]
pub struct PeeringConfig {
    /// https URI of the discovery service.
    pub uri: String,
    pub cert: Vec<u8>,
    pub key: Vec<u8>,
    pub ca: Vec<u8>,
    pub relay_uuid: String,
    /// ip:port other relays use to reach this relay's user-facing server.
    pub relay_ip: String,
}

/// Keeps the three discovery streams alive for the life of the process.
/// Any stream ending tears all three down and reconnects after a fixed
/// delay; the Hello heartbeat bounds how long a dead link goes unnoticed.
pub async fn run_peering_manager(
    cfg: PeeringConfig,
    peer_cache: Arc<PeerCache>,
    probe_requests: Arc<Mutex<mpsc::Receiver<String>>>,
    dialin_lookup: DialinLookup,
) {
    loop {
        match connect_and_run(&cfg, &peer_cache, &probe_requests, &dialin_lookup).await {
            Ok(()) => return,
            Err(e) => {
                warn!(error = %e, "peering connection lost, reconnecting");
            }
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

async fn connect_and_run(
    cfg: &PeeringConfig,
    peer_cache: &Arc<PeerCache>,
    probe_requests: &Arc<Mutex<mpsc::Receiver<String>>>,
    dialin_lookup: &DialinLookup,
) -> Result<()> {
    let domain = cfg
        .uri
        .trim_start_matches("https://")
        .split(':')
        .next()
        .unwrap_or_default()
        .to_string();

    let tls = ClientTlsConfig::new()
        .domain_name(domain)
        .ca_certificate(Certificate::from_pem(&cfg.ca))
        .identity(Identity::from_pem(&cfg.cert, &cfg.key));

    let channel = Channel::from_shared(cfg.uri.clone())
        .map_err(|e| Error::InvalidConfig(format!("bad peer service uri: {e}")))?
        .tls_config(tls)?
        .connect_timeout(DISCOVERY_DIAL_TIMEOUT)
        .connect()
        .await?;
    info!(uri = %cfg.uri, "grpc connected to peer service");

    let mut hello_client = RelayPeerServiceClient::new(channel.clone());
    let mut probe_client = RelayPeerServiceClient::new(channel.clone());
    let mut survey_client = RelayPeerServiceClient::new(channel);

    let uuid = cfg.relay_uuid.clone();
    let ip = cfg.relay_ip.clone();
    let mut hello = tokio::spawn(async move {
        client_hello_rpc(&mut hello_client, PEER_HELLO_INTERVAL, &uuid, &ip).await
    });

    // give the hello stream a moment to register this relay before the
    // probe and survey streams try to bind to it
    tokio::time::sleep(Duration::from_secs(2)).await;

    let cache = peer_cache.clone();
    let uuid = cfg.relay_uuid.clone();
    let ip = cfg.relay_ip.clone();
    let requests = probe_requests.clone();
    let mut probe = tokio::spawn(async move {
        client_probe_rpc(
            &mut probe_client,
            cache,
            &uuid,
            PEER_CACHE_EXPIRY,
            requests,
            &ip,
        )
        .await
    });

    let uuid = cfg.relay_uuid.clone();
    let ip = cfg.relay_ip.clone();
    let lookup = dialin_lookup.clone();
    let mut survey = tokio::spawn(async move {
        client_survey_rpc(&mut survey_client, &uuid, &ip, lookup).await
    });

    // the first stream to die forces a full reconnect of all three
    let result = tokio::select! {
        r = &mut hello => flatten(r, "hello"),
        r = &mut probe => flatten(r, "probe"),
        r = &mut survey => flatten(r, "survey"),
    };

    hello.abort();
    probe.abort();
    survey.abort();
    result
}

fn flatten(
    joined: std::result::Result<Result<()>, tokio::task::JoinError>,
    stream: &'static str,
) -> Result<()> {
    match joined {
        Ok(result) => result,
        Err(_) => Err(Error::ConnectionLost(stream)),
    }
}
