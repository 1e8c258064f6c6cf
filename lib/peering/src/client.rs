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

use rand::Rng;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Channel;
use tracing::{debug, warn};

use protocol::TtlCache;

use crate::pb::relay_peer_service_client::RelayPeerServiceClient;
use crate::pb::{
    PeerHelloRequest, PeerProbeRequest, PeerSurveyResponse, RelayClusterConnectionInfo,
};
use crate::{Error, Result};

/// Candidate peers per cluster SNI, learned from probe responses. Entries
/// are best-effort hints; a failed forward should remove the entry and
/// trigger a new probe.
pub type PeerCache = TtlCache<String, Vec<RelayClusterConnectionInfo>>;

/// Lookup into the local dialin pool, injected by the relay so this crate
/// stays independent of it.
pub type DialinLookup = Arc<dyn Fn(&str) -> usize + Send + Sync>;

pub fn new_peer_cache() -> PeerCache {
    TtlCache::new(1 << 14)
}

/// Returns a candidate peer IP for the SNI, randomly tie-breaking when more
/// than one relay claims the cluster.
pub fn get_peer_cache(cache: &PeerCache, clustersni: &str) -> Option<String> {
    let items = cache.get(&clustersni.to_string())?;
    match items.len() {
        0 => None,
        1 => Some(items[0].relayip.clone()),
        n => {
            let idx = rand::thread_rng().gen_range(0..n);
            Some(items[idx].relayip.clone())
        }
    }
}

/// Drives the Hello heartbeat stream. Sends the relay identity immediately
/// and on every interval tick; returns when the stream breaks, which the
/// caller must treat as loss of connectivity to the discovery service.
pub async fn client_hello_rpc(
    client: &mut RelayPeerServiceClient<Channel>,
    interval: Duration,
    relay_uuid: &str,
    relay_ip: &str,
) -> Result<()> {
    let (tx, rx) = mpsc::channel::<PeerHelloRequest>(8);
    let msg = PeerHelloRequest {
        relayuuid: relay_uuid.to_string(),
        relayip: relay_ip.to_string(),
    };

    let sender = tokio::spawn(async move {
        if tx.send(msg.clone()).await.is_err() {
            return;
        }
        let mut tick = tokio::time::interval(interval);
        tick.tick().await; // consume the immediate first tick
        loop {
            tick.tick().await;
            if tx.send(msg.clone()).await.is_err() {
                break;
            }
        }
    });

    let mut inbound = client
        .relay_peer_hello_rpc(ReceiverStream::new(rx))
        .await?
        .into_inner();

    loop {
        match inbound.message().await {
            Ok(Some(resp)) => {
                debug!(
                    serviceuuid = %resp.serviceuuid,
                    serviceip = %resp.serviceip,
                    "received hello response"
                );
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "hello stream recv failed");
                break;
            }
        }
    }

    sender.abort();
    Err(Error::ConnectionLost("hello"))
}

/// Drives the Probe stream. The first message binds the stream server-side;
/// afterwards cluster SNIs taken from `probe_requests` are probed and every
/// response is written into the peer cache, filtered of entries pointing
/// back at this relay.
pub async fn client_probe_rpc(
    client: &mut RelayPeerServiceClient<Channel>,
    cache: Arc<PeerCache>,
    relay_uuid: &str,
    expiry: Duration,
    probe_requests: Arc<tokio::sync::Mutex<mpsc::Receiver<String>>>,
    relay_ip: &str,
) -> Result<()> {
    let (tx, rx) = mpsc::channel::<PeerProbeRequest>(64);

    // empty-SNI message binds this stream to our relay object
    tx.send(PeerProbeRequest {
        relayuuid: relay_uuid.to_string(),
        clustersni: String::new(),
    })
    .await
    .map_err(|_| Error::ConnectionLost("probe"))?;

    let uuid = relay_uuid.to_string();
    let forward_tx = tx.clone();
    let forwarder = tokio::spawn(async move {
        loop {
            let next = {
                let mut requests = probe_requests.lock().await;
                tokio::select! {
                    _ = forward_tx.closed() => None,
                    sni = requests.recv() => sni,
                }
            };
            let Some(clustersni) = next else { break };
            debug!(%clustersni, "sending probe request");
            if forward_tx
                .send(PeerProbeRequest {
                    relayuuid: uuid.clone(),
                    clustersni,
                })
                .await
                .is_err()
            {
                break;
            }
        }
    });

    let mut inbound = client
        .relay_peer_probe_rpc(ReceiverStream::new(rx))
        .await?
        .into_inner();

    loop {
        let resp = match inbound.message().await {
            Ok(Some(resp)) => resp,
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "probe stream recv failed");
                break;
            }
        };

        if resp.clustersni.is_empty() || resp.items.is_empty() {
            warn!(clustersni = %resp.clustersni, "probe response with no candidates");
            continue;
        }

        let candidates: Vec<RelayClusterConnectionInfo> = resp
            .items
            .into_iter()
            .filter(|item| {
                // skip candidates that point back at this relay
                if item.relayuuid == relay_uuid {
                    return false;
                }
                if !relay_ip.is_empty() && item.relayip == relay_ip {
                    return false;
                }
                true
            })
            .collect();

        if candidates.is_empty() {
            continue;
        }

        debug!(
            clustersni = %resp.clustersni,
            candidates = candidates.len(),
            "caching probe response"
        );
        cache.insert(resp.clustersni, candidates, expiry);
    }

    forwarder.abort();
    Err(Error::ConnectionLost("probe"))
}

/// Drives the Survey stream. Answers a survey request only when the local
/// dialin pool actually holds a live connector for the cluster.
pub async fn client_survey_rpc(
    client: &mut RelayPeerServiceClient<Channel>,
    relay_uuid: &str,
    relay_ip: &str,
    dialin_lookup: DialinLookup,
) -> Result<()> {
    let (tx, rx) = mpsc::channel::<PeerSurveyResponse>(64);

    tx.send(PeerSurveyResponse {
        relayuuid: relay_uuid.to_string(),
        relayip: relay_ip.to_string(),
        clustersni: String::new(),
    })
    .await
    .map_err(|_| Error::ConnectionLost("survey"))?;

    let mut inbound = client
        .relay_peer_survey_rpc(ReceiverStream::new(rx))
        .await?
        .into_inner();

    loop {
        let req = match inbound.message().await {
            Ok(Some(req)) => req,
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "survey stream recv failed");
                break;
            }
        };

        if req.clustersni.is_empty() {
            continue;
        }

        let count = dialin_lookup(&req.clustersni);
        debug!(clustersni = %req.clustersni, count, "survey lookup");
        if count > 0 {
            if tx
                .send(PeerSurveyResponse {
                    relayuuid: relay_uuid.to_string(),
                    relayip: relay_ip.to_string(),
                    clustersni: req.clustersni,
                })
                .await
                .is_err()
            {
                break;
            }
        }
    }

    Err(Error::ConnectionLost("survey"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_cache_random_tie_break() {
        let cache = new_peer_cache();
        cache.insert(
            "c1.connector".to_string(),
            vec![
                RelayClusterConnectionInfo {
                    relayuuid: "a".into(),
                    relayip: "10.0.0.1".into(),
                },
                RelayClusterConnectionInfo {
                    relayuuid: "b".into(),
                    relayip: "10.0.0.2".into(),
                },
            ],
            Duration::from_secs(60),
        );

        for _ in 0..32 {
            let ip = get_peer_cache(&cache, "c1.connector").unwrap();
            assert!(ip == "10.0.0.1" || ip == "10.0.0.2");
        }
        assert!(get_peer_cache(&cache, "unknown").is_none());
    }
}
