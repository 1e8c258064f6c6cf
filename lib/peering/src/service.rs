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

// The peering service maintains three streams per connected relay:
// 1) Hello: heartbeats that keep the relay listed as alive
// 2) Probe: receives probe requests, answers with candidate peers
// 3) Survey: sends survey requests out, receives survey replies back
//
// Each relay is tracked as a RelayObject keyed by (OU, relay UUID). The
// object carries the channels the Probe and Survey streams drain, so any
// handler can push a message to a specific relay without holding the map
// lock across an await.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};
use uuid::Uuid;

use protocol::TtlCache;

use crate::identity::client_identity;
use crate::pb::relay_peer_service_server::RelayPeerService;
use crate::pb::{
    PeerHelloRequest, PeerHelloResponse, PeerProbeRequest, PeerProbeResponse, PeerSurveyRequest,
    PeerSurveyResponse, RelayClusterConnectionInfo,
};
use crate::{MAX_RELAY_IDLE_SECS, SURVEY_CACHE_EXPIRY};

const CHANNEL_CAPACITY: usize = 128;
const SURVEY_BROADCAST_CAPACITY: usize = 256;
const SURVEY_SEND_TIMEOUT: Duration = Duration::from_secs(2);
const SURVEY_POLL_ROUNDS: u32 = 5;

/// One survey fan-out on behalf of a probing relay.
#[derive(Debug, Clone)]
pub struct SurveyBroadcast {
    pub clustersni: String,
    pub relayuuid: String,
    pub ou: String,
}

struct RelayObject {
    last_heartbeat: AtomicI64,
    relay_ip: String,
    ref_cnt: AtomicU32,
    probe_reply_tx: mpsc::Sender<PeerProbeResponse>,
    probe_reply_rx: Mutex<Option<mpsc::Receiver<PeerProbeResponse>>>,
    survey_request_tx: mpsc::Sender<PeerSurveyRequest>,
    survey_request_rx: Mutex<Option<mpsc::Receiver<PeerSurveyRequest>>>,
}

impl RelayObject {
    fn new(relay_ip: String) -> Self {
        let (probe_reply_tx, probe_reply_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (survey_request_tx, survey_request_rx) = mpsc::channel(CHANNEL_CAPACITY);
        RelayObject {
            last_heartbeat: AtomicI64::new(unix_now()),
            relay_ip,
            ref_cnt: AtomicU32::new(0),
            probe_reply_tx,
            probe_reply_rx: Mutex::new(Some(probe_reply_rx)),
            survey_request_tx,
            survey_request_rx: Mutex::new(Some(survey_request_rx)),
        }
    }

    fn is_stale(&self, now: i64) -> bool {
        let seen = self.last_heartbeat.load(Ordering::Relaxed);
        now > seen && now - seen > MAX_RELAY_IDLE_SECS
    }
}

struct ServiceState {
    service_uuid: String,
    service_ip: String,
    // OU -> relay UUID -> object
    relays: RwLock<HashMap<String, HashMap<String, Arc<RelayObject>>>>,
    survey_tx: mpsc::Sender<SurveyBroadcast>,
    // (clustersni + relayuuid + ou) -> relay ip, populated by survey replies
    survey_cache: TtlCache<String, String>,
    survey_cache_ttl: Duration,
}

/// The discovery service. Clone is shallow; all state is shared.
#[derive(Clone)]
pub struct PeerService {
    inner: Arc<ServiceState>,
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn survey_cache_key(clustersni: &str, relayuuid: &str, ou: &str) -> String {
    format!("{clustersni}{relayuuid}{ou}")
}

impl PeerService {
    /// Creates the service and the receiver end of its survey broadcast
    /// queue. The receiver must be passed to [`PeerService::run_survey_handler`].
    pub fn new(service_ip: String) -> (Self, mpsc::Receiver<SurveyBroadcast>) {
        let (survey_tx, survey_rx) = mpsc::channel(SURVEY_BROADCAST_CAPACITY);
        let svc = PeerService {
            inner: Arc::new(ServiceState {
                service_uuid: Uuid::new_v4().to_string(),
                service_ip,
                relays: RwLock::new(HashMap::new()),
                survey_tx,
                survey_cache: TtlCache::new(1 << 16),
                survey_cache_ttl: SURVEY_CACHE_EXPIRY,
            }),
        };
        (svc, survey_rx)
    }

    pub fn service_uuid(&self) -> &str {
        &self.inner.service_uuid
    }

    /// Control loop that fans survey requests out to connected relays.
    pub async fn run_survey_handler(&self, mut rx: mpsc::Receiver<SurveyBroadcast>) {
        info!("started survey request handler");
        while let Some(req) = rx.recv().await {
            let state = self.inner.clone();
            tokio::spawn(handle_survey_req(state, req));
        }
        info!("stopping survey request handler");
    }

    /// Number of relays currently known in an OU. Used by tests and the
    /// standalone server's logs.
    pub fn relay_count(&self, ou: &str) -> usize {
        let relays = self.inner.relays.read().expect("relay map lock poisoned");
        relays.get(ou).map(|m| m.len()).unwrap_or(0)
    }
}

impl ServiceState {
    fn handle_hello(&self, relayuuid: &str, relayip: &str, ou: &str) {
        {
            let relays = self.relays.read().expect("relay map lock poisoned");
            if let Some(robj) = relays.get(ou).and_then(|m| m.get(relayuuid)) {
                robj.last_heartbeat.store(unix_now(), Ordering::Relaxed);
                return;
            }
        }

        let mut relays = self.relays.write().expect("relay map lock poisoned");
        relays
            .entry(ou.to_string())
            .or_default()
            .entry(relayuuid.to_string())
            .or_insert_with(|| Arc::new(RelayObject::new(relayip.to_string())));
    }

    fn get_relay_object(&self, relayuuid: &str, ou: &str) -> Option<Arc<RelayObject>> {
        let relays = self.relays.read().expect("relay map lock poisoned");
        let robj = relays.get(ou)?.get(relayuuid)?;
        robj.ref_cnt.fetch_add(1, Ordering::Relaxed);
        Some(robj.clone())
    }

    fn put_relay_object(&self, relayuuid: &str, ou: &str) {
        let relays = self.relays.read().expect("relay map lock poisoned");
        if let Some(robj) = relays.get(ou).and_then(|m| m.get(relayuuid)) {
            let _ = robj
                .ref_cnt
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
        }
    }

    /// Answers a probe from the survey cache alone. Returns false when no
    /// other relay has a cached claim on the cluster.
    fn try_response_from_cache(&self, relayuuid: &str, clustersni: &str, ou: &str) -> bool {
        let other_relays: Vec<String> = {
            let relays = self.relays.read().expect("relay map lock poisoned");
            relays
                .get(ou)
                .map(|m| m.keys().filter(|k| *k != relayuuid).cloned().collect())
                .unwrap_or_default()
        };

        let items: Vec<RelayClusterConnectionInfo> = other_relays
            .iter()
            .filter_map(|rid| {
                self.survey_cache
                    .get(&survey_cache_key(clustersni, rid, ou))
                    .map(|ip| RelayClusterConnectionInfo {
                        relayuuid: rid.clone(),
                        relayip: ip,
                    })
            })
            .collect();

        if items.is_empty() {
            return false;
        }

        if let Some(robj) = self.get_relay_object(relayuuid, ou) {
            let msg = PeerProbeResponse {
                clustersni: clustersni.to_string(),
                items,
            };
            if robj.probe_reply_tx.try_send(msg).is_err() {
                debug!(relayuuid, "probe reply channel full, dropping cached response");
            }
            self.put_relay_object(relayuuid, ou);
        }
        true
    }

    fn gc_stale_relays(&self) {
        let mut relays = self.relays.write().expect("relay map lock poisoned");
        let now = unix_now();
        for relay_list in relays.values_mut() {
            relay_list.retain(|relayuuid, robj| {
                if robj.is_stale(now) {
                    if robj.ref_cnt.load(Ordering::Relaxed) > 0 {
                        warn!(relayuuid, "inactive relay still has references");
                        true
                    } else {
                        false
                    }
                } else {
                    true
                }
            });
        }
    }
}

async fn handle_survey_req(state: Arc<ServiceState>, req: SurveyBroadcast) {
    let sreq = PeerSurveyRequest {
        clustersni: req.clustersni.clone(),
    };

    let mut found_stale = false;
    let mut relay_ids = Vec::new();
    let targets: Vec<Arc<RelayObject>> = {
        let relays = state.relays.read().expect("relay map lock poisoned");
        let now = unix_now();
        let mut targets = Vec::new();
        if let Some(relay_list) = relays.get(&req.ou) {
            for (relayuuid, robj) in relay_list {
                if robj.is_stale(now) {
                    found_stale = true;
                    continue;
                }
                if *relayuuid != req.relayuuid {
                    relay_ids.push(relayuuid.clone());
                    targets.push(robj.clone());
                }
            }
        }
        targets
    };

    debug!(
        clustersni = %req.clustersni,
        peers = targets.len(),
        "broadcasting survey request"
    );

    for robj in &targets {
        if tokio::time::timeout(SURVEY_SEND_TIMEOUT, robj.survey_request_tx.send(sreq.clone()))
            .await
            .is_err()
        {
            debug!(clustersni = %req.clustersni, "survey request send timed out");
        }
    }

    // Survey replies land in the cache; poll it once per second and push
    // whatever accumulated back to the probing relay as soon as anything
    // shows up.
    for _ in 0..SURVEY_POLL_ROUNDS {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let items: Vec<RelayClusterConnectionInfo> = relay_ids
            .iter()
            .filter_map(|rid| {
                state
                    .survey_cache
                    .get(&survey_cache_key(&req.clustersni, rid, &req.ou))
                    .map(|ip| RelayClusterConnectionInfo {
                        relayuuid: rid.clone(),
                        relayip: ip,
                    })
            })
            .collect();

        if items.is_empty() {
            continue;
        }

        if let Some(robj) = state.get_relay_object(&req.relayuuid, &req.ou) {
            let msg = PeerProbeResponse {
                clustersni: req.clustersni.clone(),
                items,
            };
            if robj.probe_reply_tx.try_send(msg).is_err() {
                debug!(
                    relayuuid = %req.relayuuid,
                    "probe reply channel full, dropping survey result"
                );
            }
            state.put_relay_object(&req.relayuuid, &req.ou);
        }
        break;
    }

    if found_stale {
        state.gc_stale_relays();
    }
}

#[tonic::async_trait]
impl RelayPeerService for PeerService {
    type RelayPeerHelloRpcStream = ReceiverStream<Result<PeerHelloResponse, Status>>;

    async fn relay_peer_hello_rpc(
        &self,
        request: Request<Streaming<PeerHelloRequest>>,
    ) -> Result<Response<Self::RelayPeerHelloRpcStream>, Status> {
        let identity = client_identity(&request)?;
        info!(name = %identity.common_name, ou = %identity.organizational_unit, "hello stream opened");

        let mut stream = request.into_inner();
        let (tx, rx) = mpsc::channel(8);
        let state = self.inner.clone();
        let ou = identity.organizational_unit;

        tokio::spawn(async move {
            loop {
                let msg = match stream.message().await {
                    Ok(Some(msg)) => msg,
                    Ok(None) => break,
                    Err(e) => {
                        debug!(error = %e, "hello stream recv failed");
                        break;
                    }
                };

                let reply = PeerHelloResponse {
                    serviceuuid: state.service_uuid.clone(),
                    serviceip: state.service_ip.clone(),
                };
                if tx.send(Ok(reply)).await.is_err() {
                    break;
                }
                state.handle_hello(&msg.relayuuid, &msg.relayip, &ou);
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    type RelayPeerProbeRpcStream = ReceiverStream<Result<PeerProbeResponse, Status>>;

    async fn relay_peer_probe_rpc(
        &self,
        request: Request<Streaming<PeerProbeRequest>>,
    ) -> Result<Response<Self::RelayPeerProbeRpcStream>, Status> {
        let identity = client_identity(&request)?;
        info!(name = %identity.common_name, ou = %identity.organizational_unit, "probe stream opened");

        let mut stream = request.into_inner();
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let state = self.inner.clone();
        let ou = identity.organizational_unit;

        tokio::spawn(async move {
            let mut bound = false;
            loop {
                let msg = match stream.message().await {
                    Ok(Some(msg)) => msg,
                    _ => break,
                };

                if msg.clustersni.is_empty() && !msg.relayuuid.is_empty() {
                    // first message binds this stream to the relay object
                    if !bound {
                        bound = bind_probe_sender(&state, &msg.relayuuid, &ou, tx.clone());
                    }
                    continue;
                }

                if !msg.clustersni.is_empty() && !msg.relayuuid.is_empty() {
                    let state = state.clone();
                    let ou = ou.clone();
                    tokio::spawn(async move {
                        if !state.try_response_from_cache(&msg.relayuuid, &msg.clustersni, &ou) {
                            let broadcast = SurveyBroadcast {
                                clustersni: msg.clustersni,
                                relayuuid: msg.relayuuid,
                                ou,
                            };
                            if state.survey_tx.send(broadcast).await.is_err() {
                                warn!("survey broadcast queue closed");
                            }
                        }
                    });
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    type RelayPeerSurveyRpcStream = ReceiverStream<Result<PeerSurveyRequest, Status>>;

    async fn relay_peer_survey_rpc(
        &self,
        request: Request<Streaming<PeerSurveyResponse>>,
    ) -> Result<Response<Self::RelayPeerSurveyRpcStream>, Status> {
        let identity = client_identity(&request)?;
        info!(name = %identity.common_name, ou = %identity.organizational_unit, "survey stream opened");

        let mut stream = request.into_inner();
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let state = self.inner.clone();
        let ou = identity.organizational_unit;

        tokio::spawn(async move {
            let mut bound = false;
            loop {
                let msg = match stream.message().await {
                    Ok(Some(msg)) => msg,
                    _ => break,
                };

                if msg.clustersni.is_empty() && !msg.relayuuid.is_empty() {
                    if !bound {
                        bound = bind_survey_sender(&state, &msg.relayuuid, &ou, tx.clone());
                    }
                    continue;
                }

                // a survey reply; cache it so probe polling can see it
                if !msg.clustersni.is_empty() && !msg.relayuuid.is_empty() && !msg.relayip.is_empty()
                {
                    state.survey_cache.insert(
                        survey_cache_key(&msg.clustersni, &msg.relayuuid, &ou),
                        msg.relayip,
                        state.survey_cache_ttl,
                    );
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

/// Starts the task that drains a relay's probe-reply channel onto its probe
/// stream. The channel receiver is handed back when the stream dies so a
/// reconnecting relay can bind again.
fn bind_probe_sender(
    state: &Arc<ServiceState>,
    relayuuid: &str,
    ou: &str,
    out: mpsc::Sender<Result<PeerProbeResponse, Status>>,
) -> bool {
    let Some(robj) = state.get_relay_object(relayuuid, ou) else {
        return false;
    };
    let Some(mut reply_rx) = robj
        .probe_reply_rx
        .lock()
        .expect("probe reply lock poisoned")
        .take()
    else {
        state.put_relay_object(relayuuid, ou);
        return false;
    };

    let state = state.clone();
    let relayuuid = relayuuid.to_string();
    let ou = ou.to_string();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = out.closed() => break,
                reply = reply_rx.recv() => match reply {
                    Some(reply) => {
                        if out.send(Ok(reply)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        let relays = state.relays.read().expect("relay map lock poisoned");
        if let Some(robj) = relays.get(&ou).and_then(|m| m.get(&relayuuid)) {
            *robj
                .probe_reply_rx
                .lock()
                .expect("probe reply lock poisoned") = Some(reply_rx);
        }
        drop(relays);
        state.put_relay_object(&relayuuid, &ou);
    });
    true
}

/// Same as [`bind_probe_sender`] for the survey-request channel.
fn bind_survey_sender(
    state: &Arc<ServiceState>,
    relayuuid: &str,
    ou: &str,
    out: mpsc::Sender<Result<PeerSurveyRequest, Status>>,
) -> bool {
    let Some(robj) = state.get_relay_object(relayuuid, ou) else {
        return false;
    };
    let Some(mut request_rx) = robj
        .survey_request_rx
        .lock()
        .expect("survey request lock poisoned")
        .take()
    else {
        state.put_relay_object(relayuuid, ou);
        return false;
    };

    let state = state.clone();
    let relayuuid = relayuuid.to_string();
    let ou = ou.to_string();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = out.closed() => break,
                req = request_rx.recv() => match req {
                    Some(req) => {
                        if out.send(Ok(req)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        let relays = state.relays.read().expect("relay map lock poisoned");
        if let Some(robj) = relays.get(&ou).and_then(|m| m.get(&relayuuid)) {
            *robj
                .survey_request_rx
                .lock()
                .expect("survey request lock poisoned") = Some(request_rx);
        }
        drop(relays);
        state.put_relay_object(&relayuuid, &ou);
    });
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_inserts_then_refreshes() {
        let (svc, _rx) = PeerService::new("10.0.0.1".to_string());
        svc.inner.handle_hello("relay-1", "10.0.0.2", "org-a");
        assert_eq!(svc.relay_count("org-a"), 1);

        // second hello refreshes, it must not duplicate
        svc.inner.handle_hello("relay-1", "10.0.0.2", "org-a");
        assert_eq!(svc.relay_count("org-a"), 1);

        svc.inner.handle_hello("relay-2", "10.0.0.3", "org-a");
        assert_eq!(svc.relay_count("org-a"), 2);
        assert_eq!(svc.relay_count("org-b"), 0);
    }

    #[test]
    fn survey_reply_is_idempotent() {
        let (svc, _rx) = PeerService::new("10.0.0.1".to_string());
        svc.inner.handle_hello("relay-1", "10.0.0.2", "org-a");
        svc.inner.handle_hello("relay-2", "10.0.0.3", "org-a");

        let key = survey_cache_key("c1.connector", "relay-2", "org-a");
        svc.inner
            .survey_cache
            .insert(key.clone(), "10.0.0.3".to_string(), SURVEY_CACHE_EXPIRY);
        svc.inner
            .survey_cache
            .insert(key, "10.0.0.3".to_string(), SURVEY_CACHE_EXPIRY);

        // a cached reply from relay-2 answers relay-1's probe exactly once
        assert!(svc
            .inner
            .try_response_from_cache("relay-1", "c1.connector", "org-a"));

        let robj = svc.inner.get_relay_object("relay-1", "org-a").unwrap();
        let mut rx = robj.probe_reply_rx.lock().unwrap().take().unwrap();
        let resp = rx.try_recv().unwrap();
        assert_eq!(resp.items.len(), 1);
        assert_eq!(resp.items[0].relayuuid, "relay-2");
        assert_eq!(resp.items[0].relayip, "10.0.0.3");
    }

    #[test]
    fn cache_miss_reports_no_candidates() {
        let (svc, _rx) = PeerService::new("10.0.0.1".to_string());
        svc.inner.handle_hello("relay-1", "10.0.0.2", "org-a");
        assert!(!svc
            .inner
            .try_response_from_cache("relay-1", "c1.connector", "org-a"));
    }
}
