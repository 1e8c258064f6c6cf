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

use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, error, info};

use protocol::JOIN_STRING;

use crate::Error;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// One registered tunnel connection. The h2 send handle is cloned out to
/// open new proxy streams; the ping channel reaches the heartbeat task that
/// owns the connection's ping/pong handle.
#[derive(Clone)]
pub struct ConnHandle {
    pub send_request: h2::client::SendRequest<Bytes>,
    pub peer_id: String,
    pub remote_addr: String,
    ping_tx: mpsc::Sender<oneshot::Sender<bool>>,
    driver: AbortHandle,
}

impl ConnHandle {
    /// Round-trips a ping on the underlying connection. False when the
    /// connection is dead or the ping timed out.
    pub async fn ping(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.ping_tx.send(tx).await.is_err() {
            return false;
        }
        matches!(
            tokio::time::timeout(PING_TIMEOUT, rx).await,
            Ok(Ok(true))
        )
    }
}

struct DialinConnector {
    // sorted list of `peerID--remoteAddr` entries under one SNI
    conn_keys: Vec<String>,
    lb_index: usize,
}

#[derive(Default)]
struct PoolInner {
    // key is `sni--peerID--remoteAddr`
    conns: HashMap<String, ConnHandle>,
    // secondary index per dialin SNI
    connectors: HashMap<String, DialinConnector>,
}

/// Callback invoked with the pool key whenever a connection leaves the
/// pool, however it died.
pub type DisconnectHook = Box<dyn Fn(&str) + Send + Sync>;

/// Registry of live tunnel connections keyed by cluster identity. Both maps
/// are guarded by one lock and kept mutually consistent on every insert and
/// delete; the lock is never held across an await.
pub struct DialinPool {
    inner: RwLock<PoolInner>,
    on_disconnect: Option<DisconnectHook>,
    // handed to connection drivers and heartbeats so they can evict their
    // own entry without keeping the pool alive
    weak_self: Weak<DialinPool>,
}

/// Pool occupancy reported by the ops endpoint.
#[derive(Debug, Serialize)]
pub struct DialinMetrics {
    pub dialinmetrics: Vec<DialinClusterMetric>,
    pub totalclusters: usize,
    pub totalconnections: usize,
    pub podname: String,
}

#[derive(Debug, Serialize)]
pub struct DialinClusterMetric {
    pub cluster: String,
    pub connections: usize,
}

pub fn pool_key(sni: &str, peer_id: &str, remote_addr: &str) -> String {
    format!("{sni}{JOIN_STRING}{peer_id}{JOIN_STRING}{remote_addr}")
}

fn connector_addr(peer_id: &str, remote_addr: &str) -> String {
    format!("{peer_id}{JOIN_STRING}{remote_addr}")
}

impl DialinPool {
    pub fn new(on_disconnect: Option<DisconnectHook>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| DialinPool {
            inner: RwLock::new(PoolInner::default()),
            on_disconnect,
            weak_self: weak_self.clone(),
        })
    }

    /// The URL proxy streams are issued against for a pool key.
    pub fn url(key: &str) -> String {
        format!("https://{key}")
    }

    /// Accepts a tunnel connection into the pool. Fails when an entry with
    /// the same key is present and still answers pings; a dead duplicate is
    /// replaced.
    pub async fn add_conn<S>(
        &self,
        io: S,
        peer_id: &str,
        sni: &str,
        remote_addr: &str,
    ) -> Result<String, Error>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let addr = connector_addr(peer_id, remote_addr);
        let key = pool_key(sni, peer_id, remote_addr);

        let existing = {
            let inner = self.inner.read().expect("pool lock poisoned");
            inner.conns.get(&key).cloned()
        };
        if let Some(existing) = existing {
            if existing.ping().await {
                return Err(Error::ConnectorExists(key));
            }
            self.remove_key(&key);
        }

        let (mut send_request, mut connection) = h2::client::handshake(io)
            .await
            .map_err(|e| Error::Tunnel(format!("h2 handshake failed: {e}")))?;
        let ping_pong = connection
            .ping_pong()
            .ok_or_else(|| Error::Tunnel("connection ping handle unavailable".to_string()))?;

        // drive the connection; its death is the MarkDead signal
        let pool = self.weak_self.clone();
        let driver_key = key.clone();
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(key = %driver_key, error = %e, "dialin connection closed");
            }
            if let Some(pool) = pool.upgrade() {
                pool.remove_key(&driver_key);
            }
        })
        .abort_handle();

        send_request = match send_request.ready().await {
            Ok(sr) => sr,
            Err(e) => {
                driver.abort();
                return Err(Error::Tunnel(format!("connection not ready: {e}")));
            }
        };

        let (ping_tx, ping_rx) = mpsc::channel(4);
        let handle = ConnHandle {
            send_request,
            peer_id: peer_id.to_string(),
            remote_addr: remote_addr.to_string(),
            ping_tx,
            driver,
        };

        {
            let mut inner = self.inner.write().expect("pool lock poisoned");
            inner.conns.insert(key.clone(), handle);

            let connector = inner
                .connectors
                .entry(sni.to_string())
                .or_insert_with(|| DialinConnector {
                    conn_keys: Vec::new(),
                    lb_index: 0,
                });
            match connector.conn_keys.binary_search(&addr) {
                Ok(_) => info!(%addr, "connector address already indexed"),
                Err(pos) => connector.conn_keys.insert(pos, addr.clone()),
            }
        }

        tokio::spawn(heartbeat(
            self.weak_self.clone(),
            key.clone(),
            ping_pong,
            ping_rx,
        ));

        info!(%addr, %key, "added dialin connection");
        Ok(key)
    }

    /// Round-robin pick of a live connector key for an SNI. The cursor is
    /// reset to zero whenever it runs past the list; this intentionally
    /// differs from a modulo after concurrent deletions.
    pub fn get_dialin_connector_key(&self, sni: &str) -> Result<String, Error> {
        let mut inner = self.inner.write().expect("pool lock poisoned");
        let PoolInner { conns, connectors } = &mut *inner;

        let connector = connectors
            .get_mut(sni)
            .ok_or_else(|| Error::NoDialins(sni.to_string()))?;
        let count = connector.conn_keys.len();
        if count == 0 {
            return Err(Error::NoDialins(sni.to_string()));
        }

        if connector.lb_index >= count {
            connector.lb_index = 0;
        }
        let key = format!(
            "{sni}{JOIN_STRING}{}",
            connector.conn_keys[connector.lb_index]
        );
        connector.lb_index += 1;

        if !conns.contains_key(&key) {
            // raced with an eviction, take any live key under this SNI
            for addr in &connector.conn_keys {
                let candidate = format!("{sni}{JOIN_STRING}{addr}");
                if conns.contains_key(&candidate) {
                    return Ok(candidate);
                }
            }
            return Err(Error::NoDialins(sni.to_string()));
        }

        Ok(key)
    }

    /// True while a cached key still points at a pooled connection.
    pub fn check_dialin_key_exist(&self, key: &str) -> bool {
        let inner = self.inner.read().expect("pool lock poisoned");
        inner.conns.contains_key(key)
    }

    /// Number of indexed connectors for an SNI.
    pub fn connector_count(&self, sni: &str) -> usize {
        let inner = self.inner.read().expect("pool lock poisoned");
        inner
            .connectors
            .get(sni)
            .map(|c| c.conn_keys.len())
            .unwrap_or(0)
    }

    /// Clones out the h2 handle for a pooled connection.
    pub fn client(&self, key: &str) -> Option<h2::client::SendRequest<Bytes>> {
        let inner = self.inner.read().expect("pool lock poisoned");
        inner.conns.get(key).map(|c| c.send_request.clone())
    }

    /// Removes a connection by its identity triple.
    pub fn delete_conn(&self, peer_id: &str, sni: &str, remote_addr: &str) {
        let addr = connector_addr(peer_id, remote_addr);
        let key = pool_key(sni, peer_id, remote_addr);

        let removed = {
            let mut inner = self.inner.write().expect("pool lock poisoned");
            let removed = match inner.conns.remove(&key) {
                Some(handle) => {
                    handle.driver.abort();
                    info!(%key, "dialin close");
                    true
                }
                None => {
                    error!(%key, "did not find key in pool");
                    false
                }
            };
            delete_connector_key(&mut inner, sni, &addr);
            removed
        };
        if removed {
            if let Some(hook) = &self.on_disconnect {
                hook(&key);
            }
        }
    }

    /// Removes a connection by its pool key. Invoked by the connection
    /// driver when the transport breaks and by failed liveness checks.
    pub fn remove_key(&self, key: &str) {
        let removed = {
            let mut inner = self.inner.write().expect("pool lock poisoned");
            let removed = match inner.conns.remove(key) {
                Some(handle) => {
                    handle.driver.abort();
                    info!(%key, "dialin close");
                    true
                }
                None => false,
            };

            let parts: Vec<&str> = key.splitn(3, JOIN_STRING).collect();
            if parts.len() == 3 {
                let sni = parts[0].to_string();
                let addr = connector_addr(parts[1], parts[2]);
                if !delete_connector_key(&mut inner, &sni, &addr) {
                    debug!(%key, "connector key already deleted");
                }
            } else {
                error!(%key, "invalid key in remove");
            }
            removed
        };
        if removed {
            if let Some(hook) = &self.on_disconnect {
                hook(key);
            }
        }
    }

    pub fn snapshot(&self, podname: String) -> DialinMetrics {
        let inner = self.inner.read().expect("pool lock poisoned");
        let mut metrics = DialinMetrics {
            dialinmetrics: Vec::with_capacity(inner.connectors.len()),
            totalclusters: 0,
            totalconnections: 0,
            podname,
        };
        for (sni, connector) in &inner.connectors {
            metrics.totalclusters += 1;
            metrics.totalconnections += connector.conn_keys.len();
            metrics.dialinmetrics.push(DialinClusterMetric {
                cluster: sni.clone(),
                connections: connector.conn_keys.len(),
            });
        }
        metrics
    }
}

/// Removes a connector address from the secondary index. The SNI entry goes
/// away with its last address.
fn delete_connector_key(inner: &mut PoolInner, sni: &str, addr: &str) -> bool {
    if let Some(connector) = inner.connectors.get_mut(sni) {
        if let Ok(pos) = connector.conn_keys.binary_search(&addr.to_string()) {
            connector.conn_keys.remove(pos);
            info!(%addr, "deleted connection from dialin pool");
            if connector.conn_keys.is_empty() {
                info!(%sni, "deleted last connection for sni");
                inner.connectors.remove(sni);
            }
            return true;
        }
    }
    false
}

/// Keeps a pooled connection alive and serves on-demand liveness probes.
/// The ping/pong handle lives here; a failed ping evicts the entry.
async fn heartbeat(
    pool: Weak<DialinPool>,
    key: String,
    mut ping_pong: h2::PingPong,
    mut ping_rx: mpsc::Receiver<oneshot::Sender<bool>>,
) {
    let mut tick = tokio::time::interval(HEARTBEAT_INTERVAL);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                match tokio::time::timeout(PING_TIMEOUT, ping_pong.ping(h2::Ping::opaque())).await {
                    Ok(Ok(_)) => debug!(%key, "dialin keep-alive ping success"),
                    _ => {
                        debug!(%key, "dialin keep-alive ping failed");
                        if let Some(pool) = pool.upgrade() {
                            pool.remove_key(&key);
                        }
                        return;
                    }
                }
            }
            req = ping_rx.recv() => match req {
                Some(reply) => {
                    let alive = matches!(
                        tokio::time::timeout(PING_TIMEOUT, ping_pong.ping(h2::Ping::opaque())).await,
                        Ok(Ok(_))
                    );
                    let _ = reply.send(alive);
                    if !alive {
                        if let Some(pool) = pool.upgrade() {
                            pool.remove_key(&key);
                        }
                        return;
                    }
                }
                None => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn h2_pair() -> tokio::io::DuplexStream {
        let (client, server) = tokio::io::duplex(16 * 1024);
        tokio::spawn(async move {
            if let Ok(mut conn) = h2::server::handshake(server).await {
                while let Some(req) = conn.accept().await {
                    if req.is_err() {
                        break;
                    }
                }
            }
        });
        client
    }

    #[tokio::test]
    async fn add_then_lookup() {
        let pool = DialinPool::new(None);
        let io = h2_pair().await;
        let key = pool
            .add_conn(io, "agent-cn", "c1.connector.relay.local", "10.0.0.9:41000")
            .await
            .unwrap();

        assert!(pool.check_dialin_key_exist(&key));
        assert_eq!(pool.connector_count("c1.connector.relay.local"), 1);

        let picked = pool
            .get_dialin_connector_key("c1.connector.relay.local")
            .unwrap();
        assert_eq!(picked, key);
        assert!(pool.check_dialin_key_exist(&picked));
    }

    #[tokio::test]
    async fn duplicate_live_connection_is_rejected() {
        let pool = DialinPool::new(None);
        let io = h2_pair().await;
        pool.add_conn(io, "agent-cn", "c1.connector", "10.0.0.9:41000")
            .await
            .unwrap();

        let io = h2_pair().await;
        let err = pool
            .add_conn(io, "agent-cn", "c1.connector", "10.0.0.9:41000")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConnectorExists(_)));
        assert_eq!(pool.connector_count("c1.connector"), 1);
    }

    #[tokio::test]
    async fn round_robin_visits_each_key_once() {
        let pool = DialinPool::new(None);
        let mut keys = Vec::new();
        for port in [41000, 41001, 41002] {
            let io = h2_pair().await;
            keys.push(
                pool.add_conn(io, "agent-cn", "c1.connector", &format!("10.0.0.9:{port}"))
                    .await
                    .unwrap(),
            );
        }

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(pool.get_dialin_connector_key("c1.connector").unwrap());
        }
        let mut sorted = seen.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), 3, "each key visited exactly once: {seen:?}");

        // the wheel comes back around
        let again = pool.get_dialin_connector_key("c1.connector").unwrap();
        assert_eq!(again, seen[0]);
    }

    #[tokio::test]
    async fn deleting_last_connector_removes_sni() {
        let pool = DialinPool::new(None);
        let io = h2_pair().await;
        pool.add_conn(io, "agent-cn", "c1.connector", "10.0.0.9:41000")
            .await
            .unwrap();

        pool.delete_conn("agent-cn", "c1.connector", "10.0.0.9:41000");
        assert_eq!(pool.connector_count("c1.connector"), 0);
        assert!(matches!(
            pool.get_dialin_connector_key("c1.connector"),
            Err(Error::NoDialins(_))
        ));
    }

    #[tokio::test]
    async fn remove_key_keeps_index_consistent() {
        let pool = DialinPool::new(None);
        let io = h2_pair().await;
        let k1 = pool
            .add_conn(io, "agent-cn", "c1.connector", "10.0.0.9:41000")
            .await
            .unwrap();
        let io = h2_pair().await;
        let k2 = pool
            .add_conn(io, "agent-cn", "c1.connector", "10.0.0.9:41001")
            .await
            .unwrap();

        pool.remove_key(&k1);
        assert!(!pool.check_dialin_key_exist(&k1));
        assert!(pool.check_dialin_key_exist(&k2));
        assert_eq!(pool.connector_count("c1.connector"), 1);

        // round robin only ever lands on the surviving key now
        for _ in 0..4 {
            assert_eq!(pool.get_dialin_connector_key("c1.connector").unwrap(), k2);
        }
    }
}
