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

use std::collections::HashSet;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use http::uri::Parts as UriParts;
use http::{Method, Uri};
use hyper::server::conn::Http;
use hyper::service::service_fn;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::server::TlsStream;
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, error, info};

use protocol::{HandshakeMessage, JOIN_STRING};

use crate::pool::DialinPool;
use crate::router::{process_relay_request, ConnInfo, RelayContext};
use crate::tlsutil;
use crate::{Error, Result, DEFAULT_TIMEOUT, MUX_TIMEOUT};

const HANDSHAKE_BODY_LIMIT: usize = 126_976;

/// Whether a server block terminates user traffic or parks tunnels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerKind {
    Relay,
    Dialin,
}

/// One SNI-addressed virtual server sharing the TLS listener.
pub struct ServerBlock {
    pub kind: ServerKind,
    pub name: String,
    pub server_name: String,
    pub tls: Arc<rustls::ServerConfig>,
}

/// Active dialin connections by remote address, to reject duplicates from
/// the same source. Clone is shallow.
#[derive(Clone)]
pub struct ConnectionRegistry {
    conns: Arc<RwLock<HashSet<String>>>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        ConnectionRegistry {
            conns: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    pub fn contains(&self, remote_addr: &str) -> bool {
        self.conns
            .read()
            .expect("registry lock poisoned")
            .contains(remote_addr)
    }

    pub fn add(&self, remote_addr: String) {
        self.conns
            .write()
            .expect("registry lock poisoned")
            .insert(remote_addr);
    }

    pub fn remove(&self, remote_addr: &str) {
        self.conns
            .write()
            .expect("registry lock poisoned")
            .remove(remote_addr);
    }

    /// Disconnect hook for the dialin pool: drops the registry entry named
    /// by the pool key's remote-address component.
    pub fn disconnect_hook(&self) -> crate::pool::DisconnectHook {
        let registry = self.clone();
        Box::new(move |key: &str| {
            let parts: Vec<&str> = key.splitn(3, JOIN_STRING).collect();
            if let Some(remote_addr) = parts.get(2) {
                registry.remove(remote_addr);
            } else {
                error!(%key, "disconnect callback got an invalid key");
            }
        })
    }
}

/// The TLS front of the relay. One TCP listener; the ClientHello's SNI
/// picks a server block, whose certificate finishes the handshake.
pub struct RelayServer {
    pub blocks: Vec<Arc<ServerBlock>>,
    pub pool: Arc<DialinPool>,
    pub relay_ctx: Arc<RelayContext>,
    pub connections: ConnectionRegistry,
}

/// True when the SNI matches the block's server name, which may carry a
/// leading wildcard label.
pub fn server_name_matches(pattern: &str, sni: &str) -> bool {
    if pattern == sni {
        return true;
    }
    if let Some(suffix) = pattern.strip_prefix('*') {
        return sni.len() > suffix.len() && sni.ends_with(suffix);
    }
    false
}

impl RelayServer {
    /// Accept loop for one listen address.
    pub async fn listen(self: Arc<Self>, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Accept loop over a pre-bound listener.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!(addr = ?listener.local_addr(), servers = self.blocks.len(), "starting listener");

        loop {
            let (tcp, remote) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "accept failed");
                    continue;
                }
            };
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(tcp, remote).await {
                    debug!(error = %e, %remote, "connection ended");
                }
            });
        }
    }

    async fn handle_connection(self: Arc<Self>, tcp: TcpStream, remote: SocketAddr) -> Result<()> {
        let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), tcp);
        let start = tokio::time::timeout(MUX_TIMEOUT, acceptor)
            .await
            .map_err(|_| Error::Tunnel("timed out waiting for client hello".to_string()))?
            .map_err(|e| Error::Tunnel(format!("bad client hello: {e}")))?;

        let sni = start
            .client_hello()
            .server_name()
            .unwrap_or_default()
            .to_string();

        let Some(block) = self
            .blocks
            .iter()
            .find(|b| server_name_matches(&b.server_name, &sni))
            .cloned()
        else {
            error!(%sni, %remote, "connection for an unknown server name");
            return Err(Error::Tunnel(format!("unknown server name {sni}")));
        };

        let stream = start
            .into_stream(block.tls.clone())
            .await
            .map_err(|e| Error::Tunnel(format!("tls handshake failed: {e}")))?;

        match block.kind {
            ServerKind::Relay => self.serve_user_conn(stream, sni, remote).await,
            ServerKind::Dialin => self.serve_dialin_conn(stream, sni, remote).await,
        }
    }

    /// A user-facing connection: serve HTTP/1.1 requests, each routed by
    /// the session router.
    async fn serve_user_conn(
        &self,
        stream: TlsStream<TcpStream>,
        sni: String,
        remote: SocketAddr,
    ) -> Result<()> {
        let (_, server_conn) = stream.get_ref();
        let certs = server_conn
            .peer_certificates()
            .map(|c| c.to_vec())
            .unwrap_or_default();

        let conn = ConnInfo {
            sni,
            peer_cn: tlsutil::peer_common_name(&certs).unwrap_or_default(),
            cert_issue_epoch: tlsutil::peer_cert_issue_epoch(&certs).unwrap_or(0),
            remote_addr: remote.to_string(),
        };
        debug!(sni = %conn.sni, peer = %conn.peer_cn, "serving user connection");

        let ctx = self.relay_ctx.clone();
        let service = service_fn(move |req| {
            let ctx = ctx.clone();
            let conn = conn.clone();
            async move { Ok::<_, Infallible>(process_relay_request(ctx, conn, req).await) }
        });

        Http::new()
            .serve_connection(stream, service)
            .with_upgrades()
            .await
            .map_err(|e| Error::Tunnel(format!("user connection failed: {e}")))
    }

    /// A cluster-facing connection: register it in the dialin pool and
    /// complete the CONNECT handshake.
    async fn serve_dialin_conn(
        &self,
        stream: TlsStream<TcpStream>,
        sni: String,
        remote: SocketAddr,
    ) -> Result<()> {
        let remote_addr = remote.to_string();
        let (_, server_conn) = stream.get_ref();
        let certs = server_conn
            .peer_certificates()
            .map(|c| c.to_vec())
            .unwrap_or_default();
        let peer_id = tlsutil::peer_common_name(&certs)?;

        if self.connections.contains(&remote_addr) {
            return Err(Error::Tunnel(format!(
                "connection already exists from {remote_addr}"
            )));
        }
        self.connections.add(remote_addr.clone());

        let key = match self.pool.add_conn(stream, &peer_id, &sni, &remote_addr).await {
            Ok(key) => key,
            Err(e) => {
                self.connections.remove(&remote_addr);
                return Err(e);
            }
        };

        if let Err(e) = send_dialin_handshake(&self.pool, &key).await {
            self.pool.delete_conn(&peer_id, &sni, &remote_addr);
            self.connections.remove(&remote_addr);
            return Err(e);
        }

        info!(%key, %sni, "dialin registered");
        Ok(())
    }
}

/// Authority-form URI for a CONNECT handshake on a pooled connection.
fn connect_uri(key: &str) -> Result<Uri> {
    let mut parts = UriParts::default();
    parts.authority = Some(
        key.parse()
            .map_err(|e| Error::Tunnel(format!("bad pool key authority: {e}")))?,
    );
    Uri::from_parts(parts).map_err(|e| Error::Tunnel(format!("bad connect uri: {e}")))
}

/// Sends the CONNECT handshake on a freshly pooled connection and verifies
/// the agent's JSON reply. Anything but a 200 with a handshake body is
/// fatal for the connection.
async fn send_dialin_handshake(pool: &Arc<DialinPool>, key: &str) -> Result<()> {
    let handshake = async {
        let sr = pool
            .client(key)
            .ok_or_else(|| Error::NoDialins(key.to_string()))?;
        let mut sr = sr
            .ready()
            .await
            .map_err(|e| Error::Tunnel(format!("connection not ready: {e}")))?;

        let req = http::Request::builder()
            .method(Method::CONNECT)
            .uri(connect_uri(key)?)
            .body(())
            .map_err(|e| Error::Tunnel(format!("handshake request creation failed: {e}")))?;

        let (resp, _) = sr
            .send_request(req, true)
            .map_err(|e| Error::Tunnel(format!("handshake send failed: {e}")))?;
        let resp = resp
            .await
            .map_err(|e| Error::Tunnel(format!("handshake failed: {e}")))?;

        if resp.status() != http::StatusCode::OK {
            return Err(Error::Tunnel(format!(
                "dialin handshake response is not 200 OK: {}",
                resp.status()
            )));
        }

        let mut body = resp.into_body();
        let mut buf = Vec::new();
        while let Some(chunk) = body.data().await {
            let chunk = chunk.map_err(|e| Error::Tunnel(format!("handshake body failed: {e}")))?;
            buf.extend_from_slice(&chunk);
            let _ = body.flow_control().release_capacity(chunk.len());
            if buf.len() > HANDSHAKE_BODY_LIMIT {
                return Err(Error::Tunnel("handshake body too large".to_string()));
            }
        }
        if buf.is_empty() {
            return Err(Error::Tunnel("handshake body is empty".to_string()));
        }

        let msg: HandshakeMessage = serde_json::from_slice(&buf)
            .map_err(|e| Error::Tunnel(format!("handshake failed to parse json: {e}")))?;
        info!(service = %msg.service_name, protocol = %msg.protocol, "received handshake message");
        Ok(())
    };

    tokio::time::timeout(DEFAULT_TIMEOUT, handshake)
        .await
        .map_err(|_| Error::Tunnel("handshake timed out".to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_server_name_matching() {
        assert!(server_name_matches(
            "*.user.relay.local",
            "c1.user.relay.local"
        ));
        assert!(server_name_matches(
            "*.connector.relay.local",
            "long-cluster-id.connector.relay.local"
        ));
        assert!(server_name_matches("peering.relay.local", "peering.relay.local"));

        assert!(!server_name_matches("*.user.relay.local", ".user.relay.local"));
        assert!(!server_name_matches("*.user.relay.local", "user.relay.local"));
        assert!(!server_name_matches(
            "*.user.relay.local",
            "c1.connector.relay.local"
        ));
    }

    #[test]
    fn connect_uri_is_authority_form() {
        let uri = connect_uri("c1.connector.relay.local--agent--10.0.0.9:41000").unwrap();
        assert!(uri.scheme().is_none());
        assert!(uri.path_and_query().is_none());
        assert_eq!(
            uri.authority().unwrap().as_str(),
            "c1.connector.relay.local--agent--10.0.0.9:41000"
        );
    }
}
