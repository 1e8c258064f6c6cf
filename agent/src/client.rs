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

// The tunnel client pool. Each TunnelClient owns one physical connection:
// dial out (optionally through an egress CONNECT proxy), wrap in TLS with
// a client certificate, then serve HTTP/2 on top of it so the relay can
// open streams back towards the cluster. A fixed base pool is kept open
// and an elastic set of scaled clients comes and goes with load.

use std::io::Cursor;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{Method, Response, StatusCode};
use rustls::ClientConfig as RustlsClientConfig;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info, warn};

use protocol::{read_control_message, HandshakeMessage, ACTION_PROXY, HEADER_ERROR};

use crate::backoff::{BackoffConfig, ExponentialBackoff};
use crate::config::AgentConfig;
use crate::proxy::service_proxy;
use crate::{
    Error, Result, HEALING_INTERVAL, MAX_SCALE_MULTIPLIER, SCALING_STREAMS_RATE_THRESHOLD,
    SCALING_STREAMS_THRESHOLD,
};

const DIAL_TIMEOUT: Duration = Duration::from_secs(60);
const REDIAL_DELAY: Duration = Duration::from_secs(2);
const SCALE_SWEEP_INTERVAL: Duration = Duration::from_secs(300);
const SCALE_SAMPLE_SPACING_SECS: i64 = 4;

/// State shared by every client of one relay network.
pub struct NetworkState {
    pub config: AgentConfig,
    tls: Arc<RustlsClientConfig>,
    scale_tx: mpsc::Sender<()>,
}

struct Sample {
    at: Instant,
    streams: i64,
}

/// One physical tunnel connection and its serve loop.
pub struct TunnelClient {
    network: Arc<NetworkState>,
    is_scaled: bool,
    streams: AtomicI64,
    sample: Mutex<Sample>,
    server_err: Mutex<Option<String>>,
}

/// Starts the base pool of tunnel clients and the scaling controller for
/// one relay network. Returns once everything is spawned; the clients keep
/// redialling for the life of the process.
pub fn start_network(config: AgentConfig) -> Result<()> {
    let tls = client_tls(&config)?;
    let (scale_tx, scale_rx) = mpsc::channel(5);
    let network = Arc::new(NetworkState {
        config,
        tls,
        scale_tx,
    });

    for _ in 0..network.config.max_dials {
        let client = Arc::new(TunnelClient::new(network.clone(), false));
        tokio::spawn(client.run(None));
    }

    tokio::spawn(run_client_scaling(network, scale_rx));
    Ok(())
}

fn client_tls(config: &AgentConfig) -> Result<Arc<RustlsClientConfig>> {
    let certs = rustls_pemfile::certs(&mut Cursor::new(&config.client_cert))?
        .into_iter()
        .map(rustls::Certificate)
        .collect::<Vec<_>>();
    if certs.is_empty() {
        return Err(Error::InvalidConfig("no client certificate in pem".to_string()));
    }

    let mut key = None;
    let mut reader = Cursor::new(&config.client_key);
    while let Some(item) = rustls_pemfile::read_one(&mut reader)? {
        match item {
            rustls_pemfile::Item::PKCS8Key(k)
            | rustls_pemfile::Item::RSAKey(k)
            | rustls_pemfile::Item::ECKey(k) => {
                key = Some(rustls::PrivateKey(k));
                break;
            }
            _ => continue,
        }
    }
    let key = key.ok_or_else(|| Error::InvalidConfig("no private key in pem".to_string()))?;

    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut Cursor::new(&config.root_ca))? {
        roots
            .add(&rustls::Certificate(cert))
            .map_err(|e| Error::InvalidConfig(format!("bad root certificate: {e}")))?;
    }

    let mut tls = RustlsClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)?;
    // the session is a raw stream multiplexer, never negotiated h2
    tls.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(tls))
}

impl TunnelClient {
    pub fn new(network: Arc<NetworkState>, is_scaled: bool) -> Self {
        TunnelClient {
            network,
            is_scaled,
            streams: AtomicI64::new(0),
            sample: Mutex::new(Sample {
                at: Instant::now(),
                streams: 0,
            }),
            server_err: Mutex::new(None),
        }
    }

    pub fn in_flight(&self) -> i64 {
        self.streams.load(Ordering::Relaxed)
    }

    pub fn idle_for(&self) -> Duration {
        self.sample
            .lock()
            .map(|s| s.at.elapsed())
            .unwrap_or_default()
    }

    /// Supervised connect-serve loop. Every exit redials after a short
    /// delay; only a close signal (idle scaled client) or process shutdown
    /// ends it.
    pub async fn run(self: Arc<Self>, mut close_rx: Option<watch::Receiver<bool>>) {
        let mut last_disconnect: Option<Instant> = None;
        loop {
            let serve = Self::connect_and_serve(&self);
            tokio::pin!(serve);

            let result = match close_rx.as_mut() {
                Some(rx) => {
                    tokio::select! {
                        res = &mut serve => Some(res),
                        _ = rx.changed() => None,
                    }
                }
                None => Some(serve.await),
            };

            let Some(result) = result else {
                info!("close connection due to idle streams");
                return;
            };

            match result {
                Ok(()) => info!(addr = %self.network.config.server_addr, "client disconnected"),
                Err(e) => warn!(error = %e, addr = %self.network.config.server_addr, "tunnel client failed"),
            }

            // two disconnects within a few seconds means the link is being
            // cut on the other side, not a clean shutdown
            let now = Instant::now();
            if let Some(last) = last_disconnect {
                if now.duration_since(last) < Duration::from_secs(5) {
                    warn!("connection is being cut");
                }
            }
            last_disconnect = Some(now);

            tokio::time::sleep(REDIAL_DELAY).await;
        }
    }

    async fn connect_and_serve(client: &Arc<Self>) -> Result<()> {
        let stream = client.dial_with_backoff().await?;
        info!(addr = %client.network.config.server_addr, "dial success");

        let mut conn = h2::server::handshake(stream)
            .await
            .map_err(|e| Error::Tunnel(format!("h2 handshake failed: {e}")))?;

        while let Some(accepted) = conn.accept().await {
            let (req, respond) = accepted.map_err(|e| Error::Tunnel(format!("accept failed: {e}")))?;
            let stream_client = client.clone();
            tokio::spawn(async move { stream_client.handle_stream(req, respond).await });
        }

        if let Some(err) = client
            .server_err
            .lock()
            .ok()
            .and_then(|mut e| e.take())
        {
            return Err(Error::Tunnel(format!("server error: {err}")));
        }
        Ok(())
    }

    /// Dials the relay, retrying with exponential backoff until the backoff
    /// budget is spent.
    async fn dial_with_backoff(&self) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
        let mut backoff = ExponentialBackoff::new(BackoffConfig::default());
        loop {
            match self.dial().await {
                Ok(stream) => return Ok(stream),
                Err(e) => match backoff.next_backoff() {
                    Some(delay) => {
                        info!(error = %e, ?delay, addr = %self.network.config.server_addr, "dial backoff");
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(Error::BackoffExhausted(e.to_string())),
                },
            }
        }
    }

    async fn dial(&self) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
        let config = &self.network.config;
        let dial_addr = config
            .relay_address
            .as_deref()
            .unwrap_or(config.server_addr.as_str());

        let mut tcp = match &config.egress_proxy {
            None => tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(dial_addr))
                .await
                .map_err(|_| Error::Dial(format!("dial {dial_addr} timed out")))?
                .map_err(|e| Error::Dial(e.to_string()))?,
            Some(proxy) => {
                let mut stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(proxy))
                    .await
                    .map_err(|_| Error::Dial(format!("dial proxy {proxy} timed out")))?
                    .map_err(|e| Error::Dial(e.to_string()))?;
                self.proxy_connect(&mut stream, &config.server_addr).await?;
                stream
            }
        };
        tcp.set_nodelay(true)
            .map_err(|e| Error::Dial(e.to_string()))?;

        let server_name = rustls::ServerName::try_from(config.server_name.as_str())
            .map_err(|e| Error::Dial(format!("invalid server name: {e}")))?;
        TlsConnector::from(self.network.tls.clone())
            .connect(server_name, tcp)
            .await
            .map_err(|e| Error::Dial(format!("tls handshake failed: {e}")))
    }

    /// CONNECT exchange with the egress forward proxy.
    async fn proxy_connect(&self, stream: &mut TcpStream, target: &str) -> Result<()> {
        let mut header = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
        if let Some(auth) = &self.network.config.egress_proxy_auth {
            header.push_str(&format!("Proxy-Authorization: {auth}\r\n"));
        }
        header.push_str("Connection: Keep-Alive\r\n\r\n");
        stream
            .write_all(header.as_bytes())
            .await
            .map_err(|e| Error::Dial(format!("proxy write failed: {e}")))?;

        let mut response = Vec::new();
        let mut byte = [0u8; 1];
        while !response.ends_with(b"\r\n\r\n") {
            if response.len() > 8192 {
                return Err(Error::Dial("oversized proxy response".to_string()));
            }
            let n = stream
                .read(&mut byte)
                .await
                .map_err(|e| Error::Dial(format!("proxy read failed: {e}")))?;
            if n == 0 {
                return Err(Error::Dial("proxy closed during connect".to_string()));
            }
            response.push(byte[0]);
        }

        let head = String::from_utf8_lossy(&response);
        if !head.starts_with("HTTP/1.") || !head.contains(" 200") {
            return Err(Error::Dial(format!(
                "proxy refused connect: {}",
                head.lines().next().unwrap_or_default()
            )));
        }
        debug!("proxy dialout success");
        Ok(())
    }

    /// One inbound stream from the relay. CONNECT is the handshake; PUT
    /// carries a proxied byte stream described by its control message.
    async fn handle_stream(
        self: Arc<Self>,
        req: http::Request<h2::RecvStream>,
        mut respond: h2::server::SendResponse<Bytes>,
    ) {
        if req.method() == Method::CONNECT {
            if let Some(err) = req.headers().get(HEADER_ERROR) {
                let err = String::from_utf8_lossy(err.as_bytes()).to_string();
                warn!(error = %err, "handshake error from server");
                if let Ok(mut server_err) = self.server_err.lock() {
                    *server_err = Some(err);
                }
                return;
            }
            self.handle_handshake(respond);
            return;
        }

        let _guard = StreamGuard::enter(&self.streams);
        self.sample_scaling();

        let msg = match read_control_message(req.headers(), "") {
            Ok(msg) => msg,
            Err(e) => {
                error!(error = %e, "read control message failed");
                let mut resp = Response::new(());
                *resp.status_mut() = StatusCode::BAD_REQUEST;
                let _ = respond.send_response(resp, true);
                return;
            }
        };

        if msg.action != ACTION_PROXY {
            warn!(action = %msg.action, "unknown action");
            let mut resp = Response::new(());
            *resp.status_mut() = StatusCode::BAD_REQUEST;
            let _ = respond.send_response(resp, true);
            return;
        }

        debug!(
            host = %msg.forwarded_host,
            service = %msg.forwarded_service,
            streams = self.in_flight(),
            "handle proxy action"
        );
        service_proxy(&self.network.config.upstream, req.into_body(), respond).await;
    }

    fn handle_handshake(&self, mut respond: h2::server::SendResponse<Bytes>) {
        let config = &self.network.config;
        let host = config
            .server_addr
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(config.server_addr.as_str());
        let msg = HandshakeMessage {
            service_name: config.service_name.clone(),
            protocol: "https".to_string(),
            host: host.to_string(),
        };

        let body = match serde_json::to_vec(&msg) {
            Ok(body) => body,
            Err(e) => {
                error!(error = %e, "handshake encode failed");
                return;
            }
        };

        info!("answering tunnel handshake");
        match respond.send_response(Response::new(()), false) {
            Ok(mut stream) => {
                if let Err(e) = stream.send_data(Bytes::from(body), true) {
                    error!(error = %e, "handshake send failed");
                }
            }
            Err(e) => error!(error = %e, "handshake response failed"),
        }
    }

    /// Signals the scaling controller when concurrent streams or the
    /// stream arrival rate run hot. Sampled at multi-second spacing so a
    /// burst is measured, not every request.
    fn sample_scaling(&self) {
        let current = self.in_flight();
        let now = Instant::now();
        let Ok(mut sample) = self.sample.lock() else {
            return;
        };

        let secs = now.duration_since(sample.at).as_secs() as i64;
        if secs < SCALE_SAMPLE_SPACING_SECS {
            return;
        }

        if !self.is_scaled {
            if current > SCALING_STREAMS_THRESHOLD {
                let _ = self.network.scale_tx.try_send(());
            } else if current > sample.streams
                && (current - sample.streams) / secs > SCALING_STREAMS_RATE_THRESHOLD
            {
                let _ = self.network.scale_tx.try_send(());
            }
        }
        sample.at = now;
        sample.streams = current;
    }
}

struct StreamGuard<'a> {
    streams: &'a AtomicI64,
}

impl<'a> StreamGuard<'a> {
    fn enter(streams: &'a AtomicI64) -> Self {
        streams.fetch_add(1, Ordering::SeqCst);
        StreamGuard { streams }
    }
}

impl Drop for StreamGuard<'_> {
    fn drop(&mut self) {
        self.streams.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Owns the elastic client set: spawns a scaled client per scale-up signal
/// up to the cap, and closes scaled clients that sat idle through a sweep.
async fn run_client_scaling(network: Arc<NetworkState>, mut scale_rx: mpsc::Receiver<()>) {
    let mut scaled: Vec<(Arc<TunnelClient>, watch::Sender<bool>)> = Vec::new();
    let max_scaled = network.config.max_dials * MAX_SCALE_MULTIPLIER;

    loop {
        tokio::select! {
            signal = scale_rx.recv() => {
                if signal.is_none() {
                    return;
                }
                if scaled.len() < max_scaled {
                    let client = Arc::new(TunnelClient::new(network.clone(), true));
                    let (close_tx, close_rx) = watch::channel(false);
                    tokio::spawn(client.clone().run(Some(close_rx)));
                    scaled.push((client, close_tx));
                    info!(total_scaled = scaled.len(), "scale client signal");
                }
            }
            _ = tokio::time::sleep(SCALE_SWEEP_INTERVAL) => {
                scaled.retain(|(client, close_tx)| {
                    if client.in_flight() <= 0 && client.idle_for() >= HEALING_INTERVAL {
                        let _ = close_tx.send(true);
                        false
                    } else {
                        true
                    }
                });
                info!(total_scaled = scaled.len(), "scaled client sweep");
            }
        }
    }
}
