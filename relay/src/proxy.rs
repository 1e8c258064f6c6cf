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

use bytes::Bytes;
use futures::future::poll_fn;
use http::Method;
use hyper::upgrade::OnUpgrade;
use hyper::{Body, Request, Response};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixListener, UnixStream};
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info};

use protocol::{
    write_to_header, ControlMessage, DialinFrame, ACTION_PROXY, DIALIN_FRAME_SIZE,
};

use crate::pool::DialinPool;
use crate::{Error, Result, DEFAULT_TIMEOUT, IDLE_TIMEOUT, UNIX_SOCKET_PREFIX};

/// Path of the stitching unix socket for a dialin server name.
pub fn unix_socket_path(server_name: &str) -> String {
    format!("{UNIX_SOCKET_PREFIX}{}", server_name.replace('*', "star"))
}

/// Sends a whole buffer on an h2 stream, waiting for flow-control capacity
/// chunk by chunk.
pub async fn h2_send_all(stream: &mut h2::SendStream<Bytes>, mut data: Bytes) -> Result<()> {
    while !data.is_empty() {
        stream.reserve_capacity(data.len());
        let granted = poll_fn(|cx| stream.poll_capacity(cx))
            .await
            .ok_or_else(|| Error::Tunnel("stream closed while awaiting capacity".to_string()))?
            .map_err(|e| Error::Tunnel(format!("capacity error: {e}")))?;
        let chunk = data.split_to(granted.min(data.len()));
        stream
            .send_data(chunk, false)
            .map_err(|e| Error::Tunnel(format!("send error: {e}")))?;
    }
    Ok(())
}

/// Pumps bytes from a reader onto an h2 send stream. Every chunk is sent as
/// it arrives; the stream is closed on EOF or after the idle timeout.
pub async fn copy_reader_to_h2<R>(mut reader: R, mut tx: h2::SendStream<Bytes>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        let n = match tokio::time::timeout(IDLE_TIMEOUT, reader.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                debug!(error = %e, "read side of proxied stream closed");
                break;
            }
            Err(_) => {
                error!("proxied stream idle too long, tearing down");
                break;
            }
        };
        if h2_send_all(&mut tx, Bytes::copy_from_slice(&buf[..n]))
            .await
            .is_err()
        {
            return;
        }
    }
    let _ = tx.send_data(Bytes::new(), true);
}

/// Pumps an h2 receive stream into a writer, flushing after every chunk so
/// bytes are forwarded as they arrive.
pub async fn copy_h2_to_writer<W>(mut body: h2::RecvStream, mut writer: W)
where
    W: AsyncWrite + Unpin,
{
    loop {
        let chunk = match tokio::time::timeout(IDLE_TIMEOUT, body.data()).await {
            Ok(Some(Ok(chunk))) => chunk,
            Ok(Some(Err(e))) => {
                debug!(error = %e, "tunnel stream closed");
                break;
            }
            Ok(None) => break,
            Err(_) => {
                error!("tunnel stream idle too long, tearing down");
                break;
            }
        };
        if writer.write_all(&chunk).await.is_err() {
            break;
        }
        let _ = writer.flush().await;
        let _ = body.flow_control().release_capacity(chunk.len());
    }
    let _ = writer.shutdown().await;
}

/// Listens on the dial-in stitching unix socket of a dialin server block.
/// Every accepted connection carries a fixed-size frame naming the dialin
/// key, then raw bytes that are spliced onto a fresh tunnel stream.
pub async fn run_unix_listener(
    pool: Arc<DialinPool>,
    dialin_server_name: String,
    service_name: String,
) -> Result<()> {
    let path = unix_socket_path(&dialin_server_name);
    let _ = tokio::fs::remove_file(&path).await;
    let listener = UnixListener::bind(&path)?;
    info!(socket = %path, "started unix listener");

    loop {
        let (stream, _) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(error = %e, socket = %path, "unix accept failed");
                continue;
            }
        };
        let pool = pool.clone();
        let service_name = service_name.clone();
        tokio::spawn(async move {
            if let Err(e) = stitch_unix_conn(pool, service_name, stream).await {
                debug!(error = %e, "unix stitch ended");
            }
        });
    }
}

/// Bridges one unix connection onto a tunnel stream for its dialin key.
async fn stitch_unix_conn(
    pool: Arc<DialinPool>,
    service_name: String,
    mut stream: UnixStream,
) -> Result<()> {
    let mut buf = vec![0u8; DIALIN_FRAME_SIZE];
    tokio::time::timeout(DEFAULT_TIMEOUT, stream.read_exact(&mut buf))
        .await
        .map_err(|_| Error::Tunnel("timed out reading dialin frame".to_string()))??;
    let frame = DialinFrame::decode(&buf)?;

    if !pool.check_dialin_key_exist(&frame.dialin_key) {
        return Err(Error::NoDialins(frame.dialin_key));
    }

    let msg = ControlMessage {
        action: ACTION_PROXY.to_string(),
        forwarded_host: frame.sni.clone(),
        forwarded_service: service_name,
        user_name: frame.user_name.clone(),
        namespace: "default".to_string(),
        scope: "default".to_string(),
        allow: "true".to_string(),
        remote_addr: String::new(),
    };

    let (resp, send_stream) = open_proxy_stream(&pool, &frame.dialin_key, &msg).await?;

    let (read_half, write_half) = stream.into_split();
    let upstream = tokio::spawn(copy_reader_to_h2(read_half, send_stream));

    copy_h2_to_writer(resp.into_body(), write_half).await;
    let _ = upstream.await;
    Ok(())
}

/// Opens one PUT proxy stream on the pooled connection for a dialin key.
/// The returned send stream carries client-to-agent bytes; the response
/// body carries agent-to-client bytes.
pub async fn open_proxy_stream(
    pool: &DialinPool,
    key: &str,
    msg: &ControlMessage,
) -> Result<(http::Response<h2::RecvStream>, h2::SendStream<Bytes>)> {
    let sr = pool
        .client(key)
        .ok_or_else(|| Error::NoDialins(key.to_string()))?;
    let mut sr = sr
        .ready()
        .await
        .map_err(|e| Error::Tunnel(format!("connection not ready: {e}")))?;

    let mut req = http::Request::builder()
        .method(Method::PUT)
        .uri(DialinPool::url(key))
        .body(())
        .map_err(|e| Error::Tunnel(format!("bad proxy request: {e}")))?;
    write_to_header(req.headers_mut(), msg)?;

    let (resp_fut, send_stream) = sr
        .send_request(req, false)
        .map_err(|e| Error::Tunnel(format!("open stream failed: {e}")))?;
    let resp = resp_fut
        .await
        .map_err(|e| Error::Tunnel(format!("proxy stream rejected: {e}")))?;
    Ok((resp, send_stream))
}

/// Forwards an HTTP request over the stitching unix socket. The fixed-size
/// frame binds the connection to a dialin key before HTTP bytes flow.
pub async fn forward_over_unix(
    socket_path: &str,
    frame: &DialinFrame,
    req: Request<Body>,
) -> Result<Response<Body>> {
    let mut stream = UnixStream::connect(socket_path).await?;
    stream.write_all(&frame.encode()?).await?;

    let (mut sender, conn) = hyper::client::conn::Builder::new()
        .handshake::<_, Body>(stream)
        .await
        .map_err(|e| Error::Tunnel(format!("unix handshake failed: {e}")))?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "unix upstream connection ended");
        }
    });

    sender
        .send_request(req)
        .await
        .map_err(|e| Error::Tunnel(format!("unix upstream request failed: {e}")))
}

/// Forwards an HTTP request to a peer relay over TLS, presenting this
/// relay's certificate and the original server name as SNI.
pub async fn forward_to_peer(
    tls: Arc<rustls::ClientConfig>,
    relay_ip: &str,
    sni: &str,
    req: Request<Body>,
) -> Result<Response<Body>> {
    let addr = if relay_ip.contains(':') {
        relay_ip.to_string()
    } else {
        format!("{relay_ip}:443")
    };

    let tcp = TcpStream::connect(&addr).await?;
    let server_name = rustls::ServerName::try_from(sni)
        .map_err(|e| Error::Tunnel(format!("invalid peer sni {sni}: {e}")))?;
    let stream = TlsConnector::from(tls).connect(server_name, tcp).await?;

    let (mut sender, conn) = hyper::client::conn::Builder::new()
        .handshake::<_, Body>(stream)
        .await
        .map_err(|e| Error::Tunnel(format!("peer handshake failed: {e}")))?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "peer connection ended");
        }
    });

    sender
        .send_request(req)
        .await
        .map_err(|e| Error::Tunnel(format!("peer request failed: {e}")))
}

/// Splices two upgraded connections together until either side closes.
pub fn spawn_upgrade_splice(client: OnUpgrade, upstream: OnUpgrade) {
    tokio::spawn(async move {
        match tokio::try_join!(client, upstream) {
            Ok((mut client_io, mut upstream_io)) => {
                if let Err(e) =
                    tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io).await
                {
                    debug!(error = %e, "upgraded stream splice ended");
                }
            }
            Err(e) => debug!(error = %e, "upgrade failed"),
        }
    });
}
