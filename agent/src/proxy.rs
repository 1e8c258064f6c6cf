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

use bytes::Bytes;
use futures::future::poll_fn;
use http::Response;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tracing::{debug, error};

use crate::config::Upstream;
use crate::{Error, Result, IDLE_TIMEOUT, UPSTREAM_DIAL_TIMEOUT};

/// Splices one tunneled stream onto the local upstream service. The
/// request body is the relay-to-cluster direction, the response body the
/// other way.
pub async fn service_proxy(
    upstream: &Upstream,
    body: h2::RecvStream,
    mut respond: h2::server::SendResponse<Bytes>,
) {
    let send = match dial_upstream(upstream).await {
        Ok(io) => {
            let Ok(send) = respond.send_response(Response::new(()), false) else {
                return;
            };
            Some((io, send))
        }
        Err(e) => {
            error!(error = %e, ?upstream, "upstream dial failed");
            respond.send_reset(h2::Reason::INTERNAL_ERROR);
            None
        }
    };
    let Some((io, send)) = send else { return };

    match io {
        UpstreamIo::Tcp(stream) => {
            let (read_half, write_half) = stream.into_split();
            let inbound = tokio::spawn(copy_h2_to_writer(body, write_half));
            copy_reader_to_h2(read_half, send).await;
            let _ = inbound.await;
        }
        UpstreamIo::Unix(stream) => {
            let (read_half, write_half) = stream.into_split();
            let inbound = tokio::spawn(copy_h2_to_writer(body, write_half));
            copy_reader_to_h2(read_half, send).await;
            let _ = inbound.await;
        }
    }
}

enum UpstreamIo {
    Tcp(TcpStream),
    Unix(UnixStream),
}

async fn dial_upstream(upstream: &Upstream) -> Result<UpstreamIo> {
    match upstream {
        Upstream::Tcp(addr) => {
            let stream = tokio::time::timeout(UPSTREAM_DIAL_TIMEOUT, TcpStream::connect(addr))
                .await
                .map_err(|_| Error::Dial(format!("upstream {addr} timed out")))?
                .map_err(|e| Error::Dial(e.to_string()))?;
            Ok(UpstreamIo::Tcp(stream))
        }
        Upstream::Unix(path) => {
            let stream = tokio::time::timeout(UPSTREAM_DIAL_TIMEOUT, UnixStream::connect(path))
                .await
                .map_err(|_| Error::Dial(format!("upstream {path} timed out")))?
                .map_err(|e| Error::Dial(e.to_string()))?;
            Ok(UpstreamIo::Unix(stream))
        }
    }
}

/// Sends a whole buffer on an h2 stream, waiting for flow-control capacity
/// chunk by chunk.
async fn h2_send_all(stream: &mut h2::SendStream<Bytes>, mut data: Bytes) -> Result<()> {
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

/// Pumps bytes from the upstream onto the tunnel stream, forwarding each
/// chunk as it arrives.
async fn copy_reader_to_h2<R>(mut reader: R, mut tx: h2::SendStream<Bytes>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        let n = match tokio::time::timeout(IDLE_TIMEOUT, reader.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                debug!(error = %e, "upstream read ended");
                break;
            }
            Err(_) => {
                error!("upstream idle too long, tearing down");
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

/// Pumps tunnel bytes into the upstream, flushing after every chunk.
async fn copy_h2_to_writer<W>(mut body: h2::RecvStream, mut writer: W)
where
    W: AsyncWrite + Unpin,
{
    loop {
        let chunk = match tokio::time::timeout(IDLE_TIMEOUT, body.data()).await {
            Ok(Some(Ok(chunk))) => chunk,
            Ok(Some(Err(e))) => {
                debug!(error = %e, "tunnel stream ended");
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
