/*
Copyright 2024 The Kubernetes Authors.

SPDX-License-Identifier: Apache-2.0
*/

// Minimal echo target used when exercising the tunnel end to end: point the
// agent's upstream at this server (tcp) or at its unix socket and whatever
// bytes enter the tunnel come straight back.

use std::env;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UnixListener};
use tokio::signal;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    match args.get(1).map(String::as_str) {
        Some("--unix") => {
            let path = args
                .get(2)
                .cloned()
                .unwrap_or_else(|| "/tmp/relay-agent-unix-echo".to_string());
            let _ = std::fs::remove_file(&path);
            let listener = UnixListener::bind(&path)?;
            println!("echo server listening on unix socket {path}");
            tokio::spawn(async move {
                loop {
                    if let Ok((stream, _)) = listener.accept().await {
                        tokio::spawn(echo(stream));
                    }
                }
            });
        }
        _ => {
            let addr = args
                .get(1)
                .cloned()
                .unwrap_or_else(|| "127.0.0.1:16001".to_string());
            let listener = TcpListener::bind(&addr).await?;
            println!("echo server listening on {addr}");
            tokio::spawn(async move {
                loop {
                    if let Ok((stream, peer)) = listener.accept().await {
                        println!("connection from {peer}");
                        tokio::spawn(echo(stream));
                    }
                }
            });
        }
    }

    signal::ctrl_c().await?;
    Ok(())
}

async fn echo<S>(mut stream: S)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut buf = [0u8; 8192];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                if stream.write_all(&buf[..n]).await.is_err() {
                    return;
                }
                let _ = stream.flush().await;
            }
        }
    }
}
