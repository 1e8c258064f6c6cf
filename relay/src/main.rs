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

use anyhow::Context;
use clap::Parser;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use peering::client::DialinLookup;
use relay::authz::AuthzProvisioner;
use relay::config::{RelayConfig, RelayOpt};
use relay::ops::{run_ops_server, OpsState};
use relay::peer::{run_peering_manager, PeeringConfig};
use relay::pool::DialinPool;
use relay::proxy::run_unix_listener;
use relay::router::RelayContext;
use relay::server::{ConnectionRegistry, RelayServer, ServerBlock, ServerKind};
use relay::sessions::SessionCache;
use relay::tlsutil;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = RelayOpt::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter, log_level) = tracing_subscriber::reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = RelayConfig::load(opt).context("loading configuration")?;
    let relay_uuid = Uuid::new_v4().to_string();
    info!(%relay_uuid, "starting relay");

    let connections = ConnectionRegistry::new();
    let pool = DialinPool::new(Some(connections.disconnect_hook()));
    let sessions = SessionCache::new();
    let peer_cache = Arc::new(peering::new_peer_cache());
    let (probe_tx, probe_rx) = mpsc::channel::<String>(256);
    let probe_rx = Arc::new(Mutex::new(probe_rx));

    let authenticator = Arc::new(
        protocol::PeerAuthenticator::new(&cfg.peer_auth_key)
            .context("loading peer auth key")?,
    );
    let provisioner = AuthzProvisioner::new(
        cfg.peer_service_uri.clone(),
        cfg.peer_cert.clone(),
        cfg.peer_key.clone(),
        cfg.peer_ca.clone(),
    );

    // relay-to-relay forwards present the user-facing certificate
    let peer_client_tls = tlsutil::client_config(
        &cfg.user_cert,
        &cfg.user_key,
        &cfg.user_ca,
        &[b"http/1.1"],
    )
    .context("building peer client tls")?;

    let relay_ctx = Arc::new(RelayContext {
        server_name: cfg.user_server_name.clone(),
        dialin_server_name: cfg.dialin_server_name.clone(),
        service_name: cfg.service_name.clone(),
        relay_uuid: relay_uuid.clone(),
        pool: pool.clone(),
        sessions,
        provisioner,
        peer_cache: peer_cache.clone(),
        probe_tx,
        authenticator,
        peer_client_tls,
    });

    let blocks = vec![
        Arc::new(ServerBlock {
            kind: ServerKind::Relay,
            name: cfg.service_name.clone(),
            server_name: cfg.user_server_name.clone(),
            tls: tlsutil::server_config(
                &cfg.user_cert,
                &cfg.user_key,
                &cfg.user_ca,
                &[b"http/1.1"],
            )
            .context("building user server tls")?,
        }),
        Arc::new(ServerBlock {
            kind: ServerKind::Dialin,
            name: cfg.service_name.clone(),
            server_name: cfg.dialin_server_name.clone(),
            tls: tlsutil::server_config(
                &cfg.connector_cert,
                &cfg.connector_key,
                &cfg.connector_ca,
                &[],
            )
            .context("building connector server tls")?,
        }),
    ];

    let server = Arc::new(RelayServer {
        blocks,
        pool: pool.clone(),
        relay_ctx,
        connections,
    });

    let listen_address = cfg.listen_address;
    tokio::spawn({
        let server = server.clone();
        async move {
            if let Err(e) = server.listen(listen_address).await {
                error!(error = %e, "listener failed");
                std::process::exit(1);
            }
        }
    });

    tokio::spawn({
        let pool = pool.clone();
        let dialin_server_name = cfg.dialin_server_name.clone();
        let service_name = cfg.service_name.clone();
        async move {
            if let Err(e) = run_unix_listener(pool, dialin_server_name, service_name).await {
                error!(error = %e, "unix listener failed");
                std::process::exit(1);
            }
        }
    });

    let dialin_lookup: DialinLookup = {
        let pool = pool.clone();
        Arc::new(move |sni: &str| pool.connector_count(sni))
    };
    tokio::spawn(run_peering_manager(
        PeeringConfig {
            uri: cfg.peer_service_uri.clone(),
            cert: cfg.peer_cert.clone(),
            key: cfg.peer_key.clone(),
            ca: cfg.peer_ca.clone(),
            relay_uuid,
            relay_ip: cfg.relay_ip_port(),
        },
        peer_cache,
        probe_rx,
        dialin_lookup,
    ));

    let ops_state = Arc::new(OpsState {
        pool,
        log_level,
        pod_name: cfg.pod_name.clone(),
    });
    tokio::spawn(async move {
        if let Err(e) = run_ops_server(cfg.ops_address, ops_state).await {
            error!(error = %e, "ops server failed");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}
