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

use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};
use tracing::info;

use peering::pb::relay_peer_service_server::RelayPeerServiceServer;
use peering::PeerService;

#[derive(Debug, Parser)]
struct Opt {
    #[clap(long, default_value = "0.0.0.0")]
    listen_address: IpAddr,
    #[clap(long, default_value = "7001")]
    listen_port: u16,
    /// Address other relays should be told this service answers on.
    #[clap(long, default_value = "")]
    service_ip: String,
    #[clap(short = 'c', long)]
    server_certificate_path: PathBuf,
    #[clap(short = 'k', long)]
    server_private_key_path: PathBuf,
    #[clap(short = 'a', long)]
    client_certificate_authority_root_path: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = Opt::parse();

    let subscriber = tracing_subscriber::FmtSubscriber::new();
    tracing::subscriber::set_global_default(subscriber)?;

    let cert = fs::read(&opt.server_certificate_path)
        .with_context(|| format!("reading {:?}", opt.server_certificate_path))?;
    let key = fs::read(&opt.server_private_key_path)
        .with_context(|| format!("reading {:?}", opt.server_private_key_path))?;
    let ca = fs::read(&opt.client_certificate_authority_root_path)
        .with_context(|| format!("reading {:?}", opt.client_certificate_authority_root_path))?;

    let tls = ServerTlsConfig::new()
        .identity(Identity::from_pem(cert, key))
        .client_ca_root(Certificate::from_pem(ca));

    let (service, survey_rx) = PeerService::new(opt.service_ip.clone());
    info!(uuid = service.service_uuid(), "starting relay peer service");

    let survey_service = service.clone();
    tokio::spawn(async move { survey_service.run_survey_handler(survey_rx).await });

    let (mut health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_serving::<RelayPeerServiceServer<PeerService>>()
        .await;

    let addr = SocketAddr::new(opt.listen_address, opt.listen_port);
    info!(%addr, "listening");
    Server::builder()
        .tls_config(tls)?
        .add_service(health_service)
        .add_service(RelayPeerServiceServer::new(service))
        .serve(addr)
        .await?;

    Ok(())
}
