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

use agent::client::start_network;
use agent::config::{AgentConfig, AgentOpt};
use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = AgentOpt::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AgentConfig::load(opt).context("loading configuration")?;
    info!(
        cluster_id = %config.cluster_id,
        addr = %config.server_addr,
        dials = config.max_dials,
        "starting relay agent"
    );

    start_network(config).context("starting relay network")?;

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}
