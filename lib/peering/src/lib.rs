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

use std::time::Duration;

use thiserror::Error;

pub mod client;
pub mod identity;
pub mod pb;
pub mod service;

pub use client::{get_peer_cache, new_peer_cache, PeerCache};
pub use service::PeerService;

/// Interval between heartbeat messages on the Hello stream.
pub const PEER_HELLO_INTERVAL: Duration = Duration::from_secs(60);

/// How long peer candidates learned from probe responses stay usable.
pub const PEER_CACHE_EXPIRY: Duration = Duration::from_secs(600);

/// How long a survey reply stays visible to probe polling.
pub const SURVEY_CACHE_EXPIRY: Duration = Duration::from_secs(60);

/// Relays without a heartbeat for this long are skipped by survey
/// broadcasts and garbage-collected once their streams are unreferenced.
pub const MAX_RELAY_IDLE_SECS: i64 = 300;

#[derive(Error, Debug)]
pub enum Error {
    #[error("peering stream `{0}` lost connection to the discovery service")]
    ConnectionLost(&'static str),
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
    #[error("rpc error: {0}")]
    Rpc(#[from] tonic::Status),
    #[error("invalid configuration: `{0}`")]
    InvalidConfig(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
