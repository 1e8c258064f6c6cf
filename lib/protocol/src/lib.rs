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

use http::header::HeaderMap;
use http::HeaderValue;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod cache;
pub mod security;

pub use cache::TtlCache;
pub use security::PeerAuthenticator;

// Header names are lowercase so they can be used as static keys with
// http::HeaderMap. Matching is case-insensitive on the wire.
pub const HEADER_ERROR: &str = "x-error";
pub const HEADER_ACTION: &str = "x-action";
pub const HEADER_FORWARDED_HOST: &str = "x-forwarded-host";
pub const HEADER_FORWARDED_SERVICE: &str = "x-forwarded-service";
pub const HEADER_FORWARDED_FOR: &str = "x-forwarded-for";

pub const HEADER_USER: &str = "x-rafay-user";
pub const HEADER_NAMESPACE: &str = "x-rafay-namespace";
pub const HEADER_SCOPE: &str = "x-rafay-scope";
pub const HEADER_ALLOW: &str = "x-rafay-allow";
pub const HEADER_KEY: &str = "x-rafay-key";
pub const HEADER_SESSION_KEY: &str = "x-rafay-sessionkey";
pub const HEADER_CLEAR_SECRET: &str = "x-rafay-clear-cache";

pub const HEADER_XRAY_RELAY_UUID: &str = "x-rafay-xray-relayuuid";
pub const HEADER_PEER_NONCE: &str = "x-rafay-peer-nonce";
pub const HEADER_PEER_HASH: &str = "x-rafay-peer-hash";
pub const HEADER_USER_CERT_ISSUED: &str = "x-rafay-user-cert-issued";
pub const HEADER_CLUSTER_SERVER_NAME: &str = "x-rafay-cluster-servername";
pub const HEADER_CLUSTER_ID: &str = "x-rafay-cluster-id";

/// Action carried in the control message of every tunneled stream.
pub const ACTION_PROXY: &str = "proxy";

/// Separator used to build dialin pool keys (`sni--peerID--remoteAddr`).
pub const JOIN_STRING: &str = "--";

/// Size of the fixed frame exchanged on the dial-in stitching unix socket
/// before any payload bytes.
pub const DIALIN_FRAME_SIZE: usize = 1024;

#[derive(Error, Debug)]
pub enum Error {
    #[error("missing headers: {0}")]
    MissingHeaders(String),
    #[error("invalid header value: {0}")]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),
    #[error("dialin frame too large: {0} bytes")]
    FrameTooLarge(usize),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid peer key: `{0}`")]
    InvalidPeerKey(String),
    #[error("crypto failure: `{0}`")]
    Crypto(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// ControlMessage is written into the headers of every tunneled stream
/// before any payload bytes flow. The agent uses it to route the stream to
/// the right backend service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlMessage {
    pub action: String,
    pub forwarded_host: String,
    pub forwarded_service: String,
    pub remote_addr: String,
    pub user_name: String,
    pub namespace: String,
    pub scope: String,
    pub allow: String,
}

/// Writes a ControlMessage into HTTP headers.
pub fn write_to_header(headers: &mut HeaderMap, msg: &ControlMessage) -> Result<()> {
    headers.insert(HEADER_ACTION, HeaderValue::from_str(&msg.action)?);
    headers.insert(
        HEADER_FORWARDED_HOST,
        HeaderValue::from_str(&msg.forwarded_host)?,
    );
    headers.insert(
        HEADER_FORWARDED_SERVICE,
        HeaderValue::from_str(&msg.forwarded_service)?,
    );
    headers.insert(HEADER_USER, HeaderValue::from_str(&msg.user_name)?);
    headers.insert(HEADER_NAMESPACE, HeaderValue::from_str(&msg.namespace)?);
    headers.insert(HEADER_SCOPE, HeaderValue::from_str(&msg.scope)?);
    headers.insert(HEADER_ALLOW, HeaderValue::from_str(&msg.allow)?);
    Ok(())
}

fn header_str(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// Reads a ControlMessage back from HTTP headers. The action, forwarded host
/// and forwarded service headers are mandatory.
pub fn read_control_message(headers: &HeaderMap, remote_addr: &str) -> Result<ControlMessage> {
    let msg = ControlMessage {
        action: header_str(headers, HEADER_ACTION),
        forwarded_host: header_str(headers, HEADER_FORWARDED_HOST),
        forwarded_service: header_str(headers, HEADER_FORWARDED_SERVICE),
        user_name: header_str(headers, HEADER_USER),
        namespace: header_str(headers, HEADER_NAMESPACE),
        scope: header_str(headers, HEADER_SCOPE),
        allow: header_str(headers, HEADER_ALLOW),
        remote_addr: remote_addr.to_string(),
    };

    let mut missing = Vec::new();
    if msg.action.is_empty() {
        missing.push(HEADER_ACTION);
    }
    if msg.forwarded_host.is_empty() {
        missing.push(HEADER_FORWARDED_HOST);
    }
    if msg.forwarded_service.is_empty() {
        missing.push(HEADER_FORWARDED_SERVICE);
    }
    if !missing.is_empty() {
        return Err(Error::MissingHeaders(missing.join(", ")));
    }

    Ok(msg)
}

/// Handshake payload exchanged on the CONNECT stream right after a tunnel
/// connection is accepted into the dialin pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakeMessage {
    #[serde(rename = "ServiceName")]
    pub service_name: String,
    #[serde(rename = "Protocol")]
    pub protocol: String,
    #[serde(rename = "Host")]
    pub host: String,
}

/// Fixed-size frame sent on the dial-in stitching unix socket immediately
/// after connecting, before any payload bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DialinFrame {
    #[serde(rename = "DialinKey")]
    pub dialin_key: String,
    #[serde(rename = "UserName")]
    pub user_name: String,
    #[serde(rename = "SNI")]
    pub sni: String,
}

impl DialinFrame {
    /// Encodes the frame as JSON padded with zero bytes to
    /// DIALIN_FRAME_SIZE.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = serde_json::to_vec(self)?;
        if buf.len() >= DIALIN_FRAME_SIZE {
            return Err(Error::FrameTooLarge(buf.len()));
        }
        buf.resize(DIALIN_FRAME_SIZE, 0);
        Ok(buf)
    }

    /// Decodes a frame from a zero-padded buffer.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
        Ok(serde_json::from_slice(&buf[..end])?)
    }
}

/// Appends the client address to the X-Forwarded-For chain.
pub fn set_x_forwarded_for(headers: &mut HeaderMap, remote_addr: &str) {
    let client_ip = match remote_addr.rsplit_once(':') {
        Some((host, _)) => host,
        None => remote_addr,
    };

    let value = match headers.get(HEADER_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) => format!("{prior}, {client_ip}"),
        None => client_ip.to_string(),
    };
    if let Ok(v) = HeaderValue::from_str(&value) {
        headers.insert(HEADER_FORWARDED_FOR, v);
    }
}

/// Appends this relay's UUID to the loop-detection chain.
pub fn set_xray_uuid(headers: &mut HeaderMap, relay_uuid: &str) {
    let value = match headers
        .get(HEADER_XRAY_RELAY_UUID)
        .and_then(|v| v.to_str().ok())
    {
        Some(prior) => format!("{prior}, {relay_uuid}"),
        None => relay_uuid.to_string(),
    };
    if let Ok(v) = HeaderValue::from_str(&value) {
        headers.insert(HEADER_XRAY_RELAY_UUID, v);
    }
}

/// Reports whether this relay's UUID is already present in the
/// loop-detection chain.
pub fn check_relay_loops(headers: &HeaderMap, relay_uuid: &str) -> bool {
    headers
        .get(HEADER_XRAY_RELAY_UUID)
        .and_then(|v| v.to_str().ok())
        .map(|chain| chain.contains(relay_uuid))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message() -> ControlMessage {
        ControlMessage {
            action: ACTION_PROXY.to_string(),
            forwarded_host: "c1.connector.relay.local".to_string(),
            forwarded_service: "kubectl".to_string(),
            remote_addr: String::new(),
            user_name: "alice@example.com".to_string(),
            namespace: "team-a".to_string(),
            scope: "namespace".to_string(),
            allow: "true".to_string(),
        }
    }

    #[test]
    fn control_message_round_trip() {
        let msg = sample_message();
        let mut headers = HeaderMap::new();
        write_to_header(&mut headers, &msg).unwrap();

        let got = read_control_message(&headers, "").unwrap();
        assert_eq!(got, msg);
    }

    #[test]
    fn control_message_missing_action() {
        let msg = sample_message();
        let mut headers = HeaderMap::new();
        write_to_header(&mut headers, &msg).unwrap();
        headers.remove(HEADER_ACTION);

        let err = read_control_message(&headers, "").unwrap_err();
        assert!(matches!(err, Error::MissingHeaders(_)));
        assert!(err.to_string().contains(HEADER_ACTION));
    }

    #[test]
    fn dialin_frame_round_trip() {
        let frame = DialinFrame {
            dialin_key: "c1.connector--agent--10.0.0.9:41234".to_string(),
            user_name: "alice".to_string(),
            sni: "c1.user.relay.local".to_string(),
        };
        let buf = frame.encode().unwrap();
        assert_eq!(buf.len(), DIALIN_FRAME_SIZE);
        assert_eq!(DialinFrame::decode(&buf).unwrap(), frame);
    }

    #[test]
    fn xray_uuid_accumulates() {
        let mut headers = HeaderMap::new();
        set_xray_uuid(&mut headers, "relay-a");
        set_xray_uuid(&mut headers, "relay-b");

        let chain = headers
            .get(HEADER_XRAY_RELAY_UUID)
            .unwrap()
            .to_str()
            .unwrap();
        assert_eq!(chain, "relay-a, relay-b");
        assert!(check_relay_loops(&headers, "relay-a"));
        assert!(!check_relay_loops(&headers, "relay-c"));
    }
}
