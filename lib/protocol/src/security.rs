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

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use http::header::HeaderMap;
use http::HeaderValue;
use rand::RngCore;

use crate::{Error, Result, HEADER_PEER_HASH, HEADER_PEER_NONCE, HEADER_XRAY_RELAY_UUID};

const NONCE_SIZE: usize = 12;

/// Seals and verifies the relay-to-relay security headers. The loop
/// detection UUID chain is encrypted with a shared AES-256-GCM key; the
/// receiving peer decrypts it and compares against the plaintext chain to
/// detect header tampering.
///
/// The key is provisioned as a hex-encoded secret shared by all relay
/// replicas of a deployment.
pub struct PeerAuthenticator {
    cipher: Aes256Gcm,
}

impl PeerAuthenticator {
    pub fn new(hex_key: &str) -> Result<Self> {
        let key = hex::decode(hex_key.trim())
            .map_err(|e| Error::InvalidPeerKey(e.to_string()))?;
        if key.len() != 32 {
            return Err(Error::InvalidPeerKey(format!(
                "expected 32 bytes, got {}",
                key.len()
            )));
        }
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| Error::InvalidPeerKey(e.to_string()))?;
        Ok(PeerAuthenticator { cipher })
    }

    /// Seals the current UUID chain into the nonce/hash header pair. The
    /// chain header must already be set.
    pub fn set_header_nonce(&self, headers: &mut HeaderMap) -> Result<()> {
        let chain = headers
            .get(HEADER_XRAY_RELAY_UUID)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| Error::MissingHeaders(HEADER_XRAY_RELAY_UUID.to_string()))?
            .to_string();

        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), chain.as_bytes())
            .map_err(|e| Error::Crypto(e.to_string()))?;

        headers.insert(
            HEADER_PEER_NONCE,
            HeaderValue::from_str(&hex::encode(nonce))?,
        );
        headers.insert(
            HEADER_PEER_HASH,
            HeaderValue::from_str(&hex::encode(ciphertext))?,
        );
        Ok(())
    }

    /// Verifies the nonce/hash pair against the UUID chain. Returns false
    /// for any missing, undecodable or mismatching header.
    pub fn check_headers(&self, headers: &HeaderMap) -> bool {
        let hash = match headers.get(HEADER_PEER_HASH).and_then(|v| v.to_str().ok()) {
            Some(v) if !v.is_empty() => v,
            _ => return false,
        };
        let nonce = match headers.get(HEADER_PEER_NONCE).and_then(|v| v.to_str().ok()) {
            Some(v) if !v.is_empty() => v,
            _ => return false,
        };
        let expected = match headers
            .get(HEADER_XRAY_RELAY_UUID)
            .and_then(|v| v.to_str().ok())
        {
            Some(v) if !v.is_empty() => v,
            _ => return false,
        };

        let ciphertext = match hex::decode(hash) {
            Ok(v) => v,
            Err(_) => return false,
        };
        let nonce = match hex::decode(nonce) {
            Ok(v) if v.len() == NONCE_SIZE => v,
            _ => return false,
        };

        match self
            .cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
        {
            Ok(plaintext) => plaintext == expected.as_bytes(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::set_xray_uuid;

    const TEST_KEY: &str = "6368616e676520746869732070617373776f726420746f206120736563726574";

    #[test]
    fn header_nonce_round_trip() {
        let auth = PeerAuthenticator::new(TEST_KEY).unwrap();
        let mut headers = HeaderMap::new();
        set_xray_uuid(&mut headers, "7e2c5f3a-relay-a");

        auth.set_header_nonce(&mut headers).unwrap();
        assert!(auth.check_headers(&headers));
    }

    #[test]
    fn tampered_headers_fail_check() {
        let auth = PeerAuthenticator::new(TEST_KEY).unwrap();
        let mut headers = HeaderMap::new();
        set_xray_uuid(&mut headers, "7e2c5f3a-relay-a");
        auth.set_header_nonce(&mut headers).unwrap();

        // mutate the chain
        let mut tampered = headers.clone();
        tampered.insert(
            HEADER_XRAY_RELAY_UUID,
            HeaderValue::from_static("other-relay"),
        );
        assert!(!auth.check_headers(&tampered));

        // mutate the hash
        let mut tampered = headers.clone();
        tampered.insert(HEADER_PEER_HASH, HeaderValue::from_static("00ff00ff"));
        assert!(!auth.check_headers(&tampered));

        // mutate the nonce
        let mut tampered = headers;
        tampered.insert(
            HEADER_PEER_NONCE,
            HeaderValue::from_static("000000000000000000000000"),
        );
        assert!(!auth.check_headers(&tampered));
    }

    #[test]
    fn rejects_short_key() {
        assert!(PeerAuthenticator::new("0011").is_err());
        assert!(PeerAuthenticator::new("not-hex").is_err());
    }
}
