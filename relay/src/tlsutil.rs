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

use std::io::Cursor;
use std::sync::Arc;

use rustls::server::AllowAnyAuthenticatedClient;
use rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore, ServerConfig};
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

use crate::{Error, Result};

pub fn load_certs(pem: &[u8]) -> Result<Vec<Certificate>> {
    let certs = rustls_pemfile::certs(&mut Cursor::new(pem))?;
    if certs.is_empty() {
        return Err(Error::InvalidConfig("no certificates in pem".to_string()));
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

pub fn load_private_key(pem: &[u8]) -> Result<PrivateKey> {
    let mut reader = Cursor::new(pem);
    while let Some(item) = rustls_pemfile::read_one(&mut reader)? {
        match item {
            rustls_pemfile::Item::PKCS8Key(key)
            | rustls_pemfile::Item::RSAKey(key)
            | rustls_pemfile::Item::ECKey(key) => return Ok(PrivateKey(key)),
            _ => continue,
        }
    }
    Err(Error::InvalidConfig("no private key in pem".to_string()))
}

fn root_store(ca_pem: &[u8]) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(ca_pem)? {
        roots
            .add(&cert)
            .map_err(|e| Error::InvalidConfig(format!("bad root certificate: {e}")))?;
    }
    Ok(roots)
}

/// Server-side TLS termination with mandatory client certificates verified
/// against the given root.
pub fn server_config(
    cert_pem: &[u8],
    key_pem: &[u8],
    client_ca_pem: &[u8],
    alpn: &[&[u8]],
) -> Result<Arc<ServerConfig>> {
    let roots = root_store(client_ca_pem)?;
    let mut config = ServerConfig::builder()
        .with_safe_defaults()
        .with_client_cert_verifier(Arc::new(AllowAnyAuthenticatedClient::new(roots)))
        .with_single_cert(load_certs(cert_pem)?, load_private_key(key_pem)?)?;
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Ok(Arc::new(config))
}

/// Client-side TLS with a client certificate, verifying the server against
/// the given root.
pub fn client_config(
    cert_pem: &[u8],
    key_pem: &[u8],
    root_ca_pem: &[u8],
    alpn: &[&[u8]],
) -> Result<Arc<ClientConfig>> {
    let mut config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(root_store(root_ca_pem)?)
        .with_client_auth_cert(load_certs(cert_pem)?, load_private_key(key_pem)?)?;
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Ok(Arc::new(config))
}

/// Common name of the first peer certificate, used as the connection
/// identity.
pub fn peer_common_name(certs: &[Certificate]) -> Result<String> {
    let der = certs
        .first()
        .ok_or_else(|| Error::Tunnel("no peer certificate".to_string()))?;
    let (_, cert) = X509Certificate::from_der(&der.0)
        .map_err(|e| Error::Tunnel(format!("unparsable peer certificate: {e}")))?;
    cert.subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .filter(|cn| !cn.is_empty())
        .map(str::to_string)
        .ok_or_else(|| Error::Tunnel("peer certificate has empty common name".to_string()))
}

/// NotBefore of the first peer certificate as a unix epoch. Forwarded to
/// the control plane so it can reject certificates that predate a
/// credential rotation.
pub fn peer_cert_issue_epoch(certs: &[Certificate]) -> Result<i64> {
    let der = certs
        .first()
        .ok_or_else(|| Error::Tunnel("no peer certificate".to_string()))?;
    let (_, cert) = X509Certificate::from_der(&der.0)
        .map_err(|e| Error::Tunnel(format!("unparsable peer certificate: {e}")))?;
    Ok(cert.validity().not_before.timestamp())
}
