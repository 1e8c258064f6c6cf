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

use tonic::{Request, Status};
use x509_parser::prelude::FromDer;
use x509_parser::certificate::X509Certificate;

/// Identity of a connected relay, taken from its client certificate. The
/// common name identifies the relay, the organizational unit scopes all
/// discovery state to one tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub common_name: String,
    pub organizational_unit: String,
}

/// Extracts CN and OU from the verified client certificate of a request.
/// The connection is mTLS so a missing certificate is an authentication
/// error, not a protocol error.
pub fn client_identity<T>(request: &Request<T>) -> Result<ClientIdentity, Status> {
    let certs = request
        .peer_certs()
        .ok_or_else(|| Status::unauthenticated("no client certificate presented"))?;

    let der = certs
        .first()
        .ok_or_else(|| Status::unauthenticated("empty client certificate chain"))?;

    let (_, cert) = X509Certificate::from_der(der.as_ref())
        .map_err(|e| Status::unauthenticated(format!("unparsable client certificate: {e}")))?;

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .filter(|cn| !cn.is_empty())
        .ok_or_else(|| Status::unauthenticated("client certificate has no common name"))?
        .to_string();

    let organizational_unit = cert
        .subject()
        .iter_organizational_unit()
        .next()
        .and_then(|ou| ou.as_str().ok())
        .filter(|ou| !ou.is_empty())
        .ok_or_else(|| {
            Status::unauthenticated("client certificate has no organizational unit")
        })?
        .to_string();

    Ok(ClientIdentity {
        common_name,
        organizational_unit,
    })
}
