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

use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::Uri;
use hyper::client::connect::{Connected, Connection};
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::ResourceExt;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::UnixStream;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Identity};
use tower::ServiceBuilder;
use tracing::{debug, info, warn};

use peering::pb::cluster_authorization_client::ClusterAuthorizationClient;
use peering::pb::{GetUserAuthorizationRequest, GetUserAuthorizationResponse};
use protocol::{DialinFrame, TtlCache, HEADER_KEY, HEADER_NAMESPACE, HEADER_USER};

use crate::{Error, Result, FIELD_MANAGER};

const AUTHZ_CACHE_TTL: Duration = Duration::from_secs(5 * 60);
const CLIENT_CACHE_TTL: Duration = Duration::from_secs(30 * 60);
const PROVISION_TIMEOUT: Duration = Duration::from_secs(60);
const ROLE_CLEANUP_TIMEOUT: Duration = Duration::from_secs(180);
const DISCOVERY_DIAL_TIMEOUT: Duration = Duration::from_secs(30);
const TUNNEL_CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Namespace the provisioner itself operates in.
const SYSTEM_NAMESPACE: &str = "relay-system";

/// Service accounts the tunnel-scoped kube client may act as while
/// provisioning, in preference order.
const BYPASS_USER_NAMES: &[&str] = &["system-sa", "default"];

/// Result of provisioning a user's RBAC into a cluster.
#[derive(Debug, Clone, Default)]
pub struct ProvisionedUser {
    pub user_name: String,
    pub role_name: String,
    pub is_read: bool,
    pub is_org_admin: bool,
    pub enforce_org_admin_only_secret_access: bool,
}

/// The apply/delete collaborator. Production uses [`KubeApplier`]; tests
/// substitute their own recorder.
#[async_trait]
pub trait Apply: Send + Sync {
    async fn apply(&self, obj: &DynamicObject) -> Result<()>;
    async fn delete(&self, obj: &DynamicObject) -> Result<()>;
}

/// Applies dynamic objects with server-side apply through a kube client.
#[derive(Clone)]
pub struct KubeApplier {
    client: kube::Client,
}

impl KubeApplier {
    pub fn new(client: kube::Client) -> Self {
        KubeApplier { client }
    }

    fn api_for(&self, obj: &DynamicObject) -> Result<Api<DynamicObject>> {
        let ar = api_resource_for(obj)?;
        Ok(match obj.metadata.namespace.as_deref() {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        })
    }
}

#[async_trait]
impl Apply for KubeApplier {
    async fn apply(&self, obj: &DynamicObject) -> Result<()> {
        let api = self.api_for(obj)?;
        api.patch(
            &obj.name_any(),
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(obj),
        )
        .await
        .map_err(Error::Kube)?;
        Ok(())
    }

    async fn delete(&self, obj: &DynamicObject) -> Result<()> {
        let api = self.api_for(obj)?;
        api.delete(&obj.name_any(), &DeleteParams::default())
            .await
            .map_err(Error::Kube)?;
        Ok(())
    }
}

/// Resolves the API resource coordinates of a dynamic object from its
/// apiVersion/kind.
pub fn api_resource_for(obj: &DynamicObject) -> Result<ApiResource> {
    let types = obj
        .types
        .as_ref()
        .ok_or_else(|| Error::Authz("rbac object missing apiVersion/kind".to_string()))?;
    let (group, version) = match types.api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", types.api_version.as_str()),
    };
    Ok(ApiResource::from_gvk(&GroupVersionKind::gvk(
        group,
        version,
        &types.kind,
    )))
}

fn parse_rbac_document(doc: &str) -> Result<DynamicObject> {
    serde_json::from_str(doc).map_err(|e| Error::Authz(format!("unparsable rbac document: {e}")))
}

/// Builds and applies (or reuses from cache) the RBAC a user needs in a
/// target cluster. RBAC documents come from the cluster-authorization RPC;
/// application goes through the tunnel itself using a dialin-scoped kube
/// client.
pub struct AuthzProvisioner {
    peer_service_uri: String,
    peer_cert: Vec<u8>,
    peer_key: Vec<u8>,
    peer_ca: Vec<u8>,
    client_cache: TtlCache<u64, kube::Client>,
    authz_cache: TtlCache<u64, ProvisionedUser>,
}

impl AuthzProvisioner {
    pub fn new(
        peer_service_uri: String,
        peer_cert: Vec<u8>,
        peer_key: Vec<u8>,
        peer_ca: Vec<u8>,
    ) -> Arc<Self> {
        Arc::new(AuthzProvisioner {
            peer_service_uri,
            peer_cert,
            peer_key,
            peer_ca,
            client_cache: TtlCache::new(1 << 10),
            authz_cache: TtlCache::new(1 << 12),
        })
    }

    /// Resolves and provisions RBAC for a user. Cached for five minutes per
    /// (user, sni); `force_provision` bypasses the cache, `refresh_session`
    /// tolerates apply failures and keeps the existing RBAC in place.
    pub async fn provision_authz_for_user(
        &self,
        socket_path: &str,
        user_cn: &str,
        sni: &str,
        dialin_key: &str,
        force_provision: bool,
        refresh_session: bool,
        cert_issue: i64,
    ) -> Result<ProvisionedUser> {
        let cache_key = authz_cache_key(user_cn, sni);
        if !force_provision {
            if let Some(user) = self.authz_cache.get(&cache_key) {
                return Ok(user);
            }
        }

        let auth = tokio::time::timeout(
            PROVISION_TIMEOUT,
            self.get_authz(user_cn, sni, cert_issue),
        )
        .await
        .map_err(|_| Error::Authz("authorization lookup timed out".to_string()))??;

        let applied = tokio::time::timeout(
            PROVISION_TIMEOUT,
            self.provision_authz(&auth, socket_path, sni, dialin_key),
        )
        .await
        .map_err(|_| Error::ProvisionFailed("rbac apply timed out".to_string()))
        .and_then(|r| r);
        if let Err(e) = applied {
            // tolerate apply failures on background refresh, the user keeps
            // the RBAC that is already in place
            if !refresh_session {
                return Err(e);
            }
            warn!(error = %e, user_cn, "refresh provisioning failed, keeping existing rbac");
        }

        let user = ProvisionedUser {
            user_name: auth.user_name,
            role_name: auth.role_name,
            is_read: auth.is_read,
            is_org_admin: auth.is_org_admin,
            enforce_org_admin_only_secret_access: auth.enforce_org_admin_only_secret_access,
        };
        self.authz_cache
            .insert(cache_key, user.clone(), AUTHZ_CACHE_TTL);
        Ok(user)
    }

    /// Fetches the RBAC set for a user from the cluster-authorization RPC.
    async fn get_authz(
        &self,
        user_cn: &str,
        sni: &str,
        cert_issue: i64,
    ) -> Result<GetUserAuthorizationResponse> {
        let cluster_id = cluster_id_from_sni(sni)?;

        let domain = self
            .peer_service_uri
            .trim_start_matches("https://")
            .split(':')
            .next()
            .unwrap_or_default()
            .to_string();
        let tls = ClientTlsConfig::new()
            .domain_name(domain)
            .ca_certificate(Certificate::from_pem(&self.peer_ca))
            .identity(Identity::from_pem(&self.peer_cert, &self.peer_key));

        let channel = Channel::from_shared(self.peer_service_uri.clone())
            .map_err(|e| Error::Authz(format!("bad peer service uri: {e}")))?
            .tls_config(tls)
            .map_err(|e| Error::Authz(format!("bad peer service tls config: {e}")))?
            .connect_timeout(DISCOVERY_DIAL_TIMEOUT)
            .connect()
            .await
            .map_err(|e| Error::Authz(format!("cannot reach authorization service: {e}")))?;

        let mut client = ClusterAuthorizationClient::new(channel);
        let resp = client
            .get_user_authorization(GetUserAuthorizationRequest {
                user_cn: user_cn.to_string(),
                cluster_id,
                cert_issue_seconds: cert_issue,
            })
            .await
            .map_err(|e| Error::Authz(format!("authorization lookup failed: {e}")))?;
        Ok(resp.into_inner())
    }

    /// Applies the fetched RBAC set through the tunnel. Role and binding
    /// deletions (user role/namespace changes) run in the background and
    /// are best-effort.
    async fn provision_authz(
        &self,
        auth: &GetUserAuthorizationResponse,
        socket_path: &str,
        sni: &str,
        dialin_key: &str,
    ) -> Result<()> {
        let client = self.get_client(socket_path, sni, dialin_key).await?;
        let applier = KubeApplier::new(client);

        spawn_role_cleanup(
            applier.clone(),
            auth.delete_cluster_role_bindings.clone(),
            auth.delete_role_bindings.clone(),
        );

        if !auth.cluster_roles.is_empty() {
            info!(user = %auth.user_name, roles = auth.cluster_roles.len(), "cluster scope authz");
        }
        if !auth.roles.is_empty() {
            info!(user = %auth.user_name, roles = auth.roles.len(), "namespace scope authz");
        }

        let sa = parse_rbac_document(&auth.service_account)?;
        if let Err(e) = applier.apply(&sa).await {
            if !already_exists(&e) {
                return Err(Error::ProvisionFailed(format!(
                    "unable to apply service account: {e}"
                )));
            }
        }

        for doc in auth.cluster_roles.iter().chain(&auth.cluster_role_bindings) {
            let obj = parse_rbac_document(doc)?;
            if let Err(e) = applier.apply(&obj).await {
                if !already_exists(&e) {
                    return Err(Error::ProvisionFailed(format!(
                        "unable to apply {}: {e}",
                        obj.name_any()
                    )));
                }
            }
        }

        for doc in auth.roles.iter().chain(&auth.role_bindings) {
            let obj = parse_rbac_document(doc)?;
            if let Err(e) = applier.apply(&obj).await {
                // namespaced roles are tolerated, the namespace may be gone
                debug!(error = %e, name = %obj.name_any(), "unable to apply namespaced rbac");
            }
        }

        info!(sni, user = %auth.user_name, "applied authz");
        Ok(())
    }

    /// A kube client that reaches the cluster through the dialin tunnel,
    /// cached per (sni, dialin key).
    async fn get_client(
        &self,
        socket_path: &str,
        sni: &str,
        dialin_key: &str,
    ) -> Result<kube::Client> {
        let cache_key = client_cache_key(sni, dialin_key);
        if let Some(client) = self.client_cache.get(&cache_key) {
            return Ok(client);
        }

        let mut last_err = Error::Authz("no bypass user available".to_string());
        for bypass_user in BYPASS_USER_NAMES {
            let client = tunnel_client(socket_path, sni, dialin_key, bypass_user)?;
            match client.apiserver_version().await {
                Ok(_) => {
                    self.client_cache
                        .insert(cache_key, client.clone(), CLIENT_CACHE_TTL);
                    return Ok(client);
                }
                Err(e) => {
                    info!(bypass_user, error = %e, "tunnel client probe failed");
                    last_err = Error::Kube(e);
                }
            }
        }
        Err(last_err)
    }
}

fn spawn_role_cleanup(
    applier: KubeApplier,
    delete_cluster_role_bindings: Vec<String>,
    delete_role_bindings: Vec<String>,
) {
    tokio::spawn(async move {
        let cleanup = async {
            for doc in delete_cluster_role_bindings
                .iter()
                .chain(&delete_role_bindings)
            {
                match parse_rbac_document(doc) {
                    Ok(obj) => {
                        if let Err(e) = applier.delete(&obj).await {
                            debug!(error = %e, name = %obj.name_any(), "unable to delete stale binding");
                        } else {
                            info!(name = %obj.name_any(), "deleted stale binding");
                        }
                    }
                    Err(e) => debug!(error = %e, "skipping unparsable delete document"),
                }
            }
        };
        if tokio::time::timeout(ROLE_CLEANUP_TIMEOUT, cleanup).await.is_err() {
            warn!("role cleanup timed out");
        }
    });
}

fn already_exists(err: &Error) -> bool {
    err.to_string().contains("already exists")
}

pub fn cluster_id_from_sni(sni: &str) -> Result<String> {
    match sni.split_once('.') {
        Some((id, _)) if !id.is_empty() => Ok(id.to_string()),
        _ => Err(Error::Authz(format!("invalid user sni format {sni}"))),
    }
}

fn authz_cache_key(user_cn: &str, sni: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    user_cn.hash(&mut hasher);
    sni.hash(&mut hasher);
    hasher.finish()
}

fn client_cache_key(sni: &str, dialin_key: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    sni.hash(&mut hasher);
    dialin_key.hash(&mut hasher);
    hasher.finish()
}

/// Builds a kube client whose connections go through the dial-in stitching
/// socket, bound to one dialin key and acting as a bypass service account.
fn tunnel_client(
    socket_path: &str,
    sni: &str,
    dialin_key: &str,
    bypass_user: &str,
) -> Result<kube::Client> {
    let frame = DialinFrame {
        dialin_key: dialin_key.to_string(),
        user_name: bypass_user.to_string(),
        sni: sni.to_string(),
    };
    let connector = StitchConnector {
        socket_path: socket_path.to_string(),
        frame: Bytes::from(frame.encode()?),
    };
    let http_client = hyper::Client::builder().build::<_, hyper::Body>(connector);

    let bypass_user = bypass_user.to_string();
    let dialin_key = dialin_key.to_string();
    let service = ServiceBuilder::new()
        .timeout(TUNNEL_CLIENT_TIMEOUT)
        .map_request(move |mut req: http::Request<hyper::Body>| {
            // hyper's client wants absolute URIs; the authority is ignored
            // by the connector
            let path = req
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| "/".to_string());
            if let Ok(uri) = format!("http://dialin{path}").parse::<Uri>() {
                *req.uri_mut() = uri;
            }
            let headers = req.headers_mut();
            if let Ok(v) = bypass_user.parse() {
                headers.insert(HEADER_USER, v);
            }
            if let Ok(v) = dialin_key.parse() {
                headers.insert(HEADER_KEY, v);
            }
            if let Ok(v) = SYSTEM_NAMESPACE.parse() {
                headers.insert(HEADER_NAMESPACE, v);
            }
            req
        })
        .service(http_client);

    Ok(kube::Client::new(service, SYSTEM_NAMESPACE))
}

/// Connector that opens the stitching unix socket and sends the dial-in
/// frame before handing the stream to hyper.
#[derive(Clone)]
struct StitchConnector {
    socket_path: String,
    frame: Bytes,
}

impl tower::Service<Uri> for StitchConnector {
    type Response = StitchedStream;
    type Error = std::io::Error;
    type Future =
        Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _uri: Uri) -> Self::Future {
        let path = self.socket_path.clone();
        let frame = self.frame.clone();
        Box::pin(async move {
            let mut stream = UnixStream::connect(&path).await?;
            tokio::io::AsyncWriteExt::write_all(&mut stream, &frame).await?;
            Ok(StitchedStream { inner: stream })
        })
    }
}

struct StitchedStream {
    inner: UnixStream,
}

impl Connection for StitchedStream {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

impl AsyncRead for StitchedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for StitchedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_id_is_sni_prefix() {
        assert_eq!(
            cluster_id_from_sni("c1.user.relay.local").unwrap(),
            "c1"
        );
        assert!(cluster_id_from_sni("nodots").is_err());
        assert!(cluster_id_from_sni(".user.relay.local").is_err());
    }

    #[test]
    fn authz_cache_key_scopes_by_user_and_sni() {
        let a = authz_cache_key("alice", "c1.user.relay.local");
        assert_eq!(a, authz_cache_key("alice", "c1.user.relay.local"));
        assert_ne!(a, authz_cache_key("bob", "c1.user.relay.local"));
        assert_ne!(a, authz_cache_key("alice", "c2.user.relay.local"));
    }

    #[test]
    fn api_resource_from_rbac_documents() {
        let role = parse_rbac_document(
            r#"{
                "apiVersion": "rbac.authorization.k8s.io/v1",
                "kind": "Role",
                "metadata": {"name": "edit", "namespace": "team-a"},
                "rules": []
            }"#,
        )
        .unwrap();
        let ar = api_resource_for(&role).unwrap();
        assert_eq!(ar.group, "rbac.authorization.k8s.io");
        assert_eq!(ar.version, "v1");
        assert_eq!(ar.kind, "Role");

        let sa = parse_rbac_document(
            r#"{
                "apiVersion": "v1",
                "kind": "ServiceAccount",
                "metadata": {"name": "alice", "namespace": "relay-system"}
            }"#,
        )
        .unwrap();
        let ar = api_resource_for(&sa).unwrap();
        assert_eq!(ar.group, "");
        assert_eq!(ar.version, "v1");

        let missing_types = DynamicObject {
            types: None,
            metadata: Default::default(),
            data: serde_json::Value::Null,
        };
        assert!(api_resource_for(&missing_types).is_err());
    }
}
