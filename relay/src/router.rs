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
use std::time::Duration;

use http::StatusCode;
use hyper::upgrade::OnUpgrade;
use hyper::{Body, Request, Response};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use peering::{get_peer_cache, PeerCache};
use protocol::{
    check_relay_loops, set_x_forwarded_for, set_xray_uuid, DialinFrame, PeerAuthenticator,
    HEADER_CLEAR_SECRET, HEADER_CLUSTER_ID, HEADER_CLUSTER_SERVER_NAME, HEADER_KEY,
    HEADER_NAMESPACE, HEADER_SESSION_KEY, HEADER_USER, HEADER_USER_CERT_ISSUED,
    HEADER_XRAY_RELAY_UUID,
};

use crate::authz::AuthzProvisioner;
use crate::pool::DialinPool;
use crate::proxy::{forward_over_unix, forward_to_peer, spawn_upgrade_splice, unix_socket_path};
use crate::sessions::{role_check, secret_role_check, SessionCache, UserSession};

const DIALIN_MAX_ATTEMPTS: u32 = 7;
const DIALIN_RETRY_DELAY: Duration = Duration::from_secs(3);

const UNAUTH_MESSAGE: &str = "ERROR: Unauthenticated access not allowed. Please log in to the \
                              portal and download a new kubeconfig";

/// Namespace stamped on requests headed for the in-cluster agent.
const SYSTEM_NAMESPACE: &str = "relay-system";

/// Everything the user-facing request path needs, built once at startup.
pub struct RelayContext {
    pub server_name: String,
    pub dialin_server_name: String,
    pub service_name: String,
    pub relay_uuid: String,
    pub pool: Arc<DialinPool>,
    pub sessions: Arc<SessionCache>,
    pub provisioner: Arc<AuthzProvisioner>,
    pub peer_cache: Arc<PeerCache>,
    pub probe_tx: mpsc::Sender<String>,
    pub authenticator: Arc<PeerAuthenticator>,
    pub peer_client_tls: Arc<rustls::ClientConfig>,
}

/// Per-connection facts captured at TLS accept time.
#[derive(Debug, Clone)]
pub struct ConnInfo {
    pub sni: String,
    pub peer_cn: String,
    pub cert_issue_epoch: i64,
    pub remote_addr: String,
}

#[derive(Serialize)]
struct KubeStatus<'a> {
    kind: &'a str,
    #[serde(rename = "apiVersion")]
    api_version: &'a str,
    status: &'a str,
    message: &'a str,
    reason: &'a str,
    code: u16,
}

/// Renders a router failure the way the Kubernetes API does, so kubectl
/// shows a normal API error instead of a transport failure.
fn json_error(message: &str, reason: &str, code: StatusCode) -> Response<Body> {
    let status = KubeStatus {
        kind: "Status",
        api_version: "v1",
        status: "Failure",
        message,
        reason,
        code: code.as_u16(),
    };
    let body = serde_json::to_string(&status)
        .unwrap_or_else(|_| format!("{message} {reason}"));
    Response::builder()
        .status(code)
        .header(http::header::CONTENT_TYPE, "application/json; charset=utf-8")
        .header("x-content-type-options", "nosniff")
        .body(Body::from(body))
        .unwrap_or_default()
}

/// Identity resolved for one request, either from the client certificate or
/// from verified peer-forward headers.
struct RequestIdentity {
    user_name: String,
    session_key: String,
    cert_sni: String,
    cluster_id: String,
    cert_issue: i64,
}

fn header_str(req: &Request<Body>, name: &str) -> String {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// Routes one user-facing request: resolve identity, find (or wait for) a
/// tunnel, provision RBAC, filter by role, forward.
pub async fn process_relay_request(
    ctx: Arc<RelayContext>,
    conn: ConnInfo,
    mut req: Request<Body>,
) -> Response<Body> {
    let suffix = ctx.server_name.replace('*', "");
    if conn.sni == ctx.server_name || conn.sni == suffix.trim_start_matches('.') {
        error!(sni = %conn.sni, server_name = %ctx.server_name, "wildcard server name expected");
        return json_error(UNAUTH_MESSAGE, "invalid cert in kubeconfig", StatusCode::UNAUTHORIZED);
    }

    let Some(cluster_id) = conn.sni.strip_suffix(&suffix).map(str::to_string) else {
        error!(sni = %conn.sni, server_name = %ctx.server_name, "server name is not a suffix of sni");
        return json_error(UNAUTH_MESSAGE, "invalid cert in kubeconfig", StatusCode::UNAUTHORIZED);
    };
    if cluster_id.is_empty() {
        return json_error(UNAUTH_MESSAGE, "invalid cert in kubeconfig", StatusCode::UNAUTHORIZED);
    }

    let identity = if header_str(&req, HEADER_XRAY_RELAY_UUID).is_empty() {
        // direct user request; identity comes from the client certificate
        if conn.peer_cn.is_empty() {
            error!("certificate common name is empty");
            return json_error(
                UNAUTH_MESSAGE,
                "invalid cert in kubeconfig",
                StatusCode::UNAUTHORIZED,
            );
        }
        RequestIdentity {
            user_name: conn.peer_cn.clone(),
            session_key: format!("{}:{}", conn.sni, conn.peer_cn),
            cert_sni: conn.sni.clone(),
            cluster_id,
            cert_issue: conn.cert_issue_epoch,
        }
    } else {
        // forwarded by a peer relay; trust headers only after the AEAD
        // check passes
        if check_relay_loops(req.headers(), &ctx.relay_uuid) {
            error!(relay_uuid = %ctx.relay_uuid, "loop detected in peer forwards");
        }
        if !ctx.authenticator.check_headers(req.headers()) {
            error!("failed to validate peer security headers");
            return json_error(
                UNAUTH_MESSAGE,
                "failed to validate request in peer proxy",
                StatusCode::UNAUTHORIZED,
            );
        }

        let user_name = header_str(&req, HEADER_USER);
        let cluster_server_name = header_str(&req, HEADER_CLUSTER_SERVER_NAME);
        let peer_cluster_id = header_str(&req, HEADER_CLUSTER_ID);
        let cert_issue = header_str(&req, HEADER_USER_CERT_ISSUED)
            .parse::<i64>()
            .unwrap_or_else(|_| {
                warn!("peer did not send a valid cert issue header");
                0
            });

        if user_name.is_empty() || cluster_server_name.is_empty() || peer_cluster_id.is_empty() {
            error!("peer forward is missing identity headers");
            return json_error(
                UNAUTH_MESSAGE,
                "failed to find user/cluster details",
                StatusCode::UNAUTHORIZED,
            );
        }

        RequestIdentity {
            session_key: format!("{cluster_server_name}:{user_name}"),
            user_name,
            cert_sni: cluster_server_name,
            cluster_id: peer_cluster_id,
            cert_issue,
        }
    };

    let session = match ctx.sessions.get(&identity.session_key) {
        Some(session) => {
            debug!(key = %identity.session_key, "found existing session");
            session
        }
        None => {
            info!(key = %identity.session_key, "created new session");
            ctx.sessions.add(
                &identity.session_key,
                UserSession {
                    server_name: ctx.server_name.clone(),
                    cert_sni: identity.cert_sni.clone(),
                    ..Default::default()
                },
            )
        }
    };

    let dialin_sni = ctx.dialin_server_name.replace('*', &identity.cluster_id);

    // resolve a dialin key: sticky key first, then the local pool, then a
    // peer relay, retrying while probes fan out
    let mut attempt: u32 = 0;
    let dialin_key = loop {
        let sticky = session
            .read()
            .map(|s| s.dialin_cached_key.clone())
            .unwrap_or_default();

        if !sticky.is_empty() {
            if ctx.pool.check_dialin_key_exist(&sticky) {
                break sticky;
            }
            if let Ok(mut s) = session.write() {
                s.dialin_cached_key.clear();
            }
            continue;
        }

        match ctx.pool.get_dialin_connector_key(&dialin_sni) {
            Ok(key) => {
                if let Ok(mut s) = session.write() {
                    s.dialin_cached_key = key.clone();
                }
                break key;
            }
            Err(e) => {
                info!(error = %e, attempt, "no local dialins");
                if let Some(relay_ip) = get_peer_cache(&ctx.peer_cache, &dialin_sni) {
                    return process_peer_forward(&ctx, &conn, &identity, relay_ip, req).await;
                }
                if attempt == 0 {
                    send_peer_probe(&ctx.probe_tx, dialin_sni.clone());
                }
                attempt += 1;
                if attempt > DIALIN_MAX_ATTEMPTS {
                    return json_error(
                        "ERROR: failed to forward request to cluster. Please retry",
                        "failed to find connection",
                        StatusCode::INTERNAL_SERVER_ERROR,
                    );
                }
                tokio::time::sleep(DIALIN_RETRY_DELAY).await;
            }
        }
    };

    debug!(key = %dialin_key, session = %identity.session_key, "dialin connection lookup");

    let socket_path = unix_socket_path(&ctx.dialin_server_name);
    let error_flag = session.read().map(|s| s.error_flag).unwrap_or(false);
    let session_user = session
        .read()
        .map(|s| s.user_name.clone())
        .unwrap_or_default();

    if session_user.is_empty() {
        match ctx
            .provisioner
            .provision_authz_for_user(
                &socket_path,
                &identity.user_name,
                identity.cert_sni.as_str(),
                &dialin_key,
                error_flag,
                false,
                identity.cert_issue,
            )
            .await
        {
            Ok(user) => {
                if let Ok(mut s) = session.write() {
                    s.user_name = user.user_name;
                    s.role_name = user.role_name;
                    s.is_read_role = user.is_read;
                    s.is_org_admin = user.is_org_admin;
                    s.enforce_org_admin_only_secret = user.enforce_org_admin_only_secret_access;
                }
            }
            Err(e) => {
                error!(error = %e, "unable to provision authz for user");
                let message = match e {
                    crate::Error::Authz(_) => format!(
                        "ERROR: Unauthenticated access not allowed. Please log in to the portal \
                         via browser, or set up an API key, for access via the secure kubectl \
                         proxy. Error: {e}"
                    ),
                    _ => "ERROR: Connection timed-out. Unable to provision cluster RBAC. Please \
                          retry."
                        .to_string(),
                };
                if let Ok(mut s) = session.write() {
                    s.dialin_cached_key.clear();
                }
                ctx.sessions.delete(&identity.session_key);
                return json_error(
                    &message,
                    "unable to proxy kubectl service",
                    StatusCode::UNAUTHORIZED,
                );
            }
        }
    } else {
        // non-blocking refresh off the critical path
        let provisioner = ctx.provisioner.clone();
        let refresh_session = session.clone();
        let socket_path = socket_path.clone();
        let user_cn = identity.user_name.clone();
        let cert_sni = identity.cert_sni.clone();
        let key = dialin_key.clone();
        let cert_issue = identity.cert_issue;
        tokio::spawn(async move {
            match provisioner
                .provision_authz_for_user(
                    &socket_path,
                    &user_cn,
                    &cert_sni,
                    &key,
                    error_flag,
                    true,
                    cert_issue,
                )
                .await
            {
                Ok(user) => {
                    if let Ok(mut s) = refresh_session.write() {
                        s.role_name = user.role_name;
                        s.is_read_role = user.is_read;
                        s.is_org_admin = user.is_org_admin;
                        s.enforce_org_admin_only_secret =
                            user.enforce_org_admin_only_secret_access;
                    }
                }
                Err(e) => {
                    error!(error = %e, "background authz refresh failed");
                    if let Ok(mut s) = refresh_session.write() {
                        s.user_name.clear();
                    }
                }
            }
        });
    }

    // role based request filtering
    {
        let s = match session.read() {
            Ok(s) => s,
            Err(_) => return json_error(
                "ERROR: failed to forward request to cluster. Please retry",
                "session state unavailable",
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        };
        if s.is_read_role && role_check(req.method().as_str(), req.uri().path()) {
            let message = format!("ERROR: request forbidden for the role {}.", s.role_name);
            return json_error(
                &message,
                "unable to authorize user request",
                StatusCode::UNAUTHORIZED,
            );
        }
        if s.enforce_org_admin_only_secret
            && !s.is_org_admin
            && secret_role_check(req.method().as_str(), req.uri().path())
        {
            return json_error(
                "ERROR: request for secret resource is forbidden. Contact your organization admin",
                "unable to authorize user request to secret",
                StatusCode::UNAUTHORIZED,
            );
        }
    }

    // headers the agent uses to resolve the user inside the cluster
    let provisioned_user = session
        .read()
        .map(|s| s.user_name.clone())
        .unwrap_or_default();
    set_header(&mut req, HEADER_USER, &provisioned_user);
    set_header(&mut req, HEADER_KEY, &dialin_key);
    set_header(&mut req, HEADER_NAMESPACE, SYSTEM_NAMESPACE);
    set_header(&mut req, HEADER_SESSION_KEY, &identity.session_key);
    set_x_forwarded_for(req.headers_mut(), &conn.remote_addr);
    set_xray_uuid(req.headers_mut(), &ctx.relay_uuid);
    if error_flag {
        set_header(&mut req, HEADER_CLEAR_SECRET, "true");
    }

    let server_upgrade = req.extensions_mut().remove::<OnUpgrade>();
    let frame = DialinFrame {
        dialin_key: dialin_key.clone(),
        user_name: identity.user_name.clone(),
        sni: conn.sni.clone(),
    };

    let mut resp = match forward_over_unix(&socket_path, &frame, req).await {
        Ok(resp) => resp,
        Err(e) => {
            error!(error = %e, "unable to forward to dialin");
            return json_error(
                "ERROR: failed to forward request to cluster. Please retry",
                "unable to create forward handler",
                StatusCode::INTERNAL_SERVER_ERROR,
            );
        }
    };

    if resp.status() == StatusCode::SWITCHING_PROTOCOLS {
        if let Some(server_upgrade) = server_upgrade {
            let upstream_upgrade = hyper::upgrade::on(&mut resp);
            spawn_upgrade_splice(server_upgrade, upstream_upgrade);
        }
    }

    // a 401/502 from the upstream invalidates the sticky binding
    if resp.status() == StatusCode::UNAUTHORIZED || resp.status() == StatusCode::BAD_GATEWAY {
        if let Ok(mut s) = session.write() {
            s.error_flag = true;
            s.dialin_cached_key.clear();
        }
        ctx.sessions.delete(&identity.session_key);
    }

    resp
}

/// Forwards a user request to the peer relay that claims the cluster,
/// attaching the security headers the peer verifies.
async fn process_peer_forward(
    ctx: &RelayContext,
    conn: &ConnInfo,
    identity: &RequestIdentity,
    relay_ip: String,
    mut req: Request<Body>,
) -> Response<Body> {
    debug!(%relay_ip, sni = %conn.sni, "forwarding to peer relay");

    set_header(&mut req, HEADER_USER, &identity.user_name);
    set_header(&mut req, HEADER_CLUSTER_SERVER_NAME, &conn.sni);
    set_header(&mut req, HEADER_CLUSTER_ID, &identity.cluster_id);
    set_header(
        &mut req,
        HEADER_USER_CERT_ISSUED,
        &identity.cert_issue.to_string(),
    );
    set_x_forwarded_for(req.headers_mut(), &conn.remote_addr);
    set_xray_uuid(req.headers_mut(), &ctx.relay_uuid);
    if let Err(e) = ctx.authenticator.set_header_nonce(req.headers_mut()) {
        error!(error = %e, "unable to set peer security headers");
        return json_error(
            "ERROR: failed to forward request to cluster. Please retry",
            "unable to create peer handler",
            StatusCode::INTERNAL_SERVER_ERROR,
        );
    }

    let server_upgrade = req.extensions_mut().remove::<OnUpgrade>();

    match forward_to_peer(ctx.peer_client_tls.clone(), &relay_ip, &conn.sni, req).await {
        Ok(mut resp) => {
            if resp.status() == StatusCode::SWITCHING_PROTOCOLS {
                if let Some(server_upgrade) = server_upgrade {
                    let upstream_upgrade = hyper::upgrade::on(&mut resp);
                    spawn_upgrade_splice(server_upgrade, upstream_upgrade);
                }
            }
            // the candidate was stale; make the next request re-probe
            if resp.status() == StatusCode::UNAUTHORIZED
                || resp.status() == StatusCode::BAD_GATEWAY
            {
                let dialin_sni = ctx.dialin_server_name.replace('*', &identity.cluster_id);
                ctx.peer_cache.remove(&dialin_sni);
            }
            resp
        }
        Err(e) => {
            error!(error = %e, %relay_ip, "peer forward failed");
            let dialin_sni = ctx.dialin_server_name.replace('*', &identity.cluster_id);
            ctx.peer_cache.remove(&dialin_sni);
            json_error(
                "ERROR: failed to forward request to cluster. Please retry",
                "peer relay unreachable",
                StatusCode::INTERNAL_SERVER_ERROR,
            )
        }
    }
}

fn set_header(req: &mut Request<Body>, name: &'static str, value: &str) {
    match http::HeaderValue::from_str(value) {
        Ok(v) => {
            req.headers_mut().insert(name, v);
        }
        Err(_) => {
            req.headers_mut().remove(name);
        }
    }
}

/// Queues a probe for the peering manager; drops the signal when the queue
/// is full rather than blocking the request path.
fn send_peer_probe(tx: &mpsc::Sender<String>, dialin_sni: String) {
    if let Err(e) = tx.try_send(dialin_sni) {
        debug!(error = %e, "probe queue full, dropping probe signal");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn json_error_renders_kube_status() {
        let resp = json_error("boom", "test-reason", StatusCode::UNAUTHORIZED);
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["kind"], "Status");
        assert_eq!(value["status"], "Failure");
        assert_eq!(value["code"], 401);
        assert_eq!(value["reason"], "test-reason");
    }
}
