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

// End to end tunnel tests: a real agent dials a real relay over TLS, the
// relay parks the connection in its dialin pool, and bytes written into
// the stitching socket come back from the agent-local upstream.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::{Certificate, Identity, Server as TonicServer, ServerTlsConfig};

use agent::client::start_network;
use agent::config::{AgentConfig, Upstream};
use peering::pb::cluster_authorization_server::{
    ClusterAuthorization, ClusterAuthorizationServer,
};
use peering::pb::{GetUserAuthorizationRequest, GetUserAuthorizationResponse};
use protocol::{DialinFrame, PeerAuthenticator};
use relay::authz::AuthzProvisioner;
use relay::pool::DialinPool;
use relay::proxy::{run_unix_listener, unix_socket_path};
use relay::router::RelayContext;
use relay::server::{ConnectionRegistry, RelayServer, ServerBlock, ServerKind};
use relay::sessions::SessionCache;
use relay::tlsutil;

const TEST_PEER_KEY: &str = "6368616e676520746869732070617373776f726420746f206120736563726574";

struct TestCa {
    cert: rcgen::Certificate,
    key: KeyPair,
}

impl TestCa {
    fn new() -> Self {
        let key = KeyPair::generate().expect("generate ca key");
        let mut params = CertificateParams::new(Vec::<String>::new()).expect("ca params");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(DnType::CommonName, "tunnel-test-ca");
        let cert = params.self_signed(&key).expect("self sign ca");
        TestCa { cert, key }
    }

    fn ca_pem(&self) -> String {
        self.cert.pem()
    }

    fn issue(&self, cn: &str, sans: Vec<String>) -> (String, String) {
        let key = KeyPair::generate().expect("generate leaf key");
        let mut params = CertificateParams::new(sans).expect("leaf params");
        params.distinguished_name.push(DnType::CommonName, cn);
        params
            .distinguished_name
            .push(DnType::OrganizationalUnitName, "org-test");
        let cert = params
            .signed_by(&key, &self.cert, &self.key)
            .expect("sign leaf");
        (cert.pem(), key.serialize_pem())
    }
}

struct RelayEnv {
    addr: SocketAddr,
    pool: Arc<DialinPool>,
    user_server_name: String,
    dialin_server_name: String,
}

/// Builds and starts a relay instance with its own server-name namespace
/// so parallel tests do not collide on unix sockets.
async fn start_relay(ca: &TestCa, tag: &str, peer_service_uri: String) -> RelayEnv {
    let user_server_name = format!("*.user.{tag}.local");
    let dialin_server_name = format!("*.connector.{tag}.local");

    let (user_cert, user_key) = ca.issue(
        &format!("relay-user-{tag}"),
        vec![format!("*.user.{tag}.local")],
    );
    let (conn_cert, conn_key) = ca.issue(
        &format!("relay-connector-{tag}"),
        vec![format!("*.connector.{tag}.local")],
    );
    let (peer_cert, peer_key) = ca.issue(&format!("relay-peer-{tag}"), Vec::new());

    let connections = ConnectionRegistry::new();
    let pool = DialinPool::new(Some(connections.disconnect_hook()));
    let (probe_tx, _probe_rx) = mpsc::channel::<String>(256);

    let provisioner = AuthzProvisioner::new(
        peer_service_uri,
        peer_cert.into_bytes(),
        peer_key.into_bytes(),
        ca.ca_pem().into_bytes(),
    );

    let relay_ctx = Arc::new(RelayContext {
        server_name: user_server_name.clone(),
        dialin_server_name: dialin_server_name.clone(),
        service_name: "kubectl".to_string(),
        relay_uuid: format!("test-relay-{tag}"),
        pool: pool.clone(),
        sessions: SessionCache::new(),
        provisioner,
        peer_cache: Arc::new(peering::new_peer_cache()),
        probe_tx,
        authenticator: Arc::new(PeerAuthenticator::new(TEST_PEER_KEY).expect("authenticator")),
        peer_client_tls: tlsutil::client_config(
            user_cert.as_bytes(),
            user_key.as_bytes(),
            ca.ca_pem().as_bytes(),
            &[b"http/1.1"],
        )
        .expect("peer client tls"),
    });

    let blocks = vec![
        Arc::new(ServerBlock {
            kind: ServerKind::Relay,
            name: "kubectl".to_string(),
            server_name: user_server_name.clone(),
            tls: tlsutil::server_config(
                user_cert.as_bytes(),
                user_key.as_bytes(),
                ca.ca_pem().as_bytes(),
                &[b"http/1.1"],
            )
            .expect("user tls"),
        }),
        Arc::new(ServerBlock {
            kind: ServerKind::Dialin,
            name: "kubectl".to_string(),
            server_name: dialin_server_name.clone(),
            tls: tlsutil::server_config(
                conn_cert.as_bytes(),
                conn_key.as_bytes(),
                ca.ca_pem().as_bytes(),
                &[],
            )
            .expect("connector tls"),
        }),
    ];

    let server = Arc::new(RelayServer {
        blocks,
        pool: pool.clone(),
        relay_ctx,
        connections,
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind relay listener");
    let addr = listener.local_addr().expect("relay addr");
    tokio::spawn(server.serve(listener));

    let stitch_pool = pool.clone();
    let stitch_name = dialin_server_name.clone();
    tokio::spawn(async move {
        let _ = run_unix_listener(stitch_pool, stitch_name, "kubectl".to_string()).await;
    });

    RelayEnv {
        addr,
        pool,
        user_server_name,
        dialin_server_name,
    }
}

fn start_agent(ca: &TestCa, env: &RelayEnv, cluster_id: &str, upstream: Upstream) {
    let (cert, key) = ca.issue(&format!("agent-{cluster_id}"), Vec::new());
    let server_name = env.dialin_server_name.replace('*', cluster_id);

    let config = AgentConfig {
        cluster_id: cluster_id.to_string(),
        service_name: "kubectl".to_string(),
        server_addr: format!("{server_name}:{}", env.addr.port()),
        relay_address: Some(env.addr.to_string()),
        server_name,
        client_cert: cert.into_bytes(),
        client_key: key.into_bytes(),
        root_ca: ca.ca_pem().into_bytes(),
        upstream,
        egress_proxy: None,
        egress_proxy_auth: None,
        max_dials: 1,
    };
    start_network(config).expect("start agent network");
}

async fn wait_for_dialin(env: &RelayEnv, dialin_sni: &str) {
    for _ in 0..150 {
        if env.pool.connector_count(dialin_sni) > 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("agent never registered a dialin for {dialin_sni}");
}

async fn run_unix_echo(path: String) {
    let _ = tokio::fs::remove_file(&path).await;
    let listener = UnixListener::bind(&path).expect("bind echo socket");
    loop {
        let Ok((mut stream, _)) = listener.accept().await else {
            return;
        };
        tokio::spawn(async move {
            let mut buf = [0u8; 8192];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => {
                        if stream.write_all(&buf[..n]).await.is_err() {
                            return;
                        }
                        let _ = stream.flush().await;
                    }
                }
            }
        });
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn tunnel_registers_and_echoes_bytes() {
    let ca = TestCa::new();
    let env = start_relay(&ca, "t1", "https://localhost:1".to_string()).await;

    let tmp = tempfile::tempdir().expect("tempdir");
    let echo_path = tmp
        .path()
        .join("echo.sock")
        .to_string_lossy()
        .to_string();
    tokio::spawn(run_unix_echo(echo_path.clone()));

    start_agent(&ca, &env, "c1", Upstream::Unix(echo_path));

    let dialin_sni = env.dialin_server_name.replace('*', "c1");
    wait_for_dialin(&env, &dialin_sni).await;

    let key = env
        .pool
        .get_dialin_connector_key(&dialin_sni)
        .expect("connector key");
    assert!(env.pool.check_dialin_key_exist(&key));

    // stitch a connection through the tunnel and expect our bytes back
    let socket_path = unix_socket_path(&env.dialin_server_name);
    let mut stream = UnixStream::connect(&socket_path)
        .await
        .expect("connect stitch socket");
    let frame = DialinFrame {
        dialin_key: key,
        user_name: "tester".to_string(),
        sni: env.user_server_name.replace('*', "c1"),
    };
    stream
        .write_all(&frame.encode().expect("encode frame"))
        .await
        .expect("send frame");

    stream
        .write_all(b"hello tunnel")
        .await
        .expect("send payload");
    stream.flush().await.expect("flush payload");

    let mut echoed = [0u8; 12];
    tokio::time::timeout(Duration::from_secs(10), stream.read_exact(&mut echoed))
        .await
        .expect("echo timed out")
        .expect("read echo");
    assert_eq!(&echoed, b"hello tunnel");
}

// ---- the full user path: TLS + session routing + RBAC provisioning ----

struct MockAuthz;

#[tonic::async_trait]
impl ClusterAuthorization for MockAuthz {
    async fn get_user_authorization(
        &self,
        request: tonic::Request<GetUserAuthorizationRequest>,
    ) -> Result<tonic::Response<GetUserAuthorizationResponse>, tonic::Status> {
        let req = request.into_inner();
        let is_read = req.user_cn.starts_with("viewer");
        let service_account = serde_json::json!({
            "apiVersion": "v1",
            "kind": "ServiceAccount",
            "metadata": {"name": "tunnel-user-sa", "namespace": "relay-system"}
        })
        .to_string();

        Ok(tonic::Response::new(GetUserAuthorizationResponse {
            user_name: "tunnel-user-sa".to_string(),
            role_name: if is_read { "view" } else { "admin" }.to_string(),
            is_read,
            is_org_admin: false,
            enforce_org_admin_only_secret_access: false,
            service_account,
            cluster_roles: Vec::new(),
            cluster_role_bindings: Vec::new(),
            roles: Vec::new(),
            role_bindings: Vec::new(),
            delete_cluster_role_bindings: Vec::new(),
            delete_role_bindings: Vec::new(),
            namespaces: Vec::new(),
        }))
    }
}

async fn start_mock_authz(ca: &TestCa) -> SocketAddr {
    let (cert, key) = ca.issue("mock-authz", vec!["localhost".to_string()]);
    let tls = ServerTlsConfig::new()
        .identity(Identity::from_pem(cert, key))
        .client_ca_root(Certificate::from_pem(ca.ca_pem()));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind authz listener");
    let addr = listener.local_addr().expect("authz addr");
    tokio::spawn(async move {
        TonicServer::builder()
            .tls_config(tls)
            .expect("authz tls")
            .add_service(ClusterAuthorizationServer::new(MockAuthz))
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .expect("serve mock authz");
    });
    addr
}

/// A stand-in kube apiserver behind the agent: answers the version probe,
/// accepts RBAC applies, and serves a recognizable pod list.
async fn run_fake_apiserver(path: String) {
    let _ = tokio::fs::remove_file(&path).await;
    let listener = UnixListener::bind(&path).expect("bind apiserver socket");
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        tokio::spawn(async move {
            let service = hyper::service::service_fn(|req: hyper::Request<hyper::Body>| async move {
                let path = req.uri().path().to_string();
                let body = if path.starts_with("/version") {
                    serde_json::json!({
                        "major": "1",
                        "minor": "29",
                        "gitVersion": "v1.29.0",
                        "gitCommit": "0000000000000000000000000000000000000000",
                        "gitTreeState": "clean",
                        "buildDate": "2024-01-01T00:00:00Z",
                        "goVersion": "go1.21.5",
                        "compiler": "gc",
                        "platform": "linux/amd64"
                    })
                    .to_string()
                } else if path.contains("/serviceaccounts") {
                    serde_json::json!({
                        "apiVersion": "v1",
                        "kind": "ServiceAccount",
                        "metadata": {"name": "tunnel-user-sa", "namespace": "relay-system"}
                    })
                    .to_string()
                } else if path == "/api/v1/namespaces/default/pods" {
                    "pods-response".to_string()
                } else {
                    serde_json::json!({"kind": "Status", "status": "Success"}).to_string()
                };
                Ok::<_, std::convert::Infallible>(
                    hyper::Response::builder()
                        .status(200)
                        .header("content-type", "application/json")
                        .body(hyper::Body::from(body))
                        .expect("build response"),
                )
            });
            let _ = hyper::server::conn::Http::new()
                .serve_connection(stream, service)
                .await;
        });
    }
}

/// Issues one HTTPS request to the relay the way kubectl would: TLS with a
/// client certificate and the cluster's SNI.
async fn user_request(
    ca: &TestCa,
    relay_addr: SocketAddr,
    sni: &str,
    user_cn: &str,
    method: &str,
    path: &str,
) -> (http::StatusCode, bytes::Bytes) {
    let (cert, key) = ca.issue(user_cn, Vec::new());
    let tls = tlsutil::client_config(
        cert.as_bytes(),
        key.as_bytes(),
        ca.ca_pem().as_bytes(),
        &[b"http/1.1"],
    )
    .expect("user tls");

    let tcp = TcpStream::connect(relay_addr).await.expect("connect relay");
    let server_name = rustls::ServerName::try_from(sni).expect("server name");
    let stream = TlsConnector::from(tls)
        .connect(server_name, tcp)
        .await
        .expect("tls handshake");

    let (mut sender, conn) = hyper::client::conn::Builder::new()
        .handshake::<_, hyper::Body>(stream)
        .await
        .expect("http handshake");
    tokio::spawn(conn);

    let req = hyper::Request::builder()
        .method(method)
        .uri(path)
        .header(http::header::HOST, sni)
        .body(hyper::Body::empty())
        .expect("build request");

    let resp = tokio::time::timeout(Duration::from_secs(30), sender.send_request(req))
        .await
        .expect("request timed out")
        .expect("request failed");
    let status = resp.status();
    let body = hyper::body::to_bytes(resp.into_body())
        .await
        .expect("read body");
    (status, body)
}

#[tokio::test(flavor = "multi_thread")]
async fn user_request_reaches_cluster_through_tunnel() {
    let ca = TestCa::new();
    let authz_addr = start_mock_authz(&ca).await;
    let env = start_relay(
        &ca,
        "t2",
        format!("https://localhost:{}", authz_addr.port()),
    )
    .await;

    let tmp = tempfile::tempdir().expect("tempdir");
    let apiserver_path = tmp
        .path()
        .join("apiserver.sock")
        .to_string_lossy()
        .to_string();
    tokio::spawn(run_fake_apiserver(apiserver_path.clone()));

    start_agent(&ca, &env, "c2", Upstream::Unix(apiserver_path));
    wait_for_dialin(&env, &env.dialin_server_name.replace('*', "c2")).await;

    let user_sni = env.user_server_name.replace('*', "c2");

    // a normal user lists pods and sees the upstream's answer
    let (status, body) = user_request(
        &ca,
        env.addr,
        &user_sni,
        "alice@example.com",
        "GET",
        "/api/v1/namespaces/default/pods",
    )
    .await;
    assert_eq!(status, http::StatusCode::OK);
    assert_eq!(&body[..], b"pods-response");

    // a read-only user is rejected before the request reaches the tunnel
    let (status, body) = user_request(
        &ca,
        env.addr,
        &user_sni,
        "viewer@example.com",
        "POST",
        "/api/v1/namespaces/default/pods/web-0/exec",
    )
    .await;
    assert_eq!(status, http::StatusCode::UNAUTHORIZED);
    let status_doc: serde_json::Value = serde_json::from_slice(&body).expect("status json");
    assert_eq!(status_doc["kind"], "Status");
    assert_eq!(status_doc["code"], 401);
}
