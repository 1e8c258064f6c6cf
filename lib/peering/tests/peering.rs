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

// End to end exercise of the peering protocol:
// * start the discovery service with mTLS
// * run two relay clients, their Hello streams build the active relay list
// * relay 1 probes for a cluster only relay 2 holds
// * the service broadcasts a survey, relay 2 answers it
// * relay 1's peer cache learns relay 2's address from the probe response

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Identity, Server, ServerTlsConfig};

use peering::client::{client_hello_rpc, client_probe_rpc, client_survey_rpc, DialinLookup};
use peering::pb::relay_peer_service_client::RelayPeerServiceClient;
use peering::pb::relay_peer_service_server::RelayPeerServiceServer;
use peering::{get_peer_cache, new_peer_cache, PeerCache, PeerService, PEER_CACHE_EXPIRY};

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
            .push(DnType::CommonName, "peering-test-ca");
        let cert = params.self_signed(&key).expect("self sign ca");
        TestCa { cert, key }
    }

    fn ca_pem(&self) -> String {
        self.cert.pem()
    }

    /// Issues a leaf certificate with the given CN/OU, valid for the given
    /// DNS names.
    fn issue(&self, cn: &str, ou: &str, sans: Vec<String>) -> (String, String) {
        let key = KeyPair::generate().expect("generate leaf key");
        let mut params = CertificateParams::new(sans).expect("leaf params");
        params.distinguished_name.push(DnType::CommonName, cn);
        params
            .distinguished_name
            .push(DnType::OrganizationalUnitName, ou);
        let cert = params
            .signed_by(&key, &self.cert, &self.key)
            .expect("sign leaf");
        (cert.pem(), key.serialize_pem())
    }
}

async fn start_service(ca: &TestCa) -> (SocketAddr, PeerService) {
    let (server_cert, server_key) = ca.issue("peering-service", "org-test", vec![
        "localhost".to_string(),
    ]);

    let (service, survey_rx) = PeerService::new("127.0.0.1".to_string());
    let survey_service = service.clone();
    tokio::spawn(async move { survey_service.run_survey_handler(survey_rx).await });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind service listener");
    let addr = listener.local_addr().expect("service addr");

    let tls = ServerTlsConfig::new()
        .identity(Identity::from_pem(server_cert, server_key))
        .client_ca_root(Certificate::from_pem(ca.ca_pem()));

    let server_service = service.clone();
    tokio::spawn(async move {
        Server::builder()
            .tls_config(tls)
            .expect("server tls")
            .add_service(RelayPeerServiceServer::new(server_service))
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .expect("serve peering");
    });

    (addr, service)
}

struct TestRelay {
    cache: Arc<PeerCache>,
    probe_tx: mpsc::Sender<String>,
}

/// Connects one relay to the service and spawns its three stream pumps.
async fn start_relay(
    ca: &TestCa,
    addr: SocketAddr,
    name: &str,
    relay_uuid: &str,
    relay_ip: &str,
    dialin_count: usize,
) -> TestRelay {
    let (cert, key) = ca.issue(name, "org-test", Vec::new());

    let tls = ClientTlsConfig::new()
        .domain_name("localhost")
        .ca_certificate(Certificate::from_pem(ca.ca_pem()))
        .identity(Identity::from_pem(cert, key));

    let channel = Channel::from_shared(format!("https://localhost:{}", addr.port()))
        .expect("endpoint")
        .tls_config(tls)
        .expect("client tls")
        .connect()
        .await
        .expect("connect to peering service");

    let cache = Arc::new(new_peer_cache());
    let (probe_tx, probe_rx) = mpsc::channel::<String>(256);
    let probe_rx = Arc::new(Mutex::new(probe_rx));

    let mut hello_client = RelayPeerServiceClient::new(channel.clone());
    let uuid = relay_uuid.to_string();
    let ip = relay_ip.to_string();
    tokio::spawn(async move {
        let _ = client_hello_rpc(&mut hello_client, Duration::from_secs(60), &uuid, &ip).await;
    });

    // let the hello stream register the relay before binding the others
    tokio::time::sleep(Duration::from_secs(2)).await;

    let mut probe_client = RelayPeerServiceClient::new(channel.clone());
    let probe_cache = cache.clone();
    let uuid = relay_uuid.to_string();
    let ip = relay_ip.to_string();
    tokio::spawn(async move {
        let _ = client_probe_rpc(
            &mut probe_client,
            probe_cache,
            &uuid,
            PEER_CACHE_EXPIRY,
            probe_rx,
            &ip,
        )
        .await;
    });

    let mut survey_client = RelayPeerServiceClient::new(channel);
    let uuid = relay_uuid.to_string();
    let ip = relay_ip.to_string();
    let lookup: DialinLookup = Arc::new(move |_sni: &str| dialin_count);
    tokio::spawn(async move {
        let _ = client_survey_rpc(&mut survey_client, &uuid, &ip, lookup).await;
    });

    TestRelay { cache, probe_tx }
}

#[tokio::test(flavor = "multi_thread")]
async fn probe_discovers_cluster_held_by_peer() {
    let ca = TestCa::new();
    let (addr, service) = start_service(&ca).await;

    // relay 1 holds nothing, relay 2 holds the cluster
    let relay1 = start_relay(&ca, addr, "relay-1", "uuid-relay-1", "1.1.1.1", 0).await;
    let _relay2 = start_relay(&ca, addr, "relay-2", "uuid-relay-2", "2.2.2.2", 1).await;

    // both hellos should be registered under the shared OU by now
    assert_eq!(service.relay_count("org-test"), 2);

    relay1
        .probe_tx
        .send("dummycluster.connector.test".to_string())
        .await
        .expect("send probe");

    // the survey round trip is bounded at ~5s of cache polling
    let mut learned = None;
    for _ in 0..100 {
        if let Some(ip) = get_peer_cache(&relay1.cache, "dummycluster.connector.test") {
            learned = Some(ip);
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    assert_eq!(
        learned.as_deref(),
        Some("2.2.2.2"),
        "relay 1 should learn relay 2's address"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn probe_for_unknown_cluster_yields_nothing() {
    let ca = TestCa::new();
    let (addr, _service) = start_service(&ca).await;

    let relay1 = start_relay(&ca, addr, "relay-1", "uuid-a-1", "1.1.1.1", 0).await;
    let _relay2 = start_relay(&ca, addr, "relay-2", "uuid-a-2", "2.2.2.2", 0).await;

    relay1
        .probe_tx
        .send("ghostcluster.connector.test".to_string())
        .await
        .expect("send probe");

    tokio::time::sleep(Duration::from_secs(7)).await;
    assert!(get_peer_cache(&relay1.cache, "ghostcluster.connector.test").is_none());
}
