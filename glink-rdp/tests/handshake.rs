//! End-to-end over loopback UDP: handshake, start, metrics, rejection.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use glink_core::{
    codec, protected_commands, AcceptCmd, ConnectCmd, Identity, MetricsCmd, Packet, Route,
    SessionKey, SignedMessage, StopCmd, Version, PACKET_SIZE,
};
use glink_rdp::dispatch::protect;
use glink_rdp::{
    Client, ClientConfig, ClientState, Cluster, Peer, RdpError, Server, ServerConfig,
    StaticMetrics,
};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct BrokerConfig {
    brokers: Vec<String>,
}

async fn running_server() -> (Arc<Server>, std::net::SocketAddr, CancellationToken) {
    let server = Server::new("test server", ServerConfig::default());
    let listener = server.bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cancel = CancellationToken::new();
    tokio::spawn(listener.run(cancel.clone()));
    (server, addr, cancel)
}

fn quick_config() -> ClientConfig {
    ClientConfig {
        handshake_timeout: Duration::from_secs(2),
        health_period: Duration::from_millis(50),
        queue_capacity: 16,
    }
}

fn connect_packet(signer: &Identity, connect: &ConnectCmd) -> Packet {
    let signed = SignedMessage::sign(signer, connect).unwrap();
    Packet::connect(&codec::encode(&signed).unwrap()).unwrap()
}

/// Join `cluster` from a bare socket, returning the session key the cluster uses.
async fn join_by_hand(addr: SocketAddr, cluster: &Cluster) -> (UdpSocket, SessionKey) {
    let identity = Identity::generate();
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let connect = ConnectCmd {
        cluster: cluster.certificate(),
        peer: identity.peer_key(),
        version: Version::ZERO,
    };
    socket
        .send_to(connect_packet(&identity, &connect).as_bytes(), addr)
        .await
        .unwrap();
    let mut buf = [0u8; PACKET_SIZE];
    let (n, _) = tokio::time::timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let reply: SignedMessage = codec::decode(&buf[..n]).unwrap();
    assert!(reply.verify(&cluster.certificate()));
    let accept: AcceptCmd = codec::decode(&reply.data).unwrap();
    let session = identity.session(&accept.key);
    (socket, session)
}

async fn wait_for<F: Fn() -> bool>(check: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn handshake_then_start() {
    let (server, addr, cancel) = running_server().await;
    let cluster = server.add_cluster(1, "cluster 1", 2).unwrap();

    let client = Client::new("1.1.1".parse().unwrap(), quick_config());
    let (start_tx, mut start_rx) = mpsc::unbounded_channel();
    client
        .on_start(move |config| {
            start_tx.send(config.to_vec())?;
            Ok(())
        })
        .unwrap();

    let session = client
        .connect(addr, cluster.certificate(), cancel.clone())
        .await
        .unwrap();
    assert_eq!(session.cluster_index(), 1);
    assert_eq!(session.cluster_key(), cluster.public_key());
    assert_eq!(client.state(), ClientState::Connected);

    let peer = cluster.peer(client.certificate()).unwrap();
    assert!(peer.is_accepted());
    assert_eq!(peer.version(), Version::new(1, 1, 1));

    let config = BrokerConfig {
        brokers: vec!["a".to_string(), "b".to_string()],
    };
    cluster.send_start(client.certificate(), &config).await.unwrap();
    let received = tokio::time::timeout(Duration::from_secs(5), start_rx.recv())
        .await
        .unwrap()
        .unwrap();
    let parsed: BrokerConfig = serde_json::from_slice(&received).unwrap();
    assert_eq!(parsed, config);

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), session.closed())
        .await
        .unwrap();
    assert_eq!(client.state(), ClientState::Closed);
}

#[tokio::test]
async fn metrics_reach_the_peer() {
    let (server, addr, cancel) = running_server().await;
    let cluster = server.add_cluster(4, "metrics", 1).unwrap();
    let sample = MetricsCmd {
        cpu_usage: 1234,
        mem_total: 8192,
        mem_used: 2048,
        mem_free: 6144,
    };
    let client = Client::new(Version::new(2, 0, 0), quick_config())
        .with_metrics_source(StaticMetrics(sample.clone()));
    let _session = client
        .connect(addr, cluster.certificate(), cancel.clone())
        .await
        .unwrap();

    let cert = client.certificate();
    wait_for(|| {
        cluster
            .peer(cert)
            .and_then(|p| p.metrics())
            .is_some()
    })
    .await;
    assert_eq!(cluster.peer(cert).unwrap().metrics(), Some(sample));
    cancel.cancel();
}

#[tokio::test]
async fn custom_cluster_handler_sees_the_peer() {
    let (server, addr, cancel) = running_server().await;
    let cluster = server.add_cluster(2, "stop relay", 1).unwrap();
    let seen = Arc::new(Mutex::new(None));
    let seen_in = seen.clone();
    cluster
        .on_command(move |peer: &glink_rdp::Peer, cmd: glink_core::StopCmd| {
            *seen_in.lock().unwrap() = Some((peer.certificate(), cmd.stop));
            Ok(())
        })
        .unwrap();

    let client = Client::new(Version::ZERO, quick_config());
    let session = client
        .connect(addr, cluster.certificate(), cancel.clone())
        .await
        .unwrap();
    session.send(&glink_core::StopCmd { stop: true }).await.unwrap();

    wait_for(|| seen.lock().unwrap().is_some()).await;
    assert_eq!(*seen.lock().unwrap(), Some((client.certificate(), true)));
    cancel.cancel();
}

#[tokio::test]
async fn unknown_cluster_times_out() {
    let (server, addr, cancel) = running_server().await;
    let cluster = server.add_cluster(1, "real", 1).unwrap();

    let config = ClientConfig {
        handshake_timeout: Duration::from_millis(300),
        ..quick_config()
    };
    let client = Client::new(Version::new(1, 0, 0), config);
    let err = client
        .connect(addr, Identity::generate().certificate(), cancel.clone())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, RdpError::HandshakeTimeout(_)));
    assert_eq!(client.state(), ClientState::Idle);
    assert!(cluster.peers().is_empty());
    cancel.cancel();
}

#[tokio::test]
async fn disabled_peer_is_ignored() {
    let (server, addr, cancel) = running_server().await;
    let cluster = server.add_cluster(3, "disable", 1).unwrap();
    let client = Client::new(Version::ZERO, quick_config())
        .with_metrics_source(StaticMetrics(MetricsCmd::default()));
    let _session = client
        .connect(addr, cluster.certificate(), cancel.clone())
        .await
        .unwrap();

    cluster.disable(client.certificate()).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(cluster.peers().is_empty());
    assert!(cluster.send_stop(client.certificate()).await.is_err());
    cancel.cancel();
}

#[tokio::test]
async fn session_input_closes_with_session() {
    let (server, addr, cancel) = running_server().await;
    let cluster = server.add_cluster(5, "input", 1).unwrap();
    let client = Client::new(Version::ZERO, quick_config());
    let session = client
        .connect(addr, cluster.certificate(), cancel.clone())
        .await
        .unwrap();

    let (input, mut events) = session.input::<String>(4);
    input.push("first".to_string()).await.unwrap();
    assert_eq!(events.recv().await.unwrap().payload, "first");

    session.close();
    tokio::time::timeout(Duration::from_secs(5), session.closed())
        .await
        .unwrap();
    assert!(matches!(
        input.push("late".to_string()).await,
        Err(RdpError::InputClosed)
    ));
    cancel.cancel();
}

#[tokio::test]
async fn metrics_source_survives_reconnect() {
    let (server, addr, cancel) = running_server().await;
    let cluster = server.add_cluster(8, "reconnect", 1).unwrap();
    let sample = MetricsCmd {
        cpu_usage: 7,
        mem_total: 7,
        mem_used: 7,
        mem_free: 7,
    };
    let client = Client::new(Version::ZERO, quick_config())
        .with_metrics_source(StaticMetrics(sample.clone()));
    let cert = client.certificate();

    for _ in 0..2 {
        let session = client
            .connect(addr, cluster.certificate(), cancel.clone())
            .await
            .unwrap();
        wait_for(|| {
            cluster
                .peer(cert)
                .and_then(|p| p.metrics())
                .is_some()
        })
        .await;
        assert_eq!(cluster.peer(cert).unwrap().metrics(), Some(sample.clone()));
        session.close();
        tokio::time::timeout(Duration::from_secs(5), session.closed())
            .await
            .unwrap();
        assert_eq!(client.state(), ClientState::Closed);
    }
    cancel.cancel();
}

#[tokio::test]
async fn second_connect_while_connected_is_refused() {
    let (server, addr, cancel) = running_server().await;
    let cluster = server.add_cluster(9, "single", 1).unwrap();
    let client = Client::new(Version::ZERO, quick_config());
    let session = client
        .connect(addr, cluster.certificate(), cancel.clone())
        .await
        .unwrap();

    let err = client
        .connect(addr, cluster.certificate(), cancel.clone())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, RdpError::SessionActive));
    assert_eq!(client.state(), ClientState::Connected);
    assert!(!session.is_closed());

    session.close();
    tokio::time::timeout(Duration::from_secs(5), session.closed())
        .await
        .unwrap();
    assert_eq!(client.state(), ClientState::Closed);
    cancel.cancel();
}

#[tokio::test]
async fn connect_signed_by_another_key_is_rejected() {
    let (server, addr, cancel) = running_server().await;
    let cluster = server.add_cluster(6, "auth", 1).unwrap();
    let claimed = Identity::generate();
    let signer = Identity::generate();
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let connect = ConnectCmd {
        cluster: cluster.certificate(),
        peer: claimed.peer_key(),
        version: Version::ZERO,
    };

    socket
        .send_to(connect_packet(&signer, &connect).as_bytes(), addr)
        .await
        .unwrap();
    let mut buf = [0u8; PACKET_SIZE];
    let reply = tokio::time::timeout(Duration::from_millis(300), socket.recv_from(&mut buf)).await;
    assert!(reply.is_err(), "forged connect was answered");
    assert!(cluster.peers().is_empty());

    // The pipeline keeps serving after a rejection.
    socket
        .send_to(connect_packet(&claimed, &connect).as_bytes(), addr)
        .await
        .unwrap();
    let (n, _) = tokio::time::timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let reply: SignedMessage = codec::decode(&buf[..n]).unwrap();
    assert!(reply.verify(&cluster.certificate()));
    assert!(cluster.peer(claimed.certificate()).unwrap().is_accepted());
    cancel.cancel();
}

#[tokio::test]
async fn tampered_command_is_dropped_and_dispatch_continues() {
    let (server, addr, cancel) = running_server().await;
    let cluster = server.add_cluster(10, "tamper", 1).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_in = seen.clone();
    cluster
        .on_command(move |_: &Peer, cmd: StopCmd| {
            seen_in.lock().unwrap().push(cmd.stop);
            Ok(())
        })
        .unwrap();
    let (socket, session) = join_by_hand(addr, &cluster).await;
    let route = Route::Cluster(cluster.index());

    let mut tampered = protect(protected_commands(), &session, &StopCmd { stop: true }).unwrap();
    tampered.payload[5] ^= 0x01;
    let packet = Packet::routed(route, &codec::encode(&tampered).unwrap()).unwrap();
    socket.send_to(packet.as_bytes(), addr).await.unwrap();

    let valid = protect(protected_commands(), &session, &StopCmd { stop: false }).unwrap();
    let packet = Packet::routed(route, &codec::encode(&valid).unwrap()).unwrap();
    socket.send_to(packet.as_bytes(), addr).await.unwrap();

    wait_for(|| !seen.lock().unwrap().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(*seen.lock().unwrap(), vec![false]);
    cancel.cancel();
}

#[tokio::test]
async fn garbage_datagram_does_not_stop_the_listener() {
    let (server, addr, cancel) = running_server().await;
    let cluster = server.add_cluster(11, "noise", 1).unwrap();
    let noise = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    noise.send_to(&[0xff; 7], addr).await.unwrap();
    noise.send_to(&[1, 1, 0xde, 0xad], addr).await.unwrap();

    let (_socket, _session) = join_by_hand(addr, &cluster).await;
    assert_eq!(cluster.peers().len(), 1);
    cancel.cancel();
}
