//! End-to-end tests: indexing server, peer nodes and clients on loopback.
//!
//! Each test starts its own server and binds peers on ports from a shared
//! counter so parallel tests do not collide.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use peerbus::{
    ClientApi, ClientConfig, Envelope, ErrorCode, IndexClient, IndexServer, IndexServerConfig, IndexService,
    NodeConfig, NodeState, PeerId, PeerNode,
};
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;

/// Atomic port counter for unique peer ports across parallel tests.
static PORT_COUNTER: AtomicU16 = AtomicU16::new(31000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

const TEST_TIMEOUT: Duration = Duration::from_secs(5);
const SETTLE_TIME: Duration = Duration::from_millis(200);

async fn start_server() -> (SocketAddr, CancellationToken) {
    let config = IndexServerConfig { bind: "127.0.0.1:0".parse().unwrap() };
    let server = IndexServer::bind(config).await.expect("bind failed");
    let addr = server.local_addr();
    let shutdown = CancellationToken::new();
    tokio::spawn(server.run(shutdown.clone()));
    (addr, shutdown)
}

async fn start_peer(index: SocketAddr) -> PeerNode {
    let config = NodeConfig { port: Some(next_port()), index_server: index, ..NodeConfig::default() };
    PeerNode::bind(config).await.expect("peer failed to start")
}

/// A client bound on an ephemeral port with `peer` already selected.
async fn client_for(index: SocketAddr, peer: &PeerNode) -> ClientApi {
    let mut client = ClientApi::connect(ClientConfig::default(), index).await.expect("client bind failed");
    let wanted = peer.peer_id();
    let selected = client
        .select_peer(|peers| peers.iter().position(|(id, _)| *id == wanted))
        .await
        .expect("get_peers failed")
        .expect("peer not listed by index");
    assert_eq!(selected.peer_id, wanted);
    client.start_receiving();
    client
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + TEST_TIMEOUT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met within {TEST_TIMEOUT:?}");
        sleep(Duration::from_millis(10)).await;
    }
}

fn publishes(client: &ClientApi, topic: &str) -> Vec<String> {
    client
        .received_messages()
        .into_iter()
        .filter_map(|envelope| match envelope {
            Envelope::Publish { topic: t, message } if t == topic => Some(message),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn publish_reaches_subscriber() {
    let (index, shutdown) = start_server().await;
    let mut peer = start_peer(index).await;
    assert_eq!(peer.state(), NodeState::Running);

    let subscriber = client_for(index, &peer).await;
    let publisher = client_for(index, &peer).await;

    assert!(subscriber.subscribe("T").await.unwrap());
    wait_until(|| subscriber.received_messages().contains(&Envelope::ack("T"))).await;

    assert!(publisher.publish("T", "hello").await.unwrap());
    wait_until(|| publishes(&subscriber, "T") == vec!["hello".to_string()]).await;
    assert!(publishes(&publisher, "T").is_empty());

    peer.shutdown().await;
    shutdown.cancel();
}

#[tokio::test]
async fn duplicate_subscribe_delivers_once() {
    let (index, shutdown) = start_server().await;
    let mut peer = start_peer(index).await;
    let subscriber = client_for(index, &peer).await;

    subscriber.subscribe("T").await.unwrap();
    subscriber.subscribe("T").await.unwrap();
    wait_until(|| subscriber.received_messages().contains(&Envelope::ack("T"))).await;
    sleep(SETTLE_TIME).await;
    assert_eq!(peer.subscribers("T").await.unwrap(), vec![subscriber.local_addr()]);

    assert_eq!(peer.publish("T", "once").await.unwrap(), 1);
    wait_until(|| !publishes(&subscriber, "T").is_empty()).await;
    sleep(SETTLE_TIME).await;
    assert_eq!(publishes(&subscriber, "T"), vec!["once".to_string()]);

    let acks = subscriber.received_messages().iter().filter(|e| matches!(e, Envelope::Ack { .. })).count();
    assert_eq!(acks, 1);

    peer.shutdown().await;
    shutdown.cancel();
}

#[tokio::test]
async fn publish_without_subscribers_sends_nothing() {
    let (index, shutdown) = start_server().await;
    let mut peer = start_peer(index).await;
    let client = client_for(index, &peer).await;

    assert!(client.publish("empty", "nobody listens").await.unwrap());
    assert_eq!(peer.publish("empty", "nobody listens").await.unwrap(), 0);
    sleep(SETTLE_TIME).await;
    assert!(client.received_messages().is_empty());
    assert_eq!(peer.state(), NodeState::Running);

    peer.shutdown().await;
    shutdown.cancel();
}

#[tokio::test]
async fn shutdown_unregisters_and_cascades() {
    let (index, shutdown) = start_server().await;
    let mut peer = start_peer(index).await;
    let other = start_peer(index).await;
    let client = client_for(index, &peer).await;

    assert!(client.create_topic("weather").await.unwrap());
    let lookup = IndexClient::new(index);
    assert_eq!(lookup.query_topic("weather").await.unwrap().0, peer.peer_id());

    peer.shutdown().await;
    assert_eq!(peer.state(), NodeState::Stopped);

    let peers = lookup.get_peers().await.unwrap();
    assert!(!peers.contains_key(&peer.peer_id()));
    assert!(peers.contains_key(&other.peer_id()));
    assert_eq!(lookup.query_topic("weather").await.unwrap_err().code(), Some(ErrorCode::NotFound));

    shutdown.cancel();
}

#[tokio::test]
async fn create_existing_topic_subscribes_instead() {
    let (index, shutdown) = start_server().await;
    let mut peer = start_peer(index).await;
    let first = client_for(index, &peer).await;
    let second = client_for(index, &peer).await;

    assert!(first.create_topic("weather").await.unwrap());
    assert!(!second.create_topic("weather").await.unwrap());
    wait_until(|| second.received_messages().contains(&Envelope::ack("weather"))).await;

    first.publish("weather", "rain").await.unwrap();
    wait_until(|| publishes(&second, "weather") == vec!["rain".to_string()]).await;

    assert!(first.delete_topic("weather").await.unwrap());
    let lookup = IndexClient::new(index);
    assert!(lookup.get_topics().await.unwrap().is_empty());

    peer.shutdown().await;
    shutdown.cancel();
}

#[tokio::test]
async fn client_without_peers_selects_nothing() {
    let (index, shutdown) = start_server().await;
    let mut client = ClientApi::connect(ClientConfig::default(), index).await.unwrap();

    let selected = client.select_peer(|_| Some(0)).await.unwrap();
    assert!(selected.is_none());
    assert!(!client.subscribe("T").await.unwrap());

    shutdown.cancel();
}

#[tokio::test]
async fn peers_discover_each_other_by_topic() {
    let (index, shutdown) = start_server().await;
    let mut host = start_peer(index).await;
    let lookup = IndexClient::new(index).with_timeout(TEST_TIMEOUT);

    lookup.add_topic(host.peer_id(), "sports").await.unwrap();
    let (owner, addr) = timeout(TEST_TIMEOUT, lookup.query_topic("sports")).await.unwrap().unwrap();
    assert_eq!(owner, host.peer_id());
    assert_eq!(addr.port, host.local_addr().port());
    assert_eq!(PeerId(addr.port), owner);

    host.shutdown().await;
    shutdown.cancel();
}
