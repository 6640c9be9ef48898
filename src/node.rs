//! # Peer Node
//!
//! A [`PeerNode`] hosts topics for clients. It registers with the indexing
//! server, keeps a subscription table, and relays every publish it receives to
//! the topic's subscribers over UDP.
//!
//! ## Quick Start
//!
//! ```ignore
//! let node = PeerNode::bind(NodeConfig::default()).await?;
//! println!("peer {} listening on {}", node.peer_id(), node.local_addr());
//!
//! // Publishing from the node itself reaches the same subscribers as a
//! // publish datagram would.
//! node.publish("weather", "rain").await?;
//!
//! node.shutdown().await;
//! ```
//!
//! ## Datagram Handling
//!
//! | Envelope | Effect |
//! |----------|--------|
//! | `subscribe` | sender added to the topic's subscribers; ack on first subscribe |
//! | `publish` | envelope forwarded to every subscriber of the topic |
//! | `ack` | logged |
//! | anything else | logged and dropped |
//!
//! ## Lifecycle
//!
//! `Starting → Registered → Running → ShuttingDown → Stopped`. A failed
//! registration goes straight from `Starting` to `Running`; the node still
//! serves datagrams but clients cannot discover it through the index.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;

use anyhow::{Context, Result};
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::IndexClient;
use crate::messages::{self, Envelope, PeerId, WireError, MAX_DATAGRAM_SIZE};
use crate::protocols::IndexService;
use crate::server::DEFAULT_INDEX_PORT;
use crate::subscriptions::SubscriptionTable;

/// Ports tried when no port is configured.
pub const PEER_PORT_RANGE: RangeInclusive<u16> = 5000..=6000;

const DEFAULT_COMMAND_BUFFER: usize = 64;

#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub host: IpAddr,
    /// UDP port; `None` picks a random port from [`PEER_PORT_RANGE`].
    pub port: Option<u16>,
    pub index_server: SocketAddr,
    /// Reply to a first-time subscribe with an `ack` datagram.
    pub ack_subscriptions: bool,
    /// Remove this peer from the index during [`PeerNode::shutdown`].
    pub unregister_on_shutdown: bool,
    pub command_buffer: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: None,
            index_server: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_INDEX_PORT)),
            ack_subscriptions: true,
            unregister_on_shutdown: true,
            command_buffer: DEFAULT_COMMAND_BUFFER,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    Starting,
    Registered,
    Running,
    ShuttingDown,
    Stopped,
}

// ============================================================================
// Commands sent from Handle to Actor
// ============================================================================

enum Command {
    Publish {
        topic: String,
        message: String,
        reply: oneshot::Sender<Result<usize, WireError>>,
    },
    Subscribers {
        topic: String,
        reply: oneshot::Sender<Vec<SocketAddr>>,
    },
    Topics(oneshot::Sender<Vec<String>>),
}

// ============================================================================
// Peer Node (public API)
// ============================================================================

pub struct PeerNode<I: IndexService = IndexClient> {
    peer_id: PeerId,
    local_addr: SocketAddr,
    index: I,
    unregister_on_shutdown: bool,
    cmd_tx: mpsc::Sender<Command>,
    state_tx: watch::Sender<NodeState>,
    shutdown: CancellationToken,
    actor: Option<JoinHandle<()>>,
}

impl PeerNode<IndexClient> {
    /// Start a node that registers with `config.index_server` over TCP.
    pub async fn bind(config: NodeConfig) -> Result<Self> {
        let index = IndexClient::new(config.index_server);
        Self::start(config, index).await
    }
}

impl<I: IndexService> PeerNode<I> {
    pub async fn start(config: NodeConfig, index: I) -> Result<Self> {
        let (state_tx, _) = watch::channel(NodeState::Starting);

        let port = config.port.unwrap_or_else(|| rand::thread_rng().gen_range(PEER_PORT_RANGE));
        let bind_addr = SocketAddr::new(config.host, port);
        let socket = UdpSocket::bind(bind_addr)
            .await
            .with_context(|| format!("failed to bind peer socket on {bind_addr}"))?;
        let local_addr = socket.local_addr().context("failed to read peer socket address")?;
        let peer_id = PeerId(local_addr.port());

        match index.register(peer_id, local_addr.port()).await {
            Ok(message) => {
                info!(peer_id = %peer_id, response = %message, "registered with indexing server");
                state_tx.send_replace(NodeState::Registered);
            }
            Err(e) => {
                warn!(peer_id = %peer_id, error = %e, "registration with indexing server failed");
            }
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_buffer.max(1));
        let shutdown = CancellationToken::new();
        let actor = NodeActor {
            peer_id,
            socket,
            subscriptions: SubscriptionTable::new(),
            ack_subscriptions: config.ack_subscriptions,
        };
        let actor = tokio::spawn(actor.run(cmd_rx, shutdown.clone()));

        state_tx.send_replace(NodeState::Running);
        info!(peer_id = %peer_id, addr = %local_addr, "peer node running");

        Ok(Self {
            peer_id,
            local_addr,
            index,
            unregister_on_shutdown: config.unregister_on_shutdown,
            cmd_tx,
            state_tx,
            shutdown,
            actor: Some(actor),
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> NodeState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<NodeState> {
        self.state_tx.subscribe()
    }

    /// Publish `content` on `topic` from this node.
    ///
    /// Returns the number of subscribers the datagram was sent to.
    pub async fn publish(&self, topic: &str, content: &str) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Publish { topic: topic.to_string(), message: content.to_string(), reply })
            .await
            .context("peer node is not running")?;
        let delivered = rx.await.context("peer node is not running")??;
        Ok(delivered)
    }

    pub async fn subscribers(&self, topic: &str) -> Result<Vec<SocketAddr>> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Subscribers { topic: topic.to_string(), reply })
            .await
            .context("peer node is not running")?;
        rx.await.context("peer node is not running")
    }

    /// Topics with at least one subscriber, sorted.
    pub async fn topics(&self) -> Result<Vec<String>> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx.send(Command::Topics(reply)).await.context("peer node is not running")?;
        rx.await.context("peer node is not running")
    }

    /// Leave the index and stop the node. Calling it again is a no-op.
    pub async fn shutdown(&mut self) {
        if matches!(self.state(), NodeState::ShuttingDown | NodeState::Stopped) {
            return;
        }
        self.state_tx.send_replace(NodeState::ShuttingDown);
        info!(peer_id = %self.peer_id, "shutting down peer node");

        if self.unregister_on_shutdown {
            match self.index.unregister(self.peer_id).await {
                Ok(message) => info!(peer_id = %self.peer_id, response = %message, "unregistered from indexing server"),
                Err(e) => warn!(peer_id = %self.peer_id, error = %e, "unregister failed"),
            }
        }

        self.shutdown.cancel();
        if let Some(actor) = self.actor.take()
            && let Err(e) = actor.await
        {
            warn!(peer_id = %self.peer_id, error = %e, "peer node actor ended abnormally");
        }

        self.state_tx.send_replace(NodeState::Stopped);
        info!(peer_id = %self.peer_id, "peer node stopped");
    }
}

impl<I: IndexService> Drop for PeerNode<I> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// ============================================================================
// Node Actor (owns socket and subscriptions)
// ============================================================================

struct NodeActor {
    peer_id: PeerId,
    socket: UdpSocket,
    subscriptions: SubscriptionTable,
    ack_subscriptions: bool,
}

impl NodeActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>, shutdown: CancellationToken) {
        // One extra byte so oversized datagrams are detectable instead of
        // silently truncated.
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE + 1];

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                result = self.socket.recv_from(&mut buf) => match result {
                    Ok((len, from)) => self.handle_datagram(&buf[..len], from).await,
                    Err(e) => warn!(peer_id = %self.peer_id, error = %e, "receive failed"),
                },
            }
        }

        debug!(peer_id = %self.peer_id, "node actor stopped");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Publish { topic, message, reply } => {
                let envelope = Envelope::publish(topic.as_str(), message);
                let _ = reply.send(self.distribute(&topic, &envelope).await);
            }
            Command::Subscribers { topic, reply } => {
                let _ = reply.send(self.subscriptions.subscribers(&topic).to_vec());
            }
            Command::Topics(reply) => {
                let _ = reply.send(self.subscriptions.topics());
            }
        }
    }

    async fn handle_datagram(&mut self, bytes: &[u8], from: SocketAddr) {
        let envelope = match messages::decode_envelope(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(peer_id = %self.peer_id, from = %from, error = %e, "dropping datagram");
                return;
            }
        };

        match envelope {
            Envelope::Publish { ref topic, .. } => {
                info!(peer_id = %self.peer_id, from = %from, topic = %topic, "publish received");
                if let Err(e) = self.distribute(topic, &envelope).await {
                    warn!(peer_id = %self.peer_id, topic = %topic, error = %e, "failed to distribute publish");
                }
            }
            Envelope::Subscribe { topic } => self.handle_subscribe(topic, from).await,
            Envelope::Ack { topic } => {
                debug!(peer_id = %self.peer_id, from = %from, topic = %topic, "ack received");
            }
            Envelope::Unrecognized => {
                warn!(peer_id = %self.peer_id, from = %from, "unrecognized message type");
            }
        }
    }

    async fn handle_subscribe(&mut self, topic: String, from: SocketAddr) {
        if !self.subscriptions.subscribe(&topic, from) {
            debug!(peer_id = %self.peer_id, topic = %topic, subscriber = %from, "already subscribed");
            return;
        }
        info!(peer_id = %self.peer_id, topic = %topic, subscriber = %from, "subscriber added");

        if self.ack_subscriptions {
            let sent = match messages::encode_envelope(&Envelope::ack(topic.as_str())) {
                Ok(bytes) => self.socket.send_to(&bytes, from).await.map_err(WireError::from),
                Err(e) => Err(e),
            };
            if let Err(e) = sent {
                warn!(peer_id = %self.peer_id, subscriber = %from, error = %e, "failed to send ack");
            }
        }
    }

    /// Send `envelope` to every subscriber of `topic`.
    ///
    /// A failed send to one subscriber does not stop delivery to the rest.
    async fn distribute(&self, topic: &str, envelope: &Envelope) -> Result<usize, WireError> {
        let bytes = messages::encode_envelope(envelope)?;
        let subscribers = self.subscriptions.subscribers(topic);
        if subscribers.is_empty() {
            debug!(peer_id = %self.peer_id, topic = %topic, "no subscribers");
            return Ok(0);
        }

        let mut delivered = 0;
        for subscriber in subscribers {
            match self.socket.send_to(&bytes, subscriber).await {
                Ok(_) => delivered += 1,
                Err(e) => {
                    warn!(peer_id = %self.peer_id, subscriber = %subscriber, error = %e, "send to subscriber failed");
                }
            }
        }
        debug!(peer_id = %self.peer_id, topic = %topic, delivered, "distributed publish");
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::registry::{RegistryError, RegistryHandle};

    const TEST_TIMEOUT: Duration = Duration::from_secs(2);

    fn test_config() -> NodeConfig {
        NodeConfig { port: Some(0), ..NodeConfig::default() }
    }

    async fn subscriber() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").await.unwrap()
    }

    async fn send(socket: &UdpSocket, envelope: &Envelope, to: SocketAddr) {
        let bytes = messages::encode_envelope(envelope).unwrap();
        socket.send_to(&bytes, to).await.unwrap();
    }

    async fn recv(socket: &UdpSocket) -> Envelope {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let (len, _) = tokio::time::timeout(TEST_TIMEOUT, socket.recv_from(&mut buf))
            .await
            .expect("timed out waiting for datagram")
            .unwrap();
        messages::decode_envelope(&buf[..len]).unwrap()
    }

    #[tokio::test]
    async fn start_registers_and_shutdown_unregisters() {
        let registry = RegistryHandle::spawn();
        let mut node = PeerNode::start(test_config(), registry.clone()).await.unwrap();
        assert_eq!(node.state(), NodeState::Running);
        assert_eq!(node.peer_id().port(), node.local_addr().port());

        let peers = registry.get_peers().await.unwrap();
        assert_eq!(peers[&node.peer_id()].port, node.local_addr().port());

        let mut state = node.watch_state();
        node.shutdown().await;
        assert_eq!(node.state(), NodeState::Stopped);
        assert_eq!(*state.borrow_and_update(), NodeState::Stopped);
        assert_eq!(registry.get_peers().await, Err(RegistryError::NoPeers));

        // Second call is a no-op.
        node.shutdown().await;
        assert!(node.publish("weather", "rain").await.is_err());
    }

    #[tokio::test]
    async fn keep_registration_leaves_stale_entry() {
        let registry = RegistryHandle::spawn();
        let config = NodeConfig { unregister_on_shutdown: false, ..test_config() };
        let mut node = PeerNode::start(config, registry.clone()).await.unwrap();
        let peer_id = node.peer_id();
        node.shutdown().await;

        assert!(registry.get_peers().await.unwrap().contains_key(&peer_id));
    }

    #[tokio::test]
    async fn registration_failure_is_not_fatal() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = listener.local_addr().unwrap();
        drop(listener);

        let config = NodeConfig { index_server: dead, ..test_config() };
        let mut node = PeerNode::bind(config).await.unwrap();
        assert_eq!(node.state(), NodeState::Running);

        let client = subscriber().await;
        send(&client, &Envelope::subscribe("weather"), node.local_addr()).await;
        assert_eq!(recv(&client).await, Envelope::ack("weather"));

        node.shutdown().await;
        assert_eq!(node.state(), NodeState::Stopped);
    }

    #[tokio::test]
    async fn random_port_comes_from_peer_range() {
        let registry = RegistryHandle::spawn();
        let config = NodeConfig { port: None, ..NodeConfig::default() };
        let mut node = PeerNode::start(config, registry).await.unwrap();
        assert!(PEER_PORT_RANGE.contains(&node.local_addr().port()));
        node.shutdown().await;
    }

    #[tokio::test]
    async fn publish_reaches_every_subscriber() {
        let registry = RegistryHandle::spawn();
        let mut node = PeerNode::start(test_config(), registry).await.unwrap();

        let a = subscriber().await;
        let b = subscriber().await;
        for socket in [&a, &b] {
            send(socket, &Envelope::subscribe("weather"), node.local_addr()).await;
            assert_eq!(recv(socket).await, Envelope::ack("weather"));
        }
        assert_eq!(node.subscribers("weather").await.unwrap().len(), 2);

        let publisher = subscriber().await;
        send(&publisher, &Envelope::publish("weather", "rain"), node.local_addr()).await;
        assert_eq!(recv(&a).await, Envelope::publish("weather", "rain"));
        assert_eq!(recv(&b).await, Envelope::publish("weather", "rain"));

        assert_eq!(node.publish("weather", "sun").await.unwrap(), 2);
        assert_eq!(recv(&a).await, Envelope::publish("weather", "sun"));
        assert_eq!(recv(&b).await, Envelope::publish("weather", "sun"));

        node.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_subscribe_acks_once() {
        let registry = RegistryHandle::spawn();
        let mut node = PeerNode::start(test_config(), registry).await.unwrap();
        let client = subscriber().await;

        send(&client, &Envelope::subscribe("weather"), node.local_addr()).await;
        assert_eq!(recv(&client).await, Envelope::ack("weather"));

        send(&client, &Envelope::subscribe("weather"), node.local_addr()).await;
        send(&client, &Envelope::subscribe("sports"), node.local_addr()).await;
        // The repeated subscribe produced no ack, so the next one is for sports.
        assert_eq!(recv(&client).await, Envelope::ack("sports"));

        assert_eq!(node.subscribers("weather").await.unwrap(), vec![client.local_addr().unwrap()]);
        assert_eq!(node.topics().await.unwrap(), vec!["sports".to_string(), "weather".to_string()]);
        node.shutdown().await;
    }

    #[tokio::test]
    async fn acks_can_be_disabled() {
        let registry = RegistryHandle::spawn();
        let config = NodeConfig { ack_subscriptions: false, ..test_config() };
        let mut node = PeerNode::start(config, registry).await.unwrap();
        let client = subscriber().await;

        send(&client, &Envelope::subscribe("weather"), node.local_addr()).await;
        send(&client, &Envelope::publish("weather", "rain"), node.local_addr()).await;
        // The publish echoes back to the subscribed sender; no ack precedes it.
        assert_eq!(recv(&client).await, Envelope::publish("weather", "rain"));
        node.shutdown().await;
    }

    #[tokio::test]
    async fn malformed_datagrams_are_dropped() {
        let registry = RegistryHandle::spawn();
        let mut node = PeerNode::start(test_config(), registry).await.unwrap();
        let client = subscriber().await;

        client.send_to(b"not json", node.local_addr()).await.unwrap();
        client.send_to(br#"{"type":"hello"}"#, node.local_addr()).await.unwrap();
        client.send_to(&vec![b' '; MAX_DATAGRAM_SIZE + 1], node.local_addr()).await.unwrap();
        send(&client, &Envelope::subscribe("weather"), node.local_addr()).await;

        assert_eq!(recv(&client).await, Envelope::ack("weather"));
        assert_eq!(node.state(), NodeState::Running);
        node.shutdown().await;
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_noop() {
        let registry = RegistryHandle::spawn();
        let mut node = PeerNode::start(test_config(), registry).await.unwrap();

        assert_eq!(node.publish("nobody", "hello").await.unwrap(), 0);
        assert!(node.topics().await.unwrap().is_empty());
        node.shutdown().await;
    }

    #[tokio::test]
    async fn oversized_publish_is_rejected() {
        let registry = RegistryHandle::spawn();
        let mut node = PeerNode::start(test_config(), registry).await.unwrap();

        let err = node.publish("big", &"x".repeat(MAX_DATAGRAM_SIZE)).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<WireError>(), Some(WireError::TooLarge { .. })));
        node.shutdown().await;
    }
}
