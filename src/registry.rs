//! # Peer and Topic Registry
//!
//! The registry is the indexing server's only state: which peers are online
//! and which peers own which topics.
//!
//! ## Architecture
//!
//! - [`Registry`]: plain data structure with the invariant-preserving operations
//! - [`RegistryHandle`]: cheap-to-clone handle to an actor task that owns the
//!   `Registry` and applies commands one at a time
//!
//! Every connection handler on the server talks to the same handle, so
//! register/unregister/add/delete are linearized without a shared lock.
//!
//! ## Invariants
//!
//! - A topic never exists with an empty owner list; removing the last owner
//!   deletes the topic.
//! - Every topic owner is a registered peer. New ownership requires a
//!   registered peer and `unregister` cascades through all owner lists.
//! - Owner lists keep insertion order, so `query_topic` answers with the
//!   earliest owner still present.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::client::IndexError;
use crate::messages::{ErrorCode, PeerAddr, PeerId};
use crate::protocols::IndexService;

/// Bounded command queue between handles and the registry actor.
const REGISTRY_COMMAND_BUFFER: usize = 1024;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Peer {0} not found")]
    PeerNotFound(PeerId),
    #[error("Topic '{0}' not found")]
    TopicNotFound(String),
    #[error("Topic '{topic}' not found for peer {peer_id}")]
    TopicNotOwned { peer_id: PeerId, topic: String },
    #[error("Topic '{0}' already exists.")]
    AlreadyExists(String),
    #[error("Peer {0} not registered")]
    UnknownPeer(PeerId),
    #[error("No peers registered")]
    NoPeers,
    #[error("registry actor closed")]
    Closed,
}

impl RegistryError {
    /// Wire code reported to clients; `None` for server-internal failures.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            RegistryError::PeerNotFound(_)
            | RegistryError::TopicNotFound(_)
            | RegistryError::TopicNotOwned { .. } => Some(ErrorCode::NotFound),
            RegistryError::AlreadyExists(_) => Some(ErrorCode::AlreadyExists),
            RegistryError::UnknownPeer(_) => Some(ErrorCode::UnknownPeer),
            RegistryError::NoPeers => Some(ErrorCode::NoPeers),
            RegistryError::Closed => None,
        }
    }
}

pub type RegistryResult<T> = Result<T, RegistryError>;

// ============================================================================
// Registry (owned state)
// ============================================================================

#[derive(Debug, Default)]
pub struct Registry {
    peers: BTreeMap<PeerId, PeerAddr>,
    topics: BTreeMap<String, Vec<PeerId>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a peer's address. Always succeeds.
    pub fn register(&mut self, peer_id: PeerId, host: impl Into<String>, port: u16) -> String {
        let addr = PeerAddr::new(host, port);
        if let Some(previous) = self.peers.insert(peer_id, addr.clone())
            && previous != addr
        {
            debug!(peer_id = %peer_id, old = %previous, new = %addr, "peer address replaced");
        }
        info!(peer_id = %peer_id, addr = %addr, "registered peer");
        format!("Peer {peer_id} registered")
    }

    /// Remove a peer and drop it from every topic it owned.
    pub fn unregister(&mut self, peer_id: PeerId) -> RegistryResult<String> {
        if self.peers.remove(&peer_id).is_none() {
            return Err(RegistryError::PeerNotFound(peer_id));
        }

        let mut orphaned = 0usize;
        self.topics.retain(|_, owners| {
            owners.retain(|owner| *owner != peer_id);
            let keep = !owners.is_empty();
            if !keep {
                orphaned += 1;
            }
            keep
        });

        info!(peer_id = %peer_id, topics_removed = orphaned, "unregistered peer");
        Ok(format!("Peer {peer_id} unregistered"))
    }

    /// Add `peer_id` to the owners of `topic`, creating the topic if needed.
    /// Adding the same pair twice is a no-op.
    pub fn add_topic(&mut self, peer_id: PeerId, topic: &str) -> RegistryResult<String> {
        if !self.peers.contains_key(&peer_id) {
            return Err(RegistryError::UnknownPeer(peer_id));
        }
        let owners = self.topics.entry(topic.to_string()).or_default();
        if !owners.contains(&peer_id) {
            owners.push(peer_id);
        }
        info!(peer_id = %peer_id, topic = %topic, "peer added topic");
        Ok(format!("Topic '{topic}' added for peer {peer_id}"))
    }

    /// Create `topic` with `peer_id` as its only owner.
    pub fn create_topic(&mut self, topic: &str, peer_id: PeerId) -> RegistryResult<String> {
        if self.topics.contains_key(topic) {
            return Err(RegistryError::AlreadyExists(topic.to_string()));
        }
        if !self.peers.contains_key(&peer_id) {
            return Err(RegistryError::UnknownPeer(peer_id));
        }
        self.topics.insert(topic.to_string(), vec![peer_id]);
        info!(peer_id = %peer_id, topic = %topic, "created topic");
        Ok(format!("Topic '{topic}' created"))
    }

    /// Remove `peer_id` from the owners of `topic`, deleting the topic once
    /// nobody owns it.
    pub fn delete_topic(&mut self, peer_id: PeerId, topic: &str) -> RegistryResult<String> {
        let not_owned = || RegistryError::TopicNotOwned { peer_id, topic: topic.to_string() };

        let owners = self.topics.get_mut(topic).ok_or_else(not_owned)?;
        let position = owners.iter().position(|owner| *owner == peer_id).ok_or_else(not_owned)?;
        owners.remove(position);
        if owners.is_empty() {
            self.topics.remove(topic);
        }
        info!(peer_id = %peer_id, topic = %topic, "peer deleted topic");
        Ok(format!("Topic '{topic}' deleted for peer {peer_id}"))
    }

    /// The first owner of `topic` and its address.
    pub fn query_topic(&self, topic: &str) -> RegistryResult<(PeerId, PeerAddr)> {
        let located = self
            .topics
            .get(topic)
            .and_then(|owners| owners.first())
            .and_then(|peer_id| self.peers.get(peer_id).map(|addr| (*peer_id, addr.clone())));

        match located {
            Some((peer_id, addr)) => {
                debug!(topic = %topic, peer_id = %peer_id, "query resolved");
                Ok((peer_id, addr))
            }
            None => {
                warn!(topic = %topic, "query for unknown topic");
                Err(RegistryError::TopicNotFound(topic.to_string()))
            }
        }
    }

    pub fn get_peers(&self) -> RegistryResult<BTreeMap<PeerId, PeerAddr>> {
        if self.peers.is_empty() {
            warn!("No peers registered");
            return Err(RegistryError::NoPeers);
        }
        Ok(self.peers.clone())
    }

    /// All topic names, sorted.
    pub fn get_topics(&self) -> Vec<String> {
        self.topics.keys().cloned().collect()
    }

    pub fn peer(&self, peer_id: PeerId) -> Option<&PeerAddr> {
        self.peers.get(&peer_id)
    }

    pub fn owners(&self, topic: &str) -> &[PeerId] {
        self.topics.get(topic).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}

// ============================================================================
// Commands sent from Handle to Actor
// ============================================================================

type Reply<T> = oneshot::Sender<RegistryResult<T>>;

enum Command {
    Register {
        peer_id: PeerId,
        host: String,
        port: u16,
        reply: oneshot::Sender<String>,
    },
    Unregister(PeerId, Reply<String>),
    AddTopic(PeerId, String, Reply<String>),
    CreateTopic(String, PeerId, Reply<String>),
    DeleteTopic(PeerId, String, Reply<String>),
    QueryTopic(String, Reply<(PeerId, PeerAddr)>),
    GetPeers(Reply<BTreeMap<PeerId, PeerAddr>>),
    GetTopics(oneshot::Sender<Vec<String>>),
    Quit,
}

// ============================================================================
// Registry Handle (public API - cheap to clone)
// ============================================================================

#[derive(Clone, Debug)]
pub struct RegistryHandle {
    cmd_tx: mpsc::Sender<Command>,
}

impl RegistryHandle {
    /// Spawn a registry actor with empty state.
    pub fn spawn() -> Self {
        Self::spawn_with(Registry::new())
    }

    /// Spawn a registry actor that takes ownership of `registry`.
    pub fn spawn_with(registry: Registry) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(REGISTRY_COMMAND_BUFFER);
        tokio::spawn(RegistryActor { registry }.run(cmd_rx));
        Self { cmd_tx }
    }

    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> RegistryResult<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(make(tx)).await.map_err(|_| RegistryError::Closed)?;
        rx.await.map_err(|_| RegistryError::Closed)?
    }

    pub async fn register(&self, peer_id: PeerId, host: impl Into<String>, port: u16) -> RegistryResult<String> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Register { peer_id, host: host.into(), port, reply: tx })
            .await
            .map_err(|_| RegistryError::Closed)?;
        rx.await.map_err(|_| RegistryError::Closed)
    }

    pub async fn unregister(&self, peer_id: PeerId) -> RegistryResult<String> {
        self.call(|tx| Command::Unregister(peer_id, tx)).await
    }

    pub async fn add_topic(&self, peer_id: PeerId, topic: &str) -> RegistryResult<String> {
        self.call(|tx| Command::AddTopic(peer_id, topic.to_string(), tx)).await
    }

    pub async fn create_topic(&self, topic: &str, peer_id: PeerId) -> RegistryResult<String> {
        self.call(|tx| Command::CreateTopic(topic.to_string(), peer_id, tx)).await
    }

    pub async fn delete_topic(&self, peer_id: PeerId, topic: &str) -> RegistryResult<String> {
        self.call(|tx| Command::DeleteTopic(peer_id, topic.to_string(), tx)).await
    }

    pub async fn query_topic(&self, topic: &str) -> RegistryResult<(PeerId, PeerAddr)> {
        self.call(|tx| Command::QueryTopic(topic.to_string(), tx)).await
    }

    pub async fn get_peers(&self) -> RegistryResult<BTreeMap<PeerId, PeerAddr>> {
        self.call(Command::GetPeers).await
    }

    pub async fn get_topics(&self) -> RegistryResult<Vec<String>> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::GetTopics(tx)).await.map_err(|_| RegistryError::Closed)?;
        rx.await.map_err(|_| RegistryError::Closed)
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

/// In-process index. Peers registered this way share the caller's host, so
/// they are recorded on loopback.
#[async_trait]
impl IndexService for RegistryHandle {
    async fn register(&self, peer_id: PeerId, peer_port: u16) -> Result<String, IndexError> {
        Ok(RegistryHandle::register(self, peer_id, "127.0.0.1", peer_port).await?)
    }

    async fn unregister(&self, peer_id: PeerId) -> Result<String, IndexError> {
        Ok(RegistryHandle::unregister(self, peer_id).await?)
    }

    async fn add_topic(&self, peer_id: PeerId, topic: &str) -> Result<String, IndexError> {
        Ok(RegistryHandle::add_topic(self, peer_id, topic).await?)
    }

    async fn create_topic(&self, topic: &str, peer_id: PeerId) -> Result<String, IndexError> {
        Ok(RegistryHandle::create_topic(self, topic, peer_id).await?)
    }

    async fn delete_topic(&self, peer_id: PeerId, topic: &str) -> Result<String, IndexError> {
        Ok(RegistryHandle::delete_topic(self, peer_id, topic).await?)
    }

    async fn query_topic(&self, topic: &str) -> Result<(PeerId, PeerAddr), IndexError> {
        Ok(RegistryHandle::query_topic(self, topic).await?)
    }

    async fn get_peers(&self) -> Result<BTreeMap<PeerId, PeerAddr>, IndexError> {
        Ok(RegistryHandle::get_peers(self).await?)
    }

    async fn get_topics(&self) -> Result<Vec<String>, IndexError> {
        Ok(RegistryHandle::get_topics(self).await?)
    }
}

// ============================================================================
// Registry Actor (owns state)
// ============================================================================

struct RegistryActor {
    registry: Registry,
}

impl RegistryActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                Command::Register { peer_id, host, port, reply } => {
                    let _ = reply.send(self.registry.register(peer_id, host, port));
                }
                Command::Unregister(peer_id, reply) => {
                    let _ = reply.send(self.registry.unregister(peer_id));
                }
                Command::AddTopic(peer_id, topic, reply) => {
                    let _ = reply.send(self.registry.add_topic(peer_id, &topic));
                }
                Command::CreateTopic(topic, peer_id, reply) => {
                    let _ = reply.send(self.registry.create_topic(&topic, peer_id));
                }
                Command::DeleteTopic(peer_id, topic, reply) => {
                    let _ = reply.send(self.registry.delete_topic(peer_id, &topic));
                }
                Command::QueryTopic(topic, reply) => {
                    let _ = reply.send(self.registry.query_topic(&topic));
                }
                Command::GetPeers(reply) => {
                    let _ = reply.send(self.registry.get_peers());
                }
                Command::GetTopics(reply) => {
                    let _ = reply.send(self.registry.get_topics());
                }
                Command::Quit => {
                    debug!("registry actor quitting");
                    return;
                }
            }
        }
        debug!("registry handles dropped, actor quitting");
    }
}
