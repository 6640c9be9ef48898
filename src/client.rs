//! # Clients
//!
//! Two clients live here:
//!
//! - [`IndexClient`] / [`IndexConnection`]: the control-plane client for the
//!   indexing server. Peer nodes use it to register and unregister; the
//!   client API uses it for peer selection and topic management.
//! - [`ClientApi`]: an end-user client that picks a peer node, manages topics
//!   through the index, and exchanges subscribe/publish datagrams with the
//!   chosen peer.
//!
//! ## Blocking
//!
//! Index requests wait for the server's reply. There is no timeout unless one
//! is set with [`IndexClient::with_timeout`], so a hung server stalls the
//! caller.

use std::collections::BTreeMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::{TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::messages::{
    self, ControlRequest, ControlResponse, Envelope, ErrorCode, PeerAddr, PeerId, ResponseBody,
    WireError, MAX_DATAGRAM_SIZE,
};
use crate::protocols::IndexService;
use crate::registry::RegistryError;

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// The index answered with `status: error`.
    #[error("{message}")]
    Rejected {
        code: Option<ErrorCode>,
        message: String,
    },
    #[error("network error: {0}")]
    Network(#[from] io::Error),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("index server closed the connection")]
    Closed,
    #[error("unexpected response to {action}")]
    UnexpectedResponse { action: &'static str },
    #[error("index request timed out")]
    Timeout,
}

impl IndexError {
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            IndexError::Rejected { code, .. } => *code,
            _ => None,
        }
    }
}

impl From<RegistryError> for IndexError {
    fn from(err: RegistryError) -> Self {
        IndexError::Rejected { code: err.code(), message: err.to_string() }
    }
}

fn into_body(response: ControlResponse) -> Result<ResponseBody, IndexError> {
    match response {
        ControlResponse::Success(body) => Ok(body),
        ControlResponse::Error { message, code } => Err(IndexError::Rejected { code, message }),
    }
}

// ============================================================================
// Index connection (long-lived session)
// ============================================================================

/// A TCP session with the indexing server carrying any number of requests.
pub struct IndexConnection {
    stream: TcpStream,
    server: SocketAddr,
}

impl IndexConnection {
    pub async fn connect(server: SocketAddr) -> Result<Self, IndexError> {
        let stream = TcpStream::connect(server).await?;
        stream.set_nodelay(true)?;
        debug!(server = %server, "connected to indexing server");
        Ok(Self { stream, server })
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    /// Send one request and wait for its response.
    pub async fn request(&mut self, request: &ControlRequest) -> Result<ControlResponse, IndexError> {
        messages::write_message(&mut self.stream, request).await?;
        let body = messages::read_frame(&mut self.stream).await?.ok_or(IndexError::Closed)?;
        let response = serde_json::from_slice(&body).map_err(WireError::from)?;
        debug!(server = %self.server, action = request.action(), ?response, "index response");
        Ok(response)
    }
}

// ============================================================================
// Index client (connection per call)
// ============================================================================

/// Index client that opens a fresh connection for every request.
#[derive(Clone, Debug)]
pub struct IndexClient {
    server: SocketAddr,
    timeout: Option<Duration>,
}

impl IndexClient {
    pub fn new(server: SocketAddr) -> Self {
        Self { server, timeout: None }
    }

    /// Bound connect plus exchange by `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    pub async fn request(&self, request: ControlRequest) -> Result<ControlResponse, IndexError> {
        let exchange = async {
            let mut connection = IndexConnection::connect(self.server).await?;
            connection.request(&request).await
        };
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, exchange).await.map_err(|_| IndexError::Timeout)?,
            None => exchange.await,
        }
    }

    async fn request_message(&self, request: ControlRequest) -> Result<String, IndexError> {
        let action = request.action();
        match into_body(self.request(request).await?)? {
            ResponseBody::Message { message } => Ok(message),
            _ => Err(IndexError::UnexpectedResponse { action }),
        }
    }
}

#[async_trait]
impl IndexService for IndexClient {
    async fn register(&self, peer_id: PeerId, peer_port: u16) -> Result<String, IndexError> {
        self.request_message(ControlRequest::Register { peer_id, peer_port }).await
    }

    async fn unregister(&self, peer_id: PeerId) -> Result<String, IndexError> {
        self.request_message(ControlRequest::Unregister { peer_id }).await
    }

    async fn add_topic(&self, peer_id: PeerId, topic: &str) -> Result<String, IndexError> {
        self.request_message(ControlRequest::AddTopic { peer_id, topic: topic.to_string() }).await
    }

    async fn create_topic(&self, topic: &str, peer_id: PeerId) -> Result<String, IndexError> {
        self.request_message(ControlRequest::CreateTopic { topic: topic.to_string(), peer_id }).await
    }

    async fn delete_topic(&self, peer_id: PeerId, topic: &str) -> Result<String, IndexError> {
        self.request_message(ControlRequest::DeleteTopic { peer_id, topic: topic.to_string() }).await
    }

    async fn query_topic(&self, topic: &str) -> Result<(PeerId, PeerAddr), IndexError> {
        let response = self.request(ControlRequest::QueryTopic { topic: topic.to_string() }).await?;
        match into_body(response)? {
            ResponseBody::Located { peer_id, peer_info } => Ok((peer_id, peer_info)),
            _ => Err(IndexError::UnexpectedResponse { action: "query_topic" }),
        }
    }

    async fn get_peers(&self) -> Result<BTreeMap<PeerId, PeerAddr>, IndexError> {
        match into_body(self.request(ControlRequest::GetPeers).await?)? {
            ResponseBody::Peers { peers } => Ok(peers),
            _ => Err(IndexError::UnexpectedResponse { action: "get_peers" }),
        }
    }

    async fn get_topics(&self) -> Result<Vec<String>, IndexError> {
        match into_body(self.request(ControlRequest::GetTopics).await?)? {
            ResponseBody::Topics { topics } => Ok(topics),
            _ =>Err(IndexError::UnexpectedResponse { action: "get_topics" }),
        }
    }
}

// ============================================================================
// Client API
// ============================================================================

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub host: IpAddr,
    /// UDP port to listen on; `None` lets the OS choose.
    pub port: Option<u16>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self { host: IpAddr::V4(Ipv4Addr::LOCALHOST), port: None }
    }
}

/// The peer node a client talks to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SelectedPeer {
    pub peer_id: PeerId,
    pub addr: PeerAddr,
}

pub struct ClientApi<I: IndexService = IndexClient> {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    index: I,
    selected: Option<SelectedPeer>,
    received: Arc<Mutex<Vec<Envelope>>>,
    shutdown: CancellationToken,
    receiver: Option<JoinHandle<()>>,
}

impl ClientApi<IndexClient> {
    /// Bind a client that reaches the indexing server at `index_server`.
    pub async fn connect(config: ClientConfig, index_server: SocketAddr) -> Result<Self> {
        Self::bind(config, IndexClient::new(index_server)).await
    }
}

impl<I: IndexService> ClientApi<I> {
    pub async fn bind(config: ClientConfig, index: I) -> Result<Self> {
        let bind_addr = SocketAddr::new(config.host, config.port.unwrap_or(0));
        let socket = UdpSocket::bind(bind_addr)
            .await
            .with_context(|| format!("failed to bind client socket on {bind_addr}"))?;
        let local_addr = socket.local_addr()?;
        info!(addr = %local_addr, "client started");

        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
            index,
            selected: None,
            received: Arc::new(Mutex::new(Vec::new())),
            shutdown: CancellationToken::new(),
            receiver: None,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn index(&self) -> &I {
        &self.index
    }

    pub fn selected(&self) -> Option<&SelectedPeer> {
        self.selected.as_ref()
    }

    /// Ask the index for peers and let `choose` pick one by position.
    ///
    /// `choose` sees the peers sorted by id and returns an index into that
    /// slice; `None` or an out-of-range index leaves the selection unchanged.
    /// An empty registry yields `Ok(None)`.
    pub async fn select_peer<F>(&mut self, choose: F) -> Result<Option<SelectedPeer>, IndexError>
    where
        F: FnOnce(&[(PeerId, PeerAddr)]) -> Option<usize>,
    {
        let peers = match self.index.get_peers().await {
            Ok(peers) => peers,
            Err(e) if e.code() == Some(ErrorCode::NoPeers) => {
                info!("No available peer nodes.");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let peers: Vec<(PeerId, PeerAddr)> = peers.into_iter().collect();
        let Some((peer_id, addr)) = choose(&peers).and_then(|i| peers.get(i).cloned()) else {
            debug!(available = peers.len(), "no peer chosen");
            return Ok(None);
        };

        Ok(Some(self.select(peer_id, addr)))
    }

    /// Select a peer directly, bypassing the index.
    pub fn select(&mut self, peer_id: PeerId, addr: PeerAddr) -> SelectedPeer {
        info!(peer_id = %peer_id, addr = %addr, "selected peer node");
        let selected = SelectedPeer { peer_id, addr };
        self.selected = Some(selected.clone());
        selected
    }

    fn require_peer(&self) -> Option<&SelectedPeer> {
        if self.selected.is_none() {
            warn!("Peer node is not selected.");
        }
        self.selected.as_ref()
    }

    /// Create `topic` on the selected peer.
    ///
    /// If the topic already exists the client subscribes to it instead.
    /// Returns whether the topic was created.
    pub async fn create_topic(&self, topic: &str) -> Result<bool> {
        let Some(peer) = self.require_peer() else {
            return Ok(false);
        };

        match self.index.create_topic(topic, peer.peer_id).await {
            Ok(message) => {
                info!(topic = %topic, response = %message, "topic created");
                Ok(true)
            }
            Err(e) if e.code() == Some(ErrorCode::AlreadyExists) => {
                info!(topic = %topic, "topic already exists, subscribing to the existing topic");
                self.subscribe(topic).await?;
                Ok(false)
            }
            Err(IndexError::Rejected { message, .. }) => {
                warn!(topic = %topic, response = %message, "topic creation rejected");
                Ok(false)
            }
            Err(e) => Err(e).context("create_topic request failed"),
        }
    }

    /// Remove the selected peer from the owners of `topic`.
    pub async fn delete_topic(&self, topic: &str) -> Result<bool> {
        let Some(peer) = self.require_peer() else {
            return Ok(false);
        };

        match self.index.delete_topic(peer.peer_id, topic).await {
            Ok(message) => {
                info!(topic = %topic, response = %message, "topic deleted");
                Ok(true)
            }
            Err(IndexError::Rejected { message, .. }) => {
                warn!(topic = %topic, response = %message, "topic deletion rejected");
                Ok(false)
            }
            Err(e) => Err(e).context("delete_topic request failed"),
        }
    }

    /// Send a publish datagram to the selected peer. Fire-and-forget.
    pub async fn publish(&self, topic: &str, message: &str) -> Result<bool> {
        self.send_to_peer(&Envelope::publish(topic, message)).await
    }

    /// Ask the selected peer to deliver future publishes on `topic` to us.
    pub async fn subscribe(&self, topic: &str) -> Result<bool> {
        self.send_to_peer(&Envelope::subscribe(topic)).await
    }

    async fn send_to_peer(&self, envelope: &Envelope) -> Result<bool> {
        let Some(peer) = self.require_peer() else {
            return Ok(false);
        };
        let bytes = messages::encode_envelope(envelope)?;
        self.socket
            .send_to(&bytes, (peer.addr.host.as_str(), peer.addr.port))
            .await
            .with_context(|| format!("failed to send to peer {}", peer.addr))?;
        debug!(peer = %peer.addr, ?envelope, "sent datagram");
        Ok(true)
    }

    /// Start the background receive loop. Calling it twice is a no-op.
    pub fn start_receiving(&mut self) {
        if self.receiver.is_some() {
            return;
        }
        let socket = self.socket.clone();
        let received = self.received.clone();
        let shutdown = self.shutdown.clone();
        self.receiver = Some(tokio::spawn(receive_loop(socket, received, shutdown)));
    }

    /// Envelopes received so far, oldest first.
    pub fn received_messages(&self) -> Vec<Envelope> {
        self.received.lock().clone()
    }

    /// Stop receiving and release the socket.
    pub async fn shutdown(mut self) {
        info!(addr = %self.local_addr, "shutting down client");
        self.shutdown.cancel();
        if let Some(receiver) = self.receiver.take()
            && let Err(e) = receiver.await
        {
            warn!(error = %e, "client receive loop ended abnormally");
        }
    }
}

impl<I: IndexService> Drop for ClientApi<I> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn receive_loop(socket: Arc<UdpSocket>, received: Arc<Mutex<Vec<Envelope>>>, shutdown: CancellationToken) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE + 1];
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            result = socket.recv_from(&mut buf) => match result {
                Ok((len, from)) => match messages::decode_envelope(&buf[..len]) {
                    Ok(envelope) => {
                        info!(from = %from, ?envelope, "received message");
                        received.lock().push(envelope);
                    }
                    Err(e) => warn!(from = %from, error = %e, "dropping undecodable datagram"),
                },
                Err(e) => warn!(error = %e, "client receive failed"),
            }
        }
    }
    debug!("client receive loop stopped");
}
