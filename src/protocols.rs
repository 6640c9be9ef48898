//! Protocol trait definitions for peerbus's control plane.
//!
//! Peer nodes and clients reach the indexing server only through
//! [`IndexService`], so they do not care whether the index lives across a TCP
//! connection ([`IndexClient`](crate::client::IndexClient)) or in the same
//! process ([`RegistryHandle`](crate::registry::RegistryHandle)).
//!
//! | Implementation | Transport | Typical use |
//! |----------------|-----------|-------------|
//! | `IndexClient` | TCP, one connection per call | production peers and clients |
//! | `RegistryHandle` | in-process actor channel | embedding, tests |

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::client::IndexError;
use crate::messages::{PeerAddr, PeerId};

/// Indexing server operations.
///
/// Rejections from the index surface as [`IndexError::Rejected`] carrying the
/// server's message and error code.
#[async_trait]
pub trait IndexService: Send + Sync + 'static {
    /// Register the caller as `peer_id`, reachable on `peer_port`.
    async fn register(&self, peer_id: PeerId, peer_port: u16) -> Result<String, IndexError>;

    async fn unregister(&self, peer_id: PeerId) -> Result<String, IndexError>;

    /// Join the owner list of `topic`, creating it if needed.
    async fn add_topic(&self, peer_id: PeerId, topic: &str) -> Result<String, IndexError>;

    /// Create `topic` owned by `peer_id`; rejected if it already exists.
    async fn create_topic(&self, topic: &str, peer_id: PeerId) -> Result<String, IndexError>;

    async fn delete_topic(&self, peer_id: PeerId, topic: &str) -> Result<String, IndexError>;

    /// Find the peer hosting `topic`.
    async fn query_topic(&self, topic: &str) -> Result<(PeerId, PeerAddr), IndexError>;

    async fn get_peers(&self) -> Result<BTreeMap<PeerId, PeerAddr>, IndexError>;

    async fn get_topics(&self) -> Result<Vec<String>, IndexError>;
}
