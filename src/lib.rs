//! # peerbus - Indexed Peer-to-Peer Publish/Subscribe
//!
//! peerbus splits a pub/sub network into a small control plane and a direct
//! data plane:
//!
//! - **Indexing server**: a TCP service that tracks which peers are online and
//!   which peers own which topics
//! - **Peer nodes**: UDP endpoints that keep subscriber lists and fan out
//!   every publish they receive
//! - **Clients**: pick a peer through the index, then subscribe and publish by
//!   talking to that peer directly
//!
//! ## Architecture
//!
//! Mutable state lives in actors. The registry and each peer node run as a
//! task that owns its state and processes commands one at a time; callers hold
//! cheap handles that talk to the task over channels.
//!
//! ## Delivery Model
//!
//! Datagrams are fire-and-forget. There is no retry, ordering or persistence;
//! a peer that crashes without unregistering stays in the index until it
//! registers again.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `registry` | Peer/topic registry and its actor handle |
//! | `server` | TCP indexing server |
//! | `subscriptions` | Per-node subscriber table |
//! | `node` | Peer node: registration, datagram handling, distribution |
//! | `client` | Index client and end-user client API |
//! | `protocols` | `IndexService` trait shared by index clients |
//! | `messages` | Wire types, framing, size limits |

mod client;
pub mod messages;
mod node;
mod protocols;
mod registry;
mod server;
mod subscriptions;

pub use client::{ClientApi, ClientConfig, IndexClient, IndexConnection, IndexError, SelectedPeer};
pub use messages::{ControlRequest, ControlResponse, Envelope, ErrorCode, PeerAddr, PeerId, WireError};
pub use node::{NodeConfig, NodeState, PeerNode, PEER_PORT_RANGE};
pub use protocols::IndexService;
pub use registry::{Registry, RegistryError, RegistryHandle, RegistryResult};
pub use server::{IndexServer, IndexServerConfig, DEFAULT_INDEX_PORT};
pub use subscriptions::SubscriptionTable;
