//! # Indexing Server
//!
//! TCP front end for the [`Registry`](crate::registry::Registry). Each
//! accepted connection is a session of length-prefixed JSON request/response
//! frames; all sessions share one [`RegistryHandle`].
//!
//! ## Session Rules
//!
//! | Input | Outcome |
//! |-------|---------|
//! | known action | response frame, session continues |
//! | unknown action | `Invalid action` error, session continues |
//! | malformed or oversized frame | error response, session ends |
//! | empty frame or EOF | session ends |
//!
//! A failing session never affects the listener or other sessions.

use std::net::{Ipv4Addr, SocketAddr};

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::messages::{self, ControlRequest, ControlResponse, ResponseBody, WireError};
use crate::registry::RegistryHandle;

pub const DEFAULT_INDEX_PORT: u16 = 9000;

#[derive(Clone, Debug)]
pub struct IndexServerConfig {
    pub bind: SocketAddr,
}

impl Default for IndexServerConfig {
    fn default() -> Self {
        Self { bind: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_INDEX_PORT)) }
    }
}

pub struct IndexServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    registry: RegistryHandle,
}

impl IndexServer {
    /// Bind the listener and spawn a fresh registry.
    pub async fn bind(config: IndexServerConfig) -> Result<Self> {
        Self::bind_with_registry(config, RegistryHandle::spawn()).await
    }

    pub async fn bind_with_registry(config: IndexServerConfig, registry: RegistryHandle) -> Result<Self> {
        let listener = TcpListener::bind(config.bind)
            .await
            .with_context(|| format!("failed to bind indexing server on {}", config.bind))?;
        let local_addr = listener.local_addr().context("failed to read listener address")?;
        info!(addr = %local_addr, "indexing server listening");
        Ok(Self { listener, local_addr, registry })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    /// Accept connections until `shutdown` fires.
    ///
    /// Open sessions are aborted on shutdown. The registry actor keeps running
    /// for as long as other handles to it exist.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        debug!(remote = %remote, "accepted connection");
                        let registry = self.registry.clone();
                        sessions.spawn(async move {
                            let outcome = handle_connection(stream, remote, registry).await;
                            (remote, outcome)
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    log_session_outcome(joined);
                }
            }
        }

        info!(addr = %self.local_addr, open_sessions = sessions.len(), "indexing server stopping");
        sessions.shutdown().await;
        Ok(())
    }
}

fn log_session_outcome(joined: Result<(SocketAddr, Result<(), WireError>), tokio::task::JoinError>) {
    match joined {
        Ok((remote, Ok(()))) => debug!(remote = %remote, "session closed"),
        Ok((remote, Err(e))) => warn!(remote = %remote, error = %e, "session ended with error"),
        Err(e) if e.is_panic() => error!(error = %e, "session task panicked"),
        Err(e) => debug!(error = %e, "session task cancelled"),
    }
}

/// Serve one client session until it closes or sends an unusable frame.
pub async fn handle_connection(
    mut stream: TcpStream,
    remote: SocketAddr,
    registry: RegistryHandle,
) -> Result<(), WireError> {
    loop {
        let body = match messages::read_frame(&mut stream).await {
            Ok(Some(body)) => body,
            Ok(None) => return Ok(()),
            Err(e @ WireError::TooLarge { .. }) => {
                let response = ControlResponse::error(e.to_string(), None);
                messages::write_message(&mut stream, &response).await?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let request = match serde_json::from_slice::<ControlRequest>(&body) {
            Ok(request) => request,
            Err(e) => {
                let response = ControlResponse::error("Malformed request", None);
                messages::write_message(&mut stream, &response).await?;
                return Err(e.into());
            }
        };

        let response = process_request(&registry, request, remote).await;
        messages::write_message(&mut stream, &response).await?;
    }
}

/// Apply one request to the registry and build its response.
pub async fn process_request(registry: &RegistryHandle, request: ControlRequest, remote: SocketAddr) -> ControlResponse {
    let action = request.action();
    debug!(remote = %remote, action, "processing request");

    let result = match request {
        ControlRequest::Register { peer_id, peer_port } => {
            registry.register(peer_id, remote.ip().to_string(), peer_port).await.map(ControlResponse::message)
        }
        ControlRequest::Unregister { peer_id } => registry.unregister(peer_id).await.map(ControlResponse::message),
        ControlRequest::AddTopic { peer_id, topic } => {
            registry.add_topic(peer_id, &topic).await.map(ControlResponse::message)
        }
        ControlRequest::CreateTopic { topic, peer_id } => {
            registry.create_topic(&topic, peer_id).await.map(ControlResponse::message)
        }
        ControlRequest::DeleteTopic { peer_id, topic } => {
            registry.delete_topic(peer_id, &topic).await.map(ControlResponse::message)
        }
        ControlRequest::QueryTopic { topic } => registry
            .query_topic(&topic)
            .await
            .map(|(peer_id, peer_info)| ControlResponse::Success(ResponseBody::Located { peer_id, peer_info })),
        ControlRequest::GetPeers => registry
            .get_peers()
            .await
            .map(|peers| ControlResponse::Success(ResponseBody::Peers { peers })),
        ControlRequest::GetTopics => registry
            .get_topics()
            .await
            .map(|topics| ControlResponse::Success(ResponseBody::Topics { topics })),
        ControlRequest::Unrecognized => {
            warn!(remote = %remote, "invalid action");
            return ControlResponse::invalid_action();
        }
    };

    result.unwrap_or_else(|e| {
        debug!(remote = %remote, action, error = %e, "request rejected");
        ControlResponse::error(e.to_string(), e.code())
    })
}
