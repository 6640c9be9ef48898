//! Per-node subscriber lists.
//!
//! Entries are created on first subscribe and live until the node exits;
//! there is no unsubscribe message in the protocol.

use std::collections::HashMap;
use std::net::SocketAddr;

#[derive(Debug, Default)]
pub struct SubscriptionTable {
    topics: HashMap<String, Vec<SocketAddr>>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `addr` to the subscribers of `topic`.
    ///
    /// Returns `false` when the address was already subscribed, in which case
    /// nothing changes.
    pub fn subscribe(&mut self, topic: &str, addr: SocketAddr) -> bool {
        let subscribers = self.topics.entry(topic.to_string()).or_default();
        if subscribers.contains(&addr) {
            return false;
        }
        subscribers.push(addr);
        true
    }

    /// Subscribers of `topic` in the order they joined.
    pub fn subscribers(&self, topic: &str) -> &[SocketAddr] {
        self.topics.get(topic).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.topics.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Number of (topic, subscriber) pairs.
    pub fn len(&self) -> usize {
        self.topics.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
