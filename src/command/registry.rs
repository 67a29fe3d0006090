//! Process-wide map of node id to its live command channel.
//!
//! At most one channel is registered per node. Registering a new channel for
//! a node hands back the one it replaced so the caller can close it.
//! Removal is conditional on identity, so a superseded stream tearing itself
//! down cannot evict its replacement.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use super::channel::CommandChannel;

#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    channels: Arc<RwLock<HashMap<String, Arc<CommandChannel>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, node_id: &str) -> Option<Arc<CommandChannel>> {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(node_id)
            .cloned()
    }

    /// Install `channel` for its node, returning the superseded one.
    pub fn register(&self, channel: Arc<CommandChannel>) -> Option<Arc<CommandChannel>> {
        self.channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(channel.node_id().to_string(), channel)
    }

    /// Remove `channel` only if it is still the registered one.
    pub fn unregister_channel(&self, channel: &Arc<CommandChannel>) -> bool {
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        match channels.get(channel.node_id()) {
            Some(current) if Arc::ptr_eq(current, channel) => {
                channels.remove(channel.node_id());
                true
            }
            _ => false,
        }
    }

    pub fn list(&self) -> Vec<Arc<CommandChannel>> {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Whether a usable channel is registered for `node_id`.
    pub fn is_online(&self, node_id: &str) -> bool {
        self.get(node_id).is_some_and(|ch| !ch.is_closed())
    }

    /// Registered channels that are not closing or closed.
    pub fn online_count(&self) -> usize {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|ch| !ch.is_closed())
            .count()
    }

    /// Close every registered channel. Used on server shutdown.
    pub fn close_all(&self) -> usize {
        self.list().iter().filter(|ch| ch.close()).count()
    }
}
