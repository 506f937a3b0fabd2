//! Message dispatch by (cache group, message kind).

use super::messages::{Message, MessageKind};
use crate::error::{NetworkError, Result};
use crate::types::{GroupId, NodeId};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Handler for incoming messages.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle a message received from `from`.
    async fn handle(&self, from: NodeId, message: Message) -> Result<()>;
}

/// Lookup table from (group, kind) to handler.
#[derive(Default)]
pub struct MessageDispatcher {
    handlers: RwLock<HashMap<(GroupId, MessageKind), Arc<dyn MessageHandler>>>,
}

impl MessageDispatcher {
    /// Create an empty dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for a message kind of a group, replacing any previous one.
    pub fn register(&self, group_id: GroupId, kind: MessageKind, handler: Arc<dyn MessageHandler>) {
        self.handlers.write().insert((group_id, kind), handler);
    }

    /// Register `handler` for every message kind of a group.
    pub fn register_all(&self, group_id: GroupId, handler: Arc<dyn MessageHandler>) {
        for kind in [
            MessageKind::Demand,
            MessageKind::Supply,
            MessageKind::ForceKeysRequest,
            MessageKind::ForceKeysResponse,
        ] {
            self.register(group_id, kind, Arc::clone(&handler));
        }
    }

    /// Remove all handlers of a group.
    pub fn unregister_group(&self, group_id: GroupId) {
        self.handlers.write().retain(|(g, _), _| *g != group_id);
    }

    /// Route a message to its handler.
    pub async fn dispatch(&self, from: NodeId, message: Message) -> Result<()> {
        let key = (message.group_id(), message.kind());
        let handler = self.handlers.read().get(&key).cloned();

        match handler {
            Some(handler) => handler.handle(from, message).await,
            None => {
                debug!(group_id = key.0, kind = %key.1, from, "No handler for message");
                Err(NetworkError::NoHandler(format!("{}/{}", key.0, key.1)).into())
            }
        }
    }
}

impl std::fmt::Debug for MessageDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<_> = self.handlers.read().keys().copied().collect();
        keys.sort();
        f.debug_struct("MessageDispatcher")
            .field("handlers", &keys)
            .finish()
    }
}
