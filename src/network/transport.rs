//! Point-to-point message transport.
//!
//! The rebalancing subsystem only needs ordered, at-least-once delivery per
//! node pair. [`InMemoryNetwork`] provides that inside one process: every
//! node gets an ordered inbox drained by a single dispatch task. Faults can
//! be injected through a [`FaultInjector`].

use super::dispatch::MessageDispatcher;
use super::messages::Message;
use crate::error::{NetworkError, Result};
use crate::types::NodeId;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Sends messages to other nodes.
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// This node's ID.
    fn local_node(&self) -> NodeId;

    /// Send a message to `to`. Messages to the same node arrive in send order.
    async fn send(&self, to: NodeId, message: Message) -> Result<()>;
}

/// What happens to one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The target is down; the sender sees an error.
    Unreachable,
    /// Silently lost.
    Dropped,
    /// Delivered this many times.
    Deliver(u8),
}

/// Decides the [`Delivery`] of each message sent over an [`InMemoryNetwork`].
pub trait FaultInjector: Send + Sync + Debug {
    fn delivery(&self, from: NodeId, to: NodeId) -> Delivery;
}

struct Envelope {
    from: NodeId,
    message: Message,
}

/// In-process network connecting any number of nodes.
#[derive(Debug, Default)]
pub struct InMemoryNetwork {
    inboxes: RwLock<HashMap<NodeId, mpsc::UnboundedSender<Envelope>>>,
    faults: Option<Arc<dyn FaultInjector>>,
    delivered: AtomicU64,
}

impl InMemoryNetwork {
    /// Create a reliable network.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a network whose deliveries are decided by `faults`.
    pub fn with_faults(faults: Arc<dyn FaultInjector>) -> Arc<Self> {
        Arc::new(Self {
            faults: Some(faults),
            ..Self::default()
        })
    }

    /// Attach a node. Incoming messages are handed to `dispatcher` one at a time.
    ///
    /// Must be called from within a tokio runtime.
    pub fn register(
        self: &Arc<Self>,
        node: NodeId,
        dispatcher: Arc<MessageDispatcher>,
    ) -> Arc<InMemoryTransport> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        self.inboxes.write().insert(node, tx);

        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let kind = envelope.message.kind();
                if let Err(e) = dispatcher.dispatch(envelope.from, envelope.message).await {
                    debug!(node, from = envelope.from, %kind, error = %e, "Message handling failed");
                }
            }
            debug!(node, "Inbox closed");
        });

        Arc::new(InMemoryTransport {
            node,
            network: Arc::clone(self),
        })
    }

    /// Detach a node; its pending messages are still handled, new sends fail.
    pub fn unregister(&self, node: NodeId) {
        self.inboxes.write().remove(&node);
    }

    /// Number of messages delivered so far.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    fn deliver(&self, from: NodeId, to: NodeId, message: Message) -> Result<()> {
        let inbox = self
            .inboxes
            .read()
            .get(&to)
            .cloned()
            .ok_or(NetworkError::NodeUnreachable(to))?;

        let copies = match self.faults.as_ref().map(|f| f.delivery(from, to)) {
            None => 1,
            Some(Delivery::Deliver(n)) => u64::from(n),
            Some(Delivery::Unreachable) => return Err(NetworkError::NodeUnreachable(to).into()),
            Some(Delivery::Dropped) => {
                trace!(from, to, kind = %message.kind(), "Message dropped");
                return Ok(());
            }
        };

        for _ in 1..copies {
            inbox
                .send(Envelope {
                    from,
                    message: message.clone(),
                })
                .map_err(|_| NetworkError::NodeUnreachable(to))?;
        }
        inbox
            .send(Envelope { from, message })
            .map_err(|_| NetworkError::NodeUnreachable(to))?;

        self.delivered.fetch_add(copies, Ordering::Relaxed);
        Ok(())
    }
}

/// A node's handle onto an [`InMemoryNetwork`].
#[derive(Debug)]
pub struct InMemoryTransport {
    node: NodeId,
    network: Arc<InMemoryNetwork>,
}

#[async_trait]
impl Transport for InMemoryTransport {
    fn local_node(&self) -> NodeId {
        self.node
    }

    async fn send(&self, to: NodeId, message: Message) -> Result<()> {
        self.network.deliver(self.node, to, message)
    }
}
