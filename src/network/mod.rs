//! Network layer for the rebalance protocol.
//!
//! Messages form a closed set ([`Message`]) and are routed to handlers through
//! a [`MessageDispatcher`] keyed by cache group and [`MessageKind`].

pub mod dispatch;
pub mod messages;
pub mod transport;

pub use dispatch::{MessageDispatcher, MessageHandler};
pub use messages::{
    DemandMessage, ForceKeysRequest, ForceKeysResponse, Message, MessageKind, SupplyError,
    SupplyMessage,
};
pub use transport::{Delivery, FaultInjector, InMemoryNetwork, InMemoryTransport, Transport};
