//! tabmesh-core: Peer discovery and leader election over a shared broadcast channel.
//!
//! This crate provides:
//! - `NodeId` identity and the total order used to break election ties
//! - A camelCase JSON envelope with TTL-bounded frames
//! - Sealed (AES-GCM) connect handshakes with a validation hash
//! - A registry of pending operations that callers can await
//! - A sans-IO protocol machine and the tokio driver that runs it
//! - The `BroadcastTransport` abstraction plus an in-memory hub

pub mod auth;
pub mod config;
pub mod node;
pub mod node_id;
pub mod protocol;
pub mod registry;
pub mod transport;

pub use auth::{AuthError, KeyStore, SealedMessage, SecretKey};
pub use config::NodeConfig;
pub use node::{Node, NodeError};
pub use node_id::{NodeId, NodeIdError};
pub use protocol::{Action, MessageKind, Phase, Protocol, RawEnvelope, RequestEnvelope, Token};
pub use registry::{Category, Outcome, PendingRegistry, Waiter, WaiterKey};
pub use transport::{BroadcastTransport, MemoryHub, MemoryTransport, SubscriptionId, TransportError};
