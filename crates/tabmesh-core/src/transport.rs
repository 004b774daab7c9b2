//! BroadcastTransport trait for the shared channel.
//!
//! Implementations:
//! - Memory: in-process hub, one bus per channel name (tests and the CLI)

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Channel closed: {0}")]
    Closed(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Receives every frame published on the channel.
pub type FrameHandler = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// Mutates a frame in transit; returning `false` drops it.
pub type Interceptor = Arc<dyn Fn(&mut Vec<u8>) -> bool + Send + Sync>;

/// Handle returned by `subscribe`, passed back to `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(usize);

/// A named broadcast channel shared by co-located nodes.
///
/// Delivery is best-effort: unordered and possibly lossy.
#[async_trait]
pub trait BroadcastTransport: Send + Sync {
    /// Channel name
    fn channel(&self) -> &str;

    /// Deliver bytes to every subscriber of the channel
    async fn publish(&self, payload: Vec<u8>) -> Result<()>;

    /// Register a handler for inbound frames
    fn subscribe(&self, handler: FrameHandler) -> Result<SubscriptionId>;

    /// Remove a handler. Unknown ids are ignored.
    fn unsubscribe(&self, id: SubscriptionId);

    /// Refuse further publishes and subscriptions. Idempotent.
    fn close(&self);
}

// ============================================================================
// In-memory implementation
// ============================================================================

/// Subscribers of one channel.
#[derive(Default)]
struct MemoryBus {
    handlers: RwLock<Vec<(usize, FrameHandler)>>,
    interceptor: RwLock<Option<Interceptor>>,
    next_id: AtomicUsize,
}

impl MemoryBus {
    fn subscribe(&self, handler: FrameHandler) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, handler));
        SubscriptionId(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(i, _)| *i != id.0);
    }

    fn deliver(&self, mut payload: Vec<u8>) {
        let interceptor = self
            .interceptor
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(intercept) = interceptor {
            if !intercept(&mut payload) {
                return;
            }
        }

        // Clone the handler list so a handler may subscribe or unsubscribe
        let handlers: Vec<_> = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();

        for handler in handlers {
            handler(payload.clone());
        }
    }

    fn subscriber_count(&self) -> usize {
        self.handlers.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// In-process registry of channels.
///
/// Transports opened on the same channel name see each other's frames,
/// including their own.
#[derive(Default)]
pub struct MemoryHub {
    buses: Mutex<HashMap<String, Arc<MemoryBus>>>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn bus(&self, channel: &str) -> Arc<MemoryBus> {
        let mut buses = self.buses.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(buses.entry(channel.to_string()).or_default())
    }

    /// Open a transport on `channel`.
    pub fn transport(&self, channel: &str) -> MemoryTransport {
        MemoryTransport {
            channel: channel.to_string(),
            bus: self.bus(channel),
            closed: AtomicBool::new(false),
        }
    }

    /// Install (or with `None`, remove) a frame interceptor on `channel`.
    pub fn set_interceptor(&self, channel: &str, interceptor: Option<Interceptor>) {
        let bus = self.bus(channel);
        *bus.interceptor.write().unwrap_or_else(|e| e.into_inner()) = interceptor;
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.bus(channel).subscriber_count()
    }
}

impl fmt::Debug for MemoryHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let channels: Vec<String> = self
            .buses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        f.debug_struct("MemoryHub").field("channels", &channels).finish()
    }
}

/// One participant's view of an in-memory channel.
pub struct MemoryTransport {
    channel: String,
    bus: Arc<MemoryBus>,
    closed: AtomicBool,
}

impl fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("channel", &self.channel)
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

#[async_trait]
impl BroadcastTransport for MemoryTransport {
    fn channel(&self) -> &str {
        &self.channel
    }

    async fn publish(&self, payload: Vec<u8>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed(self.channel.clone()));
        }
        self.bus.deliver(payload);
        Ok(())
    }

    fn subscribe(&self, handler: FrameHandler) -> Result<SubscriptionId> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed(self.channel.clone()));
        }
        Ok(self.bus.subscribe(handler))
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.bus.unsubscribe(id);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
