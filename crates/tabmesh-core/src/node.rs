//! Node driver: runs the protocol machine against a live transport.
//!
//! Inbound frames, election timer expiries and heartbeat ticks all funnel
//! through one unbounded queue consumed by a single dispatch task, so the
//! machine sees events strictly one at a time. Local operations lock the
//! machine briefly, execute the returned actions, then await their waiter.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::auth::{create_message, verify_and_decrypt, AuthError, KeyStore, SealedMessage};
use crate::config::NodeConfig;
use crate::protocol::envelope::{now_ms, RawEnvelope, ValidationPayload};
use crate::protocol::machine::{Action, Phase, Protocol};
use crate::registry::{Category, Outcome, PendingRegistry, WaiterKey};
use crate::transport::{BroadcastTransport, FrameHandler, SubscriptionId, TransportError};
use crate::NodeId;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("Node {0} has shut down")]
    ShutDown(NodeId),
}

pub type Result<T> = std::result::Result<T, NodeError>;

/// Work item for the dispatch task.
#[derive(Debug)]
enum NodeEvent {
    Frame(Vec<u8>),
    ElectionTimeout(u64),
    HeartbeatTick,
}

/// State shared between the public handle and the background tasks.
struct Shared {
    id: NodeId,
    config: NodeConfig,
    transport: Arc<dyn BroadcastTransport>,
    keys: KeyStore,
    registry: Arc<PendingRegistry>,
    /// Never held across an await
    machine: Mutex<Protocol>,
    /// Armed timer and the round it belongs to
    election_timer: Mutex<Option<(u64, JoinHandle<()>)>>,
    events: mpsc::UnboundedSender<NodeEvent>,
}

impl Shared {
    fn lock_machine(&self) -> MutexGuard<'_, Protocol> {
        self.machine.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Carry out the machine's requested side effects in order.
    async fn execute(&self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Publish(env) => {
                    debug!(
                        "Node {} publishing {} (to {:?}, ttl {})",
                        self.id, env.kind, env.frame.to, env.frame.ttl
                    );
                    if let Err(e) = self.transport.publish(env.to_json()).await {
                        warn!("Node {} failed to publish {}: {}", self.id, env.kind, e);
                    }
                }
                Action::Settle {
                    category,
                    key,
                    outcome,
                } => {
                    self.registry.settle(category, key, outcome);
                }
                Action::ArmElectionTimer { round } => self.arm_election_timer(round),
                Action::CancelElectionTimer { round } => self.cancel_election_timer(round),
            }
        }
    }

    fn arm_election_timer(&self, round: u64) {
        let mut slot = self.election_timer.lock().unwrap_or_else(|e| e.into_inner());
        // Actions from the dispatch task and local operations can interleave;
        // never let an older round displace a newer timer
        if slot.as_ref().is_some_and(|(armed, _)| *armed > round) {
            debug!("Node {} skipping stale election timer (round {})", self.id, round);
            return;
        }

        let delay = self.config.election_timeout();
        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(NodeEvent::ElectionTimeout(round));
        });
        if let Some((_, previous)) = slot.replace((round, handle)) {
            previous.abort();
        }
    }

    /// Abort the timer only if it still belongs to `round`.
    fn cancel_election_timer(&self, round: u64) {
        let mut slot = self.election_timer.lock().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().is_some_and(|(armed, _)| *armed == round) {
            if let Some((_, handle)) = slot.take() {
                handle.abort();
            }
        }
    }

    fn abort_election_timer(&self) {
        let handle = self
            .election_timer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some((_, handle)) = handle {
            handle.abort();
        }
    }

    /// Snapshot this node and seal it with our key.
    async fn sealed_validation(&self) -> Result<(ValidationPayload, SealedMessage)> {
        let key = self.keys.use_secret_key().await;
        let validation = self.lock_machine().validation_payload(now_ms());
        let plaintext = serde_json::to_string(&validation)
            .expect("validation payload serialization should not fail");
        let sealed = create_message(&plaintext, &key)?;
        Ok((validation, sealed))
    }

    fn ensure_running(&self) -> Result<()> {
        if self.lock_machine().phase() == Phase::Disconnected {
            return Err(NodeError::ShutDown(self.id));
        }
        Ok(())
    }

    /// Dispatch loop. `Shared` holds a sender itself, so this only ends when
    /// the task is aborted on release.
    async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<NodeEvent>) {
        while let Some(event) = events.recv().await {
            let actions = match event {
                NodeEvent::Frame(bytes) => {
                    let Some(env) = RawEnvelope::from_json(&bytes) else {
                        debug!("Node {} dropping undecodable frame ({} bytes)", self.id, bytes.len());
                        continue;
                    };
                    let key = self.keys.use_secret_key().await;
                    self.lock_machine().handle(&env, &key, now_ms())
                }
                NodeEvent::ElectionTimeout(round) => self.lock_machine().on_election_timeout(round),
                NodeEvent::HeartbeatTick => self.lock_machine().heartbeat_tick(now_ms()),
            };
            self.execute(actions).await;
        }
    }
}

/// A participant in discovery and leader election on one channel.
///
/// Must be created inside a tokio runtime: construction spawns the dispatch
/// task (and the heartbeat task when configured).
pub struct Node {
    shared: Arc<Shared>,
    subscription: Mutex<Option<SubscriptionId>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Join the transport's channel under a freshly generated id.
    pub fn new(
        transport: Arc<dyn BroadcastTransport>,
        config: NodeConfig,
        keys: KeyStore,
    ) -> Result<Self> {
        Self::with_id(NodeId::generate(), transport, config, keys)
    }

    /// Join the transport's channel under a caller-chosen id.
    pub fn with_id(
        id: NodeId,
        transport: Arc<dyn BroadcastTransport>,
        config: NodeConfig,
        keys: KeyStore,
    ) -> Result<Self> {
        let machine = Protocol::new(id, config.default_ttl)
            .with_peer_verification(keys.is_shared())
            .with_neighbor_timeout(config.neighbor_timeout_ms);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let frames = events_tx.clone();
        let handler: FrameHandler = Arc::new(move |bytes: Vec<u8>| {
            let _ = frames.send(NodeEvent::Frame(bytes));
        });
        let subscription = transport.subscribe(handler)?;

        let heartbeat_interval = config.heartbeat_interval();
        let shared = Arc::new(Shared {
            id,
            config,
            transport,
            keys,
            registry: Arc::new(PendingRegistry::new()),
            machine: Mutex::new(machine),
            election_timer: Mutex::new(None),
            events: events_tx,
        });

        let mut tasks = vec![tokio::spawn(Arc::clone(&shared).run(events_rx))];

        if let Some(interval) = heartbeat_interval {
            let ticks = shared.events.clone();
            tasks.push(tokio::spawn(async move {
                let mut timer = tokio::time::interval(interval);
                // First tick completes immediately
                timer.tick().await;
                loop {
                    timer.tick().await;
                    if ticks.send(NodeEvent::HeartbeatTick).is_err() {
                        break;
                    }
                }
            }));
        }

        info!("Node {} joined channel {}", id, shared.transport.channel());

        Ok(Self {
            shared,
            subscription: Mutex::new(Some(subscription)),
            tasks: Mutex::new(tasks),
        })
    }

    pub fn id(&self) -> NodeId {
        self.shared.id
    }

    /// Discover peers, elect, and wait for leadership to settle.
    ///
    /// Returns the leader this node recognises, or `None` if leadership did
    /// not settle within the configured timeout.
    pub async fn start(&self) -> Result<Option<NodeId>> {
        let ttl = self.shared.config.default_ttl;

        let connected = self.connect(ttl).await?;
        debug!("Node {} connect finished: {:?}", self.id(), connected);

        let leadership = self
            .shared
            .registry
            .register(Category::Leadership, WaiterKey::Own);
        let elected = self.elect(ttl).await?;
        debug!("Node {} election finished: {:?}", self.id(), elected);

        if self.leader().is_none() {
            let _ = timeout(self.shared.config.leadership_timeout(), leadership).await;
        }

        let leader = self.leader();
        match leader {
            Some(leader) => info!("Node {} started, leader is {}", self.id(), leader),
            None => warn!("Node {} started without a settled leader", self.id()),
        }
        Ok(leader)
    }

    /// Broadcast a connect handshake and wait for the first acknowledgement.
    ///
    /// Resolves `Succeeded` on acknowledgement, `Exhausted` when sent with a
    /// spent TTL, and `TimedOut` when nobody answers in time.
    pub async fn connect(&self, ttl: u32) -> Result<Outcome> {
        self.shared.ensure_running()?;
        let (validation, sealed) = self.shared.sealed_validation().await?;

        let waiter = self
            .shared
            .registry
            .register(Category::Connect, WaiterKey::Token(sealed.correlation_id));
        let (_, actions) = self.shared.lock_machine().connect(ttl, validation, sealed);
        self.shared.execute(actions).await;

        Ok(timeout(self.shared.config.connect_timeout(), waiter)
            .await
            .unwrap_or(Outcome::TimedOut))
    }

    /// Start an election and wait for it to resolve.
    pub async fn elect(&self, ttl: u32) -> Result<Outcome> {
        self.shared.ensure_running()?;

        let waiter = self
            .shared
            .registry
            .register(Category::Election, WaiterKey::Own);
        let actions = self.shared.lock_machine().elect(ttl);
        self.shared.execute(actions).await;

        Ok(timeout(self.shared.config.leadership_timeout(), waiter)
            .await
            .unwrap_or(Outcome::TimedOut))
    }

    /// Record `leader` and announce it on the channel.
    pub async fn lead(&self, leader: NodeId, ttl: u32) -> Result<()> {
        self.shared.ensure_running()?;
        let actions = self.shared.lock_machine().lead(leader, ttl);
        self.shared.execute(actions).await;
        Ok(())
    }

    /// Remember `peer` and probe the channel so it can re-discover us.
    pub async fn disconnect(&self, peer: NodeId) -> Result<()> {
        self.shared.ensure_running()?;
        let (validation, sealed) = self.shared.sealed_validation().await?;
        let actions = self.shared.lock_machine().disconnect(peer, validation, sealed);
        self.shared.execute(actions).await;
        Ok(())
    }

    /// Ignore every future frame from `node` and tell the channel.
    pub async fn blacklist(&self, node: NodeId) -> Result<()> {
        self.shared.ensure_running()?;
        let actions = self.shared.lock_machine().blacklist_node(node);
        self.shared.execute(actions).await;
        Ok(())
    }

    /// Seal `plaintext` with this node's key.
    pub async fn seal(&self, plaintext: &str) -> Result<SealedMessage> {
        let key = self.shared.keys.use_secret_key().await;
        Ok(create_message(plaintext, &key)?)
    }

    /// Open a sealed message with this node's key.
    ///
    /// Returns `None` (and logs) when the message fails verification.
    pub async fn handle_message(&self, message: &SealedMessage) -> Option<String> {
        let key = self.shared.keys.use_secret_key().await;
        match verify_and_decrypt(message, &key) {
            Ok(plaintext) => Some(plaintext),
            Err(e) => {
                warn!("Node {} rejected sealed message: {}", self.id(), e);
                None
            }
        }
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.shared.lock_machine().leader()
    }

    pub fn is_leader(&self) -> bool {
        self.shared.lock_machine().is_leader()
    }

    pub fn neighbors(&self) -> BTreeSet<NodeId> {
        self.shared.lock_machine().neighbors().clone()
    }

    pub fn is_blacklisted(&self, node: NodeId) -> bool {
        self.shared.lock_machine().blacklist().contains(&node)
    }

    pub fn phase(&self) -> Phase {
        self.shared.lock_machine().phase()
    }

    /// Number of outstanding waiters in `category`.
    pub fn pending(&self, category: Category) -> usize {
        self.shared.registry.len(category)
    }

    /// Wait until no waiter in `category` is outstanding.
    pub async fn settled(&self, category: Category) {
        self.shared
            .registry
            .settled(category, self.shared.config.drain_grace())
            .await;
    }

    /// Announce departure and release every resource. Idempotent.
    pub async fn shutdown(&self) {
        let actions = self.shared.lock_machine().shutdown();
        self.shared.execute(actions).await;

        self.release();

        let cancelled = self.shared.registry.cancel_all();
        if cancelled > 0 {
            debug!("Node {} cancelled {} pending waiters", self.id(), cancelled);
        }
        if self.shared.keys.discard().await {
            debug!("Node {} discarded its key", self.id());
        }
        info!("Node {} shut down", self.id());
    }

    fn release(&self) {
        let subscription = self
            .subscription
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(id) = subscription {
            self.shared.transport.unsubscribe(id);
        }
        self.shared.transport.close();

        self.shared.abort_election_timer();

        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.release();
    }
}
