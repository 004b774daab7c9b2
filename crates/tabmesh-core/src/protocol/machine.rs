//! Discovery and election state machine.
//!
//! The machine never performs IO. Inbound frames and local operations return
//! a list of [`Action`]s that the caller executes: publish an envelope,
//! settle a waiter, arm or cancel the election timer. The node driver in
//! [`crate::node`] does this; tests drive the machine directly.
//!
//! Election is a bully variant bounded by TTL:
//! 1. A node publishes `election` and arms a timer
//! 2. A node hearing a higher-ranked `election` cancels its timer and waits
//! 3. A node hearing a lower-ranked `election` re-publishes with `ttl - 1`
//!    (or, once the budget is spent, names the leader it already knows)
//! 4. A node whose timer fires with no leader recorded declares itself
//! 5. Conflicting `leader` announcements trigger a fresh election

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt::{self, Display, Formatter};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::auth::{verify_and_decrypt, AuthError, SealedMessage, SecretKey};
use crate::protocol::envelope::{
    build_request, AcknowledgeData, BlacklistData, ConnectData, LeaderData, MessageKind,
    PartialFrame, RawEnvelope, Token, ValidationPayload,
};
use crate::registry::{Category, Outcome, WaiterKey};
use crate::NodeId;

/// How many of our own frame ids to remember for echo detection.
const SENT_HISTORY: usize = 512;

/// Lifecycle of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    Idle,
    Connecting,
    Electing,
    Leader,
    Follower,
    Disconnected,
}

impl Display for Phase {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Electing => "electing",
            Self::Leader => "leader",
            Self::Follower => "follower",
            Self::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Side effect requested by the machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Publish an envelope on the channel
    Publish(RawEnvelope),
    /// Resolve a pending waiter
    Settle {
        category: Category,
        key: WaiterKey,
        outcome: Outcome,
    },
    /// Start (or restart) the election timer for this round
    ArmElectionTimer { round: u64 },
    /// Stop the election timer armed for this round
    CancelElectionTimer { round: u64 },
}

/// Why a connect handshake was rejected.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("connect frame carries no handshake payload")]
    MissingPayload,
    #[error("frame {0} does not match the sealed payload")]
    FrameMismatch(&'static str),
    #[error("payload names node {claimed}, frame is from {from}")]
    NodeMismatch { claimed: NodeId, from: NodeId },
    #[error("sealed payload rejected: {0}")]
    Auth(#[from] AuthError),
    #[error("decrypted payload is not a validation snapshot: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("decrypted payload differs from the declared snapshot")]
    PayloadMismatch,
}

/// Per-node protocol state.
pub struct Protocol {
    id: NodeId,
    default_ttl: u32,
    phase: Phase,
    neighbors: BTreeSet<NodeId>,
    blacklist: HashSet<NodeId>,
    leader: Option<NodeId>,
    /// Highest-ranked node seen contesting the current election
    candidate: Option<NodeId>,
    election_round: u64,
    election_armed: bool,
    /// Last time each peer was heard from (ms since epoch)
    last_seen: HashMap<NodeId, u64>,
    /// Ids of frames we built, newest last
    sent: VecDeque<Token>,
    /// Peers share our key, so their handshakes can be decrypted
    verify_peers: bool,
    neighbor_timeout_ms: Option<u64>,
}

impl Protocol {
    pub fn new(id: NodeId, default_ttl: u32) -> Self {
        Self {
            id,
            default_ttl,
            phase: Phase::Idle,
            neighbors: BTreeSet::new(),
            blacklist: HashSet::new(),
            leader: None,
            candidate: None,
            election_round: 0,
            election_armed: false,
            last_seen: HashMap::new(),
            sent: VecDeque::with_capacity(SENT_HISTORY),
            verify_peers: false,
            neighbor_timeout_ms: None,
        }
    }

    /// Decrypt and check peers' handshakes, not only our own echoes.
    pub fn with_peer_verification(mut self, enabled: bool) -> Self {
        self.verify_peers = enabled;
        self
    }

    /// Evict neighbors not heard from within `timeout_ms` on each tick.
    pub fn with_neighbor_timeout(mut self, timeout_ms: Option<u64>) -> Self {
        self.neighbor_timeout_ms = timeout_ms;
        self
    }

    // ========================================================================
    // Read-only state
    // ========================================================================

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.leader
    }

    pub fn is_leader(&self) -> bool {
        self.leader == Some(self.id)
    }

    pub fn candidate(&self) -> Option<NodeId> {
        self.candidate
    }

    pub fn neighbors(&self) -> &BTreeSet<NodeId> {
        &self.neighbors
    }

    pub fn blacklist(&self) -> &HashSet<NodeId> {
        &self.blacklist
    }

    pub fn is_election_armed(&self) -> bool {
        self.election_armed
    }

    /// Snapshot sealed into connect handshakes.
    pub fn validation_payload(&self, now_ms: u64) -> ValidationPayload {
        ValidationPayload {
            node: self.id,
            phase: self.phase,
            neighbors: self.neighbors.len(),
            issued_at: now_ms,
        }
    }

    // ========================================================================
    // Local operations
    // ========================================================================

    /// Start peer discovery. The caller waits on `(Connect, Token(token))`.
    pub fn connect(
        &mut self,
        ttl: u32,
        validation: ValidationPayload,
        sealed: SealedMessage,
    ) -> (Token, Vec<Action>) {
        if matches!(self.phase, Phase::Idle | Phase::Disconnected) {
            self.phase = Phase::Connecting;
        }

        let token = sealed.correlation_id;
        let partial = PartialFrame::new(self.id).sealed(&sealed).ttl(ttl);
        let publish = self.publish(
            MessageKind::Connect,
            Some(ConnectData { validation, sealed }),
            partial,
        );
        debug!("Node {} connecting (ttl {})", self.id, ttl);
        (token, vec![publish])
    }

    /// Record `peer` as last-known-good and probe the channel for re-discovery.
    pub fn disconnect(
        &mut self,
        peer: NodeId,
        validation: ValidationPayload,
        sealed: SealedMessage,
    ) -> Vec<Action> {
        if peer != self.id {
            self.neighbors.insert(peer);
        }

        let partial = PartialFrame::new(self.id).sealed(&sealed);
        vec![self.publish(
            MessageKind::Connect,
            Some(ConnectData { validation, sealed }),
            partial,
        )]
    }

    /// Start an election. The caller waits on `(Election, Own)`.
    pub fn elect(&mut self, ttl: u32) -> Vec<Action> {
        self.phase = Phase::Electing;
        self.candidate = None;
        info!("Node {} starting election (ttl {})", self.id, ttl);

        let publish = self.publish::<()>(
            MessageKind::Election,
            None,
            PartialFrame::new(self.id).ttl(ttl),
        );
        vec![publish, self.arm_election()]
    }

    /// Election timer fired.
    ///
    /// Rounds that were cancelled or superseded are ignored.
    pub fn on_election_timeout(&mut self, round: u64) -> Vec<Action> {
        if !self.election_armed || round != self.election_round {
            return Vec::new();
        }
        self.election_armed = false;

        // Settle first so the election resolves as timed out, not adopted
        let mut actions = vec![settle(Category::Election, Outcome::TimedOut)];
        match self.leader {
            None => {
                info!("Node {} election timed out, declaring itself leader", self.id);
                actions.extend(self.lead(self.id, self.default_ttl));
            }
            Some(leader) => {
                self.phase = self.role_for(leader);
            }
        }
        actions
    }

    /// Record `leader` and announce it.
    pub fn lead(&mut self, leader: NodeId, ttl: u32) -> Vec<Action> {
        let mut actions = self.adopt(leader);
        actions.push(self.publish(
            MessageKind::Leader,
            Some(LeaderData { leader }),
            PartialFrame::new(self.id).ttl(ttl),
        ));
        actions
    }

    /// Veto every future frame from `node` and tell the channel.
    pub fn blacklist_node(&mut self, node: NodeId) -> Vec<Action> {
        if node == self.id {
            warn!("Refusing to blacklist self");
            return Vec::new();
        }

        let mut actions = self.apply_blacklist(node);
        actions.push(self.publish(
            MessageKind::Blacklist,
            Some(BlacklistData { node }),
            PartialFrame::new(self.id),
        ));
        actions
    }

    /// Announce departure. The machine keeps no further role.
    pub fn shutdown(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        actions.extend(self.disarm_election());
        if self.phase != Phase::Disconnected {
            actions.push(self.publish::<()>(
                MessageKind::Disconnect,
                None,
                PartialFrame::new(self.id).ttl(0),
            ));
        }
        self.phase = Phase::Disconnected;
        self.leader = None;
        self.candidate = None;
        actions
    }

    /// Periodic maintenance: eviction and heartbeats.
    pub fn heartbeat_tick(&mut self, now_ms: u64) -> Vec<Action> {
        let mut actions = Vec::new();

        if let Some(timeout_ms) = self.neighbor_timeout_ms {
            let stale: Vec<NodeId> = self
                .neighbors
                .iter()
                .filter(|n| {
                    self.last_seen
                        .get(n)
                        .is_some_and(|seen| now_ms.saturating_sub(*seen) > timeout_ms)
                })
                .copied()
                .collect();

            for node in stale {
                info!("Evicting silent neighbor {}", node);
                actions.extend(self.forget(node));
            }
        }

        // Followers beat to the leader; the leader beats to everyone
        let partial = match self.leader {
            Some(leader) if leader == self.id => Some(PartialFrame::new(self.id).ttl(1)),
            Some(leader) => Some(PartialFrame::new(self.id).to(leader).ttl(1)),
            None => None,
        };
        if let Some(partial) = partial {
            actions.push(self.publish::<()>(MessageKind::Heartbeat, None, partial));
        }

        actions
    }

    // ========================================================================
    // Inbound dispatch
    // ========================================================================

    /// Handle one inbound envelope.
    ///
    /// `key` is this node's key; it verifies our own echoed handshakes, and
    /// peers' handshakes when peer verification is enabled.
    pub fn handle(&mut self, env: &RawEnvelope, key: &SecretKey, now_ms: u64) -> Vec<Action> {
        let from = env.frame.from;

        // Blacklist is an absolute veto
        if self.blacklist.contains(&from) {
            debug!("Dropping {} from blacklisted node {}", env.kind, from);
            return Vec::new();
        }

        if from == self.id {
            let ours = env.frame.id.is_some_and(|id| self.sent.contains(&id));
            return if ours {
                self.on_echo(env, key)
            } else {
                self.on_identity_collision(env)
            };
        }

        if self.phase == Phase::Disconnected {
            return Vec::new();
        }

        self.last_seen.insert(from, now_ms);
        debug!("Node {} received {} from {} (ttl {})", self.id, env.kind, from, env.frame.ttl);

        match env.kind {
            MessageKind::Connect => self.on_connect(env, key),
            MessageKind::Acknowledge => self.on_acknowledge(env),
            MessageKind::Election => self.on_election(env),
            MessageKind::Leader => self.on_leader(env),
            MessageKind::Disconnect => self.on_disconnect(from),
            MessageKind::Blacklist => self.on_blacklist(env),
            MessageKind::Heartbeat => self.on_heartbeat(env),
        }
    }

    fn on_echo(&mut self, env: &RawEnvelope, key: &SecretKey) -> Vec<Action> {
        if env.kind != MessageKind::Connect {
            return Vec::new();
        }

        // Our own handshake came back: the bus must have carried it intact
        if let Err(e) = self.validate_connect(env, key, true) {
            warn!("Own connect handshake failed validation: {}", e);
            return Vec::new();
        }

        match (env.frame.is_exhausted(), env.frame.correlation_id) {
            (true, Some(token)) => vec![Action::Settle {
                category: Category::Connect,
                key: WaiterKey::Token(token),
                outcome: Outcome::Exhausted,
            }],
            _ => Vec::new(),
        }
    }

    fn on_identity_collision(&mut self, env: &RawEnvelope) -> Vec<Action> {
        error!(
            "Node id {} is used by another node ({} frame we never sent); aborting election",
            self.id, env.kind
        );

        let mut actions = Vec::new();
        actions.extend(self.disarm_election());
        if self.phase == Phase::Electing {
            self.phase = Phase::Idle;
        }
        self.candidate = None;
        actions.push(settle(Category::Election, Outcome::Aborted));
        actions
    }

    fn on_connect(&mut self, env: &RawEnvelope, key: &SecretKey) -> Vec<Action> {
        let from = env.frame.from;
        if let Err(e) = self.validate_connect(env, key, false) {
            warn!("Discarding connect from {}: {}", from, e);
            return Vec::new();
        }

        let Some(next_ttl) = env.frame.next_hop_ttl() else {
            // Handshake budget spent: conclude, never reply
            return env
                .frame
                .correlation_id
                .map(|token| Action::Settle {
                    category: Category::Connect,
                    key: WaiterKey::Token(token),
                    outcome: Outcome::Exhausted,
                })
                .into_iter()
                .collect();
        };

        if self.neighbors.insert(from) {
            info!("Node {} discovered neighbor {}", self.id, from);
        }

        let partial = PartialFrame::new(self.id)
            .to(from)
            .correlation(env.frame.correlation_id)
            .ttl(next_ttl);
        vec![self.publish(
            MessageKind::Acknowledge,
            Some(AcknowledgeData {
                kind: MessageKind::Connect,
            }),
            partial,
        )]
    }

    fn validate_connect(
        &self,
        env: &RawEnvelope,
        key: &SecretKey,
        own: bool,
    ) -> Result<ConnectData, ValidationError> {
        let data: ConnectData = env.decode_data().ok_or(ValidationError::MissingPayload)?;
        let frame = &env.frame;
        let sealed = &data.sealed;

        if frame.hash.as_deref() != Some(sealed.hash.as_str()) {
            return Err(ValidationError::FrameMismatch("hash"));
        }
        if frame.correlation_id != Some(sealed.correlation_id) {
            return Err(ValidationError::FrameMismatch("correlation id"));
        }
        if frame.timestamp != Some(sealed.timestamp) {
            return Err(ValidationError::FrameMismatch("timestamp"));
        }
        if data.validation.node != frame.from {
            return Err(ValidationError::NodeMismatch {
                claimed: data.validation.node,
                from: frame.from,
            });
        }

        if own || self.verify_peers {
            let plaintext = verify_and_decrypt(sealed, key)?;
            let opened: ValidationPayload = serde_json::from_str(&plaintext)?;
            if opened != data.validation {
                return Err(ValidationError::PayloadMismatch);
            }
        }

        Ok(data)
    }

    fn on_acknowledge(&mut self, env: &RawEnvelope) -> Vec<Action> {
        let from = env.frame.from;
        let Some(data) = env.decode_data::<AcknowledgeData>() else {
            warn!("Acknowledgement from {} is missing its type", from);
            return Vec::new();
        };
        if !env.frame.is_addressed_to(self.id) {
            return Vec::new();
        }

        match data.kind {
            MessageKind::Connect => {
                if self.neighbors.insert(from) {
                    info!("Node {} discovered neighbor {}", self.id, from);
                }
                env.frame
                    .correlation_id
                    .map(|token| Action::Settle {
                        category: Category::Connect,
                        key: WaiterKey::Token(token),
                        outcome: Outcome::Succeeded,
                    })
                    .into_iter()
                    .collect()
            }
            other => {
                debug!("Ignoring {} acknowledgement from {}", other, from);
                Vec::new()
            }
        }
    }

    fn on_election(&mut self, env: &RawEnvelope) -> Vec<Action> {
        let from = env.frame.from;
        let mut actions = Vec::new();

        if from.compare(&self.id).is_gt() {
            // A higher-ranked node is alive: it must win, so never self-declare
            if self.candidate.is_none_or(|c| from.compare(&c).is_gt()) {
                self.candidate = Some(from);
            }
            actions.extend(self.disarm_election());
            if self.leader.is_some_and(|l| l.compare(&from).is_lt()) {
                info!("Node {} dropping leader {:?}: {} outranks it", self.id, self.leader, from);
                self.leader = None;
                self.phase = Phase::Electing;
            }
        } else if let Some(next_ttl) = env.frame.next_hop_ttl() {
            if self.is_leader() {
                // Already concluded in our favour; tell the contender directly
                actions.push(self.publish(
                    MessageKind::Leader,
                    Some(LeaderData { leader: self.id }),
                    PartialFrame::new(self.id).to(from).ttl(next_ttl),
                ));
            } else {
                // Join the contest unless a higher node is already in it
                if self.leader.is_none() && self.candidate.is_none() && !self.election_armed {
                    self.phase = Phase::Electing;
                    actions.push(self.arm_election());
                }

                if next_ttl > 0 {
                    actions.push(self.publish::<()>(
                        MessageKind::Election,
                        None,
                        PartialFrame::new(self.id).ttl(next_ttl),
                    ));
                } else if let Some(leader) = self.leader {
                    // Contest ran out of budget: conclude with the leader we know
                    actions.push(self.publish(
                        MessageKind::Leader,
                        Some(LeaderData { leader }),
                        PartialFrame::new(self.id).to(from).ttl(next_ttl),
                    ));
                }
            }
        }

        actions.push(settle(Category::Election, Outcome::Succeeded));
        actions
    }

    fn on_leader(&mut self, env: &RawEnvelope) -> Vec<Action> {
        let from = env.frame.from;
        let Some(LeaderData { leader: announced }) = env.decode_data() else {
            warn!("Leader announcement from {} has no leader", from);
            return Vec::new();
        };
        if !env.frame.is_addressed_to(self.id) {
            return Vec::new();
        }
        if self.blacklist.contains(&announced) {
            debug!("Ignoring announcement of blacklisted leader {}", announced);
            return Vec::new();
        }

        // A lower-ranked claim while we are alive: contest it
        if announced.compare(&self.id).is_lt() {
            if self.is_leader() {
                return env
                    .frame
                    .next_hop_ttl()
                    .map(|ttl| {
                        self.publish(
                            MessageKind::Leader,
                            Some(LeaderData { leader: self.id }),
                            PartialFrame::new(self.id).to(from).ttl(ttl),
                        )
                    })
                    .into_iter()
                    .collect();
            }
            if self.election_armed {
                return Vec::new();
            }
            return self.reelect();
        }

        if self.leader.is_some_and(|l| l != announced) {
            return self.reelect();
        }

        let mut actions = self.adopt(announced);
        if announced == self.id {
            if let Some(ttl) = env.frame.next_hop_ttl() {
                actions.push(self.publish(
                    MessageKind::Leader,
                    Some(LeaderData { leader: self.id }),
                    PartialFrame::new(self.id).to(from).ttl(ttl),
                ));
            }
        }
        actions
    }

    fn on_disconnect(&mut self, from: NodeId) -> Vec<Action> {
        info!("Node {} left the channel", from);
        self.forget(from)
    }

    fn on_blacklist(&mut self, env: &RawEnvelope) -> Vec<Action> {
        let Some(BlacklistData { node }) = env.decode_data() else {
            warn!("Blacklist frame from {} names no node", env.frame.from);
            return Vec::new();
        };
        if node == self.id {
            warn!("Node {} was blacklisted by {}", self.id, env.frame.from);
            return Vec::new();
        }
        self.apply_blacklist(node)
    }

    fn on_heartbeat(&mut self, env: &RawEnvelope) -> Vec<Action> {
        if env.frame.is_addressed_to(self.id) && self.neighbors.insert(env.frame.from) {
            info!("Node {} discovered neighbor {} via heartbeat", self.id, env.frame.from);
        }
        Vec::new()
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn publish<T: Serialize>(
        &mut self,
        kind: MessageKind,
        data: Option<T>,
        partial: PartialFrame,
    ) -> Action {
        let env = build_request(kind, data, partial, self.default_ttl).into_raw();
        if let Some(id) = env.frame.id {
            if self.sent.len() == SENT_HISTORY {
                self.sent.pop_front();
            }
            self.sent.push_back(id);
        }
        Action::Publish(env)
    }

    fn arm_election(&mut self) -> Action {
        self.election_round += 1;
        self.election_armed = true;
        Action::ArmElectionTimer {
            round: self.election_round,
        }
    }

    fn disarm_election(&mut self) -> Option<Action> {
        if !self.election_armed {
            return None;
        }
        self.election_armed = false;
        Some(Action::CancelElectionTimer {
            round: self.election_round,
        })
    }

    fn role_for(&self, leader: NodeId) -> Phase {
        if leader == self.id {
            Phase::Leader
        } else {
            Phase::Follower
        }
    }

    fn adopt(&mut self, leader: NodeId) -> Vec<Action> {
        let mut actions = Vec::new();
        actions.extend(self.disarm_election());

        if self.leader != Some(leader) {
            info!("Node {} recognises {} as leader", self.id, leader);
        }
        self.leader = Some(leader);
        self.candidate = None;
        self.phase = self.role_for(leader);

        actions.push(settle(Category::Leadership, Outcome::Succeeded));
        actions.push(settle(Category::Election, Outcome::Succeeded));
        actions
    }

    /// Views of the leader disagree: clear ours and run a fresh election.
    fn reelect(&mut self) -> Vec<Action> {
        info!("Node {} re-electing (recorded leader {:?})", self.id, self.leader);
        self.leader = None;
        self.elect(self.default_ttl)
    }

    fn forget(&mut self, node: NodeId) -> Vec<Action> {
        self.neighbors.remove(&node);
        self.last_seen.remove(&node);
        if self.phase == Phase::Disconnected {
            return Vec::new();
        }
        if self.leader == Some(node) {
            return self.reelect();
        }
        if self.candidate == Some(node) {
            self.candidate = None;
            // We stood down for this node; nobody else will conclude for us
            if self.leader.is_none() {
                return self.reelect();
            }
        }
        Vec::new()
    }

    fn apply_blacklist(&mut self, node: NodeId) -> Vec<Action> {
        if self.blacklist.insert(node) {
            info!("Node {} blacklisted {}", self.id, node);
        }
        self.forget(node)
    }
}

fn settle(category: Category, outcome: Outcome) -> Action {
    Action::Settle {
        category,
        key: WaiterKey::Own,
        outcome,
    }
}
