//! Wire envelope for frames exchanged over the shared bus.
//!
//! Every message is a `RequestEnvelope` serialized as camelCase JSON:
//! `{"type":"connect","data":{...},"frame":{"from":"...","ttl":3,...}}`.
//! Inbound envelopes are decoded with a `serde_json::Value` payload and the
//! per-kind data is decoded lazily once the kind is known.

use crate::auth::SealedMessage;
use crate::protocol::machine::Phase;
use crate::NodeId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use uuid::Uuid;

/// Correlation and frame identifier.
pub type Token = Uuid;

/// Namespace prefix for channel names.
pub const DEFAULT_CHANNEL_PREFIX: &str = "tabmesh";

/// Separator between the channel prefix and the resource identifier.
pub const SEPARATOR: &str = ":";

/// Derive the shared channel name for a resource.
///
/// Co-located nodes for the same resource land on the same channel.
pub fn channel_name(resource: &str, prefix: &str) -> String {
    format!("{prefix}{SEPARATOR}{resource}")
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    web_time::SystemTime::now()
        .duration_since(web_time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Closed set of message kinds understood by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageKind {
    Connect,
    Acknowledge,
    Election,
    Leader,
    Disconnect,
    Blacklist,
    Heartbeat,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Acknowledge => "acknowledge",
            Self::Election => "election",
            Self::Leader => "leader",
            Self::Disconnect => "disconnect",
            Self::Blacklist => "blacklist",
            Self::Heartbeat => "heartbeat",
        }
    }
}

impl Display for MessageKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routing metadata attached to every envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    /// Intended recipient. `None` means every node on the channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<NodeId>,
    pub from: NodeId,
    /// Ties replies back to the request that caused them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Token>,
    /// Validation hash of a sealed payload (connect handshakes only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// Milliseconds since the Unix epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    /// Unique id of this frame
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Token>,
    /// Remaining hop budget
    pub ttl: u32,
}

impl Frame {
    /// TTL for a reply or re-broadcast caused by this frame.
    ///
    /// `None` when the frame arrived exhausted and must not travel further.
    pub fn next_hop_ttl(&self) -> Option<u32> {
        self.ttl.checked_sub(1)
    }

    pub fn is_exhausted(&self) -> bool {
        self.ttl == 0
    }

    /// Broadcast frames are addressed to everyone.
    pub fn is_addressed_to(&self, node: NodeId) -> bool {
        self.to.is_none_or(|to| to == node)
    }
}

/// The caller-supplied part of a frame; `build_request` fills in the rest.
#[derive(Debug, Clone)]
pub struct PartialFrame {
    pub from: NodeId,
    pub to: Option<NodeId>,
    pub correlation_id: Option<Token>,
    pub hash: Option<String>,
    pub timestamp: Option<u64>,
    pub ttl: Option<u32>,
}

impl PartialFrame {
    pub fn new(from: NodeId) -> Self {
        Self {
            from,
            to: None,
            correlation_id: None,
            hash: None,
            timestamp: None,
            ttl: None,
        }
    }

    pub fn to(mut self, to: NodeId) -> Self {
        self.to = Some(to);
        self
    }

    pub fn ttl(mut self, ttl: u32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn correlation(mut self, correlation_id: Option<Token>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Mirror a sealed message's identity fields into the frame.
    pub fn sealed(mut self, sealed: &SealedMessage) -> Self {
        self.correlation_id = Some(sealed.correlation_id);
        self.hash = Some(sealed.hash.clone());
        self.timestamp = Some(sealed.timestamp);
        self
    }
}

/// The unit exchanged over the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope<T = serde_json::Value> {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub data: Option<T>,
    pub frame: Frame,
}

/// Envelope with an undecoded payload, as seen on receipt.
pub type RawEnvelope = RequestEnvelope<serde_json::Value>;

/// Stamp a fresh frame id and timestamp, fill the TTL, and wrap the payload.
///
/// A correlation id supplied by the caller is kept so replies can be matched
/// to their request; otherwise a fresh one is minted.
pub fn build_request<T>(
    kind: MessageKind,
    data: Option<T>,
    partial: PartialFrame,
    default_ttl: u32,
) -> RequestEnvelope<T> {
    let frame = Frame {
        to: partial.to,
        from: partial.from,
        correlation_id: Some(partial.correlation_id.unwrap_or_else(Uuid::new_v4)),
        hash: partial.hash,
        timestamp: Some(partial.timestamp.unwrap_or_else(now_ms)),
        id: Some(Uuid::new_v4()),
        ttl: partial.ttl.unwrap_or(default_ttl),
    };
    RequestEnvelope { kind, data, frame }
}

impl<T: Serialize> RequestEnvelope<T> {
    /// Erase the payload type for publishing.
    pub fn into_raw(self) -> RawEnvelope {
        RequestEnvelope {
            kind: self.kind,
            data: self.data.map(|d| {
                serde_json::to_value(d).expect("envelope payload serialization should not fail")
            }),
            frame: self.frame,
        }
    }

    /// Serialize to JSON bytes.
    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("RequestEnvelope serialization should not fail")
    }
}

impl RawEnvelope {
    /// Try to parse from JSON bytes.
    pub fn from_json(data: &[u8]) -> Option<Self> {
        serde_json::from_slice(data).ok()
    }

    /// Decode the payload as the type expected for this kind.
    ///
    /// Returns `None` when the payload is absent or has the wrong shape.
    pub fn decode_data<D: DeserializeOwned>(&self) -> Option<D> {
        let value = self.data.as_ref()?;
        serde_json::from_value(value.clone()).ok()
    }
}

// ============================================================================
// Payloads
// ============================================================================

/// Diagnostic snapshot of the sender, carried in connect handshakes.
///
/// The same snapshot travels in clear and sealed; a verifier that holds the
/// key checks that both agree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationPayload {
    pub node: NodeId,
    pub phase: Phase,
    pub neighbors: usize,
    pub issued_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectData {
    pub validation: ValidationPayload,
    pub sealed: SealedMessage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcknowledgeData {
    #[serde(rename = "type")]
    pub kind: MessageKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderData {
    pub leader: NodeId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlacklistData {
    pub node: NodeId,
}
