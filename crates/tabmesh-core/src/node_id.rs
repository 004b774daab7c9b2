//! NodeId: Unique identifier for a node on the shared bus.
//!
//! Wraps a u64 internally and displays as a 16-character hex string.
//! The numeric value doubles as the election rank: the greater id wins.

use std::cmp::Ordering;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeIdError {
    #[error("Invalid node ID format: expected 16 hex chars")]
    InvalidFormat,
    #[error("Invalid hex: {0}")]
    InvalidHex(#[from] std::num::ParseIntError),
}

/// A unique identifier for a node participating in discovery and election.
///
/// # Examples
/// ```
/// use tabmesh_core::NodeId;
///
/// let a = NodeId::from(5);
/// let b = NodeId::from(9);
/// assert!(a.compare(&b).is_lt());
/// assert_eq!(b.to_string(), "0000000000000009");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    /// Generate a new random node ID.
    ///
    /// Uses cryptographically secure randomness. Never returns zero.
    pub fn generate() -> Self {
        use rand::Rng;
        loop {
            let id: u64 = rand::rng().random();
            if id != 0 {
                return Self(id);
            }
        }
    }

    /// Total order used to break election ties.
    pub fn compare(&self, other: &NodeId) -> Ordering {
        self.0.cmp(&other.0)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = NodeIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() == 16 && s.chars().all(|c| c.is_ascii_hexdigit()) {
            let id = u64::from_str_radix(&s.to_ascii_lowercase(), 16)?;
            return Ok(Self(id));
        }
        Err(NodeIdError::InvalidFormat)
    }
}

impl From<u64> for NodeId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<NodeId> for u64 {
    fn from(node_id: NodeId) -> u64 {
        node_id.0
    }
}

// Serialize as hex string so frames stay readable in logs
impl serde::Serialize for NodeId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for NodeId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_zero_padded() {
        assert_eq!(NodeId(0xff).to_string(), "00000000000000ff");
    }

    #[test]
    fn test_parse_uppercase_hex() {
        let id: NodeId = "A1B2C3D4E5F67890".parse().unwrap();
        assert_eq!(id.as_u64(), 0xa1b2c3d4e5f67890);
    }

    #[test]
    fn test_roundtrip() {
        let original = NodeId::generate();
        let parsed: NodeId = original.to_string().parse().unwrap();
        assert_eq!(original, parsed);
    }

    #[test]
    fn test_invalid_format() {
        assert!("too_short".parse::<NodeId>().is_err());
        assert!("ghijklmnopqrstuv".parse::<NodeId>().is_err());
        assert!("a1b2c3d4e5f678901".parse::<NodeId>().is_err());
        assert!("".parse::<NodeId>().is_err());
    }

    #[test]
    fn test_generate_not_zero() {
        for _ in 0..1000 {
            assert_ne!(NodeId::generate().as_u64(), 0);
        }
    }

    #[test]
    fn test_serde_as_hex_string() {
        let id = NodeId::from(9);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"0000000000000009\"");
        let parsed: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }

    // ==================== Ordering ====================

    #[test]
    fn test_greater_id_ranks_higher() {
        assert_eq!(NodeId::from(9).compare(&NodeId::from(5)), Ordering::Greater);
        assert_eq!(NodeId::from(5).compare(&NodeId::from(9)), Ordering::Less);
        assert_eq!(NodeId::from(7).compare(&NodeId::from(7)), Ordering::Equal);
    }

    #[test]
    fn test_compare_is_antisymmetric_and_stable() {
        for _ in 0..500 {
            let a = NodeId::generate();
            let b = NodeId::generate();
            if a == b {
                continue;
            }
            let ab = a.compare(&b);
            assert_eq!(ab, b.compare(&a).reverse());
            assert_ne!(ab, Ordering::Equal);
            // Repeated calls agree
            assert_eq!(ab, a.compare(&b));
        }
    }

    #[test]
    fn test_compare_matches_high_bit() {
        // Values above i64::MAX must still sort as unsigned
        let high = NodeId::from(u64::MAX);
        let low = NodeId::from(1);
        assert!(high.compare(&low).is_gt());
    }
}
