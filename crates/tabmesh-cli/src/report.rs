//! Snapshot of a node group, printed as JSON once election settles.

use serde::Serialize;
use tabmesh_core::{Node, NodeId, Phase};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeReport {
    pub id: NodeId,
    pub phase: Phase,
    pub leader: Option<NodeId>,
    pub neighbors: Vec<NodeId>,
}

impl NodeReport {
    pub fn capture(node: &Node) -> Self {
        Self {
            id: node.id(),
            phase: node.phase(),
            leader: node.leader(),
            neighbors: node.neighbors().into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupReport {
    pub channel: String,
    /// Leader every node agrees on, if they agree
    pub leader: Option<NodeId>,
    pub nodes: Vec<NodeReport>,
}

impl GroupReport {
    pub fn new(channel: String, nodes: Vec<NodeReport>) -> Self {
        let leader = agreed_leader(&nodes);
        Self {
            channel,
            leader,
            nodes,
        }
    }

    /// Every node agrees, and on the highest id present.
    pub fn converged(&self) -> bool {
        let max = self.nodes.iter().map(|n| n.id).max();
        self.leader.is_some() && self.leader == max
    }
}

fn agreed_leader(nodes: &[NodeReport]) -> Option<NodeId> {
    let first = nodes.first()?.leader?;
    nodes
        .iter()
        .all(|n| n.leader == Some(first))
        .then_some(first)
}
