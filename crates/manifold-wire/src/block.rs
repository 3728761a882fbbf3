//! In-memory graph model: nodes, edges, and the circulating message block.

use std::fmt;

use tracing::debug;

use crate::types::{ProtocolState, Side};

/// Maximum tool-name length in bytes. Names are stored in a fixed-width
/// field on the wire.
pub const NAME_MAX: usize = 100;

/// One graph-aware tool, as contributed to the message block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub pid: i32,
    pub name: String,
    /// Declared input arity: how many data channels this tool consumes.
    pub requires_channels: u32,
    /// Declared output arity: how many data channels this tool provides.
    pub provides_channels: u32,
    /// The tool's input descriptor is graph-aware.
    pub graph_in: bool,
    /// The tool's output descriptor is graph-aware.
    pub graph_out: bool,
}

/// A directed data-flow relation between two nodes.
///
/// The ordered pair `(from, to)` is the identity: multi-edges between the
/// same pair are forbidden.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub from: u32,
    pub to: u32,
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)
    }
}

/// The node index and write side from which the block was most recently
/// forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Origin {
    pub index: u32,
    pub side: Side,
}

/// The single object that circulates during negotiation.
///
/// Structural mutation goes through [`add_node`](MessageBlock::add_node) and
/// [`add_edge`](MessageBlock::add_edge) so that the serial number is bumped
/// exactly once per change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageBlock {
    pub version: u32,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    /// Pid stamping this block in the competition rule; the smallest pid
    /// observed so far among contributing tools.
    pub initiator_pid: i32,
    pub state: ProtocolState,
    /// Bumped on every structural change; never decreases for a given
    /// block identity.
    pub serial: u32,
    pub origin: Option<Origin>,
}

impl MessageBlock {
    /// A fresh empty block, stamped by its constructing tool.
    pub fn new(initiator_pid: i32) -> Self {
        debug!(initiator_pid, "message block created");
        MessageBlock {
            version: crate::codec::WIRE_VERSION,
            nodes: Vec::new(),
            edges: Vec::new(),
            initiator_pid,
            state: ProtocolState::Negotiating,
            serial: 0,
            origin: None,
        }
    }

    pub fn bump_serial(&mut self) {
        self.serial += 1;
    }

    /// Index of the node contributed by `pid`, if present.
    pub fn node_index_by_pid(&self, pid: i32) -> Option<u32> {
        self.nodes
            .iter()
            .position(|n| n.pid == pid)
            .map(|i| i as u32)
    }

    /// Add a node unless one with the same pid already exists.
    ///
    /// Returns the node's index either way; bumps the serial only when the
    /// node was actually appended.
    pub fn add_node(&mut self, node: Node) -> u32 {
        if let Some(index) = self.node_index_by_pid(node.pid) {
            return index;
        }
        let index = self.nodes.len() as u32;
        debug!(name = %node.name, pid = node.pid, index, "node added to graph");
        self.nodes.push(node);
        self.bump_serial();
        index
    }

    pub fn has_edge(&self, from: u32, to: u32) -> bool {
        self.edges.iter().any(|e| e.from == from && e.to == to)
    }

    /// Add an edge unless the ordered pair already exists.
    ///
    /// Returns whether the edge was appended; bumps the serial on append.
    /// Both endpoints must be existing node indices.
    pub fn add_edge(&mut self, from: u32, to: u32) -> bool {
        debug_assert!((from as usize) < self.nodes.len());
        debug_assert!((to as usize) < self.nodes.len());
        if self.has_edge(from, to) {
            return false;
        }
        self.edges.push(Edge { from, to });
        self.bump_serial();
        debug!(
            from,
            to,
            n_edges = self.edges.len(),
            "edge added to graph"
        );
        true
    }

    /// The node the origin refers to, validated with a bounded scan.
    pub fn origin_node(&self) -> Option<&Node> {
        let origin = self.origin?;
        self.nodes.get(origin.index as usize)
    }

    pub fn incoming_edges(&self, index: u32) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |e| e.to == index)
    }

    pub fn outgoing_edges(&self, index: u32) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |e| e.from == index)
    }

    pub fn in_degree(&self, index: u32) -> u32 {
        self.incoming_edges(index).count() as u32
    }

    pub fn out_degree(&self, index: u32) -> u32 {
        self.outgoing_edges(index).count() as u32
    }

    /// Size of this block's wire encoding in bytes.
    pub fn wire_size(&self) -> usize {
        crate::codec::encoded_len(self.nodes.len(), self.edges.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(pid: i32, name: &str) -> Node {
        Node {
            pid,
            name: name.to_string(),
            requires_channels: 1,
            provides_channels: 1,
            graph_in: true,
            graph_out: true,
        }
    }

    #[test]
    fn add_node_dedupes_by_pid() {
        let mut mb = MessageBlock::new(7);
        assert_eq!(mb.add_node(node(7, "a")), 0);
        assert_eq!(mb.serial, 1);
        assert_eq!(mb.add_node(node(9, "b")), 1);
        assert_eq!(mb.serial, 2);

        // Re-adding the same pid returns the old index without a bump.
        assert_eq!(mb.add_node(node(7, "a")), 0);
        assert_eq!(mb.nodes.len(), 2);
        assert_eq!(mb.serial, 2);
    }

    #[test]
    fn add_edge_dedupes_by_pair() {
        let mut mb = MessageBlock::new(7);
        mb.add_node(node(7, "a"));
        mb.add_node(node(9, "b"));
        let serial = mb.serial;

        assert!(mb.add_edge(0, 1));
        assert_eq!(mb.serial, serial + 1);
        assert!(!mb.add_edge(0, 1));
        assert_eq!(mb.serial, serial + 1);

        // The reverse pair is a different edge.
        assert!(mb.add_edge(1, 0));
        assert_eq!(mb.edges.len(), 2);
    }

    #[test]
    fn degrees_count_directed_edges() {
        let mut mb = MessageBlock::new(1);
        mb.add_node(node(1, "a"));
        mb.add_node(node(2, "b"));
        mb.add_node(node(3, "c"));
        mb.add_edge(0, 1);
        mb.add_edge(1, 2);

        assert_eq!(mb.out_degree(0), 1);
        assert_eq!(mb.in_degree(0), 0);
        assert_eq!(mb.in_degree(1), 1);
        assert_eq!(mb.out_degree(1), 1);
        assert_eq!(mb.in_degree(2), 1);
        assert_eq!(mb.out_degree(2), 0);
    }

    #[test]
    fn origin_node_is_bounds_checked() {
        let mut mb = MessageBlock::new(1);
        mb.add_node(node(1, "a"));

        mb.origin = Some(Origin {
            index: 0,
            side: Side::Output,
        });
        assert_eq!(mb.origin_node().map(|n| n.pid), Some(1));

        mb.origin = Some(Origin {
            index: 5,
            side: Side::Output,
        });
        assert!(mb.origin_node().is_none());
    }
}
